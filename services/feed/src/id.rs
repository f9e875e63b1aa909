//! Package identifiers.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::version::PackageVersion;

const MAX_ID_LENGTH: usize = 128;

/// Errors from validating a package id.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// Nothing to parse.
    #[error("package id is empty")]
    Empty,

    /// Longer than the maximum id length.
    #[error("package id is longer than {MAX_ID_LENGTH} characters")]
    TooLong,

    /// Contains characters outside `[A-Za-z0-9._-]`, or starts or ends with
    /// a separator.
    #[error("package id {0:?} contains invalid characters")]
    InvalidCharacters(String),
}

/// A package id, compared case-insensitively.
///
/// The original casing is kept for display.
#[derive(Debug, Clone)]
pub struct PackageId {
    display: String,
    normalized: String,
}

fn is_separator(c: char) -> bool {
    matches!(c, '.' | '-' | '_')
}

impl PackageId {
    /// Validate and wrap a package id.
    pub fn new(input: &str) -> Result<Self, IdError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(IdError::Empty);
        }
        if input.chars().count() > MAX_ID_LENGTH {
            return Err(IdError::TooLong);
        }

        let valid = input
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || is_separator(c));
        let bounded = !input.starts_with(['.', '-']) && !input.ends_with(['.', '-']);
        if !valid || !bounded {
            return Err(IdError::InvalidCharacters(input.to_owned()));
        }

        Ok(Self {
            display: input.to_owned(),
            normalized: input.to_ascii_lowercase(),
        })
    }

    /// The id as it was first written.
    pub fn as_str(&self) -> &str {
        &self.display
    }

    /// The lower-cased id, used for identity, storage paths and URLs.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }
}

impl PartialEq for PackageId {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for PackageId {}

impl Hash for PackageId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl Ord for PackageId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized.cmp(&other.normalized)
    }
}

impl PartialOrd for PackageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

impl FromStr for PackageId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PackageId::new(s)
    }
}

impl serde::Serialize for PackageId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.display)
    }
}

impl<'de> serde::Deserialize<'de> for PackageId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        PackageId::new(&raw).map_err(serde::de::Error::custom)
    }
}

/// The identity of a package: normalized id plus normalized version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageKey {
    id: String,
    version: PackageVersion,
}

impl PackageKey {
    /// Build the key for an id and version.
    pub fn new(id: &PackageId, version: &PackageVersion) -> Self {
        Self {
            id: id.normalized().to_owned(),
            version: version.clone(),
        }
    }

    /// The lower-cased id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The version.
    pub fn version(&self) -> &PackageVersion {
        &self.version
    }
}

impl fmt::Display for PackageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id, self.version.key())
    }
}
