//! Package versions.
//!
//! Versions follow the NuGet flavour of SemVer: two to four numeric
//! components, optional dot-separated release labels after `-`, and optional
//! build metadata after `+`. Build metadata never participates in identity or
//! ordering.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Errors from parsing a version string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionError {
    /// Nothing to parse.
    #[error("version is empty")]
    Empty,

    /// The numeric part has too few or too many components.
    #[error("version {0:?} must have between two and four numeric components")]
    ComponentCount(String),

    /// A numeric component is not a number.
    #[error("version {0:?} has a non-numeric component")]
    NotNumeric(String),

    /// A release label is empty or contains characters outside `[0-9A-Za-z-]`.
    #[error("version {0:?} has an invalid release label")]
    InvalidLabel(String),

    /// Build metadata is empty or malformed.
    #[error("version {0:?} has invalid build metadata")]
    InvalidMetadata(String),
}

/// A parsed package version.
///
/// Equality, ordering and hashing all use the normalized form, so
/// `1.0`, `1.0.0` and `1.0.0.0` are the same version, and release labels
/// compare case-insensitively.
#[derive(Debug, Clone)]
pub struct PackageVersion {
    major: u64,
    minor: u64,
    patch: u64,
    revision: u64,
    release: Vec<String>,
    metadata: Option<String>,
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-'
}

fn is_numeric(label: &str) -> bool {
    !label.is_empty() && label.bytes().all(|b| b.is_ascii_digit())
}

impl PackageVersion {
    /// Parse a version string.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(VersionError::Empty);
        }

        let (rest, metadata) = match input.split_once('+') {
            Some((rest, metadata)) => {
                if metadata.is_empty()
                    || metadata
                        .split('.')
                        .any(|part| part.is_empty() || !part.chars().all(is_label_char))
                {
                    return Err(VersionError::InvalidMetadata(input.to_owned()));
                }
                (rest, Some(metadata.to_owned()))
            }
            None => (input, None),
        };

        let (core, release) = match rest.split_once('-') {
            Some((core, release)) => {
                let labels: Vec<String> = release.split('.').map(str::to_owned).collect();
                for label in &labels {
                    let leading_zero = is_numeric(label) && label.len() > 1 && label.starts_with('0');
                    if label.is_empty() || !label.chars().all(is_label_char) || leading_zero {
                        return Err(VersionError::InvalidLabel(input.to_owned()));
                    }
                }
                (core, labels)
            }
            None => (rest, Vec::new()),
        };

        let parts: Vec<&str> = core.split('.').collect();
        if !(2..=4).contains(&parts.len()) {
            return Err(VersionError::ComponentCount(input.to_owned()));
        }

        let mut numbers = [0u64; 4];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            if !is_numeric(part) {
                return Err(VersionError::NotNumeric(input.to_owned()));
            }
            *slot = part
                .parse()
                .map_err(|_| VersionError::NotNumeric(input.to_owned()))?;
        }

        Ok(Self {
            major: numbers[0],
            minor: numbers[1],
            patch: numbers[2],
            revision: numbers[3],
            release,
            metadata,
        })
    }

    /// The major component.
    pub fn major(&self) -> u64 {
        self.major
    }

    /// The minor component.
    pub fn minor(&self) -> u64 {
        self.minor
    }

    /// The patch component.
    pub fn patch(&self) -> u64 {
        self.patch
    }

    /// Release labels, empty for a stable version.
    pub fn release_labels(&self) -> &[String] {
        &self.release
    }

    /// Build metadata, if any.
    pub fn metadata(&self) -> Option<&str> {
        self.metadata.as_deref()
    }

    /// Whether this version carries release labels.
    pub fn is_prerelease(&self) -> bool {
        !self.release.is_empty()
    }

    /// Whether this version can only be understood by SemVer 2.0.0 clients:
    /// it has build metadata or dotted release labels.
    pub fn is_semver2(&self) -> bool {
        self.metadata.is_some() || self.release.len() > 1
    }

    /// The normalized form: trailing zero revision dropped, leading zeros
    /// removed, build metadata stripped.
    pub fn normalized(&self) -> String {
        let mut out = format!("{}.{}.{}", self.major, self.minor, self.patch);
        if self.revision > 0 {
            out.push_str(&format!(".{}", self.revision));
        }
        if !self.release.is_empty() {
            out.push('-');
            out.push_str(&self.release.join("."));
        }
        out
    }

    /// The normalized form with build metadata appended.
    pub fn full(&self) -> String {
        match &self.metadata {
            Some(metadata) => format!("{}+{metadata}", self.normalized()),
            None => self.normalized(),
        }
    }

    /// The lower-cased normalized form, used in storage paths and URLs.
    pub fn key(&self) -> String {
        self.normalized().to_ascii_lowercase()
    }
}

fn compare_labels(a: &str, b: &str) -> Ordering {
    match (is_numeric(a), is_numeric(b)) {
        // Leading zeros are rejected at parse time, so length orders numbers.
        (true, true) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a
            .bytes()
            .map(|c| c.to_ascii_lowercase())
            .cmp(b.bytes().map(|c| c.to_ascii_lowercase())),
    }
}

impl Ord for PackageVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch, self.revision)
            .cmp(&(other.major, other.minor, other.patch, other.revision))
            .then_with(|| match (self.release.is_empty(), other.release.is_empty()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => {
                    for (a, b) in self.release.iter().zip(&other.release) {
                        let ord = compare_labels(a, b);
                        if ord != Ordering::Equal {
                            return ord;
                        }
                    }
                    self.release.len().cmp(&other.release.len())
                }
            })
    }
}

impl PartialOrd for PackageVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PackageVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PackageVersion {}

impl Hash for PackageVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for PackageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized())
    }
}

impl FromStr for PackageVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PackageVersion::parse(s)
    }
}

impl serde::Serialize for PackageVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.full())
    }
}

impl<'de> serde::Deserialize<'de> for PackageVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        PackageVersion::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> PackageVersion {
        PackageVersion::parse(s).unwrap()
    }

    #[test]
    fn normalizes_components() {
        assert_eq!(v("1.0").normalized(), "1.0.0");
        assert_eq!(v("01.002.3").normalized(), "1.2.3");
        assert_eq!(v("1.2.3.0").normalized(), "1.2.3");
        assert_eq!(v("1.2.3.4").normalized(), "1.2.3.4");
        assert_eq!(v("1.0.0-Beta.1+abc").normalized(), "1.0.0-Beta.1");
        assert_eq!(v("1.0.0-Beta.1+abc").full(), "1.0.0-Beta.1+abc");
        assert_eq!(v("1.0.0-Beta").key(), "1.0.0-beta");
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(PackageVersion::parse(""), Err(VersionError::Empty));
        assert!(matches!(
            PackageVersion::parse("1"),
            Err(VersionError::ComponentCount(_))
        ));
        assert!(matches!(
            PackageVersion::parse("1.2.3.4.5"),
            Err(VersionError::ComponentCount(_))
        ));
        assert!(matches!(
            PackageVersion::parse("1.x.0"),
            Err(VersionError::NotNumeric(_))
        ));
        assert!(matches!(
            PackageVersion::parse("1.0.0-"),
            Err(VersionError::InvalidLabel(_))
        ));
        assert!(matches!(
            PackageVersion::parse("1.0.0-a..b"),
            Err(VersionError::InvalidLabel(_))
        ));
        assert!(matches!(
            PackageVersion::parse("1.0.0-01"),
            Err(VersionError::InvalidLabel(_))
        ));
        assert!(matches!(
            PackageVersion::parse("1.0.0+"),
            Err(VersionError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn ordering_follows_semver_rules() {
        let mut versions: Vec<PackageVersion> = [
            "1.0.0", "1.0.0-beta.11", "1.0.0-alpha", "1.0.0-beta.2", "0.9.9", "1.0.0-alpha.1",
            "1.0.0.1", "1.0.0-rc.1", "1.0.0-beta",
        ]
        .into_iter()
        .map(v)
        .collect();
        versions.sort();

        let sorted: Vec<String> = versions.iter().map(|v| v.normalized()).collect();
        assert_eq!(
            sorted,
            [
                "0.9.9",
                "1.0.0-alpha",
                "1.0.0-alpha.1",
                "1.0.0-beta",
                "1.0.0-beta.2",
                "1.0.0-beta.11",
                "1.0.0-rc.1",
                "1.0.0",
                "1.0.0.1",
            ]
        );
    }

    #[test]
    fn equality_ignores_case_and_metadata() {
        assert_eq!(v("1.0.0-BETA"), v("1.0.0-beta"));
        assert_eq!(v("1.0.0+one"), v("1.0.0+two"));
        assert_eq!(v("1.0"), v("1.0.0.0"));
        assert_ne!(v("1.0.0"), v("1.0.0.1"));
    }

    #[test]
    fn semver2_detection() {
        assert!(!v("1.0.0").is_semver2());
        assert!(!v("1.0.0-beta").is_semver2());
        assert!(v("1.0.0-beta.1").is_semver2());
        assert!(v("1.0.0+sha").is_semver2());
        assert!(v("1.0.0-beta").is_prerelease());
    }
}
