//! The package catalog.
//!
//! The catalog holds one [`PackageRecord`] per package version and an
//! append-only log of [`CatalogCommit`]s describing every change to the set of
//! records. Persistence is abstracted behind [`CatalogStore`]; the in-memory
//! [`MemoryCatalog`] is the adapter shipped with the feed.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Range;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::content::{ArtifactKind, ContentHash};
use crate::id::{PackageId, PackageKey};
use crate::manifest::{DependencyGroup, PackageArchive};
use crate::version::PackageVersion;

/// Errors from a catalog adapter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CatalogError {
    /// A record for this key already exists.
    #[error("a record for {0} already exists")]
    UniqueViolation(PackageKey),

    /// The backing store could not be reached.
    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

/// Where a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Pushed by a client.
    #[default]
    Local,
    /// Fetched from the upstream feed.
    Mirror,
}

/// A dependency of one package version on another package id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyEdge {
    /// The depending package.
    pub package: PackageKey,
    /// The lower-cased id depended upon.
    pub dependency: String,
    /// The version range, as written.
    pub range: Option<String>,
    /// The target framework the dependency applies to.
    pub target_framework: Option<String>,
}

/// Everything the catalog knows about one package version.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageRecord {
    /// The id, in the casing of the first upload.
    pub id: PackageId,
    /// The version, with build metadata if any was given.
    pub version: PackageVersion,
    /// Whether the version appears in search and listings.
    pub listed: bool,
    /// When the version was first ingested.
    pub published: DateTime<Utc>,
    /// Download counter.
    pub downloads: u64,
    /// Where the package came from.
    pub origin: Origin,
    /// Sequence of the commit that added this version, 0 until inserted.
    pub added: u64,
    /// Authors.
    pub authors: Vec<String>,
    /// Description.
    pub description: String,
    /// Summary.
    pub summary: Option<String>,
    /// Title.
    pub title: Option<String>,
    /// Tags.
    pub tags: Vec<String>,
    /// Icon URL.
    pub icon_url: Option<String>,
    /// License URL.
    pub license_url: Option<String>,
    /// SPDX license expression.
    pub license_expression: Option<String>,
    /// Project URL.
    pub project_url: Option<String>,
    /// Release notes.
    pub release_notes: Option<String>,
    /// Repository URL.
    pub repository_url: Option<String>,
    /// Repository type.
    pub repository_type: Option<String>,
    /// Whether license acceptance is required.
    pub require_license_acceptance: bool,
    /// Minimum client version.
    pub min_client_version: Option<String>,
    /// Dependency groups.
    pub dependency_groups: Vec<DependencyGroup>,
    /// Target frameworks, lower-cased.
    pub target_frameworks: Vec<String>,
    /// Package types.
    pub package_types: Vec<String>,
    /// Hashes of every stored artifact.
    pub hashes: BTreeMap<ArtifactKind, ContentHash>,
}

impl PackageRecord {
    /// Build the record for a freshly stored package.
    pub fn new(
        archive: &PackageArchive,
        hashes: BTreeMap<ArtifactKind, ContentHash>,
        published: DateTime<Utc>,
        origin: Origin,
    ) -> Self {
        let m = &archive.manifest;
        Self {
            id: archive.id.clone(),
            version: archive.version.clone(),
            listed: true,
            published,
            downloads: 0,
            origin,
            added: 0,
            authors: m.authors.clone(),
            description: m.description.clone(),
            summary: m.summary.clone(),
            title: m.title.clone(),
            tags: m.tags.clone(),
            icon_url: m.icon_url.clone(),
            license_url: m.license_url.clone(),
            license_expression: m.license_expression.clone(),
            project_url: m.project_url.clone(),
            release_notes: m.release_notes.clone(),
            repository_url: m.repository_url.clone(),
            repository_type: m.repository_type.clone(),
            require_license_acceptance: m.require_license_acceptance,
            min_client_version: m.min_client_version.clone(),
            dependency_groups: m.dependency_groups.clone(),
            target_frameworks: archive.target_frameworks.clone(),
            package_types: m.package_types.clone(),
            hashes,
        }
    }

    /// The normalized key.
    pub fn key(&self) -> PackageKey {
        PackageKey::new(&self.id, &self.version)
    }

    /// Hash of the `.nupkg`.
    pub fn package_hash(&self) -> Option<&ContentHash> {
        self.hashes.get(&ArtifactKind::Package)
    }

    /// Whether an artifact of this kind is stored.
    pub fn has(&self, kind: ArtifactKind) -> bool {
        self.hashes.contains_key(&kind)
    }

    /// Every dependency edge, flattened across groups.
    pub fn dependencies(&self) -> impl Iterator<Item = DependencyEdge> + '_ {
        let package = self.key();
        self.dependency_groups.iter().flat_map(move |group| {
            let package = package.clone();
            group.dependencies.iter().map(move |dependency| DependencyEdge {
                package: package.clone(),
                dependency: dependency.id.to_ascii_lowercase(),
                range: dependency.range.clone(),
                target_framework: group.target_framework.clone(),
            })
        })
    }
}

/// What a catalog commit did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitKind {
    /// A version was ingested.
    Add,
    /// A version was hidden from listings.
    Unlist,
    /// A version was listed again.
    Relist,
    /// A version was removed.
    Delete,
}

impl fmt::Display for CommitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CommitKind::Add => "add",
            CommitKind::Unlist => "unlist",
            CommitKind::Relist => "relist",
            CommitKind::Delete => "delete",
        })
    }
}

/// One entry of the catalog change log.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogCommit {
    /// Position in the log, starting at 1. Never reused.
    pub sequence: u64,
    /// When the commit was made, never earlier than its predecessor.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: CommitKind,
    /// The package id.
    pub id: PackageId,
    /// The package version.
    pub version: PackageVersion,
}

/// The outcome of a listing change.
#[derive(Debug, Clone, PartialEq)]
pub enum Listing {
    /// No record for the key.
    Missing,
    /// The record already had the requested flag.
    Unchanged,
    /// The flag changed and a commit was appended.
    Changed(CatalogCommit),
}

/// Persistence for package records and the commit log.
///
/// Every mutation appends its commit in the same critical section as the
/// record change, so the log order is the order mutations took effect.
#[async_trait::async_trait]
pub trait CatalogStore: fmt::Debug + Send + Sync {
    /// Look up a record.
    async fn find(&self, key: &PackageKey) -> Result<Option<PackageRecord>, CatalogError>;

    /// Insert a new record and append an `add` commit.
    ///
    /// Fails with [`CatalogError::UniqueViolation`] if the key exists.
    async fn insert(&self, record: PackageRecord) -> Result<CatalogCommit, CatalogError>;

    /// Set the listed flag, appending `unlist` or `relist` on change.
    async fn set_listed(&self, key: &PackageKey, listed: bool) -> Result<Listing, CatalogError>;

    /// Remove a record and append a `delete` commit. `None` if it did not exist.
    async fn remove(&self, key: &PackageKey) -> Result<Option<CatalogCommit>, CatalogError>;

    /// Increment the download counter. `false` if the record does not exist.
    async fn add_download(&self, key: &PackageKey) -> Result<bool, CatalogError>;

    /// Every version of an id, ascending.
    async fn records_for(&self, id: &str) -> Result<Vec<PackageRecord>, CatalogError>;

    /// Every record, by id then version.
    async fn records(&self) -> Result<Vec<PackageRecord>, CatalogError>;

    /// Commits by log position (zero based), in order.
    async fn commits(&self, range: Range<usize>) -> Result<Vec<CatalogCommit>, CatalogError>;

    /// Number of commits in the log.
    async fn commit_count(&self) -> Result<usize, CatalogError>;

    /// The most recent commit.
    async fn latest_commit(&self) -> Result<Option<CatalogCommit>, CatalogError>;

    /// Look up a commit by sequence number.
    async fn commit(&self, sequence: u64) -> Result<Option<CatalogCommit>, CatalogError>;
}

#[derive(Debug, Default)]
struct CatalogState {
    packages: HashMap<String, BTreeMap<PackageVersion, PackageRecord>>,
    log: Vec<CatalogCommit>,
}

impl CatalogState {
    fn append(&mut self, kind: CommitKind, id: &PackageId, version: &PackageVersion) -> CatalogCommit {
        let now = Utc::now();
        let timestamp = match self.log.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        let commit = CatalogCommit {
            sequence: self.log.len() as u64 + 1,
            timestamp,
            kind,
            id: id.clone(),
            version: version.clone(),
        };
        self.log.push(commit.clone());
        commit
    }

    fn get_mut(&mut self, key: &PackageKey) -> Option<&mut PackageRecord> {
        self.packages.get_mut(key.id())?.get_mut(key.version())
    }
}

/// An in-process catalog.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    state: RwLock<CatalogState>,
}

impl MemoryCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CatalogStore for MemoryCatalog {
    async fn find(&self, key: &PackageKey) -> Result<Option<PackageRecord>, CatalogError> {
        let state = self.state.read();
        Ok(state
            .packages
            .get(key.id())
            .and_then(|versions| versions.get(key.version()))
            .cloned())
    }

    async fn insert(&self, mut record: PackageRecord) -> Result<CatalogCommit, CatalogError> {
        let key = record.key();
        let mut state = self.state.write();
        if state.get_mut(&key).is_some() {
            return Err(CatalogError::UniqueViolation(key));
        }

        let commit = state.append(CommitKind::Add, &record.id, &record.version);
        record.added = commit.sequence;
        state
            .packages
            .entry(key.id().to_owned())
            .or_default()
            .insert(record.version.clone(), record);
        Ok(commit)
    }

    async fn set_listed(&self, key: &PackageKey, listed: bool) -> Result<Listing, CatalogError> {
        let mut state = self.state.write();
        let Some(record) = state.get_mut(key) else {
            return Ok(Listing::Missing);
        };
        if record.listed == listed {
            return Ok(Listing::Unchanged);
        }

        record.listed = listed;
        let (id, version) = (record.id.clone(), record.version.clone());
        let kind = if listed {
            CommitKind::Relist
        } else {
            CommitKind::Unlist
        };
        Ok(Listing::Changed(state.append(kind, &id, &version)))
    }

    async fn remove(&self, key: &PackageKey) -> Result<Option<CatalogCommit>, CatalogError> {
        let mut state = self.state.write();
        let Some(versions) = state.packages.get_mut(key.id()) else {
            return Ok(None);
        };
        let Some(record) = versions.remove(key.version()) else {
            return Ok(None);
        };
        if versions.is_empty() {
            state.packages.remove(key.id());
        }
        Ok(Some(state.append(CommitKind::Delete, &record.id, &record.version)))
    }

    async fn add_download(&self, key: &PackageKey) -> Result<bool, CatalogError> {
        let mut state = self.state.write();
        match state.get_mut(key) {
            Some(record) => {
                record.downloads += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn records_for(&self, id: &str) -> Result<Vec<PackageRecord>, CatalogError> {
        let state = self.state.read();
        Ok(state
            .packages
            .get(&id.to_ascii_lowercase())
            .map(|versions| versions.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn records(&self) -> Result<Vec<PackageRecord>, CatalogError> {
        let state = self.state.read();
        let mut ids: Vec<&String> = state.packages.keys().collect();
        ids.sort();
        Ok(ids
            .into_iter()
            .flat_map(|id| state.packages[id].values().cloned())
            .collect())
    }

    async fn commits(&self, range: Range<usize>) -> Result<Vec<CatalogCommit>, CatalogError> {
        let state = self.state.read();
        let end = range.end.min(state.log.len());
        let start = range.start.min(end);
        Ok(state.log[start..end].to_vec())
    }

    async fn commit_count(&self) -> Result<usize, CatalogError> {
        Ok(self.state.read().log.len())
    }

    async fn latest_commit(&self) -> Result<Option<CatalogCommit>, CatalogError> {
        Ok(self.state.read().log.last().cloned())
    }

    async fn commit(&self, sequence: u64) -> Result<Option<CatalogCommit>, CatalogError> {
        let state = self.state.read();
        let Some(index) = sequence.checked_sub(1) else {
            return Ok(None);
        };
        Ok(usize::try_from(index)
            .ok()
            .and_then(|index| state.log.get(index))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::read_package;
    use crate::testing::PackageBuilder;

    fn record(id: &str, version: &str) -> PackageRecord {
        let archive = read_package(
            &PackageBuilder::new(id, version)
                .dependency(Some("net8.0"), "Dep.One", "1.0.0")
                .build(),
        )
        .unwrap();
        PackageRecord::new(&archive, BTreeMap::new(), Utc::now(), Origin::Local)
    }

    #[tokio::test]
    async fn insert_is_unique_per_key() {
        let catalog = MemoryCatalog::new();
        let commit = catalog.insert(record("Demo", "1.0.0")).await.unwrap();
        assert_eq!(commit.sequence, 1);
        assert_eq!(commit.kind, CommitKind::Add);
        let stored = catalog.find(&record("demo", "1.0.0").key()).await.unwrap();
        assert_eq!(stored.map(|r| r.added), Some(1));

        let err = catalog.insert(record("DEMO", "1.0")).await.unwrap_err();
        assert!(matches!(err, CatalogError::UniqueViolation(_)));
        assert_eq!(catalog.commit_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn listing_changes_are_idempotent() {
        let catalog = MemoryCatalog::new();
        let rec = record("Demo", "1.0.0");
        let key = rec.key();
        catalog.insert(rec).await.unwrap();

        assert!(matches!(
            catalog.set_listed(&key, false).await.unwrap(),
            Listing::Changed(CatalogCommit { kind: CommitKind::Unlist, .. })
        ));
        assert_eq!(catalog.set_listed(&key, false).await.unwrap(), Listing::Unchanged);
        assert!(matches!(
            catalog.set_listed(&key, true).await.unwrap(),
            Listing::Changed(CatalogCommit { kind: CommitKind::Relist, .. })
        ));
        assert_eq!(catalog.commit_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn downloads_do_not_append_commits() {
        let catalog = MemoryCatalog::new();
        let rec = record("Demo", "1.0.0");
        let key = rec.key();
        catalog.insert(rec).await.unwrap();

        assert!(catalog.add_download(&key).await.unwrap());
        assert!(catalog.add_download(&key).await.unwrap());
        assert_eq!(catalog.find(&key).await.unwrap().unwrap().downloads, 2);
        assert_eq!(catalog.commit_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn log_is_ordered_and_stable() {
        let catalog = MemoryCatalog::new();
        for version in ["1.0.0", "2.0.0", "1.5.0"] {
            catalog.insert(record("Demo", version)).await.unwrap();
        }
        let key = record("Demo", "2.0.0").key();
        catalog.remove(&key).await.unwrap().unwrap();
        assert!(catalog.remove(&key).await.unwrap().is_none());

        let commits = catalog.commits(0..10).await.unwrap();
        let sequences: Vec<u64> = commits.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, [1, 2, 3, 4]);
        assert!(commits.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(commits[3].kind, CommitKind::Delete);
        assert_eq!(catalog.commit(4).await.unwrap(), Some(commits[3].clone()));
        assert_eq!(catalog.commit(0).await.unwrap(), None);

        let versions: Vec<String> = catalog
            .records_for("demo")
            .await
            .unwrap()
            .iter()
            .map(|r| r.version.normalized())
            .collect();
        assert_eq!(versions, ["1.0.0", "1.5.0"]);
    }

    #[test]
    fn dependency_edges_are_flattened() {
        let edges: Vec<DependencyEdge> = record("Demo", "1.0.0").dependencies().collect();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].dependency, "dep.one");
        assert_eq!(edges[0].target_framework.as_deref(), Some("net8.0"));
    }
}
