//! The ingestion pipeline.
//!
//! All writes to the catalog and the content store go through [`Pipeline`].
//! Work on one package version is serialized by a per-key lock; different
//! versions proceed in parallel.
//!
//! Content is written before the catalog record and removed after it, so a
//! blob without a record can exist only transiently or after a crash. Readers
//! only reach content through a record, and the next ingest of that key
//! overwrites whatever was left behind.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::catalog::{CatalogError, CatalogStore, Listing, Origin, PackageRecord};
use crate::content::{ArtifactKind, ContentError, ContentHash, ContentStore};
use crate::error::{FeedError, FeedResult};
use crate::id::PackageKey;
use crate::manifest::{read_package, PackageArchive};

/// How an ingest was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// A new record was committed.
    Created,
    /// Identical bytes were already stored; nothing changed.
    AlreadyExists,
}

/// A package version the mirror asked upstream for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRequest {
    /// The requested version.
    pub key: PackageKey,
    /// Whether upstream lists it.
    pub listed: bool,
    /// [`Pipeline::delete_epoch`] of the key, read before the fetch started.
    pub epoch: u64,
}

/// The result of a successful ingest.
#[derive(Debug, Clone)]
pub struct Ingested {
    /// The stored record.
    pub record: PackageRecord,
    /// Whether the record is new.
    pub outcome: IngestOutcome,
}

type KeyLockMap = DashMap<PackageKey, Arc<Mutex<()>>>;

/// Holds the lock for one key and drops the map entry when nobody else wants it.
struct KeyGuard<'a> {
    locks: &'a KeyLockMap,
    key: PackageKey,
    mutex: Arc<Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // The map and this guard hold the only references when no one waits.
        self.locks
            .remove_if(&self.key, |_, mutex| {
                Arc::ptr_eq(mutex, &self.mutex) && Arc::strong_count(mutex) <= 2
            });
    }
}

/// Validates packages and commits them to the catalog and content store.
#[derive(Debug)]
pub struct Pipeline {
    catalog: Arc<dyn CatalogStore>,
    content: ContentStore,
    locks: KeyLockMap,
    // Keys deleted and not added since, with the stamp of their last delete.
    // Bounded by the number of currently deleted versions.
    deletes: DashMap<PackageKey, u64>,
    delete_stamps: AtomicU64,
}

impl Pipeline {
    /// Create a pipeline over a catalog and a content store.
    pub fn new(catalog: Arc<dyn CatalogStore>, content: ContentStore) -> Self {
        Self {
            catalog,
            content,
            locks: DashMap::new(),
            deletes: DashMap::new(),
            delete_stamps: AtomicU64::new(0),
        }
    }

    /// The catalog this pipeline writes to.
    pub fn catalog(&self) -> &Arc<dyn CatalogStore> {
        &self.catalog
    }

    /// The content store this pipeline writes to.
    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    async fn lock(&self, key: &PackageKey) -> KeyGuard<'_> {
        let mutex = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.clone().lock_owned().await;
        KeyGuard {
            locks: &self.locks,
            key: key.clone(),
            mutex,
            guard: Some(guard),
        }
    }

    /// A stamp that changes whenever `key` is deleted.
    ///
    /// A mirror reads this before fetching and hands it back to
    /// [`Pipeline::ingest_mirrored`], which refuses to resurrect a package
    /// deleted in the meantime. Stamps are never reused, so a key deleted,
    /// added again and deleted once more never repeats an earlier stamp.
    pub fn delete_epoch(&self, key: &PackageKey) -> u64 {
        self.deletes.get(key).map(|epoch| *epoch).unwrap_or(0)
    }

    /// Ingest a pushed package.
    #[tracing::instrument(skip_all, fields(size = data.len()))]
    pub async fn ingest(&self, data: Bytes) -> FeedResult<Ingested> {
        let archive = read_package(&data)?;
        self.commit(archive, data, None).await
    }

    /// Ingest a package fetched from upstream for `request`.
    ///
    /// The package must be the requested version; anything else fails with
    /// [`FeedError::UpstreamUnavailable`] before a write. Fails with
    /// [`FeedError::NotFound`] if the key was deleted after the request's
    /// epoch was read. A new record carries the upstream listing.
    #[tracing::instrument(skip_all, fields(size = data.len(), key = %request.key))]
    pub async fn ingest_mirrored(&self, data: Bytes, request: &MirrorRequest) -> FeedResult<Ingested> {
        let archive = read_package(&data)?;
        let served = PackageKey::new(&archive.id, &archive.version);
        if served != request.key {
            tracing::warn!(%served, "upstream served a different package");
            return Err(FeedError::UpstreamUnavailable(format!(
                "upstream served {served} for {}",
                request.key
            )));
        }
        self.commit(archive, data, Some(request)).await
    }

    async fn commit(
        &self,
        archive: PackageArchive,
        data: Bytes,
        mirror: Option<&MirrorRequest>,
    ) -> FeedResult<Ingested> {
        let key = PackageKey::new(&archive.id, &archive.version);
        let hash = ContentHash::of(&data);
        let origin = if mirror.is_some() {
            Origin::Mirror
        } else {
            Origin::Local
        };
        let _guard = self.lock(&key).await;

        if let Some(existing) = self.catalog.find(&key).await? {
            return resolve_existing(existing, &hash);
        }

        if let Some(request) = mirror {
            if self.delete_epoch(&key) != request.epoch {
                tracing::info!(%key, "package deleted while it was being mirrored");
                return Err(FeedError::NotFound(key.to_string()));
            }
        }

        let hashes = match self.stage(&key, &archive, &data).await {
            Ok(hashes) => hashes,
            Err(err) => {
                self.rollback(&key).await;
                return Err(err);
            }
        };

        let mut record = PackageRecord::new(&archive, hashes, Utc::now(), origin);
        record.listed = mirror.map_or(true, |request| request.listed);
        match self.catalog.insert(record.clone()).await {
            Ok(commit) => {
                record.added = commit.sequence;
                self.deletes.remove(&key);
                tracing::info!(%key, sequence = commit.sequence, ?origin, listed = record.listed, "package added");
                Ok(Ingested {
                    record,
                    outcome: IngestOutcome::Created,
                })
            }
            Err(CatalogError::UniqueViolation(_)) => {
                // Another writer sharing this catalog won the insert.
                match self.catalog.find(&key).await? {
                    Some(existing) => resolve_existing(existing, &hash),
                    None => Err(FeedError::Catalog(CatalogError::Unavailable(format!(
                        "record for {key} vanished after a unique violation"
                    )))),
                }
            }
            Err(err) => {
                self.rollback(&key).await;
                Err(err.into())
            }
        }
    }

    async fn stage(
        &self,
        key: &PackageKey,
        archive: &PackageArchive,
        data: &Bytes,
    ) -> FeedResult<BTreeMap<ArtifactKind, ContentHash>> {
        let artifacts = [
            (ArtifactKind::Package, Some(data)),
            (ArtifactKind::Manifest, Some(&archive.nuspec)),
            (ArtifactKind::Readme, archive.readme.as_ref()),
            (ArtifactKind::Icon, archive.icon.as_ref()),
            (ArtifactKind::License, archive.license.as_ref()),
        ];

        let mut hashes = BTreeMap::new();
        for (kind, blob) in artifacts {
            let Some(blob) = blob else { continue };
            let hash = match self.content.put(key, kind, blob).await {
                Ok(hash) => hash,
                Err(ContentError::Conflict { .. }) => {
                    tracing::debug!(%key, %kind, "overwriting content left without a record");
                    self.content.replace(key, kind, blob).await?
                }
                Err(ContentError::Storage(err)) => return Err(err.into()),
            };
            hashes.insert(kind, hash);
        }
        Ok(hashes)
    }

    async fn rollback(&self, key: &PackageKey) {
        if let Err(err) = self.content.delete(key).await {
            tracing::warn!(%key, error = %err, "failed to roll back staged content");
        }
    }

    /// Hide a version from search and listings.
    #[tracing::instrument(skip_all, fields(%key))]
    pub async fn unlist(&self, key: &PackageKey) -> FeedResult<()> {
        self.set_listed(key, false).await
    }

    /// Make an unlisted version visible again.
    #[tracing::instrument(skip_all, fields(%key))]
    pub async fn relist(&self, key: &PackageKey) -> FeedResult<()> {
        self.set_listed(key, true).await
    }

    async fn set_listed(&self, key: &PackageKey, listed: bool) -> FeedResult<()> {
        let _guard = self.lock(key).await;
        match self.catalog.set_listed(key, listed).await? {
            Listing::Missing => Err(FeedError::NotFound(key.to_string())),
            Listing::Unchanged => Ok(()),
            Listing::Changed(commit) => {
                tracing::info!(sequence = commit.sequence, kind = %commit.kind, "listing changed");
                Ok(())
            }
        }
    }

    /// Remove a version and all of its content. Succeeds if it never existed.
    #[tracing::instrument(skip_all, fields(%key))]
    pub async fn delete(&self, key: &PackageKey) -> FeedResult<()> {
        let _guard = self.lock(key).await;
        let stamp = self.delete_stamps.fetch_add(1, Ordering::SeqCst) + 1;
        self.deletes.insert(key.clone(), stamp);

        if let Some(commit) = self.catalog.remove(key).await? {
            tracing::info!(sequence = commit.sequence, "package deleted");
        }
        self.content.delete(key).await?;
        Ok(())
    }

    /// Count a download of a version.
    pub async fn record_download(&self, key: &PackageKey) -> FeedResult<()> {
        if !self.catalog.add_download(key).await? {
            tracing::debug!(%key, "download counted for a missing package");
        }
        Ok(())
    }
}

fn resolve_existing(existing: PackageRecord, hash: &ContentHash) -> FeedResult<Ingested> {
    if existing.package_hash() == Some(hash) {
        Ok(Ingested {
            record: existing,
            outcome: IngestOutcome::AlreadyExists,
        })
    } else {
        Err(FeedError::PackageAlreadyExists {
            id: existing.id.to_string(),
            version: existing.version.normalized(),
        })
    }
}
