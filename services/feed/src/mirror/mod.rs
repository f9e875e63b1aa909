//! Mirroring packages from an upstream feed.
//!
//! On a local miss the feed asks the [`Mirror`] to fetch the package from
//! upstream and ingest it. Fetches are coalesced per id and per id and
//! version: a miss that arrives while a fetch for the same key is running
//! attaches to it and sees its result. Settled fetches are forgotten, so a
//! package upstream did not have is fetched again on the next miss.

use std::sync::Arc;

use echocache::{Flights, RecvError};
use serde::Deserialize;

use crate::catalog::{Origin, PackageRecord};
use crate::error::{FeedError, FeedResult};
use crate::id::{PackageId, PackageKey};
use crate::ingest::{MirrorRequest, Pipeline};
use crate::version::PackageVersion;

mod retry;
mod upstream;

pub use self::retry::{Backoff, RetryPolicy};
pub use self::upstream::{HttpUpstream, UpstreamError, UpstreamFeed, UpstreamVersion};

/// Which versions a mirror fetches on first contact with an id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MirrorPolicy {
    /// Only the version asked for; for an id-level miss, the newest listed
    /// upstream version.
    #[default]
    RequestedVersion,
    /// Every version upstream has.
    AllVersions,
}

type Shared<T> = Result<T, Arc<FeedError>>;

#[derive(Debug)]
struct MirrorInner {
    upstream: Arc<dyn UpstreamFeed>,
    pipeline: Arc<Pipeline>,
    policy: MirrorPolicy,
    retry: RetryPolicy,
    ids: Flights<String, Shared<Vec<PackageRecord>>>,
    packages: Flights<PackageKey, Shared<PackageRecord>>,
}

/// Fetches missing packages from upstream through the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct Mirror {
    inner: Arc<MirrorInner>,
}

fn settle<T>(result: Result<Shared<T>, RecvError>) -> FeedResult<T> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(FeedError::from_shared(err)),
        Err(_) => Err(FeedError::UpstreamUnavailable(
            "mirror fetch was abandoned".into(),
        )),
    }
}

fn unavailable(err: UpstreamError) -> FeedError {
    FeedError::UpstreamUnavailable(err.to_string())
}

/// The newest listed version, or the newest at all if none is listed.
fn latest(versions: &[UpstreamVersion]) -> Option<&UpstreamVersion> {
    versions
        .iter()
        .rev()
        .find(|v| v.listed)
        .or_else(|| versions.last())
}

impl Mirror {
    /// A mirror of `upstream` writing through `pipeline`.
    pub fn new(
        upstream: Arc<dyn UpstreamFeed>,
        pipeline: Arc<Pipeline>,
        policy: MirrorPolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(MirrorInner {
                upstream,
                pipeline,
                policy,
                retry,
                ids: Flights::default(),
                packages: Flights::default(),
            }),
        }
    }

    /// The policy in effect.
    pub fn policy(&self) -> MirrorPolicy {
        self.inner.policy
    }

    /// Whether a fetch of `key` is running.
    pub fn is_fetching(&self, key: &PackageKey) -> bool {
        self.inner.packages.is_inflight(key)
    }

    /// Bring `id` in from upstream and return every local version afterwards.
    ///
    /// Fails with [`FeedError::NotFound`] if upstream does not know the id.
    pub async fn versions(&self, id: &PackageId) -> FeedResult<Vec<PackageRecord>> {
        let this = self.clone();
        let owned = id.clone();
        let result = self
            .inner
            .ids
            .get(id.normalized().to_owned(), move || {
                Box::pin(async move { this.sync_id(&owned).await.map_err(Arc::new) })
            })
            .await;
        settle(result)
    }

    /// Bring one version in from upstream.
    ///
    /// Under [`MirrorPolicy::AllVersions`] this mirrors the whole id.
    pub async fn package(&self, id: &PackageId, version: &PackageVersion) -> FeedResult<PackageRecord> {
        if self.inner.policy == MirrorPolicy::AllVersions {
            return self
                .versions(id)
                .await?
                .into_iter()
                .find(|record| record.version == *version)
                .ok_or_else(|| FeedError::NotFound(PackageKey::new(id, version).to_string()));
        }
        self.fetch(id, version, None).await
    }

    async fn fetch(
        &self,
        id: &PackageId,
        version: &PackageVersion,
        listed: Option<bool>,
    ) -> FeedResult<PackageRecord> {
        let this = self.clone();
        let (owned_id, owned_version) = (id.clone(), version.clone());
        let result = self
            .inner
            .packages
            .get(PackageKey::new(id, version), move || {
                Box::pin(async move {
                    this.fetch_package(&owned_id, &owned_version, listed)
                        .await
                        .map_err(Arc::new)
                })
            })
            .await;
        settle(result)
    }

    async fn upstream_versions(&self, id: &PackageId) -> FeedResult<Vec<UpstreamVersion>> {
        let upstream = &*self.inner.upstream;
        self.inner
            .retry
            .run("registration", move || upstream.versions(id))
            .await
            .map_err(unavailable)?
            .ok_or_else(|| FeedError::NotFound(id.to_string()))
    }

    #[tracing::instrument(skip_all, fields(%id, policy = ?self.inner.policy))]
    async fn sync_id(&self, id: &PackageId) -> FeedResult<Vec<PackageRecord>> {
        let upstream = self.upstream_versions(id).await?;
        self.resync(id, &upstream).await;

        let local = self.inner.pipeline.catalog().records_for(id.normalized()).await?;
        let wanted: Vec<&UpstreamVersion> = match self.inner.policy {
            MirrorPolicy::AllVersions => upstream.iter().collect(),
            MirrorPolicy::RequestedVersion => latest(&upstream).into_iter().collect(),
        };

        for candidate in wanted {
            if local.iter().any(|record| record.version == candidate.version) {
                continue;
            }
            match self.fetch(id, &candidate.version, Some(candidate.listed)).await {
                Ok(_) => {}
                Err(err) if err.is_not_found() => {
                    tracing::debug!(version = %candidate.version, "listed upstream but not downloadable");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(self.inner.pipeline.catalog().records_for(id.normalized()).await?)
    }

    /// Download one version and ingest it.
    ///
    /// `listed` is the upstream listing when the caller already has it.
    #[tracing::instrument(skip_all, fields(%id, %version))]
    async fn fetch_package(
        &self,
        id: &PackageId,
        version: &PackageVersion,
        listed: Option<bool>,
    ) -> FeedResult<PackageRecord> {
        let key = PackageKey::new(id, version);
        // Read before any network I/O so a delete during the fetch wins.
        let epoch = self.inner.pipeline.delete_epoch(&key);
        if let Some(record) = self.inner.pipeline.catalog().find(&key).await? {
            return Ok(record);
        }

        let listed = match listed {
            Some(listed) => listed,
            None => {
                let upstream = self.upstream_versions(id).await?;
                self.resync(id, &upstream).await;
                upstream
                    .iter()
                    .find(|candidate| candidate.version == *version)
                    .map(|candidate| candidate.listed)
                    .ok_or_else(|| FeedError::NotFound(key.to_string()))?
            }
        };

        let upstream = &*self.inner.upstream;
        let data = self
            .inner
            .retry
            .run("download", move || upstream.download(id, version))
            .await
            .map_err(unavailable)?
            .ok_or_else(|| FeedError::NotFound(key.to_string()))?;
        tracing::debug!(size = data.len(), "downloaded from upstream");

        // The commit runs on its own task so that abandoning the fetch
        // cannot interrupt it halfway.
        let pipeline = Arc::clone(&self.inner.pipeline);
        let request = MirrorRequest { key, listed, epoch };
        let commit = tokio::spawn(async move { pipeline.ingest_mirrored(data, &request).await });
        let ingested = commit
            .await
            .map_err(|err| FeedError::UpstreamUnavailable(format!("mirror commit failed: {err}")))??;
        Ok(ingested.record)
    }

    /// Match the listed flag of mirrored versions to upstream.
    async fn resync(&self, id: &PackageId, upstream: &[UpstreamVersion]) {
        let pipeline = &self.inner.pipeline;
        let local = match pipeline.catalog().records_for(id.normalized()).await {
            Ok(local) => local,
            Err(err) => {
                tracing::warn!(%id, error = %err, "skipping listing resync");
                return;
            }
        };

        for record in local.iter().filter(|record| record.origin == Origin::Mirror) {
            let Some(remote) = upstream.iter().find(|v| v.version == record.version) else {
                continue;
            };
            if remote.listed == record.listed {
                continue;
            }

            let key = record.key();
            let result = if remote.listed {
                pipeline.relist(&key).await
            } else {
                pipeline.unlist(&key).await
            };
            match result {
                Ok(()) => tracing::info!(%key, listed = remote.listed, "listing resynced from upstream"),
                Err(err) => tracing::warn!(%key, error = %err, "listing resync failed"),
            }
        }
    }
}
