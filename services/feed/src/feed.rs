//! The feed: every operation the HTTP surface exposes.

use std::sync::Arc;

use bytes::Bytes;

use crate::catalog::{CatalogStore, PackageRecord};
use crate::catalog_pages::CatalogPager;
use crate::config::DeletionBehavior;
use crate::content::ArtifactKind;
use crate::error::{FeedError, FeedResult};
use crate::id::{PackageId, PackageKey};
use crate::ingest::{Ingested, Pipeline};
use crate::mirror::Mirror;
use crate::protocol::{
    AutocompleteResponse, CatalogIndex, CatalogLeaf, CatalogPage, DependentsResponse,
    FeedRegistrationIndex, MetadataExtensions, PackageVersions, RegistrationLeaf,
    RegistrationPage, SearchResponse, ServiceIndex, Urls,
};
use crate::registration::RegistrationPager;
use crate::search::{AutocompleteRequest, SearchEngine, SearchRequest};
use crate::version::PackageVersion;

#[derive(Debug)]
pub(crate) struct FeedInner {
    pub(crate) urls: Urls,
    pub(crate) pipeline: Arc<Pipeline>,
    pub(crate) registrations: RegistrationPager,
    pub(crate) catalog_pages: CatalogPager,
    pub(crate) search: SearchEngine,
    pub(crate) mirror: Option<Mirror>,
    pub(crate) deletion: DeletionBehavior,
}

/// A package feed. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Feed {
    inner: Arc<FeedInner>,
}

/// Parse an id and version taken from a request path.
pub fn parse_key(id: &str, version: &str) -> FeedResult<(PackageId, PackageVersion)> {
    Ok((PackageId::new(id)?, PackageVersion::parse(version)?))
}

impl Feed {
    pub(crate) fn from_inner(inner: FeedInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The URLs documents link to.
    pub fn urls(&self) -> &Urls {
        &self.inner.urls
    }

    /// The ingestion pipeline.
    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.inner.pipeline
    }

    /// The catalog.
    pub fn catalog(&self) -> &Arc<dyn CatalogStore> {
        self.inner.pipeline.catalog()
    }

    /// The upstream mirror, when enabled.
    pub fn mirror(&self) -> Option<&Mirror> {
        self.inner.mirror.as_ref()
    }

    /// What a delete request does.
    pub fn deletion(&self) -> DeletionBehavior {
        self.inner.deletion
    }

    /// The service index document.
    pub fn service_index(&self) -> ServiceIndex {
        ServiceIndex::new(&self.inner.urls)
    }

    /// Add a package.
    pub async fn push(&self, data: Bytes) -> FeedResult<Ingested> {
        self.inner.pipeline.ingest(data).await
    }

    /// Hide a version.
    pub async fn unlist(&self, id: &PackageId, version: &PackageVersion) -> FeedResult<()> {
        self.inner.pipeline.unlist(&PackageKey::new(id, version)).await
    }

    /// Show a hidden version again.
    pub async fn relist(&self, id: &PackageId, version: &PackageVersion) -> FeedResult<()> {
        self.inner.pipeline.relist(&PackageKey::new(id, version)).await
    }

    /// Remove a version and its content. Succeeds if it does not exist.
    pub async fn delete(&self, id: &PackageId, version: &PackageVersion) -> FeedResult<()> {
        self.inner.pipeline.delete(&PackageKey::new(id, version)).await
    }

    /// Unlist or delete, as configured.
    pub async fn remove(&self, id: &PackageId, version: &PackageVersion) -> FeedResult<()> {
        match self.inner.deletion {
            DeletionBehavior::Unlist => self.unlist(id, version).await,
            DeletionBehavior::HardDelete => self.delete(id, version).await,
        }
    }

    /// Every local version of `id`, mirroring the id when none exist.
    ///
    /// Empty when neither this feed nor upstream has the id.
    pub async fn records(&self, id: &PackageId) -> FeedResult<Vec<PackageRecord>> {
        let local = self.catalog().records_for(id.normalized()).await?;
        if !local.is_empty() {
            return Ok(local);
        }
        match &self.inner.mirror {
            Some(mirror) => match mirror.versions(id).await {
                Ok(records) => Ok(records),
                Err(err) if err.is_not_found() => Ok(Vec::new()),
                Err(err) => Err(err),
            },
            None => Ok(local),
        }
    }

    /// One version, mirroring it when missing.
    pub async fn record(&self, id: &PackageId, version: &PackageVersion) -> FeedResult<PackageRecord> {
        let key = PackageKey::new(id, version);
        if let Some(record) = self.catalog().find(&key).await? {
            return Ok(record);
        }
        match &self.inner.mirror {
            Some(mirror) => mirror.package(id, version).await,
            None => Err(FeedError::NotFound(key.to_string())),
        }
    }

    /// `GET /v3/package/{id}/index.json`
    pub async fn package_versions(&self, id: &PackageId) -> FeedResult<PackageVersions> {
        let records = self.records(id).await?;
        if records.is_empty() {
            return Err(FeedError::NotFound(id.to_string()));
        }
        Ok(PackageVersions {
            versions: records.iter().map(|r| r.version.key()).collect(),
        })
    }

    /// Read one artifact. Package downloads are counted.
    pub async fn download(
        &self,
        id: &PackageId,
        version: &PackageVersion,
        kind: ArtifactKind,
    ) -> FeedResult<Bytes> {
        let record = self.record(id, version).await?;
        let key = record.key();
        if !record.has(kind) {
            return Err(FeedError::NotFound(format!("{key} has no {kind}")));
        }

        let data = self
            .inner
            .pipeline
            .content()
            .get(&key, kind)
            .await?
            .ok_or_else(|| FeedError::NotFound(format!("{kind} of {key}")))?;

        if kind == ArtifactKind::Package {
            self.inner.pipeline.record_download(&key).await?;
        }
        Ok(data)
    }

    /// `GET /v3/registration/{id}/index.json`
    pub async fn registration_index(&self, id: &PackageId) -> FeedResult<FeedRegistrationIndex> {
        let records = self.records(id).await?;
        self.inner
            .registrations
            .index(&records)
            .ok_or_else(|| FeedError::NotFound(id.to_string()))
    }

    /// `GET /v3/registration/{id}/page/{lower}/{upper}.json`
    pub async fn registration_page(
        &self,
        id: &PackageId,
        lower: &PackageVersion,
        upper: &PackageVersion,
    ) -> FeedResult<RegistrationPage<MetadataExtensions>> {
        let records = self.catalog().records_for(id.normalized()).await?;
        self.inner
            .registrations
            .page(&records, lower, upper)
            .ok_or_else(|| FeedError::NotFound(format!("{id} {lower}..{upper}")))
    }

    /// `GET /v3/registration/{id}/{version}.json`
    pub async fn registration_leaf(
        &self,
        id: &PackageId,
        version: &PackageVersion,
    ) -> FeedResult<RegistrationLeaf> {
        let record = self.record(id, version).await?;
        Ok(self.inner.registrations.leaf(&record))
    }

    /// `GET /v3/catalog/index.json`
    pub async fn catalog_index(&self) -> FeedResult<CatalogIndex> {
        Ok(self.inner.catalog_pages.index(self.catalog().as_ref()).await?)
    }

    /// `GET /v3/catalog/page{n}.json`
    pub async fn catalog_page(&self, page: usize) -> FeedResult<CatalogPage> {
        self.inner
            .catalog_pages
            .page(self.catalog().as_ref(), page)
            .await?
            .ok_or_else(|| FeedError::NotFound(format!("catalog page {page}")))
    }

    /// `GET /v3/catalog/data/{sequence}/{id}.{version}.json`
    ///
    /// `name` is the `{id}.{version}` part of the leaf URL.
    pub async fn catalog_leaf(&self, sequence: u64, name: &str) -> FeedResult<CatalogLeaf> {
        let not_found = || FeedError::NotFound(format!("catalog leaf {sequence}/{name}"));
        let commit = self.catalog().commit(sequence).await?.ok_or_else(not_found)?;
        let expected = format!("{}.{}", commit.id.normalized(), commit.version.key());
        if !expected.eq_ignore_ascii_case(name) {
            return Err(not_found());
        }

        let published = self
            .catalog()
            .find(&PackageKey::new(&commit.id, &commit.version))
            .await?
            .map(|record| record.published);
        Ok(self.inner.catalog_pages.leaf(&commit, published))
    }

    /// `GET /v3/search`
    pub async fn search(&self, request: &SearchRequest) -> FeedResult<SearchResponse> {
        Ok(self.inner.search.search(request).await?)
    }

    /// `GET /v3/autocomplete`
    pub async fn autocomplete(&self, request: &AutocompleteRequest) -> FeedResult<AutocompleteResponse> {
        Ok(self.inner.search.autocomplete(request).await?)
    }

    /// Every version of `id`, ascending, optionally with unlisted ones.
    pub async fn list_versions(
        &self,
        id: &PackageId,
        include_unlisted: bool,
    ) -> FeedResult<Vec<PackageVersion>> {
        Ok(self
            .inner
            .search
            .list_versions(id.normalized(), include_unlisted)
            .await?)
    }

    /// `GET /v3/dependents`
    pub async fn dependents(&self, id: &PackageId) -> FeedResult<DependentsResponse> {
        Ok(self.inner.search.dependents(id.normalized()).await?)
    }
}
