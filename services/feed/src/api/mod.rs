//! Feed builder and HTTP router

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::response::Json;
use axum::routing::get;

use crate::catalog::{CatalogStore, MemoryCatalog};
use crate::catalog_pages::{self, CatalogPager};
use crate::config::{DeletionBehavior, FeedConfig};
use crate::content::ContentStore;
use crate::error::FeedResult;
use crate::feed::{Feed, FeedInner};
use crate::ingest::Pipeline;
use crate::mirror::{HttpUpstream, Mirror, MirrorPolicy, RetryPolicy, UpstreamFeed};
use crate::protocol::{ServiceIndex, Urls};
use crate::registration::{self, RegistrationPager};
use crate::search::{self, SearchEngine};

mod download;
mod metadata;
mod publish;
mod query;

const DEFAULT_BUCKET: &str = "packages";

/// Feed builder for configuring and creating the package feed
#[derive(Debug)]
pub struct FeedBuilder {
    storage: Option<storage::Storage>,
    bucket: Option<String>,
    base_url: Option<String>,
    catalog: Option<Arc<dyn CatalogStore>>,
    upstream: Option<Arc<dyn UpstreamFeed>>,
    policy: MirrorPolicy,
    retry: RetryPolicy,
    registration_page_size: usize,
    catalog_page_size: usize,
    max_search_take: usize,
    deletion: DeletionBehavior,
}

impl Default for FeedBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedBuilder {
    /// Create a new feed builder
    pub fn new() -> Self {
        Self {
            storage: None,
            bucket: None,
            base_url: None,
            catalog: None,
            upstream: None,
            policy: MirrorPolicy::default(),
            retry: RetryPolicy::default(),
            registration_page_size: registration::DEFAULT_PAGE_SIZE,
            catalog_page_size: catalog_pages::DEFAULT_PAGE_SIZE,
            max_search_take: search::DEFAULT_MAX_TAKE,
            deletion: DeletionBehavior::default(),
        }
    }

    /// A builder set up from configuration, with its storage backend opened.
    pub async fn from_config(config: &FeedConfig) -> FeedResult<Self> {
        let storage = config.storage.clone().build().await?;
        let mut builder = Self::new()
            .storage(storage)
            .bucket(config.bucket.clone())
            .base_url(config.base_url.clone())
            .registration_page_size(config.registration_page_size)
            .catalog_page_size(config.catalog_page_size)
            .max_search_take(config.max_search_take)
            .deletion(config.deletion)
            .mirror_policy(config.mirror.policy)
            .retry(config.mirror.retry());

        if config.mirror.enabled {
            if let Some(service_index) = &config.mirror.service_index {
                tracing::info!(upstream = %service_index, policy = ?config.mirror.policy, "mirroring enabled");
                builder = builder.upstream(Arc::new(HttpUpstream::new(service_index.clone())));
            }
        }
        Ok(builder)
    }

    /// Set the storage backend
    pub fn storage(mut self, storage: storage::Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the bucket name for storage
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the public base URL
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Use a catalog other than the in-memory one
    pub fn catalog(mut self, catalog: Arc<dyn CatalogStore>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Mirror misses from an upstream feed
    pub fn upstream(mut self, upstream: Arc<dyn UpstreamFeed>) -> Self {
        self.upstream = Some(upstream);
        self
    }

    /// Which versions the mirror fetches
    pub fn mirror_policy(mut self, policy: MirrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// How upstream calls are retried
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Versions per registration page
    pub fn registration_page_size(mut self, size: usize) -> Self {
        self.registration_page_size = size;
        self
    }

    /// Commits per catalog page
    pub fn catalog_page_size(mut self, size: usize) -> Self {
        self.catalog_page_size = size;
        self
    }

    /// Largest search page
    pub fn max_search_take(mut self, take: usize) -> Self {
        self.max_search_take = take;
        self
    }

    /// What a delete request does
    pub fn deletion(mut self, deletion: DeletionBehavior) -> Self {
        self.deletion = deletion;
        self
    }

    /// Build the feed
    ///
    /// Without a storage backend, packages are kept in memory.
    pub fn build(self) -> Feed {
        let bucket = self.bucket.unwrap_or_else(|| DEFAULT_BUCKET.to_owned());
        let storage = self
            .storage
            .unwrap_or_else(|| storage::MemoryStorage::with_buckets(&[bucket.as_str()]).into());
        let urls = Urls::new(self.base_url.as_deref().unwrap_or("http://localhost:5000"));
        let catalog = self
            .catalog
            .unwrap_or_else(|| Arc::new(MemoryCatalog::new()));

        let pipeline = Arc::new(Pipeline::new(
            catalog.clone(),
            ContentStore::new(&storage, &bucket),
        ));
        let mirror = self
            .upstream
            .map(|upstream| Mirror::new(upstream, pipeline.clone(), self.policy, self.retry));

        Feed::from_inner(FeedInner {
            registrations: RegistrationPager::new(urls.clone(), self.registration_page_size),
            catalog_pages: CatalogPager::new(urls.clone(), self.catalog_page_size),
            search: SearchEngine::new(catalog, urls.clone(), self.max_search_take),
            urls,
            pipeline,
            mirror,
            deletion: self.deletion,
        })
    }

    /// Build the feed and its router
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn router(self) -> Router {
        self.build().router()
    }
}

impl Feed {
    /// The HTTP surface of this feed
    pub fn router(&self) -> Router {
        Router::new()
            .route("/v3/index.json", get(service_index))
            .merge(publish::router())
            .merge(download::router())
            .merge(metadata::router())
            .merge(query::router())
            .with_state(self.clone())
    }
}

/// Service index endpoint
async fn service_index(State(feed): State<Feed>) -> Json<ServiceIndex> {
    Json(feed.service_index())
}
