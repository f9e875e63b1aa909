//! Concurrent writers, mirror misses and failing backends

mod common;

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::http::StatusCode;
use common::{Package, SlowUpstream, get, json, push, test_feed};
use feed::catalog::{
    CatalogCommit, CatalogError, CatalogStore, Listing, MemoryCatalog, PackageRecord,
};
use feed::content::ArtifactKind;
use feed::ingest::IngestOutcome;
use feed::{FeedError, PackageId, PackageKey, PackageVersion};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identical_pushes_create_once() {
    let feed = test_feed().build();
    let package = Package::new("Race", "1.0.0").build();

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let feed = feed.clone();
            let package = package.clone();
            tokio::spawn(async move { feed.push(package).await })
        })
        .collect();

    let mut created = 0;
    for task in tasks {
        match task.await.unwrap().unwrap().outcome {
            IngestOutcome::Created => created += 1,
            IngestOutcome::AlreadyExists => {}
        }
    }
    assert_eq!(created, 1);
    assert_eq!(feed.catalog().commit_count().await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn conflicting_pushes_have_one_winner() {
    let feed = test_feed().build();

    let tasks: Vec<_> = (0..8)
        .map(|n| {
            let feed = feed.clone();
            let package = Package::new("Race", "1.0.0")
                .description(&format!("variant {n}"))
                .build();
            tokio::spawn(async move { feed.push(package).await })
        })
        .collect();

    let mut created = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(ingested) => {
                assert_eq!(ingested.outcome, IngestOutcome::Created);
                created += 1;
            }
            Err(FeedError::PackageAlreadyExists { .. }) => conflicts += 1,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    assert_eq!((created, conflicts), (1, 7));

    // The stored package is the winner's, whole
    let id = PackageId::new("race").unwrap();
    let version = PackageVersion::parse("1.0.0").unwrap();
    let record = feed.record(&id, &version).await.unwrap();
    let data = feed.download(&id, &version, ArtifactKind::Package).await.unwrap();
    assert_eq!(
        record.package_hash().unwrap(),
        &feed::content::ContentHash::of(&data)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn catalog_pages_are_stable_under_writes() {
    let feed = test_feed().catalog_page_size(4).build();

    let tasks: Vec<_> = (0..10)
        .map(|n| {
            let feed = feed.clone();
            tokio::spawn(async move {
                feed.push(Package::new(&format!("Pkg{n}"), "1.0.0").build())
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let first = feed.catalog_page(0).await.unwrap();
    assert_eq!(first.count, 4);

    feed.push(Package::new("Late", "1.0.0").build()).await.unwrap();
    feed.unlist(
        &PackageId::new("pkg3").unwrap(),
        &PackageVersion::parse("1.0.0").unwrap(),
    )
    .await
    .unwrap();

    // Full pages never change
    assert_eq!(feed.catalog_page(0).await.unwrap(), first);

    let index = feed.catalog_index().await.unwrap();
    assert_eq!(index.count, 3);
    let counts: Vec<_> = index.items.iter().map(|item| item.count).collect();
    assert_eq!(counts, [4, 4, 4]);

    // Every commit appears once, in sequence order
    let mut sequences = Vec::new();
    for page in 0..index.count {
        for item in feed.catalog_page(page).await.unwrap().items {
            let sequence: u64 = item
                .url
                .split('/')
                .rev()
                .nth(1)
                .unwrap()
                .parse()
                .unwrap();
            sequences.push(sequence);
        }
    }
    assert_eq!(sequences, (1..=12).collect::<Vec<u64>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_mirror_misses_download_once() {
    let upstream = SlowUpstream::new(Duration::from_millis(100));
    upstream.publish(Package::new("Remote.Lib", "1.0.0"));
    let feed = test_feed().upstream(upstream.clone()).build();

    let id = PackageId::new("remote.lib").unwrap();
    let version = PackageVersion::parse("1.0.0").unwrap();
    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let feed = feed.clone();
            let (id, version) = (id.clone(), version.clone());
            tokio::spawn(async move { feed.download(&id, &version, ArtifactKind::Package).await })
        })
        .collect();

    let mut bodies = Vec::new();
    for task in tasks {
        bodies.push(task.await.unwrap().unwrap());
    }
    assert!(bodies.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(upstream.downloads(), 1);

    let key = PackageKey::new(&id, &version);
    let record = feed.catalog().find(&key).await.unwrap().unwrap();
    assert_eq!(record.downloads, 10);
    assert_eq!(feed.catalog().commit_count().await.unwrap(), 1);
}

#[tokio::test]
async fn mirrored_packages_are_served_over_http() {
    let upstream = SlowUpstream::new(Duration::ZERO);
    upstream.publish(Package::new("Remote", "1.0.0"));
    upstream.publish(Package::new("Remote", "2.0.0"));
    let app = test_feed().upstream(upstream.clone()).router();

    // An id miss mirrors the latest version
    let versions = json(get(&app, "/v3/package/remote/index.json").await).await;
    assert_eq!(versions["versions"], serde_json::json!(["2.0.0"]));

    // A version miss mirrors that version
    let response = get(&app, "/v3/package/remote/1.0.0/remote.1.0.0.nupkg").await;
    assert_eq!(response.status(), StatusCode::OK);

    let versions = json(get(&app, "/v3/package/remote/index.json").await).await;
    assert_eq!(versions["versions"], serde_json::json!(["1.0.0", "2.0.0"]));

    let response = get(&app, "/v3/package/remote/3.0.0/remote.3.0.0.nupkg").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let response = get(&app, "/v3/registration/unknown/index.json").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(upstream.downloads(), 2);
}

/// A catalog whose inserts fail while `failing` is set
#[derive(Debug, Default)]
struct FlakyCatalog {
    inner: MemoryCatalog,
    failing: AtomicBool,
}

#[async_trait::async_trait]
impl CatalogStore for FlakyCatalog {
    async fn find(&self, key: &PackageKey) -> Result<Option<PackageRecord>, CatalogError> {
        self.inner.find(key).await
    }

    async fn insert(&self, record: PackageRecord) -> Result<CatalogCommit, CatalogError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CatalogError::Unavailable("connection reset".into()));
        }
        self.inner.insert(record).await
    }

    async fn set_listed(&self, key: &PackageKey, listed: bool) -> Result<Listing, CatalogError> {
        self.inner.set_listed(key, listed).await
    }

    async fn remove(&self, key: &PackageKey) -> Result<Option<CatalogCommit>, CatalogError> {
        self.inner.remove(key).await
    }

    async fn add_download(&self, key: &PackageKey) -> Result<bool, CatalogError> {
        self.inner.add_download(key).await
    }

    async fn records_for(&self, id: &str) -> Result<Vec<PackageRecord>, CatalogError> {
        self.inner.records_for(id).await
    }

    async fn records(&self) -> Result<Vec<PackageRecord>, CatalogError> {
        self.inner.records().await
    }

    async fn commits(&self, range: Range<usize>) -> Result<Vec<CatalogCommit>, CatalogError> {
        self.inner.commits(range).await
    }

    async fn commit_count(&self) -> Result<usize, CatalogError> {
        self.inner.commit_count().await
    }

    async fn latest_commit(&self) -> Result<Option<CatalogCommit>, CatalogError> {
        self.inner.latest_commit().await
    }

    async fn commit(&self, sequence: u64) -> Result<Option<CatalogCommit>, CatalogError> {
        self.inner.commit(sequence).await
    }
}

#[tokio::test]
async fn failed_catalog_write_leaves_no_content() {
    let catalog = Arc::new(FlakyCatalog::default());
    catalog.failing.store(true, Ordering::SeqCst);
    let feed = test_feed().catalog(catalog.clone()).build();
    let app = feed.router();

    let package = Package::new("Flaky", "1.0.0").readme("hello").build();
    assert_eq!(
        push(&app, package.clone()).await,
        StatusCode::INTERNAL_SERVER_ERROR
    );

    let key = PackageKey::new(
        &PackageId::new("flaky").unwrap(),
        &PackageVersion::parse("1.0.0").unwrap(),
    );
    for kind in ArtifactKind::ALL {
        let stored = feed.pipeline().content().get(&key, kind).await.unwrap();
        assert!(stored.is_none(), "{kind} left behind");
    }
    assert_eq!(catalog.commit_count().await.unwrap(), 0);

    // Once the catalog recovers the same push succeeds
    catalog.failing.store(false, Ordering::SeqCst);
    assert_eq!(push(&app, package).await, StatusCode::CREATED);
}
