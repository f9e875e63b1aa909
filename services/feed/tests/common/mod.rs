//! Helpers shared by the integration tests
#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use bytes::Bytes;
use feed::mirror::{UpstreamError, UpstreamFeed, UpstreamVersion};
use feed::{FeedBuilder, PackageId, PackageVersion};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use storage::MemoryStorage;
use tower::ServiceExt;

pub const BUCKET: &str = "test-packages";

/// A feed kept entirely in memory
pub fn test_feed() -> FeedBuilder {
    let storage = MemoryStorage::with_buckets(&[BUCKET]);
    FeedBuilder::new()
        .storage(storage.into())
        .bucket(BUCKET)
        .base_url("http://feed.test")
}

/// A minimal package archive
#[derive(Debug, Clone)]
pub struct Package {
    id: String,
    version: String,
    description: String,
    tags: Vec<String>,
    dependencies: Vec<(String, String)>,
    readme: Option<String>,
}

impl Package {
    pub fn new(id: &str, version: &str) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            description: format!("The {id} package"),
            tags: Vec::new(),
            dependencies: Vec::new(),
            readme: None,
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.into();
        self
    }

    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn dependency(mut self, id: &str, range: &str) -> Self {
        self.dependencies.push((id.into(), range.into()));
        self
    }

    pub fn readme(mut self, contents: &str) -> Self {
        self.readme = Some(contents.into());
        self
    }

    fn nuspec(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<package>\n  <metadata>\n");
        xml.push_str(&format!("    <id>{}</id>\n", self.id));
        xml.push_str(&format!("    <version>{}</version>\n", self.version));
        xml.push_str("    <authors>Integration</authors>\n");
        xml.push_str(&format!("    <description>{}</description>\n", self.description));
        if !self.tags.is_empty() {
            xml.push_str(&format!("    <tags>{}</tags>\n", self.tags.join(" ")));
        }
        if self.readme.is_some() {
            xml.push_str("    <readme>README.md</readme>\n");
        }
        if !self.dependencies.is_empty() {
            xml.push_str("    <dependencies>\n      <group>\n");
            for (id, range) in &self.dependencies {
                xml.push_str(&format!("        <dependency id=\"{id}\" version=\"{range}\" />\n"));
            }
            xml.push_str("      </group>\n    </dependencies>\n");
        }
        xml.push_str("  </metadata>\n</package>\n");
        xml
    }

    pub fn build(&self) -> Bytes {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::FileOptions::default();

        writer.start_file(format!("{}.nuspec", self.id), options).unwrap();
        writer.write_all(self.nuspec().as_bytes()).unwrap();
        if let Some(readme) = &self.readme {
            writer.start_file("README.md", options).unwrap();
            writer.write_all(readme.as_bytes()).unwrap();
        }

        writer.finish().unwrap().into_inner().into()
    }
}

/// Send one request through a router
pub async fn send(app: &axum::Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

pub async fn get(app: &axum::Router, uri: &str) -> Response<Body> {
    send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
}

pub async fn push(app: &axum::Router, package: Bytes) -> StatusCode {
    send(
        app,
        Request::builder()
            .method("PUT")
            .uri("/api/v2/package")
            .body(Body::from(package))
            .unwrap(),
    )
    .await
    .status()
}

pub async fn body(response: Response<Body>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

pub async fn json(response: Response<Body>) -> serde_json::Value {
    assert_eq!(response.status(), StatusCode::OK);
    serde_json::from_slice(&body(response).await).unwrap()
}

/// An upstream feed held in memory, with slow and counted downloads
#[derive(Debug, Default)]
pub struct SlowUpstream {
    packages: Mutex<Vec<(String, PackageVersion, Bytes)>>,
    downloads: AtomicUsize,
    delay: Duration,
}

impl SlowUpstream {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    pub fn publish(&self, package: Package) {
        let data = package.build();
        self.packages.lock().push((
            package.id.to_ascii_lowercase(),
            PackageVersion::parse(&package.version).unwrap(),
            data,
        ));
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl UpstreamFeed for SlowUpstream {
    async fn versions(&self, id: &PackageId) -> Result<Option<Vec<UpstreamVersion>>, UpstreamError> {
        let mut versions: Vec<UpstreamVersion> = self
            .packages
            .lock()
            .iter()
            .filter(|(package, ..)| package == id.normalized())
            .map(|(_, version, _)| UpstreamVersion {
                version: version.clone(),
                listed: true,
            })
            .collect();
        versions.sort_by(|a, b| a.version.cmp(&b.version));
        Ok((!versions.is_empty()).then_some(versions))
    }

    async fn download(
        &self,
        id: &PackageId,
        version: &PackageVersion,
    ) -> Result<Option<Bytes>, UpstreamError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(self
            .packages
            .lock()
            .iter()
            .find(|(package, v, _)| package == id.normalized() && v == version)
            .map(|(.., data)| data.clone()))
    }
}
