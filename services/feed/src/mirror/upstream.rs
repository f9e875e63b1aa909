//! The upstream feed a mirror reads from.

use std::fmt;

use bytes::Bytes;
use echocache::Cached;
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use crate::id::PackageId;
use crate::protocol::ServiceIndex;
use crate::version::PackageVersion;

/// A failed upstream call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// Worth retrying: timeouts, connection failures, 5xx, 429.
    #[error("transient upstream failure: {0}")]
    Transient(String),

    /// Retrying will not help.
    #[error("upstream failure: {0}")]
    Fatal(String),
}

impl UpstreamError {
    /// Whether retrying the call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, UpstreamError::Transient(_))
    }

    fn from_status(status: StatusCode, url: &str) -> Self {
        let message = format!("{status} from {url}");
        if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            UpstreamError::Transient(message)
        } else {
            UpstreamError::Fatal(message)
        }
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() || err.is_builder() {
            UpstreamError::Fatal(err.to_string())
        } else {
            UpstreamError::Transient(err.to_string())
        }
    }
}

/// One version as the upstream registration lists it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamVersion {
    /// The version.
    pub version: PackageVersion,
    /// Whether upstream lists it.
    pub listed: bool,
}

/// Read access to another feed.
///
/// `Ok(None)` means upstream answered that the package does not exist.
#[async_trait::async_trait]
pub trait UpstreamFeed: fmt::Debug + Send + Sync {
    /// Every version of `id` upstream knows about, ascending.
    async fn versions(&self, id: &PackageId) -> Result<Option<Vec<UpstreamVersion>>, UpstreamError>;

    /// The `.nupkg` of one version.
    async fn download(
        &self,
        id: &PackageId,
        version: &PackageVersion,
    ) -> Result<Option<Bytes>, UpstreamError>;
}

#[derive(Debug, Clone)]
struct Endpoints {
    registrations: String,
    packages: String,
}

impl Endpoints {
    fn from_index(index: &ServiceIndex) -> Result<Self, UpstreamError> {
        let registrations = resource_url(index, |kind| kind == "RegistrationsBaseUrl")
            .or_else(|| resource_url(index, |kind| kind.starts_with("RegistrationsBaseUrl")))
            .ok_or_else(|| UpstreamError::Fatal("no RegistrationsBaseUrl resource".into()))?;
        let packages = resource_url(index, |kind| kind == "PackageBaseAddress/3.0.0")
            .ok_or_else(|| UpstreamError::Fatal("no PackageBaseAddress/3.0.0 resource".into()))?;

        Ok(Self {
            registrations,
            packages,
        })
    }
}

fn resource_url(index: &ServiceIndex, wanted: impl Fn(&str) -> bool) -> Option<String> {
    index
        .resources
        .iter()
        .find(|resource| wanted(&resource.kind))
        .map(|resource| with_slash(&resource.url))
}

fn with_slash(url: &str) -> String {
    if url.ends_with('/') {
        url.to_owned()
    } else {
        format!("{url}/")
    }
}

fn listed_default() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct RemoteIndex {
    #[serde(default)]
    items: Vec<RemotePage>,
}

#[derive(Debug, Deserialize)]
struct RemotePage {
    #[serde(rename = "@id")]
    url: String,
    #[serde(default)]
    items: Option<Vec<RemoteLeaf>>,
}

#[derive(Debug, Deserialize)]
struct RemoteLeaf {
    #[serde(rename = "catalogEntry")]
    entry: RemoteEntry,
}

#[derive(Debug, Deserialize)]
struct RemoteEntry {
    version: String,
    #[serde(default = "listed_default")]
    listed: bool,
}

/// An upstream reached over HTTP through its service index.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    service_index: Url,
    endpoints: Cached<Result<Endpoints, UpstreamError>>,
}

impl HttpUpstream {
    /// An upstream described by the service index at `service_index`.
    pub fn new(service_index: Url) -> Self {
        Self::with_client(reqwest::Client::new(), service_index)
    }

    /// Like [`HttpUpstream::new`], with a preconfigured client.
    pub fn with_client(client: reqwest::Client, service_index: Url) -> Self {
        Self {
            client,
            service_index,
            endpoints: Cached::new(None),
        }
    }

    /// The service index URL.
    pub fn service_index(&self) -> &Url {
        &self.service_index
    }

    async fn endpoints(&self) -> Result<Endpoints, UpstreamError> {
        let client = self.client.clone();
        let url = self.service_index.clone();
        let endpoints = self
            .endpoints
            .get(move || {
                Box::pin(async move {
                    tracing::debug!(%url, "fetching upstream service index");
                    let index: ServiceIndex = get_json(&client, url.as_str())
                        .await?
                        .ok_or_else(|| UpstreamError::Fatal(format!("no service index at {url}")))?;
                    Endpoints::from_index(&index)
                })
            })
            .await
            .map_err(|_| UpstreamError::Transient("service index fetch was abandoned".into()))?;

        if endpoints.is_err() {
            self.endpoints.clear();
        }
        endpoints
    }
}

async fn get(client: &reqwest::Client, url: &str) -> Result<Option<reqwest::Response>, UpstreamError> {
    let response = client.get(url).send().await?;
    match response.status() {
        StatusCode::NOT_FOUND => Ok(None),
        status if status.is_success() => Ok(Some(response)),
        status => Err(UpstreamError::from_status(status, url)),
    }
}

async fn get_json<T>(client: &reqwest::Client, url: &str) -> Result<Option<T>, UpstreamError>
where
    T: serde::de::DeserializeOwned,
{
    match get(client, url).await? {
        Some(response) => Ok(Some(response.json().await?)),
        None => Ok(None),
    }
}

#[async_trait::async_trait]
impl UpstreamFeed for HttpUpstream {
    #[tracing::instrument(skip_all, fields(%id))]
    async fn versions(&self, id: &PackageId) -> Result<Option<Vec<UpstreamVersion>>, UpstreamError> {
        let endpoints = self.endpoints().await?;
        let url = format!("{}{}/index.json", endpoints.registrations, id.normalized());
        let Some(index) = get_json::<RemoteIndex>(&self.client, &url).await? else {
            return Ok(None);
        };

        let mut versions = Vec::new();
        for page in index.items {
            let leaves = match page.items {
                Some(leaves) => leaves,
                None => {
                    tracing::trace!(page = %page.url, "following registration page");
                    get_json::<RemotePage>(&self.client, &page.url)
                        .await?
                        .and_then(|page| page.items)
                        .ok_or_else(|| {
                            UpstreamError::Fatal(format!("registration page {} is empty", page.url))
                        })?
                }
            };

            for leaf in leaves {
                match PackageVersion::parse(&leaf.entry.version) {
                    Ok(version) => versions.push(UpstreamVersion {
                        version,
                        listed: leaf.entry.listed,
                    }),
                    Err(err) => {
                        tracing::debug!(version = %leaf.entry.version, error = %err, "skipping upstream version");
                    }
                }
            }
        }

        versions.sort_by(|a, b| a.version.cmp(&b.version));
        versions.dedup_by(|a, b| a.version == b.version);
        Ok(Some(versions))
    }

    #[tracing::instrument(skip_all, fields(%id, %version))]
    async fn download(
        &self,
        id: &PackageId,
        version: &PackageVersion,
    ) -> Result<Option<Bytes>, UpstreamError> {
        let endpoints = self.endpoints().await?;
        let (id, version) = (id.normalized(), version.key());
        let url = format!("{}{id}/{version}/{id}.{version}.nupkg", endpoints.packages);
        match get(&self.client, &url).await? {
            Some(response) => Ok(Some(response.bytes().await?)),
            None => Ok(None),
        }
    }
}
