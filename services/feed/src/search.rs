//! Search, autocomplete, version listing and dependents.
//!
//! Matching is deliberately simple: every whitespace separated query token
//! must be contained in the package id or be a prefix of one of its tags,
//! compared case-insensitively. Results are ordered by downloads, most first,
//! then by id.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::catalog::{CatalogError, CatalogStore, PackageRecord};
use crate::protocol::{
    AutocompleteResponse, DependentResult, DependentsResponse, PackageTypeItem, SearchResponse,
    SearchResult, SearchResultVersion, Urls,
};
use crate::version::PackageVersion;

/// Largest `take` honoured when none is configured.
pub const DEFAULT_MAX_TAKE: usize = 1000;

const DEFAULT_TAKE: usize = 20;

fn default_take() -> usize {
    DEFAULT_TAKE
}

/// Version filters shared by search and autocomplete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VersionFilter {
    /// Include prerelease versions.
    pub prerelease: bool,
    /// Include SemVer 2.0.0 versions.
    pub semver2: bool,
}

impl VersionFilter {
    fn new(prerelease: bool, sem_ver_level: Option<&str>) -> Self {
        Self {
            prerelease,
            semver2: sem_ver_level.is_some_and(|level| level.trim().starts_with('2')),
        }
    }

    fn accepts(&self, record: &PackageRecord) -> bool {
        record.listed
            && (self.prerelease || !record.version.is_prerelease())
            && (self.semver2 || !record.version.is_semver2())
    }
}

/// Query parameters of `GET /v3/search`.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    /// Query text.
    #[serde(default, rename = "q")]
    pub query: Option<String>,
    /// Results to skip.
    #[serde(default)]
    pub skip: usize,
    /// Results to return, clamped to the configured maximum.
    #[serde(default = "default_take")]
    pub take: usize,
    /// Include prerelease versions.
    #[serde(default)]
    pub prerelease: bool,
    /// `2.0.0` to include SemVer 2.0.0 versions.
    #[serde(default, rename = "semVerLevel")]
    pub sem_ver_level: Option<String>,
    /// Only packages of this type.
    #[serde(default, rename = "packageType")]
    pub package_type: Option<String>,
    /// Only versions targeting this framework.
    #[serde(default)]
    pub framework: Option<String>,
}

impl Default for SearchRequest {
    fn default() -> Self {
        Self {
            query: None,
            skip: 0,
            take: DEFAULT_TAKE,
            prerelease: false,
            sem_ver_level: None,
            package_type: None,
            framework: None,
        }
    }
}

impl SearchRequest {
    /// The version filter these parameters ask for.
    pub fn filter(&self) -> VersionFilter {
        VersionFilter::new(self.prerelease, self.sem_ver_level.as_deref())
    }
}

/// Query parameters of `GET /v3/autocomplete`.
#[derive(Debug, Clone, Deserialize)]
pub struct AutocompleteRequest {
    /// Id prefix.
    #[serde(default, rename = "q")]
    pub query: Option<String>,
    /// Exact id whose versions to list instead.
    #[serde(default)]
    pub id: Option<String>,
    /// Results to skip.
    #[serde(default)]
    pub skip: usize,
    /// Results to return, clamped to the configured maximum.
    #[serde(default = "default_take")]
    pub take: usize,
    /// Include prerelease versions.
    #[serde(default)]
    pub prerelease: bool,
    /// `2.0.0` to include SemVer 2.0.0 versions.
    #[serde(default, rename = "semVerLevel")]
    pub sem_ver_level: Option<String>,
}

impl Default for AutocompleteRequest {
    fn default() -> Self {
        Self {
            query: None,
            id: None,
            skip: 0,
            take: DEFAULT_TAKE,
            prerelease: false,
            sem_ver_level: None,
        }
    }
}

impl AutocompleteRequest {
    /// The version filter these parameters ask for.
    pub fn filter(&self) -> VersionFilter {
        VersionFilter::new(self.prerelease, self.sem_ver_level.as_deref())
    }
}

fn tokens(query: Option<&str>) -> Vec<String> {
    query
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_ascii_lowercase)
        .collect()
}

fn matches(record: &PackageRecord, tokens: &[String]) -> bool {
    let id = record.id.normalized();
    tokens.iter().all(|token| {
        id.contains(token.as_str())
            || record
                .tags
                .iter()
                .any(|tag| tag.to_ascii_lowercase().starts_with(token.as_str()))
    })
}

fn page<T>(items: Vec<T>, skip: usize, take: usize) -> Vec<T> {
    items.into_iter().skip(skip).take(take).collect()
}

/// Group records by id, keeping per-id version order.
fn group(records: Vec<PackageRecord>) -> BTreeMap<String, Vec<PackageRecord>> {
    let mut groups: BTreeMap<String, Vec<PackageRecord>> = BTreeMap::new();
    for record in records {
        groups
            .entry(record.id.normalized().to_owned())
            .or_default()
            .push(record);
    }
    groups
}

/// Answers queries over the catalog.
#[derive(Debug, Clone)]
pub struct SearchEngine {
    catalog: Arc<dyn CatalogStore>,
    urls: Urls,
    max_take: usize,
}

impl SearchEngine {
    /// Search `catalog`, returning at most `max_take` results per page.
    pub fn new(catalog: Arc<dyn CatalogStore>, urls: Urls, max_take: usize) -> Self {
        Self {
            catalog,
            urls,
            max_take: max_take.max(1),
        }
    }

    /// Search listed packages.
    #[tracing::instrument(skip(self), fields(query = ?request.query))]
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse, CatalogError> {
        let tokens = tokens(request.query.as_deref());
        let package_type = request.package_type.as_deref();
        let framework = request.framework.as_deref();
        let filter = request.filter();

        let candidates = self
            .catalog
            .records()
            .await?
            .into_iter()
            .filter(|record| filter.accepts(record))
            .filter(|record| {
                package_type.is_none_or(|wanted| {
                    record
                        .package_types
                        .iter()
                        .any(|kind| kind.eq_ignore_ascii_case(wanted))
                })
            })
            .filter(|record| {
                framework.is_none_or(|wanted| {
                    record
                        .target_frameworks
                        .iter()
                        .any(|tfm| tfm.eq_ignore_ascii_case(wanted))
                })
            })
            .collect();

        let mut results: Vec<SearchResult> = group(candidates)
            .into_values()
            .filter_map(|versions| {
                let latest = versions.last()?;
                matches(latest, &tokens).then(|| self.summarize(&versions))
            })
            .flatten()
            .collect();

        results.sort_by(|a, b| {
            b.total_downloads
                .cmp(&a.total_downloads)
                .then_with(|| a.id.to_ascii_lowercase().cmp(&b.id.to_ascii_lowercase()))
        });

        let total_hits = results.len();
        Ok(SearchResponse {
            total_hits,
            data: page(results, request.skip, request.take.min(self.max_take)),
        })
    }

    fn summarize(&self, versions: &[PackageRecord]) -> Option<SearchResult> {
        let latest = versions.last()?;
        let registration = self.urls.registration_index(&latest.id);
        Some(SearchResult {
            url: registration.clone(),
            kind: "Package".to_owned(),
            registration,
            id: latest.id.to_string(),
            version: latest.version.full(),
            description: latest.description.clone(),
            authors: latest.authors.clone(),
            icon_url: latest.icon_url.clone(),
            license_url: latest.license_url.clone(),
            project_url: latest.project_url.clone(),
            summary: latest.summary.clone(),
            tags: latest.tags.clone(),
            title: latest.title.clone(),
            total_downloads: versions.iter().map(|r| r.downloads).sum(),
            package_types: latest
                .package_types
                .iter()
                .map(|name| PackageTypeItem { name: name.clone() })
                .collect(),
            versions: versions
                .iter()
                .map(|r| SearchResultVersion {
                    url: self.urls.registration_leaf(&r.id, &r.version),
                    version: r.version.full(),
                    downloads: r.downloads,
                })
                .collect(),
        })
    }

    /// Package ids starting with a prefix, or the versions of one id.
    #[tracing::instrument(skip(self), fields(query = ?request.query, id = ?request.id))]
    pub async fn autocomplete(
        &self,
        request: &AutocompleteRequest,
    ) -> Result<AutocompleteResponse, CatalogError> {
        let take = request.take.min(self.max_take);
        let filter = request.filter();

        if let Some(id) = &request.id {
            let versions: Vec<String> = self
                .catalog
                .records_for(&id.to_ascii_lowercase())
                .await?
                .iter()
                .filter(|record| filter.accepts(record))
                .map(|record| record.version.full())
                .collect();
            return Ok(AutocompleteResponse {
                total_hits: versions.len(),
                data: page(versions, request.skip, take),
            });
        }

        let prefix = request
            .query
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let listed = self
            .catalog
            .records()
            .await?
            .into_iter()
            .filter(|record| filter.accepts(record))
            .filter(|record| record.id.normalized().starts_with(&prefix))
            .collect();

        let mut ids: Vec<(u64, String, String)> = group(listed)
            .into_iter()
            .filter_map(|(key, versions)| {
                let display = versions.last()?.id.to_string();
                Some((versions.iter().map(|r| r.downloads).sum(), key, display))
            })
            .collect();
        ids.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        Ok(AutocompleteResponse {
            total_hits: ids.len(),
            data: page(ids.into_iter().map(|(_, _, id)| id).collect(), request.skip, take),
        })
    }

    /// Every version of an id, ascending.
    pub async fn list_versions(
        &self,
        id: &str,
        include_unlisted: bool,
    ) -> Result<Vec<PackageVersion>, CatalogError> {
        Ok(self
            .catalog
            .records_for(id)
            .await?
            .into_iter()
            .filter(|record| include_unlisted || record.listed)
            .map(|record| record.version)
            .collect())
    }

    /// Listed packages with a dependency on `id`, ordered by id.
    #[tracing::instrument(skip(self))]
    pub async fn dependents(&self, id: &str) -> Result<DependentsResponse, CatalogError> {
        let wanted = id.to_ascii_lowercase();
        let dependents = self
            .catalog
            .records()
            .await?
            .into_iter()
            .filter(|record| record.listed)
            .filter(|record| record.dependencies().any(|edge| edge.dependency == wanted))
            .collect();

        let data: Vec<DependentResult> = group(dependents)
            .into_values()
            .filter_map(|versions| {
                let latest = versions.last()?;
                Some(DependentResult {
                    id: latest.id.to_string(),
                    description: latest.description.clone(),
                    total_downloads: versions.iter().map(|r| r.downloads).sum(),
                })
            })
            .collect();

        Ok(DependentsResponse {
            total_hits: data.len(),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap as Map;

    use chrono::Utc;

    use super::*;
    use crate::catalog::{MemoryCatalog, Origin};
    use crate::manifest::read_package;
    use crate::testing::PackageBuilder;

    async fn insert(catalog: &MemoryCatalog, builder: PackageBuilder, downloads: u64) {
        let archive = read_package(&builder.build()).unwrap();
        let record = PackageRecord::new(&archive, Map::new(), Utc::now(), Origin::Local);
        let key = record.key();
        catalog.insert(record).await.unwrap();
        for _ in 0..downloads {
            catalog.add_download(&key).await.unwrap();
        }
    }

    async fn engine() -> (Arc<MemoryCatalog>, SearchEngine) {
        let catalog = Arc::new(MemoryCatalog::new());
        insert(&catalog, PackageBuilder::new("Json.Core", "1.0.0").tags(&["json", "parser"]), 5).await;
        insert(&catalog, PackageBuilder::new("Json.Core", "2.0.0-beta"), 0).await;
        insert(&catalog, PackageBuilder::new("Yaml.Core", "1.0.0").tags(&["yaml"]), 9).await;
        insert(
            &catalog,
            PackageBuilder::new("Json.Extras", "1.0.0+build.1")
                .dependency(None, "Json.Core", "1.0.0"),
            5,
        )
        .await;
        insert(
            &catalog,
            PackageBuilder::new("Tool", "1.0.0")
                .package_type("DotnetTool")
                .file("lib/net8.0/tool.dll", b"MZ")
                .dependency(Some("net8.0"), "json.core", "[1.0,)"),
            1,
        )
        .await;

        let engine = SearchEngine::new(catalog.clone(), Urls::new("http://feed"), 3);
        (catalog, engine)
    }

    fn ids(response: &SearchResponse) -> Vec<&str> {
        response.data.iter().map(|r| r.id.as_str()).collect()
    }

    #[tokio::test]
    async fn orders_by_downloads_then_id() {
        let (_, engine) = engine().await;
        let request = SearchRequest {
            sem_ver_level: Some("2.0.0".into()),
            ..Default::default()
        };
        let response = engine.search(&request).await.unwrap();
        assert_eq!(response.total_hits, 4);
        // take is clamped to 3
        assert_eq!(ids(&response), ["Yaml.Core", "Json.Core", "Json.Extras"]);
    }

    #[tokio::test]
    async fn filters_prerelease_and_semver2() {
        let (_, engine) = engine().await;

        let response = engine.search(&SearchRequest::default()).await.unwrap();
        assert!(!ids(&response).contains(&"Json.Extras"));
        let json = response.data.iter().find(|r| r.id == "Json.Core").unwrap();
        assert_eq!(json.version, "1.0.0");

        let request = SearchRequest {
            query: Some("json".into()),
            prerelease: true,
            ..Default::default()
        };
        let response = engine.search(&request).await.unwrap();
        let json = response.data.iter().find(|r| r.id == "Json.Core").unwrap();
        assert_eq!(json.version, "2.0.0-beta");
        assert_eq!(json.versions.len(), 2);
        assert_eq!(json.total_downloads, 5);
    }

    #[tokio::test]
    async fn tokens_match_ids_and_tag_prefixes() {
        let (_, engine) = engine().await;
        let search = |q: &str| SearchRequest {
            query: Some(q.into()),
            ..Default::default()
        };

        let response = engine.search(&search("YAM")).await.unwrap();
        assert_eq!(ids(&response), ["Yaml.Core"]);

        let response = engine.search(&search("core pars")).await.unwrap();
        assert_eq!(ids(&response), ["Json.Core"]);

        let mut prerelease = search("core pars");
        prerelease.prerelease = true;
        let response = engine.search(&prerelease).await.unwrap();
        assert!(response.data.is_empty(), "the newest Json.Core has no tags");

        let response = engine.search(&search("nothing")).await.unwrap();
        assert_eq!(response.total_hits, 0);
    }

    #[tokio::test]
    async fn package_type_and_framework_filters() {
        let (_, engine) = engine().await;
        let request = SearchRequest {
            package_type: Some("dotnettool".into()),
            ..Default::default()
        };
        assert_eq!(ids(&engine.search(&request).await.unwrap()), ["Tool"]);

        let request = SearchRequest {
            framework: Some("NET8.0".into()),
            ..Default::default()
        };
        assert_eq!(ids(&engine.search(&request).await.unwrap()), ["Tool"]);
    }

    #[tokio::test]
    async fn skip_past_the_end_is_empty() {
        let (_, engine) = engine().await;
        let request = SearchRequest {
            skip: 100,
            ..Default::default()
        };
        let response = engine.search(&request).await.unwrap();
        assert!(response.data.is_empty());
        assert_eq!(response.total_hits, 3);
    }

    #[tokio::test]
    async fn excludes_unlisted() {
        let (catalog, engine) = engine().await;
        let key = catalog.records_for("yaml.core").await.unwrap()[0].key();
        catalog.set_listed(&key, false).await.unwrap();

        let response = engine.search(&SearchRequest::default()).await.unwrap();
        assert!(!ids(&response).contains(&"Yaml.Core"));

        let all = engine.list_versions("YAML.CORE", true).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(engine.list_versions("yaml.core", false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn autocomplete_ids_and_versions() {
        let (_, engine) = engine().await;
        let request = AutocompleteRequest {
            query: Some("JSON".into()),
            ..Default::default()
        };
        let response = engine.autocomplete(&request).await.unwrap();
        assert_eq!(response.data, ["Json.Core"]);

        let request = AutocompleteRequest {
            id: Some("json.core".into()),
            prerelease: true,
            ..Default::default()
        };
        let response = engine.autocomplete(&request).await.unwrap();
        assert_eq!(response.data, ["1.0.0", "2.0.0-beta"]);
    }

    #[tokio::test]
    async fn dependents_are_listed_and_ordered() {
        let (_, engine) = engine().await;
        let response = engine.dependents("JSON.CORE").await.unwrap();
        let ids: Vec<&str> = response.data.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, ["Json.Extras", "Tool"]);
        assert!(engine.dependents("yaml.core").await.unwrap().data.is_empty());
    }
}
