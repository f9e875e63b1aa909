//! JSON documents served by the feed.
//!
//! Protocol-required fields are defined once. Server-side additions are
//! separate structs flattened into the protocol shapes, so a client that only
//! knows the protocol sees exactly the protocol fields plus some extras.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::PackageId;
use crate::version::PackageVersion;

/// Builds every URL the feed hands out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Urls {
    base: String,
}

impl Urls {
    /// URLs rooted at `base`, e.g. `https://feed.example.com`.
    pub fn new(base: &str) -> Self {
        Self {
            base: base.trim_end_matches('/').to_owned(),
        }
    }

    /// The base URL without a trailing slash.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// `GET /v3/index.json`
    pub fn service_index(&self) -> String {
        format!("{}/v3/index.json", self.base)
    }

    /// `PUT /api/v2/package`
    pub fn publish(&self) -> String {
        format!("{}/api/v2/package", self.base)
    }

    /// Base address of package content.
    pub fn package_base(&self) -> String {
        format!("{}/v3/package/", self.base)
    }

    /// Version list of a package id.
    pub fn package_versions(&self, id: &PackageId) -> String {
        format!("{}/v3/package/{}/index.json", self.base, id.normalized())
    }

    /// The `.nupkg` of a version.
    pub fn package_content(&self, id: &PackageId, version: &PackageVersion) -> String {
        let (id, version) = (id.normalized(), version.key());
        format!("{}/v3/package/{id}/{version}/{id}.{version}.nupkg", self.base)
    }

    /// The `.nuspec` of a version.
    pub fn package_manifest(&self, id: &PackageId, version: &PackageVersion) -> String {
        let (id, version) = (id.normalized(), version.key());
        format!("{}/v3/package/{id}/{version}/{id}.nuspec", self.base)
    }

    /// The embedded readme of a version.
    pub fn readme(&self, id: &PackageId, version: &PackageVersion) -> String {
        format!(
            "{}/v3/package/{}/{}/readme",
            self.base,
            id.normalized(),
            version.key()
        )
    }

    /// Base address of registration documents.
    pub fn registration_base(&self) -> String {
        format!("{}/v3/registration/", self.base)
    }

    /// Registration index of a package id.
    pub fn registration_index(&self, id: &PackageId) -> String {
        format!("{}/v3/registration/{}/index.json", self.base, id.normalized())
    }

    /// A registration page, addressed by its version bounds.
    pub fn registration_page(
        &self,
        id: &PackageId,
        lower: &PackageVersion,
        upper: &PackageVersion,
    ) -> String {
        format!(
            "{}/v3/registration/{}/page/{}/{}.json",
            self.base,
            id.normalized(),
            lower.key(),
            upper.key()
        )
    }

    /// Registration leaf of one version.
    pub fn registration_leaf(&self, id: &PackageId, version: &PackageVersion) -> String {
        format!(
            "{}/v3/registration/{}/{}.json",
            self.base,
            id.normalized(),
            version.key()
        )
    }

    /// The catalog index.
    pub fn catalog_index(&self) -> String {
        format!("{}/v3/catalog/index.json", self.base)
    }

    /// A catalog page by number, starting at 0.
    pub fn catalog_page(&self, page: usize) -> String {
        format!("{}/v3/catalog/page{page}.json", self.base)
    }

    /// The catalog leaf of one commit.
    pub fn catalog_leaf(&self, sequence: u64, id: &PackageId, version: &PackageVersion) -> String {
        format!(
            "{}/v3/catalog/data/{sequence}/{}.{}.json",
            self.base,
            id.normalized(),
            version.key()
        )
    }

    /// Search endpoint.
    pub fn search(&self) -> String {
        format!("{}/v3/search", self.base)
    }

    /// Autocomplete endpoint.
    pub fn autocomplete(&self) -> String {
        format!("{}/v3/autocomplete", self.base)
    }

    /// Dependents endpoint.
    pub fn dependents(&self) -> String {
        format!("{}/v3/dependents", self.base)
    }
}

/// Placeholder for documents served without extensions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoExtensions {}

/// One entry of the service index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceResource {
    /// Resource URL.
    #[serde(rename = "@id")]
    pub url: String,
    /// Resource type, e.g. `SearchQueryService/3.5.0`.
    #[serde(rename = "@type")]
    pub kind: String,
    /// Human readable note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// `GET /v3/index.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIndex {
    /// Protocol version, always `3.0.0`.
    pub version: String,
    /// Every resource the feed offers.
    pub resources: Vec<ServiceResource>,
}

impl ServiceIndex {
    /// The service index for a feed at `urls`.
    pub fn new(urls: &Urls) -> Self {
        let resources = [
            resource(urls.publish(), &["PackagePublish/2.0.0"], "Push and delete packages"),
            resource(
                urls.search(),
                &[
                    "SearchQueryService",
                    "SearchQueryService/3.0.0-beta",
                    "SearchQueryService/3.0.0-rc",
                    "SearchQueryService/3.5.0",
                ],
                "Query packages",
            ),
            resource(
                urls.registration_base(),
                &[
                    "RegistrationsBaseUrl",
                    "RegistrationsBaseUrl/3.0.0-rc",
                    "RegistrationsBaseUrl/3.0.0-beta",
                    "RegistrationsBaseUrl/3.4.0",
                    "RegistrationsBaseUrl/3.6.0",
                ],
                "Package metadata",
            ),
            resource(urls.package_base(), &["PackageBaseAddress/3.0.0"], "Package content"),
            resource(
                urls.autocomplete(),
                &[
                    "SearchAutocompleteService",
                    "SearchAutocompleteService/3.0.0-rc",
                    "SearchAutocompleteService/3.0.0-beta",
                    "SearchAutocompleteService/3.5.0",
                ],
                "Autocomplete ids and versions",
            ),
            resource(urls.catalog_index(), &["Catalog/3.0.0"], "Change feed"),
            resource(urls.dependents(), &["PackageDependents/1.0.0"], "Packages depending on a package"),
            resource(
                format!("{}/v3/package/{{lower_id}}/{{lower_version}}/readme", urls.base()),
                &["ReadmeUriTemplate/6.13.0"],
                "Package readme",
            ),
        ]
        .into_iter()
        .flatten()
        .collect();

        Self {
            version: "3.0.0".to_owned(),
            resources,
        }
    }
}

fn resource(url: String, kinds: &[&str], comment: &str) -> Vec<ServiceResource> {
    kinds
        .iter()
        .map(|kind| ServiceResource {
            url: url.clone(),
            kind: (*kind).to_owned(),
            comment: Some(comment.to_owned()),
        })
        .collect()
}

/// `GET /v3/package/{id}/index.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageVersions {
    /// Lower-cased normalized versions, ascending.
    pub versions: Vec<String>,
}

/// One dependency inside a dependency group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyItem {
    /// Dependency id.
    pub id: String,
    /// Version range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<String>,
}

/// Dependencies for one target framework.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGroupItem {
    /// Target framework, absent for framework-agnostic dependencies.
    #[serde(
        rename = "targetFramework",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub target_framework: Option<String>,
    /// The dependencies.
    #[serde(default)]
    pub dependencies: Vec<DependencyItem>,
}

/// The `catalogEntry` of a registration leaf item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageMetadata<M = NoExtensions> {
    /// URL of this entry.
    #[serde(rename = "@id")]
    pub url: String,
    /// Package id.
    pub id: String,
    /// Full version, with build metadata.
    pub version: String,
    /// Comma separated authors.
    #[serde(default)]
    pub authors: String,
    /// Dependency groups.
    #[serde(default)]
    pub dependency_groups: Vec<DependencyGroupItem>,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Icon URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    /// License URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_url: Option<String>,
    /// SPDX license expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_expression: Option<String>,
    /// Listed flag.
    #[serde(default = "listed_default")]
    pub listed: bool,
    /// Minimum client version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_client_version: Option<String>,
    /// URL of the `.nupkg`.
    #[serde(default)]
    pub package_content: String,
    /// Base64 SHA-512 of the `.nupkg`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_hash: Option<String>,
    /// Always `SHA512` when a hash is present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_hash_algorithm: Option<String>,
    /// Project URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_url: Option<String>,
    /// Publish time.
    pub published: DateTime<Utc>,
    /// Whether clients must accept the license.
    #[serde(default)]
    pub require_license_acceptance: bool,
    /// Summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Server-side extensions.
    #[serde(flatten)]
    pub extensions: M,
}

fn listed_default() -> bool {
    true
}

/// Extra `catalogEntry` fields served by this feed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataExtensions {
    /// Downloads of this version.
    pub downloads: u64,
    /// Whether a readme is stored.
    pub has_readme: bool,
    /// Package types.
    pub package_types: Vec<String>,
    /// Release notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_notes: Option<String>,
    /// Repository URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_url: Option<String>,
    /// Repository type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_type: Option<String>,
}

/// One version inside a registration page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationLeafItem<M = NoExtensions> {
    /// URL of the registration leaf.
    #[serde(rename = "@id")]
    pub url: String,
    /// Version metadata.
    pub catalog_entry: PackageMetadata<M>,
    /// URL of the `.nupkg`.
    pub package_content: String,
}

/// A page of versions, with items present when inlined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "M: Deserialize<'de>"))]
pub struct RegistrationPage<M = NoExtensions> {
    /// Stable URL derived from the id and the bounds.
    #[serde(rename = "@id")]
    pub url: String,
    /// Number of versions on the page.
    pub count: usize,
    /// Lowest version on the page.
    pub lower: String,
    /// Highest version on the page.
    pub upper: String,
    /// The versions, absent when the page must be fetched separately.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Vec<RegistrationLeafItem<M>>>,
    /// The registration index this page belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// `GET /v3/registration/{id}/index.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "M: Deserialize<'de>"))]
pub struct RegistrationIndex<M = NoExtensions> {
    /// URL of this index.
    #[serde(rename = "@id")]
    pub url: String,
    /// JSON-LD types.
    #[serde(rename = "@type")]
    pub types: Vec<String>,
    /// Number of pages.
    pub count: usize,
    /// The pages.
    pub items: Vec<RegistrationPage<M>>,
}

/// The registration index with server-side totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedRegistrationIndex {
    /// The protocol document.
    #[serde(flatten)]
    pub index: RegistrationIndex<MetadataExtensions>,
    /// Downloads across every version.
    #[serde(rename = "totalDownloads")]
    pub total_downloads: u64,
}

/// `GET /v3/registration/{id}/{version}.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationLeaf {
    /// URL of this leaf.
    #[serde(rename = "@id")]
    pub url: String,
    /// JSON-LD types.
    #[serde(rename = "@type")]
    pub types: Vec<String>,
    /// URL of the version's catalog entry.
    pub catalog_entry: String,
    /// Listed flag.
    pub listed: bool,
    /// URL of the `.nupkg`.
    pub package_content: String,
    /// Publish time.
    pub published: DateTime<Utc>,
    /// URL of the registration index.
    pub registration: String,
}

/// One page summary in the catalog index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogPageItem {
    /// Page URL.
    #[serde(rename = "@id")]
    pub url: String,
    /// Always `CatalogPage`.
    #[serde(rename = "@type")]
    pub kind: String,
    /// Id of the newest commit on the page.
    #[serde(rename = "commitId")]
    pub commit_id: String,
    /// Time of the newest commit on the page.
    #[serde(rename = "commitTimeStamp")]
    pub commit_timestamp: DateTime<Utc>,
    /// Commits on the page.
    pub count: usize,
}

/// `GET /v3/catalog/index.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogIndex {
    /// URL of this index.
    #[serde(rename = "@id")]
    pub url: String,
    /// JSON-LD types.
    #[serde(rename = "@type")]
    pub types: Vec<String>,
    /// Id of the newest commit.
    #[serde(rename = "commitId")]
    pub commit_id: String,
    /// Time of the newest commit.
    #[serde(rename = "commitTimeStamp")]
    pub commit_timestamp: DateTime<Utc>,
    /// Number of pages.
    pub count: usize,
    /// The pages, oldest first.
    pub items: Vec<CatalogPageItem>,
}

/// One commit on a catalog page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogLeafItem {
    /// Leaf URL.
    #[serde(rename = "@id")]
    pub url: String,
    /// `nuget:PackageDetails` or `nuget:PackageDelete`.
    #[serde(rename = "@type")]
    pub kind: String,
    /// Commit id.
    #[serde(rename = "commitId")]
    pub commit_id: String,
    /// Commit time.
    #[serde(rename = "commitTimeStamp")]
    pub commit_timestamp: DateTime<Utc>,
    /// Package id.
    #[serde(rename = "nuget:id")]
    pub package_id: String,
    /// Package version.
    #[serde(rename = "nuget:version")]
    pub package_version: String,
}

/// `GET /v3/catalog/page{n}.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogPage {
    /// Page URL.
    #[serde(rename = "@id")]
    pub url: String,
    /// Always `CatalogPage`.
    #[serde(rename = "@type")]
    pub kind: String,
    /// Id of the newest commit on the page.
    #[serde(rename = "commitId")]
    pub commit_id: String,
    /// Time of the newest commit on the page.
    #[serde(rename = "commitTimeStamp")]
    pub commit_timestamp: DateTime<Utc>,
    /// Commits on the page.
    pub count: usize,
    /// URL of the catalog index.
    pub parent: String,
    /// The commits, oldest first.
    pub items: Vec<CatalogLeafItem>,
}

/// `GET /v3/catalog/data/{sequence}/{id}.{version}.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogLeaf {
    /// Leaf URL.
    #[serde(rename = "@id")]
    pub url: String,
    /// JSON-LD types.
    #[serde(rename = "@type")]
    pub types: Vec<String>,
    /// Commit id.
    #[serde(rename = "catalog:commitId")]
    pub commit_id: String,
    /// Commit time.
    #[serde(rename = "catalog:commitTimeStamp")]
    pub commit_timestamp: DateTime<Utc>,
    /// Package id.
    pub id: String,
    /// When the package was published, for details leaves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
    /// Package version.
    pub version: String,
    /// Listed flag after the commit, for details leaves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listed: Option<bool>,
}

/// A package type on a search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageTypeItem {
    /// Package type name.
    pub name: String,
}

/// A version on a search result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResultVersion {
    /// Registration leaf URL.
    #[serde(rename = "@id")]
    pub url: String,
    /// Full version.
    pub version: String,
    /// Downloads of this version.
    pub downloads: u64,
}

/// One package id in a search response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    /// Registration index URL.
    #[serde(rename = "@id")]
    pub url: String,
    /// Always `Package`.
    #[serde(rename = "@type")]
    pub kind: String,
    /// Registration index URL.
    pub registration: String,
    /// Package id.
    pub id: String,
    /// Latest matching version.
    pub version: String,
    /// Description of the latest version.
    pub description: String,
    /// Authors of the latest version.
    pub authors: Vec<String>,
    /// Icon URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_url: Option<String>,
    /// License URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_url: Option<String>,
    /// Project URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_url: Option<String>,
    /// Summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Tags of the latest version.
    pub tags: Vec<String>,
    /// Title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Downloads of every matching version.
    pub total_downloads: u64,
    /// Package types of the latest version.
    pub package_types: Vec<PackageTypeItem>,
    /// Every matching version, ascending.
    pub versions: Vec<SearchResultVersion>,
}

/// `GET /v3/search`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Matching package ids before paging.
    #[serde(rename = "totalHits")]
    pub total_hits: usize,
    /// The requested page.
    pub data: Vec<SearchResult>,
}

/// `GET /v3/autocomplete`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutocompleteResponse {
    /// Matches before paging.
    #[serde(rename = "totalHits")]
    pub total_hits: usize,
    /// Package ids, or versions of one id.
    pub data: Vec<String>,
}

/// One package in a dependents response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependentResult {
    /// Package id.
    pub id: String,
    /// Description of the latest listed version.
    pub description: String,
    /// Downloads across listed versions.
    pub total_downloads: u64,
}

/// `GET /v3/dependents`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependentsResponse {
    /// Number of dependents.
    #[serde(rename = "totalHits")]
    pub total_hits: usize,
    /// Dependent packages ordered by id.
    pub data: Vec<DependentResult>,
}
