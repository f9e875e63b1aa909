//! Registration documents: the per-id version listing.
//!
//! Pages are laid out by replaying the versions of an id in the order they
//! were added. A version above every page joins the last page, or opens a new
//! one when the last page is full. Any other version joins the page covering
//! it, or the nearest page below it. Adding a version therefore changes only
//! the page it joins, and every other page keeps its bounds and URL.
//!
//! While every version fits in one page, that page is inlined into the index.

use std::ops::Range;

use crate::catalog::PackageRecord;
use crate::content::ArtifactKind;
use crate::id::PackageId;
use crate::protocol::{
    DependencyGroupItem, DependencyItem, FeedRegistrationIndex, MetadataExtensions,
    PackageMetadata, RegistrationIndex, RegistrationLeaf, RegistrationLeafItem, RegistrationPage,
    Urls,
};
use crate::version::PackageVersion;

/// Registration page size used when none is configured.
pub const DEFAULT_PAGE_SIZE: usize = 64;

/// Split ascending versions into page ranges.
///
/// `added[i]` orders the arrival of the `i`th lowest version. Versions with
/// equal arrival are taken in ascending order.
pub fn partition(added: &[u64], page_size: usize) -> Vec<Range<usize>> {
    let page_size = page_size.max(1);
    let mut arrivals: Vec<usize> = (0..added.len()).collect();
    arrivals.sort_by_key(|&index| added[index]);

    // Each page spans a range of positions and counts the versions seen so far.
    let mut pages: Vec<(Range<usize>, usize)> = Vec::new();
    for index in arrivals {
        let joined = match pages.last() {
            None => None,
            Some((span, count)) if index >= span.end => {
                (*count < page_size).then(|| pages.len() - 1)
            }
            Some(_) => Some(
                pages
                    .iter()
                    .rposition(|(span, _)| span.start <= index)
                    .unwrap_or(0),
            ),
        };

        match joined {
            Some(joined) => {
                let (span, count) = &mut pages[joined];
                span.start = span.start.min(index);
                span.end = span.end.max(index + 1);
                *count += 1;
            }
            None => pages.push((index..index + 1, 1)),
        }
    }
    pages.into_iter().map(|(span, _)| span).collect()
}

/// Builds registration documents from catalog records.
#[derive(Debug, Clone)]
pub struct RegistrationPager {
    urls: Urls,
    page_size: usize,
}

impl RegistrationPager {
    /// A pager producing pages of at most `page_size` versions.
    pub fn new(urls: Urls, page_size: usize) -> Self {
        Self {
            urls,
            page_size: page_size.max(1),
        }
    }

    /// The page size.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// The registration index for the versions of one id.
    ///
    /// `records` must be sorted ascending by version. `None` when empty.
    pub fn index(&self, records: &[PackageRecord]) -> Option<FeedRegistrationIndex> {
        let id = &records.first()?.id;
        let inline = records.len() <= self.page_size;

        let added: Vec<u64> = records.iter().map(|r| r.added).collect();
        let items: Vec<_> = partition(&added, self.page_size)
            .into_iter()
            .filter_map(|range| self.page_for(id, &records[range], inline))
            .collect();

        Some(FeedRegistrationIndex {
            index: RegistrationIndex {
                url: self.urls.registration_index(id),
                types: vec![
                    "catalog:CatalogRoot".to_owned(),
                    "PackageRegistration".to_owned(),
                    "catalog:Permalink".to_owned(),
                ],
                count: items.len(),
                items,
            },
            total_downloads: records.iter().map(|r| r.downloads).sum(),
        })
    }

    /// The page spanning `lower..=upper`, with its items.
    ///
    /// Bounds from an older partition still resolve to the versions they
    /// cover. `None` when no version falls in the range.
    pub fn page(
        &self,
        records: &[PackageRecord],
        lower: &PackageVersion,
        upper: &PackageVersion,
    ) -> Option<RegistrationPage<MetadataExtensions>> {
        let start = records.iter().position(|r| &r.version >= lower)?;
        let end = records
            .iter()
            .rposition(|r| &r.version <= upper)
            .map(|index| index + 1)?;
        if start >= end {
            return None;
        }
        let id = &records[start].id;
        self.page_for(id, &records[start..end], true)
    }

    fn page_for(
        &self,
        id: &PackageId,
        records: &[PackageRecord],
        inline: bool,
    ) -> Option<RegistrationPage<MetadataExtensions>> {
        let lower = &records.first()?.version;
        let upper = &records.last()?.version;

        Some(RegistrationPage {
            url: self.urls.registration_page(id, lower, upper),
            count: records.len(),
            lower: lower.normalized(),
            upper: upper.normalized(),
            items: inline.then(|| records.iter().map(|r| self.item(r)).collect()),
            parent: Some(self.urls.registration_index(id)),
        })
    }

    fn item(&self, record: &PackageRecord) -> RegistrationLeafItem<MetadataExtensions> {
        RegistrationLeafItem {
            url: self.urls.registration_leaf(&record.id, &record.version),
            catalog_entry: self.metadata(record),
            package_content: self.urls.package_content(&record.id, &record.version),
        }
    }

    /// The `catalogEntry` document of one version.
    pub fn metadata(&self, record: &PackageRecord) -> PackageMetadata<MetadataExtensions> {
        PackageMetadata {
            url: self.urls.registration_leaf(&record.id, &record.version),
            id: record.id.to_string(),
            version: record.version.full(),
            authors: record.authors.join(", "),
            dependency_groups: record
                .dependency_groups
                .iter()
                .map(|group| DependencyGroupItem {
                    target_framework: group.target_framework.clone(),
                    dependencies: group
                        .dependencies
                        .iter()
                        .map(|d| DependencyItem {
                            id: d.id.clone(),
                            range: d.range.clone(),
                        })
                        .collect(),
                })
                .collect(),
            description: record.description.clone(),
            icon_url: record.icon_url.clone(),
            license_url: record.license_url.clone(),
            license_expression: record.license_expression.clone(),
            listed: record.listed,
            min_client_version: record.min_client_version.clone(),
            package_content: self.urls.package_content(&record.id, &record.version),
            package_hash: record.package_hash().map(|hash| hash.to_base64()),
            package_hash_algorithm: record.package_hash().map(|_| "SHA512".to_owned()),
            project_url: record.project_url.clone(),
            published: record.published,
            require_license_acceptance: record.require_license_acceptance,
            summary: record.summary.clone(),
            tags: record.tags.clone(),
            title: record.title.clone(),
            extensions: MetadataExtensions {
                downloads: record.downloads,
                has_readme: record.has(ArtifactKind::Readme),
                package_types: record.package_types.clone(),
                release_notes: record.release_notes.clone(),
                repository_url: record.repository_url.clone(),
                repository_type: record.repository_type.clone(),
            },
        }
    }

    /// The registration leaf of one version.
    pub fn leaf(&self, record: &PackageRecord) -> RegistrationLeaf {
        RegistrationLeaf {
            url: self.urls.registration_leaf(&record.id, &record.version),
            types: vec!["Package".to_owned(), "http://schema.nuget.org/catalog#Permalink".to_owned()],
            catalog_entry: self.urls.registration_leaf(&record.id, &record.version),
            listed: record.listed,
            package_content: self.urls.package_content(&record.id, &record.version),
            published: record.published,
            registration: self.urls.registration_index(&record.id),
        }
    }
}
