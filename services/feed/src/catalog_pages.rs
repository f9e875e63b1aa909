//! Catalog documents: the change feed.
//!
//! Commits are grouped, in log order, into pages of `page_size` commits. Page
//! `n` always holds the commits at positions `n * page_size ..`, so a full
//! page never changes and only the newest page grows.

use chrono::{DateTime, Utc};

use crate::catalog::{CatalogCommit, CatalogError, CatalogStore, CommitKind};
use crate::protocol::{CatalogIndex, CatalogLeaf, CatalogLeafItem, CatalogPage, CatalogPageItem, Urls};

/// Catalog page size used when none is configured.
pub const DEFAULT_PAGE_SIZE: usize = 550;

/// A stable, GUID-shaped id for a commit.
pub fn commit_id(sequence: u64) -> String {
    format!("00000000-0000-0000-0000-{:012x}", sequence)
}

fn leaf_type(kind: CommitKind) -> &'static str {
    match kind {
        CommitKind::Delete => "nuget:PackageDelete",
        CommitKind::Add | CommitKind::Unlist | CommitKind::Relist => "nuget:PackageDetails",
    }
}

/// Builds catalog documents from the commit log.
#[derive(Debug, Clone)]
pub struct CatalogPager {
    urls: Urls,
    page_size: usize,
}

impl CatalogPager {
    /// A pager producing pages of at most `page_size` commits.
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

    /// The catalog index: every page with its commit count and newest commit.
    pub async fn index(&self, catalog: &dyn CatalogStore) -> Result<CatalogIndex, CatalogError> {
        let total = catalog.commit_count().await?;
        let pages = total.div_ceil(self.page_size);

        let mut items = Vec::with_capacity(pages);
        for page in 0..pages {
            let start = page * self.page_size;
            let end = (start + self.page_size).min(total);
            let Some(newest) = catalog.commits(end - 1..end).await?.pop() else {
                break;
            };
            items.push(CatalogPageItem {
                url: self.urls.catalog_page(page),
                kind: "CatalogPage".to_owned(),
                commit_id: commit_id(newest.sequence),
                commit_timestamp: newest.timestamp,
                count: end - start,
            });
        }

        let (commit, timestamp) = match items.last() {
            Some(item) => (item.commit_id.clone(), item.commit_timestamp),
            None => (commit_id(0), DateTime::<Utc>::UNIX_EPOCH),
        };

        Ok(CatalogIndex {
            url: self.urls.catalog_index(),
            types: vec!["CatalogRoot".to_owned(), "AppendOnlyCatalog".to_owned()],
            commit_id: commit,
            commit_timestamp: timestamp,
            count: items.len(),
            items,
        })
    }

    /// Page `page` of the catalog, `None` past the last page.
    pub async fn page(
        &self,
        catalog: &dyn CatalogStore,
        page: usize,
    ) -> Result<Option<CatalogPage>, CatalogError> {
        let Some(start) = page.checked_mul(self.page_size) else {
            return Ok(None);
        };
        let commits = catalog.commits(start..start.saturating_add(self.page_size)).await?;
        let Some(newest) = commits.last() else {
            return Ok(None);
        };

        Ok(Some(CatalogPage {
            url: self.urls.catalog_page(page),
            kind: "CatalogPage".to_owned(),
            commit_id: commit_id(newest.sequence),
            commit_timestamp: newest.timestamp,
            count: commits.len(),
            parent: self.urls.catalog_index(),
            items: commits.iter().map(|c| self.leaf_item(c)).collect(),
        }))
    }

    fn leaf_item(&self, commit: &CatalogCommit) -> CatalogLeafItem {
        CatalogLeafItem {
            url: self.urls.catalog_leaf(commit.sequence, &commit.id, &commit.version),
            kind: leaf_type(commit.kind).to_owned(),
            commit_id: commit_id(commit.sequence),
            commit_timestamp: commit.timestamp,
            package_id: commit.id.to_string(),
            package_version: commit.version.full(),
        }
    }

    /// The leaf document of one commit.
    ///
    /// `published` is the package's publish time when it still exists.
    pub fn leaf(&self, commit: &CatalogCommit, published: Option<DateTime<Utc>>) -> CatalogLeaf {
        let details = commit.kind != CommitKind::Delete;
        let kind = leaf_type(commit.kind).trim_start_matches("nuget:");
        CatalogLeaf {
            url: self.urls.catalog_leaf(commit.sequence, &commit.id, &commit.version),
            types: vec![kind.to_owned(), "catalog:Permalink".to_owned()],
            commit_id: commit_id(commit.sequence),
            commit_timestamp: commit.timestamp,
            id: commit.id.to_string(),
            published: if details { published } else { None },
            version: commit.version.full(),
            listed: details.then_some(commit.kind != CommitKind::Unlist),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::catalog::{MemoryCatalog, Origin, PackageRecord};
    use crate::manifest::read_package;
    use crate::testing::PackageBuilder;

    async fn catalog_with(versions: usize) -> MemoryCatalog {
        let catalog = MemoryCatalog::new();
        for patch in 0..versions {
            let archive =
                read_package(&PackageBuilder::new("Demo", &format!("1.0.{patch}")).build()).unwrap();
            catalog
                .insert(PackageRecord::new(&archive, BTreeMap::new(), Utc::now(), Origin::Local))
                .await
                .unwrap();
        }
        catalog
    }

    #[tokio::test]
    async fn empty_catalog_has_no_pages() {
        let pager = CatalogPager::new(Urls::new("http://feed"), 3);
        let index = pager.index(&MemoryCatalog::new()).await.unwrap();
        assert_eq!(index.count, 0);
        assert!(pager.page(&MemoryCatalog::new(), 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pages_follow_commit_order() {
        let catalog = catalog_with(7).await;
        let pager = CatalogPager::new(Urls::new("http://feed"), 3);

        let index = pager.index(&catalog).await.unwrap();
        let counts: Vec<usize> = index.items.iter().map(|p| p.count).collect();
        assert_eq!(counts, [3, 3, 1]);
        assert_eq!(index.items[2].url, "http://feed/v3/catalog/page2.json");
        assert_eq!(index.commit_id, commit_id(7));

        let mut seen = Vec::new();
        for page in 0..index.count {
            let page = pager.page(&catalog, page).await.unwrap().unwrap();
            seen.extend(page.items.into_iter().map(|item| item.package_version));
        }
        let expected: Vec<String> = (0..7).map(|p| format!("1.0.{p}")).collect();
        assert_eq!(seen, expected);
        assert!(pager.page(&catalog, 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn full_pages_do_not_change() {
        let catalog = catalog_with(6).await;
        let pager = CatalogPager::new(Urls::new("http://feed"), 3);
        let before = pager.page(&catalog, 0).await.unwrap().unwrap();

        let archive = read_package(&PackageBuilder::new("Other", "1.0.0").build()).unwrap();
        catalog
            .insert(PackageRecord::new(&archive, BTreeMap::new(), Utc::now(), Origin::Local))
            .await
            .unwrap();

        assert_eq!(pager.page(&catalog, 0).await.unwrap().unwrap(), before);
        assert_eq!(pager.page(&catalog, 2).await.unwrap().unwrap().count, 1);
    }

    #[tokio::test]
    async fn delete_leaves_have_their_own_type() {
        let catalog = catalog_with(1).await;
        let record = catalog.records().await.unwrap().remove(0);
        catalog.set_listed(&record.key(), false).await.unwrap();
        catalog.remove(&record.key()).await.unwrap();

        let pager = CatalogPager::new(Urls::new("http://feed"), 10);
        let page = pager.page(&catalog, 0).await.unwrap().unwrap();
        let kinds: Vec<&str> = page.items.iter().map(|i| i.kind.as_str()).collect();
        assert_eq!(
            kinds,
            ["nuget:PackageDetails", "nuget:PackageDetails", "nuget:PackageDelete"]
        );

        let commits = catalog.commits(0..3).await.unwrap();
        let unlisted = pager.leaf(&commits[1], Some(record.published));
        assert_eq!(unlisted.listed, Some(false));
        assert_eq!(unlisted.types[0], "PackageDetails");
        let deleted = pager.leaf(&commits[2], None);
        assert_eq!(deleted.types[0], "PackageDelete");
        assert_eq!(deleted.listed, None);
        assert_eq!(
            deleted.url,
            "http://feed/v3/catalog/data/3/demo.1.0.0.json"
        );
    }
}
