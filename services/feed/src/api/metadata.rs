//! Registration and catalog documents

use axum::Router;
use axum::extract::{Path, State};
use axum::response::Json;
use axum::routing::get;

use crate::error::{FeedError, FeedResult};
use crate::feed::{Feed, parse_key};
use crate::id::PackageId;
use crate::protocol::{
    CatalogIndex, CatalogLeaf, CatalogPage, FeedRegistrationIndex, MetadataExtensions,
    RegistrationLeaf, RegistrationPage,
};
use crate::version::PackageVersion;

/// Router for metadata documents
pub(super) fn router() -> Router<Feed> {
    Router::new()
        .route("/v3/registration/{id}/index.json", get(registration_index))
        .route(
            "/v3/registration/{id}/page/{lower}/{upper}",
            get(registration_page),
        )
        .route("/v3/registration/{id}/{leaf}", get(registration_leaf))
        .route("/v3/catalog/index.json", get(catalog_index))
        .route("/v3/catalog/{page}", get(catalog_page))
        .route("/v3/catalog/data/{sequence}/{leaf}", get(catalog_leaf))
}

/// Strip the `.json` extension off the last path segment.
fn json_stem(segment: &str) -> FeedResult<&str> {
    segment
        .strip_suffix(".json")
        .ok_or_else(|| FeedError::NotFound(segment.to_owned()))
}

/// Registration index of a package
async fn registration_index(
    State(feed): State<Feed>,
    Path(id): Path<String>,
) -> FeedResult<Json<FeedRegistrationIndex>> {
    let id = PackageId::new(&id)?;
    Ok(Json(feed.registration_index(&id).await?))
}

/// One registration page, addressed by its bounds
async fn registration_page(
    State(feed): State<Feed>,
    Path((id, lower, upper)): Path<(String, String, String)>,
) -> FeedResult<Json<RegistrationPage<MetadataExtensions>>> {
    let (id, lower) = parse_key(&id, &lower)?;
    let upper = PackageVersion::parse(json_stem(&upper)?)?;
    Ok(Json(feed.registration_page(&id, &lower, &upper).await?))
}

/// Registration leaf of one version
async fn registration_leaf(
    State(feed): State<Feed>,
    Path((id, leaf)): Path<(String, String)>,
) -> FeedResult<Json<RegistrationLeaf>> {
    let (id, version) = parse_key(&id, json_stem(&leaf)?)?;
    Ok(Json(feed.registration_leaf(&id, &version).await?))
}

/// The catalog index
async fn catalog_index(State(feed): State<Feed>) -> FeedResult<Json<CatalogIndex>> {
    Ok(Json(feed.catalog_index().await?))
}

/// One catalog page, `page{n}.json`
async fn catalog_page(
    State(feed): State<Feed>,
    Path(page): Path<String>,
) -> FeedResult<Json<CatalogPage>> {
    let number = json_stem(&page)?
        .strip_prefix("page")
        .and_then(|n| n.parse::<usize>().ok())
        .ok_or_else(|| FeedError::NotFound(page.clone()))?;
    Ok(Json(feed.catalog_page(number).await?))
}

/// The catalog leaf of one commit
async fn catalog_leaf(
    State(feed): State<Feed>,
    Path((sequence, leaf)): Path<(u64, String)>,
) -> FeedResult<Json<CatalogLeaf>> {
    Ok(Json(feed.catalog_leaf(sequence, json_stem(&leaf)?).await?))
}
