//! Search, autocomplete and dependents

use axum::Router;
use axum::extract::{Query, State};
use axum::response::Json;
use axum::routing::get;
use serde::Deserialize;

use crate::error::FeedResult;
use crate::feed::Feed;
use crate::id::PackageId;
use crate::protocol::{AutocompleteResponse, DependentsResponse, SearchResponse};
use crate::search::{AutocompleteRequest, SearchRequest};

/// Router for query operations
pub(super) fn router() -> Router<Feed> {
    Router::new()
        .route("/v3/search", get(search))
        .route("/v3/autocomplete", get(autocomplete))
        .route("/v3/dependents", get(dependents))
}

/// Search packages
async fn search(
    State(feed): State<Feed>,
    Query(request): Query<SearchRequest>,
) -> FeedResult<Json<SearchResponse>> {
    Ok(Json(feed.search(&request).await?))
}

/// Complete package ids, or list versions of one id
async fn autocomplete(
    State(feed): State<Feed>,
    Query(request): Query<AutocompleteRequest>,
) -> FeedResult<Json<AutocompleteResponse>> {
    Ok(Json(feed.autocomplete(&request).await?))
}

#[derive(Debug, Deserialize)]
struct DependentsQuery {
    id: String,
}

/// Packages depending on a package
async fn dependents(
    State(feed): State<Feed>,
    Query(query): Query<DependentsQuery>,
) -> FeedResult<Json<DependentsResponse>> {
    let id = PackageId::new(&query.id)?;
    Ok(Json(feed.dependents(&id).await?))
}
