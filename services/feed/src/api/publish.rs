//! Pushing, unlisting, relisting and deleting packages

use axum::Router;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, put};
use bytes::Bytes;

use crate::error::FeedResult;
use crate::feed::{Feed, parse_key};
use crate::ingest::IngestOutcome;

/// Largest package accepted by a push.
const MAX_PACKAGE_SIZE: usize = 250 * 1024 * 1024;

/// Router for publish operations
pub(super) fn router() -> Router<Feed> {
    Router::new()
        .route(
            "/api/v2/package",
            put(push_package).layer(DefaultBodyLimit::max(MAX_PACKAGE_SIZE)),
        )
        .route(
            "/api/v2/package/{id}/{version}",
            delete(delete_package).post(relist_package),
        )
}

/// Push a package
///
/// Responds 201 for a new version and 200 when identical bytes were already
/// pushed.
async fn push_package(State(feed): State<Feed>, body: Bytes) -> FeedResult<StatusCode> {
    let ingested = feed.push(body).await?;
    Ok(match ingested.outcome {
        IngestOutcome::Created => StatusCode::CREATED,
        IngestOutcome::AlreadyExists => StatusCode::OK,
    })
}

/// Unlist or delete a version, as configured
async fn delete_package(
    State(feed): State<Feed>,
    Path((id, version)): Path<(String, String)>,
) -> FeedResult<StatusCode> {
    let (id, version) = parse_key(&id, &version)?;
    feed.remove(&id, &version).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Relist a version
async fn relist_package(
    State(feed): State<Feed>,
    Path((id, version)): Path<(String, String)>,
) -> FeedResult<StatusCode> {
    let (id, version) = parse_key(&id, &version)?;
    feed.relist(&id, &version).await?;
    Ok(StatusCode::OK)
}
