//! Package content: version lists and artifact downloads

use axum::Router;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;

use crate::content::ArtifactKind;
use crate::error::{FeedError, FeedResult};
use crate::feed::{Feed, parse_key};
use crate::id::PackageId;
use crate::protocol::PackageVersions;

/// Router for package content
pub(super) fn router() -> Router<Feed> {
    Router::new()
        .route("/v3/package/{id}/index.json", get(list_versions))
        .route("/v3/package/{id}/{version}/{file}", get(get_artifact))
}

/// List the versions of a package
async fn list_versions(
    State(feed): State<Feed>,
    Path(id): Path<String>,
) -> FeedResult<Json<PackageVersions>> {
    let id = PackageId::new(&id)?;
    Ok(Json(feed.package_versions(&id).await?))
}

/// Which artifact a file name in a content URL asks for.
fn artifact(id: &str, version: &str, file: &str) -> Option<ArtifactKind> {
    let file = file.to_ascii_lowercase();
    let (id, version) = (id.to_ascii_lowercase(), version.to_ascii_lowercase());
    match file.as_str() {
        "readme" => Some(ArtifactKind::Readme),
        "icon" => Some(ArtifactKind::Icon),
        "license" => Some(ArtifactKind::License),
        name if name == format!("{id}.{version}.nupkg") => Some(ArtifactKind::Package),
        name if name == format!("{id}.nuspec") => Some(ArtifactKind::Manifest),
        _ => None,
    }
}

/// Download a package, its manifest or an embedded file
async fn get_artifact(
    State(feed): State<Feed>,
    Path((id, version, file)): Path<(String, String, String)>,
) -> FeedResult<Response> {
    let kind = artifact(&id, &version, &file)
        .ok_or_else(|| FeedError::NotFound(format!("{id}/{version}/{file}")))?;
    let (id, version) = parse_key(&id, &version)?;

    let data = feed.download(&id, &version, kind).await?;
    Ok(([(header::CONTENT_TYPE, kind.content_type())], data).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_names_select_artifacts() {
        assert_eq!(
            artifact("Demo", "1.0.0", "demo.1.0.0.nupkg"),
            Some(ArtifactKind::Package)
        );
        assert_eq!(artifact("demo", "1.0.0", "DEMO.nuspec"), Some(ArtifactKind::Manifest));
        assert_eq!(artifact("demo", "1.0.0", "readme"), Some(ArtifactKind::Readme));
        assert_eq!(artifact("demo", "1.0.0", "other.1.0.0.nupkg"), None);
        assert_eq!(artifact("demo", "1.0.0", "demo.2.0.0.nupkg"), None);
    }
}
