//! Error types for the feed

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::catalog::CatalogError;
use crate::content::ContentError;
use crate::id::IdError;
use crate::manifest::ManifestError;
use crate::version::VersionError;

/// Result type for feed operations
pub type FeedResult<T> = Result<T, FeedError>;

/// Error types for feed operations
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// The uploaded artifact is not a valid package
    #[error("invalid package: {0}")]
    InvalidPackage(#[from] ManifestError),

    /// A request named a malformed id or version
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Different content is already stored for this id and version
    #[error("package {id} {version} already exists")]
    PackageAlreadyExists {
        /// Package id
        id: String,
        /// Package version
        version: String,
    },

    /// No such package, locally or upstream
    #[error("not found: {0}")]
    NotFound(String),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// Catalog error
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// The upstream feed could not be reached
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// An error delivered to several waiters of one shared operation
    #[error(transparent)]
    Shared(Arc<FeedError>),
}

impl From<IdError> for FeedError {
    fn from(err: IdError) -> Self {
        FeedError::InvalidRequest(err.to_string())
    }
}

impl From<VersionError> for FeedError {
    fn from(err: VersionError) -> Self {
        FeedError::InvalidRequest(err.to_string())
    }
}

impl From<ContentError> for FeedError {
    fn from(err: ContentError) -> Self {
        match err {
            ContentError::Conflict { key, .. } => FeedError::PackageAlreadyExists {
                id: key.id().to_owned(),
                version: key.version().normalized(),
            },
            ContentError::Storage(err) => FeedError::Storage(err),
        }
    }
}

impl FeedError {
    /// Unwrap an error shared between waiters, cloning it where possible.
    pub fn from_shared(err: Arc<FeedError>) -> Self {
        match &*err {
            FeedError::NotFound(what) => FeedError::NotFound(what.clone()),
            FeedError::UpstreamUnavailable(what) => FeedError::UpstreamUnavailable(what.clone()),
            FeedError::InvalidRequest(what) => FeedError::InvalidRequest(what.clone()),
            FeedError::PackageAlreadyExists { id, version } => FeedError::PackageAlreadyExists {
                id: id.clone(),
                version: version.clone(),
            },
            FeedError::Catalog(err) => FeedError::Catalog(err.clone()),
            FeedError::Shared(inner) => FeedError::from_shared(inner.clone()),
            _ => FeedError::Shared(err),
        }
    }

    /// The error, looking through [`FeedError::Shared`].
    fn inner(&self) -> &FeedError {
        match self {
            FeedError::Shared(inner) => inner.inner(),
            other => other,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self.inner() {
            FeedError::Storage(err) => err.is_retryable(),
            FeedError::Catalog(CatalogError::Unavailable(_)) => true,
            _ => false,
        }
    }

    /// Whether this is a [`FeedError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self.inner(), FeedError::NotFound(_))
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self.inner() {
            FeedError::InvalidPackage(_) | FeedError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            FeedError::PackageAlreadyExists { .. } => StatusCode::CONFLICT,
            FeedError::NotFound(_) => StatusCode::NOT_FOUND,
            FeedError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            FeedError::Storage(_) | FeedError::Catalog(_) | FeedError::Shared(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get the machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self.inner() {
            FeedError::InvalidPackage(_) => "INVALID_PACKAGE",
            FeedError::InvalidRequest(_) => "INVALID_REQUEST",
            FeedError::PackageAlreadyExists { .. } => "PACKAGE_ALREADY_EXISTS",
            FeedError::NotFound(_) => "NOT_FOUND",
            FeedError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            FeedError::Storage(_) | FeedError::Catalog(_) | FeedError::Shared(_) => "UNKNOWN",
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
}

impl IntoResponse for FeedError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let body = ErrorResponse {
            code: self.error_code(),
            message: self.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}
