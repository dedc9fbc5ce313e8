use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Failure of a persistence call.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The backing service could not be reached. Only produced by test doubles
    /// and non-SQL stores.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Why a slug could not be turned into a link.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("short link '{0}' not found")]
    NotFound(String),

    #[error("failed to look up short link '{slug}'")]
    Transport {
        slug: String,
        #[source]
        source: StoreError,
    },
}

/// Errors returned by the management API as `{ "error": "..." }` bodies.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("you do not own this resource")]
    Forbidden,

    #[error("not found")]
    NotFound,

    #[error("{0}")]
    Conflict(String),

    #[error("uploads are not configured")]
    UploadsDisabled,

    #[error("upload failed")]
    Upload(String),

    #[error("database error")]
    Database(#[from] sqlx::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::UploadsDisabled => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Upload(detail) => {
                tracing::error!("Upload failed: {}", detail);
                StatusCode::BAD_GATEWAY
            }
            ApiError::Database(e) => {
                tracing::error!("Database error in API handler: {:?}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
