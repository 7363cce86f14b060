use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Errors surfaced across configuration loading, backend lifecycle and the
/// HTTP front-end. Kept as a single enum so every call site propagates with
/// `?` and the front-end maps variants to responses in one place.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("backend '{0}' has no configured binary and no running instance to attach to")]
    BinaryMissing(String),

    #[error("backend '{0}' failed to start: {1}")]
    SpawnFailure(String, String),

    #[error("endpoint not found for path '{0}'")]
    EndpointNotMatched(String),

    #[error("backend key '{0}' not found in manager")]
    BackendKeyNotFound(String),

    #[error("backend '{0}' is not available")]
    BackendUnavailable(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, kind) = match &self {
            Error::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "config_error"),
            Error::BinaryMissing(_) => (StatusCode::SERVICE_UNAVAILABLE, "binary_missing"),
            Error::SpawnFailure(..) => (StatusCode::SERVICE_UNAVAILABLE, "spawn_failure"),
            Error::EndpointNotMatched(_) => (StatusCode::NOT_FOUND, "endpoint_not_matched"),
            Error::BackendKeyNotFound(_) => (StatusCode::INTERNAL_SERVER_ERROR, "backend_key_not_found"),
            Error::BackendUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "backend_unavailable"),
        };

        tracing::warn!(error = %self, kind, "request failed");

        let body = json!({
            "error": {
                "type": kind,
                "message": self.to_string(),
            }
        });

        (status, axum::Json(body)).into_response()
    }
}
