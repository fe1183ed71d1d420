use std::time::Duration;

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

/// Failure reported by an external engine (embedding, generation, rerank).
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("engine call timed out after {0:?}")]
    Timeout(Duration),
    #[error("engine unavailable: {0}")]
    Unavailable(String),
    #[error("engine returned an invalid response: {0}")]
    Response(String),
}

impl EngineError {
    pub fn unavailable<E: std::fmt::Display>(err: E) -> Self {
        EngineError::Unavailable(err.to_string())
    }

    pub fn response<E: std::fmt::Display>(err: E) -> Self {
        EngineError::Response(err.to_string())
    }
}

/// Error taxonomy of the retrieval-augmented generation pipeline.
///
/// Only `EmptyInput`, `InvalidInput`, `EmbeddingFailure`, `RetrievalFailure`,
/// `GenerationFailure` and `Storage` reach callers as failures. Rewrite and
/// rerank failures are absorbed by the pipeline's fallback policies.
#[derive(Debug, Error)]
pub enum RagError {
    #[error("empty input: {0}")]
    EmptyInput(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("embedding failed: {0}")]
    EmbeddingFailure(#[source] EngineError),
    #[error("retrieval failed: {0}")]
    RetrievalFailure(String),
    #[error("rerank failed: {0}")]
    RerankFailure(String),
    #[error("query rewrite failed: {0}")]
    RewriteFailure(String),
    #[error("generation failed: {0}")]
    GenerationFailure(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("cancelled by client")]
    CancelledByClient,
}

impl RagError {
    pub fn storage<E: std::fmt::Display>(err: E) -> Self {
        RagError::Storage(err.to_string())
    }

    /// Whether the pipeline continues in a degraded mode after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RagError::RerankFailure(_) | RagError::RewriteFailure(_))
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<RagError> for ApiError {
    fn from(err: RagError) -> Self {
        match err {
            RagError::EmptyInput(_) | RagError::InvalidInput(_) | RagError::CancelledByClient => {
                ApiError::BadRequest(err.to_string())
            }
            RagError::EmbeddingFailure(_)
            | RagError::RetrievalFailure(_)
            | RagError::GenerationFailure(_) => ApiError::ServiceUnavailable(err.to_string()),
            RagError::InvalidConfig(_)
            | RagError::RerankFailure(_)
            | RagError::RewriteFailure(_)
            | RagError::Storage(_) => ApiError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({ "error": message }));
        (status, body).into_response()
    }
}
