//! Request-level error taxonomy and its HTTP rendering.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::retry::ProviderError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("missing or invalid X-User-Id header")]
    Unauthorized,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unsupported document format: {path}")]
    UnsupportedFormat { path: String },

    #[error("failed to load document {path}: {reason}")]
    DocumentLoad { path: String, reason: String },

    #[error("embedding provider failed: {0}")]
    EmbeddingFailure(#[source] ProviderError),

    #[error("language model failed: {0}")]
    GenerationFailure(#[source] ProviderError),

    #[error("failed to rebuild chain for agent {agent_id}: {source}")]
    RebuildFailure {
        agent_id: String,
        #[source]
        source: Box<AppError>,
    },

    /// Preparation aborted on one document; `loaded` lists the documents that
    /// had already been read when the failure happened.
    #[error("{source}")]
    PreparationAborted {
        loaded: Vec<String>,
        #[source]
        source: Box<AppError>,
    },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Unauthorized => "UNAUTHORIZED",
            AppError::InvalidInput(_) => "INVALID_INPUT",
            AppError::NotFound { .. } => "NOT_FOUND",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::UnsupportedFormat { .. } => "UNSUPPORTED_FORMAT",
            AppError::DocumentLoad { .. } => "DOCUMENT_LOAD_FAILED",
            AppError::EmbeddingFailure(_) => "EMBEDDING_FAILURE",
            AppError::GenerationFailure(_) => "GENERATION_FAILURE",
            AppError::RebuildFailure { .. } => "REBUILD_FAILURE",
            AppError::PreparationAborted { source, .. } => source.code(),
            AppError::Storage(_) => "STORAGE_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::UnsupportedFormat { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::DocumentLoad { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::EmbeddingFailure(_) | AppError::GenerationFailure(_) => StatusCode::BAD_GATEWAY,
            AppError::PreparationAborted { source, .. } => source.status(),
            AppError::RebuildFailure { .. } | AppError::Storage(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Provider faults are worth retrying from the client side; input faults are not.
    pub fn retryable(&self) -> bool {
        match self {
            AppError::EmbeddingFailure(e) | AppError::GenerationFailure(e) => e.is_transient(),
            AppError::RebuildFailure { source, .. } | AppError::PreparationAborted { source, .. } => source.retryable(),
            _ => false,
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            AppError::NotFound { entity, id } => Some(serde_json::json!({ "entity": entity, "id": id })),
            AppError::UnsupportedFormat { path } => Some(serde_json::json!({ "path": path })),
            AppError::DocumentLoad { path, reason } => Some(serde_json::json!({ "path": path, "reason": reason })),
            AppError::EmbeddingFailure(_) | AppError::GenerationFailure(_) => {
                Some(serde_json::json!({ "retryable": self.retryable() }))
            }
            AppError::RebuildFailure { agent_id, source } => Some(serde_json::json!({
                "agentId": agent_id,
                "cause": source.code(),
                "retryable": source.retryable(),
            })),
            AppError::PreparationAborted { loaded, source } => {
                let mut details = source.details().unwrap_or_else(|| serde_json::json!({}));
                details["loaded"] = serde_json::json!(loaded);
                Some(details)
            }
            _ => None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), error = %self, "request failed");
        } else {
            tracing::warn!(code = self.code(), error = %self, "request rejected");
        }
        let body = serde_json::json!({
            "error": { "code": self.code(), "message": self.to_string(), "details": self.details() }
        });
        (status, Json(body)).into_response()
    }
}

impl From<sled::Error> for AppError {
    fn from(err: sled::Error) -> Self {
        AppError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Storage(format!("corrupt record: {}", err))
    }
}
