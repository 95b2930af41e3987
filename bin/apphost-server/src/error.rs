//! Unified server error type and the domain error classifier.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors become a JSON-body HTTP
//! response with the matching status code. Domain errors enter through
//! `From<DomainError>`, the single place where they are classified.
//!
//! Unclassified errors are logged with full detail but only a generic
//! message is returned, so storage paths never leak to clients.

use apphost_core::DomainError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::error;

/// All errors that can occur in the apphost-server request lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerError {
    /// A named request parameter has an unacceptable value.
    #[error("invalid parameter {field}: {message}")]
    InvalidParameter { field: &'static str, message: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A domain error with no client-facing classification.
    #[error(transparent)]
    Unclassified(DomainError),
}

impl From<DomainError> for ServerError {
    fn from(err: DomainError) -> Self {
        // No wildcard arm: every domain error is classified here.
        match err {
            DomainError::InvalidSlug(_) => ServerError::InvalidParameter {
                field: "slug",
                message: err.to_string(),
            },
            DomainError::AlreadyExists(_) | DomainError::Busy(_) => {
                ServerError::Conflict(err.to_string())
            }
            DomainError::NotFound(_) | DomainError::ManifestNotReachable(_) => {
                ServerError::NotFound(err.to_string())
            }
            DomainError::UnsupportedSource(_) | DomainError::MalformedSource(_) => {
                ServerError::InvalidParameter {
                    field: "source",
                    message: err.to_string(),
                }
            }
            DomainError::SourceNotReachable(_)
            | DomainError::BadManifest(_)
            | DomainError::MissingSource => ServerError::BadRequest(err.to_string()),
            DomainError::Storage(_) | DomainError::Interrupted(_) => ServerError::Unclassified(err),
        }
    }
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::InvalidParameter { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ServerError::Conflict(_) => StatusCode::CONFLICT,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServerError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServerError::Unclassified(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON body sent to the client, also used as the data of a streamed
    /// `error` event.
    pub fn body(&self) -> Value {
        match self {
            ServerError::InvalidParameter { field, message } => {
                json!({ "error": message, "parameter": field })
            }
            ServerError::Conflict(m)
            | ServerError::NotFound(m)
            | ServerError::BadRequest(m)
            | ServerError::Unauthorized(m)
            | ServerError::Forbidden(m) => json!({ "error": m }),
            ServerError::Unclassified(e) => {
                error!(error = %e, "unclassified domain error");
                json!({ "error": "internal server error" })
            }
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
