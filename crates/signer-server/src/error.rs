//! Service error types and their HTTP rendering.
//!
//! Every error reaching an HTTP caller is rendered as
//! `{ "success": false, "error": "<message>" }`. Only request validation
//! and queue admission failures can reach a caller; everything after the
//! `201` acknowledgment is reported to the operator log instead.

use std::io;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use idcard_signer_core::Error as CoreError;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinError;

/// Error type for the signer service.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The request body was rejected before it reached the queue.
    #[error("{0}")]
    BadRequest(String),

    /// The send queue is full.
    #[error("signer is busy, try again later")]
    Busy,

    /// The signing worker has stopped.
    #[error("signer is shutting down")]
    ShuttingDown,

    /// Core library error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Socket or terminal I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A background task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(#[from] JoinError),
}

/// Result type for service operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// The error body returned to HTTP callers.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Always `false`.
    pub success: bool,
    /// Human-readable cause.
    pub error: String,
}

impl ServerError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_)
            | Self::Core(
                CoreError::InvalidRecipient(_)
                | CoreError::InvalidAmount(_)
                | CoreError::JsonError(_),
            ) => StatusCode::BAD_REQUEST,
            Self::Busy | Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Core(CoreError::Node(_) | CoreError::Timeout(_)) => StatusCode::BAD_GATEWAY,
            Self::Core(_) | Self::Io(_) | Self::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
