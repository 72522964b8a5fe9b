use crate::services::receiver_service::ReceiverError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// Error class reported to clients alongside the HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadRequest,
    SequenceError,
    NotFound,
    IoFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "BadRequest",
            ErrorKind::SequenceError => "SequenceError",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::IoFailure => "IOFailure",
        }
    }
}

/// A lightweight wrapper for request errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub kind: ErrorKind,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status, class and message.
    pub fn new(status: StatusCode, kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::IoFailure, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorKind::BadRequest, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorKind::NotFound, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "kind": self.kind.as_str(),
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<ReceiverError> for AppError {
    fn from(err: ReceiverError) -> Self {
        match err {
            ReceiverError::BadRequest(_) => AppError::bad_request(err.to_string()),
            ReceiverError::Sequence { .. } => {
                AppError::new(StatusCode::CONFLICT, ErrorKind::SequenceError, err.to_string())
            }
            ReceiverError::SizeMismatch { .. } => AppError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorKind::SequenceError,
                err.to_string(),
            ),
            ReceiverError::ArtifactNotFound(_) => AppError::not_found(err.to_string()),
            ReceiverError::Sqlx(_) | ReceiverError::Io(_) => {
                tracing::error!("storage failure: {}", err);
                AppError::internal(err.to_string())
            }
        }
    }
}
