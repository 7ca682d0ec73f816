//! Fault boundary and structured error responses
//!
//! Every error body the HTTP surface produces is an [`ErrorResponse`]:
//! the admission gate builds the 401, the router fallback the 404, and
//! this module the 500 for anything that escaped a handler.

use std::any::Any;
use std::fmt::Display;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;
use tracing::error;

/// Body message for rejected credentials (kept verbatim for existing clients)
pub const UNAUTHORIZED_MESSAGE: &str = "Unauthorized: Invalid API Key";
/// Body message for unmatched routes
pub const NOT_FOUND_MESSAGE: &str = "Not Found";
/// Body message for unhandled failures
pub const INTERNAL_MESSAGE: &str = "Internal Server Error";

/// Machine-readable error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or invalid credential on a protected route
    Unauthorized,
    /// No route matched
    NotFound,
    /// Unhandled failure caught by the fault boundary
    Internal,
}

impl ErrorKind {
    /// Snake-case label used in logs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        }
    }
}

/// Structured error answer: `{"error": message}` with the kind's status.
///
/// The kind is attached to the response as an extension so outer layers can
/// tell an intentional rejection from a caught failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorResponse {
    /// HTTP status code
    pub status: StatusCode,
    /// Error kind
    pub kind: ErrorKind,
    /// Human-readable message
    pub message: &'static str,
}

impl ErrorResponse {
    pub(crate) const fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            kind: ErrorKind::Unauthorized,
            message: UNAUTHORIZED_MESSAGE,
        }
    }

    pub(crate) const fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: ErrorKind::NotFound,
            message: NOT_FOUND_MESSAGE,
        }
    }

    pub(crate) const fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: ErrorKind::Internal,
            message: INTERNAL_MESSAGE,
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(json!({ "error": self.message }))).into_response();
        response.extensions_mut().insert(self.kind);
        response
    }
}

/// Convert a handler failure into the uniform 500. The detail only reaches
/// the log.
pub fn internal_error_response(failure: &dyn Display) -> Response {
    error!(kind = ErrorKind::Internal.as_str(), error = %failure, "Unhandled failure in HTTP path");
    ErrorResponse::internal().into_response()
}

/// Panic handler for `CatchPanicLayer`
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    internal_error_response(&panic_message(panic.as_ref()))
}

/// Text of a panic payload, for logs only
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else {
        "non-string panic payload"
    }
}
