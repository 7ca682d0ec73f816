//! Error types for the Zenth gateway

use std::io;

use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::gateway::fault;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A handler returning `Err` is an unhandled failure: the fault boundary
/// logs the detail and answers with the generic 500 body.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        fault::internal_error_response(&self)
    }
}
