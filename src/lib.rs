//! Zenth Gateway Library
//!
//! Minimal authenticated API gateway in front of a few HTTP resources and a
//! realtime WebSocket channel.
//!
//! # Features
//!
//! - **API-key admission**: every route under a protected prefix requires a
//!   configured key in the credential header (`x-api-key` by default)
//! - **Public routes**: reachable without any credential
//! - **Realtime channel**: WebSocket connections with per-connection
//!   identity and named events (`ping` → `pong`)
//! - **Fault boundary**: unhandled handler failures become a generic 500
//! - **Configurable CORS** for the HTTP and channel surfaces

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;

pub use error::{Error, Result};
pub use zenth_core::{ChannelEvent, CredentialStore};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
