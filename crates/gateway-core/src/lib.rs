//! Zenth gateway core primitives
//!
//! Transport-neutral building blocks shared by the HTTP admission layer and
//! the realtime channel:
//!
//! - [`CredentialStore`]: the immutable set of shared-secret API keys
//! - [`ChannelEvent`]: the named-event envelope carried over the channel

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod credentials;
pub mod event;

pub use credentials::CredentialStore;
pub use event::{ChannelEvent, EventParseError};
