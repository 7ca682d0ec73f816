//! Named events exchanged over the realtime channel
//!
//! Wire format (one event per text frame):
//!
//! ```text
//! {"event": "ping"}                 envelope, no payload
//! {"event": "chat", "data": {...}}  envelope with payload
//! ping                              bare name, no payload
//! ```
//!
//! Outbound events are always written as the JSON envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Inbound liveness probe
pub const PING: &str = "ping";
/// Reply to [`PING`]
pub const PONG: &str = "pong";
/// Explicit client disconnect
pub const DISCONNECT: &str = "disconnect";

/// Malformed inbound event
#[derive(Error, Debug)]
pub enum EventParseError {
    /// Frame carried no event name
    #[error("empty event name")]
    EmptyName,

    /// Event name contains whitespace or control characters
    #[error("invalid event name: {0:?}")]
    InvalidName(String),

    /// Frame looked like an envelope but was not valid JSON
    #[error("invalid event envelope: {0}")]
    Envelope(#[from] serde_json::Error),
}

/// A named event with an optional JSON payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEvent {
    /// Event name
    #[serde(rename = "event")]
    pub name: String,
    /// Optional payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ChannelEvent {
    /// Create an event without payload
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: None,
        }
    }

    /// Create an event carrying `data`
    pub fn with_data(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data: Some(data),
        }
    }

    /// Parse an inbound text frame.
    ///
    /// Frames starting with `{` must be a JSON envelope; anything else is
    /// read as a bare event name.
    pub fn parse(frame: &str) -> Result<Self, EventParseError> {
        let frame = frame.trim();
        let event = if frame.starts_with('{') {
            serde_json::from_str::<Self>(frame)?
        } else {
            Self::named(frame)
        };

        validate_name(&event.name)?;
        Ok(event)
    }

    /// Serialize as an outbound text frame
    #[must_use]
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Whether this event has the given name
    #[must_use]
    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }
}

fn validate_name(name: &str) -> Result<(), EventParseError> {
    if name.is_empty() {
        return Err(EventParseError::EmptyName);
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(EventParseError::InvalidName(name.to_string()));
    }
    Ok(())
}
