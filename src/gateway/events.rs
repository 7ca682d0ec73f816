//! Named-event handlers for realtime connections

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use zenth_core::ChannelEvent;
use zenth_core::event::{PING, PONG};

use super::channel::ConnectionId;

/// Handles one named inbound event on one connection.
///
/// Returned events are delivered back to the originating connection only.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle `event` received on `connection`
    async fn handle(&self, connection: &ConnectionId, event: &ChannelEvent) -> Vec<ChannelEvent>;
}

/// Liveness probe: every `ping` is answered with exactly one `pong`
#[derive(Debug, Default, Clone, Copy)]
pub struct PingHandler;

#[async_trait]
impl EventHandler for PingHandler {
    async fn handle(&self, _connection: &ConnectionId, _event: &ChannelEvent) -> Vec<ChannelEvent> {
        vec![ChannelEvent::named(PONG)]
    }
}

/// Event name → handler table, fixed at startup and shared by all connections
#[derive(Default, Clone)]
pub struct EventRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl EventRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in events (`ping`)
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(PING, PingHandler);
        registry
    }

    /// Register (or replace) the handler for `name`
    pub fn register(&mut self, name: impl Into<String>, handler: impl EventHandler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    /// Whether a handler exists for `name`
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered event names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run the handler registered for the event's name.
    ///
    /// Returns `None` when no handler is registered.
    pub async fn dispatch(
        &self,
        connection: &ConnectionId,
        event: &ChannelEvent,
    ) -> Option<Vec<ChannelEvent>> {
        let handler = self.handlers.get(&event.name)?;
        Some(handler.handle(connection, event).await)
    }
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("events", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl EventHandler for Echo {
        async fn handle(&self, _connection: &ConnectionId, event: &ChannelEvent) -> Vec<ChannelEvent> {
            vec![event.clone()]
        }
    }

    #[tokio::test]
    async fn test_ping_yields_single_pong() {
        let registry = EventRegistry::with_defaults();
        let id = ConnectionId::generate();

        let replies = registry.dispatch(&id, &ChannelEvent::named(PING)).await.unwrap();
        assert_eq!(replies, vec![ChannelEvent::named(PONG)]);
    }

    #[tokio::test]
    async fn test_unknown_event_is_unhandled() {
        let registry = EventRegistry::with_defaults();
        let id = ConnectionId::generate();

        assert!(registry.dispatch(&id, &ChannelEvent::named("nope")).await.is_none());
    }

    #[tokio::test]
    async fn test_custom_handler() {
        let mut registry = EventRegistry::with_defaults();
        registry.register("echo", Echo);
        let id = ConnectionId::generate();

        let event = ChannelEvent::with_data("echo", json!({"n": 1}));
        let replies = registry.dispatch(&id, &event).await.unwrap();
        assert_eq!(replies, vec![event]);
        assert_eq!(registry.names(), vec!["echo", "ping"]);
        assert!(registry.contains("echo"));
    }
}
