//! Realtime channel manager
//!
//! Each upgraded WebSocket becomes a [`Connection`]: an identity assigned on
//! accept plus a command queue. A per-connection task owns the socket and
//! the connection state; the rest of the gateway only reaches it through the
//! [`ChannelManager`], which keeps the queue senders of live connections in a
//! concurrent map.
//!
//! Lifecycle: `Connecting -> Open -> Closed`. The identity exists before the
//! first frame is read, and a closed connection is removed from the map, so
//! events addressed to it afterwards are dropped.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{CloseFrame, Message, close_code},
    },
    http::{HeaderMap, StatusCode, header::ORIGIN},
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use zenth_core::ChannelEvent;
use zenth_core::event::DISCONNECT;

use super::events::EventRegistry;
use super::fault::panic_message;
use super::router::AppState;
use crate::config::ChannelConfig;

/// Unique connection identity, never reused
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate a fresh identity
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn-{}", Uuid::new_v4()))
    }

    /// Identity as a string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upgrade accepted, identity not yet published
    Connecting,
    /// Registered and exchanging events
    Open,
    /// Removed from the live set (terminal)
    Closed,
}

/// Why a connection closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Close frame or `disconnect` event from the client
    ClientDisconnect,
    /// Read/write failure or the stream ended without a close frame
    Transport(String),
    /// The client sent something that is not an event
    Malformed(String),
    /// An event handler panicked
    HandlerFailure(String),
    /// Closed by the gateway
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientDisconnect => f.write_str("client disconnect"),
            Self::Transport(detail) => write!(f, "transport failure: {detail}"),
            Self::Malformed(detail) => write!(f, "malformed event: {detail}"),
            Self::HandlerFailure(detail) => write!(f, "handler failure: {detail}"),
            Self::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Messages from the manager to a connection task
#[derive(Debug)]
enum Command {
    Emit(ChannelEvent),
    Close,
}

/// One live channel, owned by its connection task
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    state: ConnectionState,
    events: Arc<EventRegistry>,
    commands: mpsc::Receiver<Command>,
}

impl Connection {
    /// Connection identity
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }
}

/// Tracks live connections and routes events to them
pub struct ChannelManager {
    connections: DashMap<ConnectionId, mpsc::Sender<Command>>,
    events: Arc<EventRegistry>,
    buffer_size: usize,
}

impl ChannelManager {
    /// Create a manager dispatching inbound events through `events`
    pub fn new(events: EventRegistry, buffer_size: usize) -> Self {
        Self {
            connections: DashMap::new(),
            events: Arc::new(events),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Create a manager with the built-in events
    pub fn from_config(config: &ChannelConfig) -> Self {
        Self::new(EventRegistry::with_defaults(), config.buffer_size)
    }

    /// Accept a connection: assign its identity and publish it as open.
    ///
    /// The returned connection must be driven with [`ChannelManager::run`].
    pub fn open(&self) -> Connection {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        let mut connection = Connection {
            id: ConnectionId::generate(),
            state: ConnectionState::Connecting,
            events: Arc::clone(&self.events),
            commands: rx,
        };

        self.connections.insert(connection.id.clone(), tx);
        connection.state = ConnectionState::Open;
        info!(connection_id = %connection.id, "Client connected");

        connection
    }

    /// Drive a connection until it closes, then remove it from the live set.
    ///
    /// Inbound frames are handled one at a time in arrival order; replies and
    /// emitted events go to this connection's sink only.
    pub async fn run<Tx, Rx, E>(&self, mut connection: Connection, mut sink: Tx, mut stream: Rx) -> CloseReason
    where
        Tx: Sink<Message> + Unpin,
        Tx::Error: fmt::Display,
        Rx: Stream<Item = Result<Message, E>> + Unpin,
        E: fmt::Display,
    {
        let id = connection.id.clone();
        let events = Arc::clone(&connection.events);

        let reason = loop {
            let step = tokio::select! {
                frame = stream.next() => on_frame(&id, &events, frame, &mut sink).await,
                command = connection.commands.recv() => on_command(command, &mut sink).await,
            };
            if let Some(reason) = step {
                break reason;
            }
        };

        let _ = sink.close().await;
        self.teardown(&mut connection, &reason);
        reason
    }

    /// Queue an event for a connection.
    ///
    /// Returns `false` when the event was dropped: the connection is closed
    /// or unknown, or its queue is full.
    pub fn emit(&self, id: &ConnectionId, event: ChannelEvent) -> bool {
        let Some(sender) = self.connections.get(id) else {
            debug!(connection_id = %id, event = %event.name, "Dropping event for closed connection");
            return false;
        };

        match sender.try_send(Command::Emit(event)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(connection_id = %id, "Outbound queue full, dropping event");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(connection_id = %id, "Connection closing, dropping event");
                false
            }
        }
    }

    /// Ask every live connection to close. Never waits on a connection.
    ///
    /// A connection whose queue is full loses its map entry instead; its
    /// task sends the close frame once the queued events are written.
    pub fn close_all(&self) {
        for id in self.connection_ids() {
            let Some(sender) = self.connections.get(&id).map(|entry| entry.value().clone()) else {
                continue;
            };

            if let Err(TrySendError::Full(_)) = sender.try_send(Command::Close) {
                warn!(connection_id = %id, "Outbound queue full, closing after drain");
                drop(sender);
                self.connections.remove(&id);
            }
        }
    }

    /// Number of open connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Whether `id` is open
    pub fn is_open(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Identities of open connections
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| entry.key().clone()).collect()
    }

    fn teardown(&self, connection: &mut Connection, reason: &CloseReason) {
        if connection.state == ConnectionState::Closed {
            return;
        }

        connection.state = ConnectionState::Closed;
        connection.commands.close();
        self.connections.remove(&connection.id);

        match reason {
            CloseReason::ClientDisconnect | CloseReason::Shutdown => {
                info!(connection_id = %connection.id, reason = %reason, "Client disconnected");
            }
            CloseReason::Transport(_)
            | CloseReason::Malformed(_)
            | CloseReason::HandlerFailure(_) => {
                warn!(connection_id = %connection.id, reason = %reason, "Client disconnected");
            }
        }
    }
}

impl fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelManager")
            .field("connections", &self.connections.len())
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

async fn on_frame<Tx, E>(
    id: &ConnectionId,
    events: &EventRegistry,
    frame: Option<Result<Message, E>>,
    sink: &mut Tx,
) -> Option<CloseReason>
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: fmt::Display,
    E: fmt::Display,
{
    let message = match frame {
        Some(Ok(message)) => message,
        Some(Err(e)) => return Some(CloseReason::Transport(e.to_string())),
        None => return Some(CloseReason::Transport("stream ended".to_string())),
    };

    match message {
        Message::Text(text) => {
            let event = match ChannelEvent::parse(text.as_str()) {
                Ok(event) => event,
                Err(e) => {
                    return Some(
                        refuse(
                            sink,
                            close_code::INVALID,
                            "malformed event",
                            CloseReason::Malformed(e.to_string()),
                        )
                        .await,
                    );
                }
            };

            if event.is(DISCONNECT) {
                return Some(CloseReason::ClientDisconnect);
            }

            let replies = match AssertUnwindSafe(events.dispatch(id, &event))
                .catch_unwind()
                .await
            {
                Ok(Some(replies)) => replies,
                Ok(None) => {
                    debug!(connection_id = %id, event = %event.name, "No handler for event, ignoring");
                    return None;
                }
                Err(panic) => {
                    let detail = panic_message(panic.as_ref()).to_string();
                    error!(connection_id = %id, event = %event.name, error = %detail, "Event handler panicked");
                    return Some(
                        refuse(
                            sink,
                            close_code::ERROR,
                            "internal error",
                            CloseReason::HandlerFailure(detail),
                        )
                        .await,
                    );
                }
            };

            for reply in &replies {
                if let Err(reason) = deliver(sink, reply).await {
                    return Some(reason);
                }
            }
            None
        }
        Message::Binary(_) => Some(
            refuse(
                sink,
                close_code::UNSUPPORTED,
                "malformed event",
                CloseReason::Malformed("binary frame".to_string()),
            )
            .await,
        ),
        Message::Close(_) => Some(CloseReason::ClientDisconnect),
        // Protocol pings are answered by the transport
        Message::Ping(_) | Message::Pong(_) => None,
    }
}

async fn on_command<Tx>(command: Option<Command>, sink: &mut Tx) -> Option<CloseReason>
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: fmt::Display,
{
    match command {
        Some(Command::Emit(event)) => deliver(sink, &event).await.err(),
        Some(Command::Close) | None => {
            let frame = CloseFrame {
                code: close_code::AWAY,
                reason: "server shutting down".into(),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
            Some(CloseReason::Shutdown)
        }
    }
}

async fn deliver<Tx>(sink: &mut Tx, event: &ChannelEvent) -> Result<(), CloseReason>
where
    Tx: Sink<Message> + Unpin,
    Tx::Error: fmt::Display,
{
    sink.send(Message::Text(event.to_frame().into()))
        .await
        .map_err(|e| CloseReason::Transport(e.to_string()))
}

async fn refuse<Tx>(sink: &mut Tx, code: u16, text: &'static str, reason: CloseReason) -> CloseReason
where
    Tx: Sink<Message> + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: text.into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
    reason
}

/// GET upgrade endpoint for the realtime channel
pub async fn channel_upgrade(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(origin) = headers.get(ORIGIN) {
        if !state.channel_origins.allows_origin(origin) {
            warn!(origin = ?origin, "Refused channel upgrade from disallowed origin");
            return StatusCode::FORBIDDEN.into_response();
        }
    }

    let channels = Arc::clone(&state.channels);
    ws.on_failed_upgrade(|e| warn!(error = %e, "Channel upgrade failed"))
        .on_upgrade(move |socket| async move {
            let (sink, stream) = socket.split();
            let connection = channels.open();
            channels.run(connection, sink, stream).await;
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::io;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    use super::*;
    use crate::gateway::events::EventHandler;

    struct MockClient {
        id: ConnectionId,
        inbound: UnboundedSender<Result<Message, io::Error>>,
        outbound: UnboundedReceiver<Message>,
        task: JoinHandle<CloseReason>,
    }

    impl MockClient {
        fn send_text(&self, text: &str) {
            self.inbound
                .unbounded_send(Ok(Message::Text(text.to_string().into())))
                .unwrap();
        }

        async fn recv(&mut self) -> Option<Message> {
            timeout(Duration::from_secs(1), self.outbound.next())
                .await
                .ok()
                .flatten()
        }

        async fn assert_silent(&mut self) {
            assert!(
                timeout(Duration::from_millis(100), self.outbound.next())
                    .await
                    .is_err(),
                "unexpected outbound frame"
            );
        }

        async fn closed(self) -> CloseReason {
            timeout(Duration::from_secs(1), self.task).await.unwrap().unwrap()
        }
    }

    fn connect(manager: &Arc<ChannelManager>) -> MockClient {
        let (inbound, stream) = unbounded();
        let (sink, outbound) = unbounded();
        let connection = manager.open();
        let id = connection.id().clone();
        let manager = Arc::clone(manager);
        let task = tokio::spawn(async move { manager.run(connection, sink, stream).await });

        MockClient {
            id,
            inbound,
            outbound,
            task,
        }
    }

    fn text(message: Message) -> String {
        match message {
            Message::Text(text) => text.as_str().to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    fn manager() -> Arc<ChannelManager> {
        Arc::new(ChannelManager::new(EventRegistry::with_defaults(), 16))
    }

    #[test]
    fn test_open_assigns_identity_before_events() {
        let manager = manager();
        let connection = manager.open();

        assert_eq!(connection.state(), ConnectionState::Open);
        assert!(connection.id().as_str().starts_with("conn-"));
        assert!(manager.is_open(connection.id()));
        assert_eq!(manager.connection_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_opens_get_distinct_identities() {
        let manager = manager();

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.open() })
            })
            .collect();

        let mut connections = Vec::new();
        for task in tasks {
            connections.push(task.await.unwrap());
        }

        let ids: HashSet<_> = connections.iter().map(|c| c.id().clone()).collect();
        assert_eq!(ids.len(), 64);
        assert_eq!(manager.connection_count(), 64);
        assert_eq!(manager.connection_ids().len(), 64);
    }

    #[tokio::test]
    async fn test_ping_answers_only_sender() {
        let manager = manager();
        let mut a = connect(&manager);
        let mut b = connect(&manager);

        a.send_text("ping");

        let reply = a.recv().await.expect("pong for A");
        assert_eq!(text(reply), r#"{"event":"pong"}"#);
        a.assert_silent().await;
        b.assert_silent().await;
    }

    #[tokio::test]
    async fn test_ping_envelope() {
        let manager = manager();
        let mut client = connect(&manager);

        client.send_text(r#"{"event":"ping"}"#);
        assert_eq!(text(client.recv().await.unwrap()), r#"{"event":"pong"}"#);
    }

    #[tokio::test]
    async fn test_unknown_event_is_ignored() {
        let manager = manager();
        let mut client = connect(&manager);

        client.send_text("whatever");
        client.assert_silent().await;
        assert!(manager.is_open(&client.id));
    }

    #[tokio::test]
    async fn test_events_processed_in_order() {
        struct Echo;

        #[async_trait]
        impl EventHandler for Echo {
            async fn handle(&self, _c: &ConnectionId, event: &ChannelEvent) -> Vec<ChannelEvent> {
                vec![event.clone()]
            }
        }

        let mut registry = EventRegistry::with_defaults();
        registry.register("echo", Echo);
        let manager = Arc::new(ChannelManager::new(registry, 16));
        let mut client = connect(&manager);

        for n in 0..10 {
            client.send_text(&format!(r#"{{"event":"echo","data":{n}}}"#));
        }
        for n in 0..10 {
            assert_eq!(
                text(client.recv().await.unwrap()),
                format!(r#"{{"event":"echo","data":{n}}}"#)
            );
        }
    }

    #[tokio::test]
    async fn test_close_frame_tears_down() {
        let manager = manager();
        let client = connect(&manager);
        let id = client.id.clone();

        client.inbound.unbounded_send(Ok(Message::Close(None))).unwrap();

        assert_eq!(client.closed().await, CloseReason::ClientDisconnect);
        assert!(!manager.is_open(&id));
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_event_tears_down() {
        let manager = manager();
        let client = connect(&manager);

        client.send_text("disconnect");

        assert_eq!(client.closed().await, CloseReason::ClientDisconnect);
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_tears_down() {
        let manager = manager();
        let client = connect(&manager);

        client
            .inbound
            .unbounded_send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
            .unwrap();

        assert!(matches!(client.closed().await, CloseReason::Transport(_)));
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_end_tears_down() {
        let manager = manager();
        let MockClient {
            inbound, task, id, ..
        } = connect(&manager);

        drop(inbound);

        let reason = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(matches!(reason, CloseReason::Transport(_)));
        assert!(!manager.is_open(&id));
    }

    #[tokio::test]
    async fn test_malformed_event_closes_connection() {
        let manager = manager();
        let mut client = connect(&manager);

        client.send_text(r#"{"event": "#);

        match client.recv().await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, close_code::INVALID),
            other => panic!("expected close frame, got {other:?}"),
        }
        assert!(matches!(client.closed().await, CloseReason::Malformed(_)));
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_binary_frame_closes_connection() {
        let manager = manager();
        let mut client = connect(&manager);

        client
            .inbound
            .unbounded_send(Ok(Message::Binary(vec![1, 2, 3].into())))
            .unwrap();

        match client.recv().await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, close_code::UNSUPPORTED),
            other => panic!("expected close frame, got {other:?}"),
        }
        assert!(matches!(client.closed().await, CloseReason::Malformed(_)));
    }

    #[tokio::test]
    async fn test_emit_reaches_only_target() {
        let manager = manager();
        let mut a = connect(&manager);
        let mut b = connect(&manager);

        assert!(manager.emit(&a.id, ChannelEvent::named("notice")));

        assert_eq!(text(a.recv().await.unwrap()), r#"{"event":"notice"}"#);
        b.assert_silent().await;
    }

    #[tokio::test]
    async fn test_events_after_close_are_dropped() {
        let manager = manager();
        let client = connect(&manager);
        let id = client.id.clone();

        client.inbound.unbounded_send(Ok(Message::Close(None))).unwrap();
        client.closed().await;

        assert!(!manager.emit(&id, ChannelEvent::named("pong")));
        assert!(!manager.emit(&id, ChannelEvent::named("late")));
        assert!(!manager.is_open(&id));
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_close_all() {
        let manager = manager();
        let mut a = connect(&manager);
        let b = connect(&manager);

        manager.close_all();

        assert!(matches!(a.recv().await, Some(Message::Close(Some(_)))));
        assert_eq!(b.closed().await, CloseReason::Shutdown);
        assert_eq!(a.closed().await, CloseReason::Shutdown);
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_close_all_does_not_wait_on_full_queue() {
        let manager = Arc::new(ChannelManager::new(EventRegistry::with_defaults(), 1));
        let connection = manager.open();
        let id = connection.id().clone();

        // Nothing drains the queue yet, so this fills it
        assert!(manager.emit(&id, ChannelEvent::named("notice")));
        assert!(!manager.emit(&id, ChannelEvent::named("overflow")));

        timeout(Duration::from_millis(100), async { manager.close_all() })
            .await
            .expect("close_all blocked");
        assert!(!manager.is_open(&id));

        // The queued event is still written before the connection closes
        let (_inbound, stream) = unbounded::<Result<Message, io::Error>>();
        let (sink, mut outbound) = unbounded();
        let reason = timeout(Duration::from_secs(1), manager.run(connection, sink, stream))
            .await
            .unwrap();

        assert_eq!(reason, CloseReason::Shutdown);
        assert_eq!(text(outbound.next().await.unwrap()), r#"{"event":"notice"}"#);
        match outbound.next().await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, close_code::AWAY),
            other => panic!("expected close frame, got {other:?}"),
        }
        assert_eq!(manager.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_closes_connection() {
        struct Boom;

        #[async_trait]
        impl EventHandler for Boom {
            async fn handle(&self, _c: &ConnectionId, _e: &ChannelEvent) -> Vec<ChannelEvent> {
                panic!("handler exploded");
            }
        }

        let mut registry = EventRegistry::with_defaults();
        registry.register("boom", Boom);
        let manager = Arc::new(ChannelManager::new(registry, 16));
        let mut client = connect(&manager);
        let mut bystander = connect(&manager);
        let id = client.id.clone();

        client.send_text("boom");

        match client.recv().await {
            Some(Message::Close(Some(frame))) => assert_eq!(frame.code, close_code::ERROR),
            other => panic!("expected close frame, got {other:?}"),
        }
        assert!(matches!(client.closed().await, CloseReason::HandlerFailure(d) if d == "handler exploded"));
        assert!(!manager.is_open(&id));
        assert_eq!(manager.connection_count(), 1);

        // Other connections keep working
        bystander.send_text("ping");
        assert_eq!(text(bystander.recv().await.unwrap()), r#"{"event":"pong"}"#);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let manager = manager();
        let mut connection = manager.open();

        manager.teardown(&mut connection, &CloseReason::Shutdown);
        manager.teardown(&mut connection, &CloseReason::Shutdown);

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn test_identities_are_unique() {
        let ids: HashSet<_> = (0..1000).map(|_| ConnectionId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
