//! Stream multiplexer
//!
//! [`StreamClient`] is the synchronous core of the realtime client. It tracks
//! two independent gates, registry readiness (set once) and socket openness
//! (cycles on every reconnect), queues stream requests until both are
//! satisfied, and restores every active subscription whenever the socket
//! reopens.

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::registry::TopicRegistry;
use crate::streams::ledger::SubscriptionLedger;
use crate::streams::router::{CallbackResult, StreamCallback, TopicRouter};
use crate::types::{FrameKey, SubscribeCommand, Topic, WILDCARD};
use crate::websocket::{ConnectionHandle, Frame};

/// Outbound side of the physical connection
pub trait Transport {
    /// Whether the connection is currently open
    fn is_open(&self) -> bool;

    /// Socket generation; changes whenever a new socket opens
    fn epoch(&self) -> u64;

    /// Send one serialized command
    fn send(&self, command: String) -> Result<()>;
}

impl Transport for ConnectionHandle {
    fn is_open(&self) -> bool {
        ConnectionHandle::is_open(self)
    }

    fn epoch(&self) -> u64 {
        ConnectionHandle::epoch(self)
    }

    fn send(&self, command: String) -> Result<()> {
        ConnectionHandle::send(self, command)
    }
}

/// Client-level events
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Topic registry is available
    Initialize,
    /// Connection (re)opened and subscriptions were reissued
    Open,
    /// Connection closed
    Close,
    /// Callback, server, or transport failure
    Error(Arc<Error>),
}

/// What `add_stream` did with a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    /// Bound immediately to these topics
    Subscribed(Vec<Topic>),
    /// Waiting for the registry and/or an open connection
    Queued,
}

/// Stream request deferred until the client is ready
struct PendingStream {
    symbol: String,
    table: Option<String>,
    callback: StreamCallback,
}

/// Registry gate, flipped once by `initialize`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Uninitialized,
    Ready,
}

/// Subscription state machine over one transport
pub struct StreamClient<T: Transport> {
    transport: T,
    authenticated: bool,
    readiness: Readiness,
    connected: bool,
    /// Transport epoch seen by the last processed open
    open_epoch: Option<u64>,
    registry: Option<TopicRegistry>,
    router: TopicRouter,
    pending: VecDeque<PendingStream>,
    events: broadcast::Sender<ClientEvent>,
}

impl<T: Transport> std::fmt::Debug for StreamClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamClient")
            .field("authenticated", &self.authenticated)
            .field("readiness", &self.readiness)
            .field("connected", &self.connected)
            .field("pending", &self.pending.len())
            .field("router", &self.router)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> StreamClient<T> {
    /// Create a client; `authenticated` selects the wildcard table set
    pub fn new(transport: T, authenticated: bool, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            transport,
            authenticated,
            readiness: Readiness::Uninitialized,
            connected: false,
            open_epoch: None,
            registry: None,
            router: TopicRouter::new(),
            pending: VecDeque::new(),
            events,
        }
    }

    /// Receive client events from now on
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn is_initialized(&self) -> bool {
        self.readiness == Readiness::Ready
    }

    /// Whether the last lifecycle event seen was an open
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn registry(&self) -> Option<&TopicRegistry> {
        self.registry.as_ref()
    }

    pub fn ledger(&self) -> &SubscriptionLedger {
        self.router.ledger()
    }

    /// Listener count for `(table, symbol)`
    pub fn count(&self, table: &str, symbol: &str) -> usize {
        self.router.ledger().count(table, symbol)
    }

    /// Number of stream requests waiting for readiness
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn emit(&self, event: ClientEvent) {
        // No receivers is fine; events are advisory
        let _ = self.events.send(event);
    }

    fn emit_error(&self, error: Error) {
        warn!(error = %error, "Realtime client error");
        self.emit(ClientEvent::Error(Arc::new(error)));
    }

    fn ready(&self) -> bool {
        self.readiness == Readiness::Ready && self.connected
    }

    // ========== Lifecycle ==========

    /// Install the topic registry; only the first call has an effect
    pub fn initialize(&mut self, registry: TopicRegistry) {
        if self.readiness == Readiness::Ready {
            warn!("Topic registry already initialized; ignoring");
            return;
        }
        info!(tables = registry.all().len(), "Topic registry initialized");
        self.registry = Some(registry);
        self.readiness = Readiness::Ready;
        self.emit(ClientEvent::Initialize);
        self.drain_pending();
    }

    /// Connection (re)opened: resubscribe everything, then run queued requests
    ///
    /// Each transport epoch is resubscribed at most once. An open event that
    /// arrives after its socket was already replaced restores the live socket,
    /// and the replacement's own open event then finds nothing left to do.
    pub fn handle_open(&mut self) {
        self.connected = true;
        let epoch = self.transport.epoch();
        if self.open_epoch == Some(epoch) {
            debug!(epoch, "Socket already resubscribed");
        } else {
            self.open_epoch = Some(epoch);
            self.resubscribe_all();
        }
        self.emit(ClientEvent::Open);
        self.drain_pending();
    }

    /// Connection closed; requests queue until the next open
    pub fn handle_close(&mut self) {
        self.connected = false;
        self.emit(ClientEvent::Close);
    }

    /// Report a transport or server failure as an `error` event
    pub fn handle_error(&self, error: Error) {
        self.emit_error(error);
    }

    // ========== Inbound ==========

    /// Fan one frame out to the matching callbacks
    ///
    /// Returns how many callbacks completed; failures become `error` events.
    pub fn handle_frame(&self, frame: &Frame) -> usize {
        let outcome = self.router.dispatch(frame);
        for error in outcome.errors {
            self.emit_error(error);
        }
        outcome.delivered
    }

    /// Dispatch data published under a composite name
    ///
    /// Only `table:action:symbol` names carry data; anything else is ignored.
    pub fn handle_topic_event(&self, name: &str, data: Value) -> usize {
        match name.parse::<FrameKey>() {
            Ok(key) => self.handle_frame(&Frame { key, data }),
            Err(_) => {
                debug!(event = name, "Ignoring non-data event");
                0
            }
        }
    }

    // ========== Streams ==========

    /// Bind `callback` to `symbol` on `table` (or every permitted table)
    ///
    /// The callback receives `(data, symbol, table)` for every action on the
    /// topic. Requests made before the registry is loaded or while the
    /// connection is down are queued and run exactly once when both are ready.
    pub fn add_stream<F>(
        &mut self,
        symbol: &str,
        table: Option<&str>,
        callback: F,
    ) -> Result<StreamStatus>
    where
        F: Fn(&Value, &str, &str) -> CallbackResult + Send + Sync + 'static,
    {
        self.add_stream_callback(symbol, table, Arc::new(callback))
    }

    /// [`StreamClient::add_stream`] for an already shared callback
    pub fn add_stream_callback(
        &mut self,
        symbol: &str,
        table: Option<&str>,
        callback: StreamCallback,
    ) -> Result<StreamStatus> {
        if symbol.is_empty() {
            return Err(Error::InvalidParameter(
                "symbol must not be empty".to_string(),
            ));
        }
        let table = table.filter(|t| *t != WILDCARD);
        if let (Some(registry), Some(table)) = (&self.registry, table) {
            registry.ensure_known(table)?;
        }

        if !self.ready() {
            debug!(
                symbol,
                table = table.unwrap_or(WILDCARD),
                initialized = self.is_initialized(),
                connected = self.connected,
                "Queueing stream until client is ready"
            );
            self.pending.push_back(PendingStream {
                symbol: symbol.to_string(),
                table: table.map(str::to_string),
                callback,
            });
            return Ok(StreamStatus::Queued);
        }

        self.subscribe_stream(symbol, table, callback)
            .map(StreamStatus::Subscribed)
    }

    /// Expand the table selector and bind every resulting topic
    fn subscribe_stream(
        &mut self,
        symbol: &str,
        table: Option<&str>,
        callback: StreamCallback,
    ) -> Result<Vec<Topic>> {
        let registry = self
            .registry
            .as_ref()
            .ok_or_else(|| Error::InvalidParameter("topic registry not loaded".to_string()))?;

        let tables: Vec<String> = match table {
            Some(table) => {
                registry.ensure_known(table)?;
                vec![table.to_string()]
            }
            None => registry.tables_for(self.authenticated).to_vec(),
        };

        let mut topics = Vec::with_capacity(tables.len());
        for table in tables {
            let topic = Topic::scoped(table, symbol);
            let bound = self.router.bind(&topic, callback.clone());
            if bound.is_first() && self.socket_current() {
                self.send_subscribe(&topic);
            }
            topics.push(topic);
        }
        Ok(topics)
    }

    /// Open socket whose open event has been processed
    ///
    /// A socket that opened after the last processed open is resubscribed in
    /// full once its own open event arrives; sending now would duplicate it.
    fn socket_current(&self) -> bool {
        self.transport.is_open() && self.open_epoch == Some(self.transport.epoch())
    }

    fn send_subscribe(&self, topic: &Topic) {
        let sent = SubscribeCommand::new(topic)
            .to_json()
            .and_then(|command| self.transport.send(command));
        match sent {
            Ok(()) => debug!(topic = %topic, "Sent subscribe"),
            Err(e) => self.emit_error(e),
        }
    }

    /// Reissue a subscribe for every topic with live bindings
    fn resubscribe_all(&self) {
        if !self.transport.is_open() {
            debug!("Socket already dropped; waiting for the next open");
            return;
        }
        let topics = self.router.ledger().active_topics();
        if !topics.is_empty() {
            info!(topics = topics.len(), "Resubscribing active topics");
        }
        for topic in &topics {
            self.send_subscribe(topic);
        }
    }

    /// Run queued requests once both gates are open
    fn drain_pending(&mut self) {
        if !self.ready() {
            return;
        }
        while let Some(request) = self.pending.pop_front() {
            let PendingStream {
                symbol,
                table,
                callback,
            } = request;
            if let Err(e) = self.subscribe_stream(&symbol, table.as_deref(), callback) {
                self.emit_error(e);
            }
        }
    }
}
