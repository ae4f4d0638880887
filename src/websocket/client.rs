//! WebSocket connection with automatic reconnection
//!
//! A [`Connection`] owns one physical socket at a time. A supervisor task
//! connects, pumps inbound messages, writes outbound commands and sends
//! heartbeats; when the socket drops it reconnects with exponential backoff.
//! Every successful (re)connect is reported as [`ConnectionEvent::Open`].

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::auth::ApiCredentials;
use crate::error::{Error, Result};
use crate::websocket::message::{self, InboundMessage};

/// Interval between heartbeat pings
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Capacity of the connection event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Connection state of the WebSocket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Connected and ready
    Connected,
    /// Connection lost, attempting to reconnect
    Reconnecting,
    /// Connection has been closed for good
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}

/// Backoff policy for replacing a dropped socket
///
/// Delays grow geometrically from `initial_delay` and saturate at
/// `max_delay`, however long the outage lasts.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Replace dropped sockets at all
    pub enabled: bool,
    /// Wait before the first reconnect
    pub initial_delay: Duration,
    /// Upper bound for any single wait
    pub max_delay: Duration,
    /// Growth factor applied per failed attempt
    pub backoff_multiplier: f64,
    /// Consecutive failed attempts tolerated, `None` for no limit
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    /// Never reconnect; the first drop ends the connection
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Wait before reconnect `attempt` (0-indexed, reset after each open)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs).map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Whether attempt number `attempt` may still be made
    pub fn should_attempt(&self, attempt: u32) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| attempt < max)
    }
}

/// Lifecycle and data events produced by a [`Connection`]
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// Socket (re)opened; fires on every successful connect
    Open,
    /// Socket closed; a reconnect may follow
    Close,
    /// Decoded inbound message
    Message(InboundMessage),
    /// Transport-level fault that did not end the supervisor
    Error(String),
}

/// Outbound side of the connection, handed to the stream multiplexer
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    opened: Arc<AtomicBool>,
    epoch: Arc<AtomicU64>,
    outgoing_tx: mpsc::UnboundedSender<String>,
}

impl ConnectionHandle {
    /// Whether a socket is currently open
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    /// Number of sockets opened so far; bumped before each one is usable
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Queue a text frame for the open socket
    pub fn send(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(Error::WebSocket("Not connected".to_string()));
        }
        self.outgoing_tx
            .send(text)
            .map_err(|_| Error::WebSocket("Connection task has stopped".to_string()))
    }
}

type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a connected session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Socket dropped or errored; eligible for reconnect
    Dropped,
    /// Shutdown requested or nobody listens for events anymore
    Stopped,
}

/// WebSocket connection to the realtime endpoint
pub struct Connection {
    /// Realtime endpoint URL (unsigned)
    url: String,
    /// Credentials used to sign every connect
    credentials: Option<ApiCredentials>,
    /// Reconnection configuration
    reconnect_config: ReconnectConfig,
    /// Current connection state
    state: Arc<RwLock<ConnectionState>>,
    /// State change notifier
    state_tx: watch::Sender<ConnectionState>,
    /// State change receiver
    state_rx: watch::Receiver<ConnectionState>,
    /// Outbound queue shared with handles
    handle: ConnectionHandle,
    /// Outbound queue consumer, taken by the supervisor on start
    outgoing_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    /// Current reconnect attempt count
    reconnect_attempts: Arc<AtomicU64>,
    /// Last ping received timestamp
    last_ping: Arc<RwLock<Option<Instant>>>,
    /// Shutdown signal sender
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.url)
            .field("authenticated", &self.credentials.is_some())
            .field("reconnect_config", &self.reconnect_config)
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a connection for `url`; nothing happens until [`Connection::start`]
    pub fn new(
        url: impl Into<String>,
        credentials: Option<ApiCredentials>,
        reconnect_config: ReconnectConfig,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            url: url.into(),
            credentials,
            reconnect_config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            state_tx,
            state_rx,
            handle: ConnectionHandle {
                opened: Arc::new(AtomicBool::new(false)),
                epoch: Arc::new(AtomicU64::new(0)),
                outgoing_tx,
            },
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            reconnect_attempts: Arc::new(AtomicU64::new(0)),
            last_ping: Arc::new(RwLock::new(None)),
            shutdown_tx,
        }
    }

    /// Realtime endpoint URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Outbound handle for this connection
    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Get the current connection state
    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Check if currently connected
    pub fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    /// Subscribe to state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Get the last ping timestamp
    pub async fn last_ping_time(&self) -> Option<Instant> {
        *self.last_ping.read().await
    }

    /// Get the number of reconnect attempts since the last successful connect
    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Start the supervisor task and return its event stream
    ///
    /// Can be called once; returns an error afterwards or after close.
    pub async fn start(&self) -> Result<mpsc::Receiver<ConnectionEvent>> {
        if *self.shutdown_tx.borrow() {
            return Err(Error::WebSocket("Connection has been closed".to_string()));
        }
        let outgoing_rx = self
            .outgoing_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::WebSocket("Connection already started".to_string()))?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let supervisor = Supervisor {
            url: self.url.clone(),
            credentials: self.credentials.clone(),
            reconnect_config: self.reconnect_config.clone(),
            state: self.state.clone(),
            state_tx: self.state_tx.clone(),
            opened: self.handle.opened.clone(),
            epoch: self.handle.epoch.clone(),
            reconnect_attempts: self.reconnect_attempts.clone(),
            last_ping: self.last_ping.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
            events_tx,
        };
        tokio::spawn(supervisor.run(outgoing_rx));

        Ok(events_rx)
    }

    /// Close the connection permanently
    pub async fn close(&self) {
        // Stored even when no supervisor is listening yet
        self.shutdown_tx.send_replace(true);
        self.handle.opened.store(false, Ordering::Release);
        let mut current = self.state.write().await;
        if *current != ConnectionState::Closed {
            *current = ConnectionState::Closed;
            let _ = self.state_tx.send(ConnectionState::Closed);
        }
    }
}

/// State moved into the supervisor task
struct Supervisor {
    url: String,
    credentials: Option<ApiCredentials>,
    reconnect_config: ReconnectConfig,
    state: Arc<RwLock<ConnectionState>>,
    state_tx: watch::Sender<ConnectionState>,
    opened: Arc<AtomicBool>,
    epoch: Arc<AtomicU64>,
    reconnect_attempts: Arc<AtomicU64>,
    last_ping: Arc<RwLock<Option<Instant>>>,
    shutdown_rx: watch::Receiver<bool>,
    events_tx: mpsc::Sender<ConnectionEvent>,
}

impl Supervisor {
    async fn set_state(&self, state: ConnectionState) {
        let mut current_state = self.state.write().await;
        if *current_state != state && *current_state != ConnectionState::Closed {
            *current_state = state;
            let _ = self.state_tx.send(state);
        }
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// URL for the next connect, freshly signed when authenticated
    fn connect_url(&self) -> Result<String> {
        match &self.credentials {
            Some(credentials) => credentials.sign_url(&self.url),
            None => Ok(self.url.clone()),
        }
    }

    async fn emit(&self, event: ConnectionEvent) -> bool {
        self.events_tx.send(event).await.is_ok()
    }

    async fn run(mut self, mut outgoing_rx: mpsc::UnboundedReceiver<String>) {
        let mut attempt: u32 = 0;

        while !self.shutting_down() {
            self.set_state(if attempt == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            })
            .await;

            let connected = match self.connect_url() {
                Ok(url) => connect_async(url.as_str()).await.map_err(describe_ws_error),
                Err(e) => Err(e),
            };

            match connected {
                Ok((ws, _response)) => {
                    attempt = 0;
                    self.reconnect_attempts.store(0, Ordering::Relaxed);

                    self.epoch.fetch_add(1, Ordering::AcqRel);
                    // Commands queued for the previous socket are stale
                    while outgoing_rx.try_recv().is_ok() {}

                    self.opened.store(true, Ordering::Release);
                    self.set_state(ConnectionState::Connected).await;
                    info!(url = %self.url, "Realtime connection open");
                    if !self.emit(ConnectionEvent::Open).await {
                        break;
                    }

                    let end = self.session(ws, &mut outgoing_rx).await;

                    self.opened.store(false, Ordering::Release);
                    info!(url = %self.url, "Realtime connection closed");
                    if !self.emit(ConnectionEvent::Close).await || end == SessionEnd::Stopped {
                        break;
                    }
                }
                Err(e) => {
                    warn!(url = %self.url, attempt, error = %e, "Realtime connect failed");
                    if !self.emit(ConnectionEvent::Error(e.to_string())).await {
                        break;
                    }
                }
            }

            if !self.reconnect_config.should_attempt(attempt) {
                self.set_state(ConnectionState::Disconnected).await;
                break;
            }

            let delay = self.reconnect_config.delay_for_attempt(attempt);
            attempt += 1;
            self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            self.set_state(ConnectionState::Reconnecting).await;
            debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");

            tokio::select! {
                _ = self.shutdown_rx.changed() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.opened.store(false, Ordering::Release);
        if self.shutting_down() {
            self.set_state(ConnectionState::Closed).await;
        }
    }

    /// Pump one connected socket until it drops or shutdown is requested
    async fn session(
        &mut self,
        ws: WsConnection,
        outgoing_rx: &mut mpsc::UnboundedReceiver<String>,
    ) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();
        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        let _ = sink.send(Message::Close(None)).await;
                        let _ = sink.close().await;
                        return SessionEnd::Stopped;
                    }
                }
                outgoing = outgoing_rx.recv() => {
                    let Some(text) = outgoing else {
                        return SessionEnd::Stopped;
                    };
                    debug!(command = %text, "Sending command");
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!(error = %e, "Failed to send command");
                        return SessionEnd::Dropped;
                    }
                }
                _ = heartbeat.tick() => {
                    if sink.send(Message::Ping(b"ping".to_vec())).await.is_err() {
                        return SessionEnd::Dropped;
                    }
                }
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match message::decode(&text) {
                                Ok(InboundMessage::Pong) => {}
                                Ok(decoded) => {
                                    if !self.emit(ConnectionEvent::Message(decoded)).await {
                                        return SessionEnd::Stopped;
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, "Discarding undecodable message");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            *self.last_ping.write().await = Some(Instant::now());
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "Realtime socket error");
                            let _ = self.emit(ConnectionEvent::Error(describe_ws_error(e).to_string())).await;
                            return SessionEnd::Dropped;
                        }
                    }
                }
            }
        }
    }
}

fn describe_ws_error(e: WsError) -> Error {
    match e {
        WsError::Io(io_err) => Error::WebSocket(format!("IO error: {io_err}")),
        WsError::Tls(tls_err) => Error::WebSocket(format!("TLS error: {tls_err}")),
        WsError::ConnectionClosed => Error::WebSocket("Connection closed".to_string()),
        WsError::AlreadyClosed => Error::WebSocket("Already closed".to_string()),
        WsError::Protocol(p) => Error::WebSocket(format!("Protocol error: {p}")),
        WsError::Url(u) => Error::WebSocket(format!("URL error: {u}")),
        WsError::Http(resp) => Error::WebSocket(format!("HTTP error: status {}", resp.status())),
        WsError::HttpFormat(e) => Error::WebSocket(format!("HTTP format error: {e}")),
        _ => Error::WebSocket(format!("WebSocket error: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============ ConnectionState Tests ============

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "Disconnected");
        assert_eq!(ConnectionState::Connecting.to_string(), "Connecting");
        assert_eq!(ConnectionState::Connected.to_string(), "Connected");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "Reconnecting");
        assert_eq!(ConnectionState::Closed.to_string(), "Closed");
    }

    // ============ ReconnectConfig Tests ============

    #[test]
    fn test_default_backoff_reaches_cap_after_six_drops() {
        let config = ReconnectConfig::default();
        let delays: Vec<Duration> = (0..8).map(|n| config.delay_for_attempt(n)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
                Duration::from_secs(30),
                Duration::from_secs(30),
            ]
        );
    }

    #[test]
    fn test_long_outage_saturates_at_max_delay() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 10.0,
            ..Default::default()
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(5));
        // The multiplier overflows f64 long before attempt u32::MAX
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_constant_backoff() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_millis(250),
            backoff_multiplier: 1.0,
            ..Default::default()
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(250));
        assert_eq!(config.delay_for_attempt(40), Duration::from_millis(250));
    }

    #[test]
    fn test_attempt_limit_counts_consecutive_failures() {
        let unlimited = ReconnectConfig::default();
        assert!(unlimited.should_attempt(0));
        assert!(unlimited.should_attempt(1000));

        let limited = ReconnectConfig {
            max_attempts: Some(2),
            ..Default::default()
        };
        assert!(limited.should_attempt(1));
        assert!(!limited.should_attempt(2));

        assert!(!ReconnectConfig::disabled().should_attempt(0));
    }

    // ============ Connection Tests ============

    #[tokio::test]
    async fn test_connection_initial_state() {
        let conn = Connection::new("ws://127.0.0.1:9/realtime", None, ReconnectConfig::disabled());
        assert_eq!(conn.state().await, ConnectionState::Disconnected);
        assert!(!conn.is_open());
        assert_eq!(conn.reconnect_attempts(), 0);
        assert!(conn.last_ping_time().await.is_none());
        assert_eq!(*conn.state_receiver().borrow(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_handle_send_not_connected() {
        let conn = Connection::new("ws://127.0.0.1:9/realtime", None, ReconnectConfig::disabled());
        let err = conn.handle().send("hello".to_string()).unwrap_err();
        assert!(matches!(err, Error::WebSocket(_)));
        assert!(err.to_string().contains("Not connected"));
    }

    #[test]
    fn test_connection_debug_hides_credentials() {
        let creds = ApiCredentials::new("key", "very-secret").unwrap();
        let conn = Connection::new("wss://ws.bitmex.com/realtime", Some(creds), ReconnectConfig::default());
        let debug_str = format!("{:?}", conn);
        assert!(debug_str.contains("Connection"));
        assert!(debug_str.contains("authenticated: true"));
        assert!(!debug_str.contains("very-secret"));
    }

    #[tokio::test]
    async fn test_connect_failure_without_reconnect() {
        // Port 9 (discard) is closed on test hosts
        let conn = Connection::new("ws://127.0.0.1:9/realtime", None, ReconnectConfig::disabled());
        let mut events = conn.start().await.unwrap();

        match events.recv().await {
            Some(ConnectionEvent::Error(msg)) => assert!(msg.contains("WebSocket error")),
            other => panic!("Expected Error event, got {other:?}"),
        }
        assert!(events.recv().await.is_none());
        assert_eq!(conn.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let conn = Connection::new("ws://127.0.0.1:9/realtime", None, ReconnectConfig::disabled());
        let _events = conn.start().await.unwrap();
        assert!(conn.start().await.is_err());
    }

    #[tokio::test]
    async fn test_start_after_close_fails() {
        let conn = Connection::new("ws://127.0.0.1:9/realtime", None, ReconnectConfig::disabled());
        conn.close().await;
        assert_eq!(conn.state().await, ConnectionState::Closed);
        let err = conn.start().await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn test_connection_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Connection>();
        assert_sync::<Connection>();
        assert_send::<ConnectionHandle>();
        assert_sync::<ConnectionHandle>();
    }

    // ============ Local server tests ============

    use crate::registry::TopicRegistry;
    use crate::streams::{CallbackResult, StreamClient, StreamStatus};
    use serde_json::Value;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    /// Accept two sockets; the first is closed by the server after one command
    async fn flaky_server() -> (String, mpsc::UnboundedReceiver<(usize, String)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/realtime", listener.local_addr().unwrap());
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            for socket in 0..2 {
                let (tcp, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                while let Some(Ok(msg)) = ws.next().await {
                    if let Message::Text(text) = msg {
                        let _ = seen_tx.send((socket, text));
                        if socket == 0 {
                            break;
                        }
                    }
                }
                let _ = ws.close(None).await;
            }
        });

        (url, seen_rx)
    }

    /// Feed connection events into the stream client until the next open
    async fn pump_until_open(
        events: &mut mpsc::Receiver<ConnectionEvent>,
        core: &mut StreamClient<ConnectionHandle>,
    ) {
        loop {
            let event = timeout(WAIT, events.recv())
                .await
                .expect("no open within timeout")
                .expect("connection events ended");
            match event {
                ConnectionEvent::Open => {
                    core.handle_open();
                    return;
                }
                ConnectionEvent::Close => core.handle_close(),
                ConnectionEvent::Error(msg) => core.handle_error(Error::WebSocket(msg)),
                ConnectionEvent::Message(_) => {}
            }
        }
    }

    #[tokio::test]
    async fn test_reconnect_resubscribes_on_new_socket() {
        let (url, mut seen) = flaky_server().await;
        let reconnect = ReconnectConfig {
            initial_delay: Duration::from_millis(20),
            ..Default::default()
        };
        let conn = Connection::new(url, None, reconnect);
        let mut core = StreamClient::new(conn.handle(), false, 16);
        core.initialize(TopicRegistry::new(vec!["trade".to_string()], vec![]));
        let mut events = conn.start().await.unwrap();

        pump_until_open(&mut events, &mut core).await;
        let status = core
            .add_stream("XBTUSD", Some("trade"), |_: &Value, _: &str, _: &str| -> CallbackResult {
                Ok(())
            })
            .unwrap();
        assert!(matches!(status, StreamStatus::Subscribed(_)));

        let subscribe = r#"{"op":"subscribe","args":"trade:XBTUSD"}"#.to_string();
        assert_eq!(timeout(WAIT, seen.recv()).await.unwrap(), Some((0, subscribe.clone())));

        // Server dropped the first socket; the second open restores the topic
        pump_until_open(&mut events, &mut core).await;
        assert_eq!(timeout(WAIT, seen.recv()).await.unwrap(), Some((1, subscribe)));
        assert!(conn.is_open());
        assert_eq!(conn.handle().epoch(), 2);
        assert_eq!(conn.reconnect_attempts(), 0);
        assert_eq!(core.count("trade", "XBTUSD"), 1);

        conn.close().await;
        while let Ok(Some(_)) = timeout(WAIT, events.recv()).await {}
        assert!(!conn.is_open());
        assert_eq!(conn.state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_stops_running_connection() {
        let (url, _seen) = flaky_server().await;
        let conn = Connection::new(url, None, ReconnectConfig::default());
        let mut events = conn.start().await.unwrap();

        assert_eq!(timeout(WAIT, events.recv()).await.unwrap(), Some(ConnectionEvent::Open));
        assert_eq!(conn.state().await, ConnectionState::Connected);

        conn.close().await;
        assert_eq!(timeout(WAIT, events.recv()).await.unwrap(), Some(ConnectionEvent::Close));
        assert_eq!(timeout(WAIT, events.recv()).await.unwrap(), None);
        assert_eq!(conn.state().await, ConnectionState::Closed);
        assert!(conn.handle().send("late".to_string()).is_err());
    }

    // ============ Integration Tests (require network) ============

    #[tokio::test]
    #[ignore]
    async fn test_connect_to_testnet() {
        let conn = Connection::new(
            crate::client::TESTNET_WS_URL,
            None,
            ReconnectConfig::disabled(),
        );
        let mut events = conn.start().await.unwrap();
        assert_eq!(events.recv().await, Some(ConnectionEvent::Open));
        assert!(conn.is_open());
        conn.close().await;
    }
}
