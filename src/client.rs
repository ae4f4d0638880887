//! Realtime client for the BitMEX WebSocket API
//!
//! [`RealtimeClient`] wires the pieces together: it opens the
//! [`Connection`], fetches the [`TopicRegistry`] in the background, and feeds
//! every lifecycle and data event into one [`StreamClient`] from a single
//! driver task.

use reqwest::Client as HttpClient;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::auth::ApiCredentials;
use crate::error::{Error, Result};
use crate::registry::{schema_url, TopicRegistry};
use crate::streams::{CallbackResult, ClientEvent, StreamClient, StreamStatus};
use crate::websocket::{
    Connection, ConnectionEvent, ConnectionHandle, ConnectionState, InboundMessage,
    ReconnectConfig,
};

/// Realtime endpoints
pub const MAINNET_WS_URL: &str = "wss://ws.bitmex.com/realtime";
pub const TESTNET_WS_URL: &str = "wss://ws.testnet.bitmex.com/realtime";

/// Default capacity of the client event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Network configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    /// Mainnet environment
    #[default]
    Mainnet,
    /// Testnet environment
    Testnet,
}

impl Network {
    /// Get the realtime URL for this network
    pub fn ws_url(&self) -> &'static str {
        match self {
            Network::Mainnet => MAINNET_WS_URL,
            Network::Testnet => TESTNET_WS_URL,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Explicit realtime endpoint; overrides the network default
    pub endpoint: Option<String>,
    /// Use the testnet endpoint when no explicit endpoint is set
    pub testnet: bool,
    /// API key id; its presence makes the client authenticated
    pub api_key_id: Option<String>,
    /// API key secret, required with `api_key_id`
    pub api_key_secret: Option<String>,
    /// Reconnection behaviour of the underlying connection
    pub reconnect: ReconnectConfig,
    /// Capacity of the client event channel
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            testnet: false,
            api_key_id: None,
            api_key_secret: None,
            reconnect: ReconnectConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Configuration for mainnet
    pub fn mainnet() -> Self {
        Self::default()
    }

    /// Configuration for testnet
    pub fn testnet() -> Self {
        Self {
            testnet: true,
            ..Default::default()
        }
    }

    /// Use an explicit realtime endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Authenticate with an API key pair
    pub fn with_credentials(
        mut self,
        api_key_id: impl Into<String>,
        api_key_secret: impl Into<String>,
    ) -> Self {
        self.api_key_id = Some(api_key_id.into());
        self.api_key_secret = Some(api_key_secret.into());
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn network(&self) -> Network {
        if self.testnet {
            Network::Testnet
        } else {
            Network::Mainnet
        }
    }

    /// Realtime endpoint in effect
    pub fn endpoint(&self) -> &str {
        self.endpoint
            .as_deref()
            .unwrap_or_else(|| self.network().ws_url())
    }

    /// Whether the client subscribes with private table access
    pub fn authenticated(&self) -> bool {
        self.api_key_id.is_some()
    }

    /// Validated credentials, if any are configured
    pub fn credentials(&self) -> Result<Option<ApiCredentials>> {
        ApiCredentials::from_parts(self.api_key_id.as_deref(), self.api_key_secret.as_deref())
    }
}

/// Topic-multiplexing client over one realtime connection
pub struct RealtimeClient {
    config: ClientConfig,
    core: Arc<Mutex<StreamClient<ConnectionHandle>>>,
    connection: Arc<Connection>,
    driver: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("endpoint", &self.config.endpoint())
            .field("authenticated", &self.config.authenticated())
            .finish_non_exhaustive()
    }
}

impl RealtimeClient {
    /// Start a client: connect, fetch the registry, and begin routing
    ///
    /// Must be called inside a Tokio runtime. Registry lookup failure is
    /// fatal: it is reported as an `error` event, the connection is closed,
    /// and [`RealtimeClient::wait`] returns [`Error::Startup`].
    pub async fn spawn(config: ClientConfig) -> Result<Self> {
        let http = HttpClient::builder().build().map_err(Error::Http)?;
        Self::spawn_with_http(config, http).await
    }

    /// [`RealtimeClient::spawn`] with a caller-supplied HTTP client
    pub async fn spawn_with_http(config: ClientConfig, http: HttpClient) -> Result<Self> {
        let credentials = config.credentials()?;
        let endpoint = config.endpoint().to_string();

        let connection = Arc::new(Connection::new(
            endpoint.clone(),
            credentials,
            config.reconnect.clone(),
        ));
        let core = Arc::new(Mutex::new(StreamClient::new(
            connection.handle(),
            config.authenticated(),
            config.event_capacity,
        )));

        let events_rx = connection.start().await?;
        info!(
            endpoint = %endpoint,
            authenticated = config.authenticated(),
            "Starting realtime client"
        );

        let driver = tokio::spawn(drive(
            core.clone(),
            connection.clone(),
            events_rx,
            http,
            schema_url(&endpoint),
        ));

        Ok(Self {
            config,
            core,
            connection,
            driver: Mutex::new(Some(driver)),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Receive client events (`initialize`, `open`, `close`, `error`)
    pub async fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.core.lock().await.subscribe_events()
    }

    /// Bind a callback to `symbol` on `table`, or on every permitted table
    /// when `table` is `None` or `"*"`
    ///
    /// See [`StreamClient::add_stream`].
    pub async fn add_stream<F>(
        &self,
        symbol: &str,
        table: Option<&str>,
        callback: F,
    ) -> Result<StreamStatus>
    where
        F: Fn(&Value, &str, &str) -> CallbackResult + Send + Sync + 'static,
    {
        self.core.lock().await.add_stream(symbol, table, callback)
    }

    /// Listener count for `(table, symbol)`
    pub async fn count(&self, table: &str, symbol: &str) -> usize {
        self.core.lock().await.count(table, symbol)
    }

    pub async fn is_initialized(&self) -> bool {
        self.core.lock().await.is_initialized()
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.connection.state().await
    }

    /// Close the connection; the driver stops once it drains
    pub async fn close(&self) {
        self.connection.close().await;
    }

    /// Wait for the driver to finish
    ///
    /// Returns the fatal startup error, if there was one.
    pub async fn wait(&self) -> Result<()> {
        let Some(driver) = self.driver.lock().await.take() else {
            return Ok(());
        };
        driver
            .await
            .map_err(|e| Error::Startup(format!("driver task failed: {e}")))?
    }
}

/// Feed registry and connection events into the stream client, in order
async fn drive(
    core: Arc<Mutex<StreamClient<ConnectionHandle>>>,
    connection: Arc<Connection>,
    mut events_rx: mpsc::Receiver<ConnectionEvent>,
    http: HttpClient,
    schema_url: String,
) -> Result<()> {
    let lookup = async move { TopicRegistry::fetch(&http, &schema_url).await };
    tokio::pin!(lookup);
    let mut initialized = false;
    let mut events_live = true;

    loop {
        tokio::select! {
            registry = &mut lookup, if !initialized => {
                initialized = true;
                match registry {
                    Ok(registry) => {
                        core.lock().await.initialize(registry);
                        if !events_live {
                            return Ok(());
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Topic registry lookup failed");
                        let message = e.to_string();
                        core.lock().await.handle_error(e);
                        connection.close().await;
                        return Err(Error::Startup(message));
                    }
                }
            }
            event = events_rx.recv(), if events_live => {
                let Some(event) = event else {
                    debug!("Connection events ended");
                    if initialized {
                        return Ok(());
                    }
                    // The registry outcome still decides how startup ends
                    events_live = false;
                    continue;
                };
                let mut core = core.lock().await;
                match event {
                    ConnectionEvent::Open => core.handle_open(),
                    ConnectionEvent::Close => core.handle_close(),
                    ConnectionEvent::Error(message) => core.handle_error(Error::WebSocket(message)),
                    ConnectionEvent::Message(message) => handle_message(&core, message),
                }
            }
        }
    }
}

fn handle_message(core: &StreamClient<ConnectionHandle>, message: InboundMessage) {
    match message {
        InboundMessage::Data(frames) => {
            for frame in &frames {
                core.handle_frame(frame);
            }
        }
        InboundMessage::Subscribed(topic) => debug!(topic = %topic, "Subscription confirmed"),
        InboundMessage::Failure { status, error } => {
            let message = match status {
                Some(status) => format!("{status} {error}"),
                None => error,
            };
            core.handle_error(Error::Api(message));
        }
        InboundMessage::Info(info) => info!(message = %info, "Server info"),
        InboundMessage::Pong => {}
    }
}
