//! BitMEX realtime client
//!
//! A topic-multiplexing client for the BitMEX realtime WebSocket API:
//! - Topic registry lookup (which tables exist and which need a key)
//! - Callback routing by table and symbol, with listener counts
//! - One subscribe command per topic, reissued after every reconnect
//! - Signed connections for account-scoped tables
//!
//! ```no_run
//! use bitmex_realtime::{CallbackResult, ClientConfig, RealtimeClient};
//!
//! # async fn run() -> bitmex_realtime::Result<()> {
//! let client = RealtimeClient::spawn(ClientConfig::testnet()).await?;
//! client
//!     .add_stream("XBTUSD", Some("trade"), |data, symbol, table| -> CallbackResult {
//!         println!("{table}:{symbol} {data}");
//!         Ok(())
//!     })
//!     .await?;
//! client.wait().await
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod error;
pub mod registry;
pub mod streams;
pub mod types;
pub mod websocket;

pub use auth::ApiCredentials;
pub use client::{ClientConfig, Network, RealtimeClient, MAINNET_WS_URL, TESTNET_WS_URL};
pub use error::{CallbackError, Error, Result};
pub use registry::TopicRegistry;
pub use streams::{CallbackResult, ClientEvent, StreamClient, StreamStatus};
pub use types::*;
pub use websocket::ReconnectConfig;
