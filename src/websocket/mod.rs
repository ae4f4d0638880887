//! WebSocket transport for the BitMEX realtime API
//!
//! This module owns the physical connection: connecting (with signed URLs for
//! authenticated clients), reconnecting with backoff, heartbeats, and decoding
//! inbound text into [`Frame`]s keyed by `table:action:symbol`.
//!
//! # Example
//!
//! ```ignore
//! use bitmex_realtime::websocket::{Connection, ConnectionEvent, ReconnectConfig};
//!
//! let conn = Connection::new("wss://ws.bitmex.com/realtime", None, ReconnectConfig::default());
//! let mut events = conn.start().await?;
//! while let Some(event) = events.recv().await {
//!     if event == ConnectionEvent::Open {
//!         conn.handle().send(r#"{"op":"subscribe","args":"trade:XBTUSD"}"#.to_string())?;
//!     }
//! }
//! ```

mod client;
mod message;

pub use client::{
    Connection, ConnectionEvent, ConnectionHandle, ConnectionState, ReconnectConfig,
    HEARTBEAT_INTERVAL,
};
pub use message::{decode, Frame, InboundMessage, PONG};
