//! Inbound message decoding
//!
//! Data messages look like
//! `{"table":"trade","action":"insert","data":[{"symbol":"XBTUSD",...}]}` and
//! are split into one [`Frame`] per symbol. Everything else is a control
//! message (subscription ack, error, welcome info, heartbeat reply).

use serde::Deserialize;
use serde_json::Value;

use crate::error::Result;
use crate::types::{is_account_scoped, Action, FrameKey, WILDCARD};

/// Text the server sends in reply to a `ping` text frame
pub const PONG: &str = "pong";

/// Data for one `table:action:symbol` topic
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub key: FrameKey,
    /// Rows for this symbol (always a JSON array)
    pub data: Value,
}

impl Frame {
    pub fn new(key: FrameKey, rows: Vec<Value>) -> Self {
        Self {
            key,
            data: Value::Array(rows),
        }
    }

    pub fn table(&self) -> &str {
        &self.key.table
    }

    pub fn symbol(&self) -> &str {
        &self.key.symbol
    }

    pub fn action(&self) -> Action {
        self.key.action
    }
}

/// A decoded inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Table data, one frame per symbol in first-seen order
    Data(Vec<Frame>),
    /// Subscription acknowledged for `table:symbol`
    Subscribed(String),
    /// Error reported by the server
    Failure { status: Option<u16>, error: String },
    /// Welcome or informational message
    Info(String),
    /// Heartbeat reply
    Pong,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawMessage {
    Table {
        table: String,
        action: Action,
        #[serde(default)]
        data: Vec<Value>,
    },
    Subscribed {
        success: bool,
        subscribe: String,
    },
    Failure {
        error: String,
        #[serde(default)]
        status: Option<u16>,
    },
    Info {
        info: String,
    },
}

/// Decode one text message from the realtime socket
pub fn decode(text: &str) -> Result<InboundMessage> {
    if text == PONG {
        return Ok(InboundMessage::Pong);
    }

    let raw: RawMessage = serde_json::from_str(text)?;
    Ok(match raw {
        RawMessage::Table {
            table,
            action,
            data,
        } => InboundMessage::Data(split_by_symbol(&table, action, data)),
        RawMessage::Subscribed { success, subscribe } if success => {
            InboundMessage::Subscribed(subscribe)
        }
        RawMessage::Subscribed { subscribe, .. } => InboundMessage::Failure {
            status: None,
            error: format!("Subscription rejected: {subscribe}"),
        },
        RawMessage::Failure { error, status } => InboundMessage::Failure { status, error },
        RawMessage::Info { info } => InboundMessage::Info(info),
    })
}

/// Group rows by their `symbol` field, keeping first-seen order
fn split_by_symbol(table: &str, action: Action, rows: Vec<Value>) -> Vec<Frame> {
    if is_account_scoped(table) {
        return vec![Frame::new(FrameKey::new(table, action, WILDCARD), rows)];
    }

    let mut groups: Vec<(String, Vec<Value>)> = Vec::new();
    for row in rows {
        let symbol = row
            .get("symbol")
            .and_then(Value::as_str)
            .unwrap_or(WILDCARD)
            .to_string();
        match groups.iter_mut().find(|(s, _)| *s == symbol) {
            Some((_, bucket)) => bucket.push(row),
            None => groups.push((symbol, vec![row])),
        }
    }

    // Empty partials still tell subscribers the table is live
    if groups.is_empty() {
        groups.push((WILDCARD.to_string(), Vec::new()));
    }

    groups
        .into_iter()
        .map(|(symbol, rows)| Frame::new(FrameKey::new(table, action, symbol), rows))
        .collect()
}
