//! Shared types for BitMEX realtime topics
//!
//! Topics are `(table, symbol)` pairs. Inbound data is keyed by the composite
//! name `table:action:symbol`, and callbacks bind to patterns of the same shape
//! with the action wildcarded.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Wildcard used for "all tables" and "no symbol scoping"
pub const WILDCARD: &str = "*";

/// Separator between the segments of a composite topic name
pub const TOPIC_DELIMITER: char = ':';

/// Tables whose data is not partitioned by instrument symbol
pub const ACCOUNT_SCOPED_TABLES: &[&str] = &[
    "account",
    "affiliate",
    "announcement",
    "chat",
    "connected",
    "funds",
    "insurance",
    "margin",
    "privateNotifications",
    "publicNotifications",
    "transact",
    "wallet",
];

/// Check whether a table is account-scoped rather than symbol-scoped
pub fn is_account_scoped(table: &str) -> bool {
    ACCOUNT_SCOPED_TABLES.contains(&table)
}

/// Symbol actually used for a table: account-scoped tables always use `*`
pub fn effective_symbol<'a>(table: &str, symbol: &'a str) -> &'a str {
    if is_account_scoped(table) {
        WILDCARD
    } else {
        symbol
    }
}

// ============================================================================
// Topic
// ============================================================================

/// A logical data stream: one table, one symbol
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic {
    pub table: String,
    pub symbol: String,
}

impl Topic {
    /// Create a topic as given, without symbol normalization
    pub fn new(table: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            symbol: symbol.into(),
        }
    }

    /// Create a topic, forcing the wildcard symbol for account-scoped tables
    pub fn scoped(table: impl Into<String>, symbol: &str) -> Self {
        let table = table.into();
        let symbol = effective_symbol(&table, symbol).to_string();
        Self { table, symbol }
    }

    /// Pattern matching every action on this topic (`table:*:symbol`)
    pub fn pattern(&self) -> TopicPattern {
        TopicPattern {
            table: self.table.clone(),
            action: None,
            symbol: self.symbol.clone(),
        }
    }

    /// Argument string used in subscribe commands (`table:symbol`)
    pub fn subscription_arg(&self) -> String {
        format!("{}{}{}", self.table, TOPIC_DELIMITER, self.symbol)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.table, TOPIC_DELIMITER, self.symbol)
    }
}

// ============================================================================
// Actions and composite keys
// ============================================================================

/// Table action carried by every data message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Full snapshot sent after subscribing
    Partial,
    /// New rows
    Insert,
    /// Changed rows (keys plus changed fields)
    Update,
    /// Removed rows
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Partial => "partial",
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "partial" => Ok(Action::Partial),
            "insert" => Ok(Action::Insert),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            other => Err(Error::InvalidParameter(format!("unknown action: {other}"))),
        }
    }
}

/// Splits a composite name into exactly three segments
fn split_composite(name: &str) -> Option<(&str, &str, &str)> {
    let mut parts = name.split(TOPIC_DELIMITER);
    let table = parts.next()?;
    let action = parts.next()?;
    let symbol = parts.next()?;
    if parts.next().is_some() || table.is_empty() || symbol.is_empty() {
        return None;
    }
    Some((table, action, symbol))
}

/// Key of an inbound frame: `table:action:symbol`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameKey {
    pub table: String,
    pub action: Action,
    pub symbol: String,
}

impl FrameKey {
    pub fn new(table: impl Into<String>, action: Action, symbol: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            action,
            symbol: symbol.into(),
        }
    }
}

impl fmt::Display for FrameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.table, self.action, self.symbol)
    }
}

impl FromStr for FrameKey {
    type Err = Error;

    /// Parses `table:action:symbol`. Names with any other segment count
    /// (`open`, `error`, ...) are control events, not data topics.
    fn from_str(s: &str) -> Result<Self> {
        let (table, action, symbol) = split_composite(s)
            .ok_or_else(|| Error::InvalidParameter(format!("not a data topic: {s}")))?;
        Ok(Self::new(table, action.parse()?, symbol))
    }
}

/// Binding pattern: `table:action:symbol` where action may be `*`
/// and symbol `*` matches every symbol
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPattern {
    pub table: String,
    pub action: Option<Action>,
    pub symbol: String,
}

impl TopicPattern {
    /// Check whether an inbound frame key falls under this pattern
    pub fn matches(&self, key: &FrameKey) -> bool {
        self.table == key.table
            && self.action.map_or(true, |action| action == key.action)
            && (self.symbol == WILDCARD || self.symbol == key.symbol)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.action {
            Some(action) => write!(f, "{}:{}:{}", self.table, action, self.symbol),
            None => write!(f, "{}:{}:{}", self.table, WILDCARD, self.symbol),
        }
    }
}

impl FromStr for TopicPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (table, action, symbol) = split_composite(s)
            .ok_or_else(|| Error::InvalidParameter(format!("not a data topic: {s}")))?;
        let action = if action == WILDCARD {
            None
        } else {
            Some(action.parse()?)
        };
        Ok(Self {
            table: table.to_string(),
            action,
            symbol: symbol.to_string(),
        })
    }
}

// ============================================================================
// Outbound commands
// ============================================================================

/// Subscribe command: `{"op":"subscribe","args":"table:symbol"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeCommand {
    pub op: String,
    pub args: String,
}

impl SubscribeCommand {
    pub fn new(topic: &Topic) -> Self {
        Self {
            op: "subscribe".to_string(),
            args: topic.subscription_arg(),
        }
    }

    /// Serialize to the wire format
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_scoped_tables() {
        assert!(is_account_scoped("wallet"));
        assert!(is_account_scoped("margin"));
        assert!(is_account_scoped("chat"));
        assert!(is_account_scoped("connected"));
        assert!(!is_account_scoped("trade"));
        assert!(!is_account_scoped("order"));
    }

    #[test]
    fn test_effective_symbol() {
        assert_eq!(effective_symbol("wallet", "XBTUSD"), "*");
        assert_eq!(effective_symbol("trade", "XBTUSD"), "XBTUSD");
    }

    #[test]
    fn test_topic_scoped() {
        assert_eq!(Topic::scoped("margin", "ETHUSD"), Topic::new("margin", "*"));
        assert_eq!(Topic::scoped("quote", "ETHUSD"), Topic::new("quote", "ETHUSD"));
    }

    #[test]
    fn test_topic_pattern_display() {
        let topic = Topic::new("trade", "XBTUSD");
        assert_eq!(topic.pattern().to_string(), "trade:*:XBTUSD");
        assert_eq!(topic.to_string(), "trade:XBTUSD");
    }

    #[test]
    fn test_frame_key_parse() {
        let key: FrameKey = "instrument:update:XBTUSD".parse().unwrap();
        assert_eq!(key.table, "instrument");
        assert_eq!(key.action, Action::Update);
        assert_eq!(key.symbol, "XBTUSD");
        assert_eq!(key.to_string(), "instrument:update:XBTUSD");
    }

    #[test]
    fn test_frame_key_rejects_control_names() {
        assert!("open".parse::<FrameKey>().is_err());
        assert!("error".parse::<FrameKey>().is_err());
        assert!("trade:XBTUSD".parse::<FrameKey>().is_err());
        assert!("a:insert:b:c".parse::<FrameKey>().is_err());
        assert!("trade:replace:XBTUSD".parse::<FrameKey>().is_err());
    }

    #[test]
    fn test_pattern_matches() {
        let pattern: TopicPattern = "trade:*:XBTUSD".parse().unwrap();
        assert!(pattern.matches(&FrameKey::new("trade", Action::Insert, "XBTUSD")));
        assert!(pattern.matches(&FrameKey::new("trade", Action::Partial, "XBTUSD")));
        assert!(!pattern.matches(&FrameKey::new("trade", Action::Insert, "ETHUSD")));
        assert!(!pattern.matches(&FrameKey::new("quote", Action::Insert, "XBTUSD")));

        let any_symbol: TopicPattern = "trade:insert:*".parse().unwrap();
        assert!(any_symbol.matches(&FrameKey::new("trade", Action::Insert, "ETHUSD")));
        assert!(!any_symbol.matches(&FrameKey::new("trade", Action::Delete, "ETHUSD")));
    }

    #[test]
    fn test_action_serde() {
        assert_eq!(serde_json::to_string(&Action::Partial).unwrap(), "\"partial\"");
        let action: Action = serde_json::from_str("\"delete\"").unwrap();
        assert_eq!(action, Action::Delete);
    }

    #[test]
    fn test_subscribe_command_json() {
        let cmd = SubscribeCommand::new(&Topic::new("trade", "XBTUSD"));
        assert_eq!(
            cmd.to_json().unwrap(),
            r#"{"op":"subscribe","args":"trade:XBTUSD"}"#
        );
    }
}
