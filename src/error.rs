//! Error types for the BitMEX realtime client

use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by a user stream callback
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur when using the realtime client
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API returned an error response
    #[error("API error: {0}")]
    Api(String),

    /// Authentication error
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Invalid parameter error
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Table name is not part of the realtime schema
    #[error("Unknown table for BitMEX subscription: {table}. Available tables are {}.", .available.join(","))]
    UnknownTable {
        table: String,
        available: Vec<String>,
    },

    /// A stream callback returned an error or panicked
    #[error("Stream callback for {table}:{symbol} failed: {source}")]
    Callback {
        table: String,
        symbol: String,
        #[source]
        source: CallbackError,
    },

    /// The client could not start (schema lookup failed)
    #[error("Startup error: {0}")]
    Startup(String),
}
