//! Error categories for the hole-punching core.
//!
//! Every fallible operation in this crate surfaces one of these variants.
//! Nothing here retries locally — callers decide whether/when to retry.

use thiserror::Error;

/// The error categories surfaced by this crate's fallible operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// I/O failure at the transport layer (HTTP, WebSocket, UDP).
    #[error("network error: {0}")]
    Network(String),

    /// Server returned a non-2xx HTTP status.
    #[error("non-2xx response from {path}: {status}")]
    HttpNonOk { path: String, status: u16 },

    /// JSON was present but missing or ill-typed a required field.
    #[error("schema error: {0}")]
    Schema(String),

    /// A bounded wait elapsed without a matching event.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// A phase was called out of order.
    #[error("uninitialized: {0}")]
    Uninitialized(String),

    /// A caller-supplied buffer was too small.
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Random-byte generation or base64 (de)coding failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Catch-all for internally-detected violations not covered above.
    #[error("internal error: {0}")]
    Unknown(String),
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        CoreError::Network(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CoreError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        CoreError::Network(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Schema(e.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Network(e.to_string())
    }
}

impl From<base64::DecodeError> for CoreError {
    fn from(e: base64::DecodeError) -> Self {
        CoreError::Crypto(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
