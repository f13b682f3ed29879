//! Error types for the streaming layer

use thiserror::Error;

use crate::currency::{Asset, CurrencyPair};

/// Streaming and order book errors
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Connection is not established")]
    NotConnected,

    #[error("Connection is already established")]
    AlreadyConnected,

    #[error("No order book for {exchange} {pair} {asset}")]
    BookNotFound {
        exchange: String,
        pair: CurrencyPair,
        asset: Asset,
    },

    #[error("Order book for {exchange} {pair} {asset} already exists")]
    AlreadyExists {
        exchange: String,
        pair: CurrencyPair,
        asset: Asset,
    },

    #[error("Out of order update for {exchange} {pair}: book at {book_marker}, update at {update_marker}")]
    OutOfOrderUpdate {
        exchange: String,
        pair: CurrencyPair,
        book_marker: String,
        update_marker: String,
    },

    #[error("No response to request {request_id} within {timeout_ms}ms")]
    ResponseTimeout { request_id: i64, timeout_ms: u64 },

    #[error("Connection is shutting down")]
    ShuttingDown,

    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Failed to decode frame: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Max reconnection attempts exceeded")]
    MaxReconnectAttemptsExceeded,
}

impl StreamError {
    /// Whether the error invalidates a single book and calls for a resubscribe
    pub fn is_desync(&self) -> bool {
        matches!(
            self,
            StreamError::OutOfOrderUpdate { .. } | StreamError::BookNotFound { .. }
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for StreamError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        StreamError::WebSocket(err.to_string())
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::Decode(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StreamError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        StreamError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::Ipc(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StreamError::ResponseTimeout {
            request_id: 42,
            timeout_ms: 1000,
        };
        assert_eq!(err.to_string(), "No response to request 42 within 1000ms");

        let err = StreamError::BookNotFound {
            exchange: "kraken".to_string(),
            pair: CurrencyPair::new("xbt", "usd"),
            asset: Asset::Spot,
        };
        assert_eq!(err.to_string(), "No order book for kraken XBT/USD spot");
    }

    #[test]
    fn test_desync_classification() {
        let err = StreamError::OutOfOrderUpdate {
            exchange: "kraken".to_string(),
            pair: CurrencyPair::new("XBT", "USD"),
            book_marker: "5".to_string(),
            update_marker: "3".to_string(),
        };
        assert!(err.is_desync());
        assert!(!StreamError::NotConnected.is_desync());
    }
}
