//! Configuration module for the stream service

use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::currency::{CurrencyPair, DEFAULT_DELIMITER};
use crate::dispatch::BookSettings;
use crate::error::{Result, StreamError};
use crate::subscription::ChannelKind;
use crate::venue::kraken::KRAKEN_WS_URL;
use crate::websocket::{StreamSettings, TransportConfig};

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Venue adapter to run (only "kraken" today)
    pub exchange: String,

    /// WebSocket endpoint of the venue
    pub ws_endpoint: String,

    /// Optional HTTP CONNECT proxy
    pub ws_proxy: Option<String>,

    /// Optional bearer token for the handshake
    pub ws_auth_token: Option<String>,

    /// Channels to subscribe, e.g. `book:XBT/USD,trade:ETH/USD`
    pub subscriptions: String,

    /// Levels kept per book side (0 keeps all)
    pub book_depth: usize,

    /// Deltas buffered per book before a drain
    pub book_batch_size: usize,

    pub allow_snapshot_override: bool,

    pub response_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_secs: u64,

    /// Event fan-out capacity
    pub event_buffer: usize,

    /// How long a book or connection event may wait for queue space
    pub book_event_timeout_ms: u64,

    /// Reconnection settings
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,

    pub shutdown_grace_ms: u64,

    /// IPC socket path for forwarding events; unset logs them instead
    pub ipc_socket_path: Option<String>,

    /// Port of the health and metrics server
    pub health_port: u16,
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            exchange: env::var("EXCHANGE")
                .map(|s| s.trim().to_lowercase())
                .unwrap_or(defaults.exchange),
            ws_endpoint: env::var("WS_ENDPOINT").unwrap_or(defaults.ws_endpoint),
            ws_proxy: optional("WS_PROXY"),
            ws_auth_token: optional("WS_AUTH_TOKEN"),
            subscriptions: env::var("SUBSCRIPTIONS").unwrap_or(defaults.subscriptions),
            book_depth: parsed("BOOK_DEPTH", defaults.book_depth),
            book_batch_size: parsed("BOOK_BATCH_SIZE", defaults.book_batch_size),
            allow_snapshot_override: parsed(
                "ALLOW_SNAPSHOT_OVERRIDE",
                defaults.allow_snapshot_override,
            ),
            response_timeout_ms: parsed("RESPONSE_TIMEOUT_MS", defaults.response_timeout_ms),
            connect_timeout_ms: parsed("CONNECT_TIMEOUT_MS", defaults.connect_timeout_ms),
            heartbeat_interval_secs: parsed(
                "HEARTBEAT_INTERVAL_SECS",
                defaults.heartbeat_interval_secs,
            ),
            event_buffer: parsed("EVENT_BUFFER", defaults.event_buffer),
            book_event_timeout_ms: parsed("BOOK_EVENT_TIMEOUT_MS", defaults.book_event_timeout_ms),
            reconnect_delay_ms: parsed("RECONNECT_DELAY_MS", defaults.reconnect_delay_ms),
            max_reconnect_attempts: parsed(
                "MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
            shutdown_grace_ms: parsed("SHUTDOWN_GRACE_MS", defaults.shutdown_grace_ms),
            ipc_socket_path: optional("IPC_SOCKET_PATH"),
            health_port: parsed("HEALTH_PORT", defaults.health_port),
        };

        // Fail at startup rather than on first connect
        config.channels()?;
        Ok(config)
    }

    /// Parse the subscription list into (kind, pair) entries
    pub fn channels(&self) -> Result<Vec<(ChannelKind, CurrencyPair)>> {
        parse_subscriptions(&self.subscriptions)
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            url: self.ws_endpoint.clone(),
            proxy: self.ws_proxy.clone(),
            auth_token: self.ws_auth_token.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            book: BookSettings {
                batch_size: self.book_batch_size.max(1),
                allow_snapshot_override: self.allow_snapshot_override,
            },
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: "kraken".to_string(),
            ws_endpoint: KRAKEN_WS_URL.to_string(),
            ws_proxy: None,
            ws_auth_token: None,
            subscriptions: "book:XBT/USD,trade:XBT/USD,ticker:XBT/USD".to_string(),
            book_depth: 10,
            book_batch_size: 1,
            allow_snapshot_override: true,
            response_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            heartbeat_interval_secs: 30,
            event_buffer: 4096,
            book_event_timeout_ms: 250,
            reconnect_delay_ms: 1000,
            max_reconnect_attempts: 0,
            shutdown_grace_ms: 5000,
            ipc_socket_path: None,
            health_port: 9090,
        }
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Parse `kind:BASE/QUOTE` entries separated by commas
pub fn parse_subscriptions(raw: &str) -> Result<Vec<(ChannelKind, CurrencyPair)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| -> Result<(ChannelKind, CurrencyPair)> {
            let (kind, pair) = entry.split_once(':').ok_or_else(|| {
                StreamError::Config(format!("subscription {entry:?} is not kind:pair"))
            })?;
            Ok((kind.parse::<ChannelKind>()?, CurrencyPair::parse(pair, DEFAULT_DELIMITER)?))
        })
        .collect()
}
