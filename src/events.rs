//! Normalized events published to the rest of the bot

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::currency::{Asset, CurrencyPair};
use crate::orderbook::{Book, Side};

/// A public trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub exchange: String,
    pub pair: CurrencyPair,
    pub asset: Asset,
    pub price: Decimal,
    pub amount: Decimal,
    /// Aggressor side
    pub side: Side,
    pub timestamp: DateTime<Utc>,
}

/// Top-of-book and 24h statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub exchange: String,
    pub pair: CurrencyPair,
    pub asset: Asset,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub volume: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub open: Decimal,
}

/// Best bid/ask with sizes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spread {
    pub exchange: String,
    pub pair: CurrencyPair,
    pub asset: Asset,
    pub bid: Decimal,
    pub ask: Decimal,
    pub bid_amount: Decimal,
    pub ask_amount: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// OHLC candle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub exchange: String,
    pub pair: CurrencyPair,
    pub asset: Asset,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Event published on the fan-out
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A book changed; carries the post-change copy
    BookChanged(Book),
    Trade(Trade),
    Ticker(Ticker),
    Spread(Spread),
    Candle(Candle),
    /// A channel-local or venue-reported error
    Error { exchange: String, message: String },
    /// The physical connection ended
    ConnectionLost { exchange: String, reason: String },
}

impl StreamEvent {
    /// Book and connection events must not be dropped on a full queue
    /// without waiting first.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            StreamEvent::BookChanged(_) | StreamEvent::ConnectionLost { .. }
        )
    }

    /// Short name used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::BookChanged(_) => "book",
            StreamEvent::Trade(_) => "trade",
            StreamEvent::Ticker(_) => "ticker",
            StreamEvent::Spread(_) => "spread",
            StreamEvent::Candle(_) => "candle",
            StreamEvent::Error { .. } => "error",
            StreamEvent::ConnectionLost { .. } => "connection_lost",
        }
    }
}
