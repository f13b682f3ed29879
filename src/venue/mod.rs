//! Venue adapters
//!
//! A venue supplies the wire encoding of control requests and a decoder
//! that turns one raw frame into a tagged [`Frame`]. Everything else
//! (correlation, routing, book state) is shared.

pub mod kraken;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::currency::{Asset, CurrencyPair};
use crate::error::Result;
use crate::events::{Candle, Spread, Ticker, Trade};
use crate::orderbook::{BufferedUpdate, PriceLevel, Side};
use crate::subscription::ChannelKind;

pub use kraken::Kraken;

/// Venue-assigned channel identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelId {
    Number(i64),
    Name(String),
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Number(n) => write!(f, "{n}"),
            ChannelId::Name(s) => f.write_str(s),
        }
    }
}

/// Outcome reported by a subscription ack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckStatus {
    Subscribed,
    Unsubscribed,
    Error(String),
}

/// A subscribe/unsubscribe acknowledgement
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionAck {
    pub request_id: Option<i64>,
    pub channel_id: Option<ChannelId>,
    pub pair: Option<CurrencyPair>,
    pub kind: Option<ChannelKind>,
    pub status: AckStatus,
}

/// Book data carried by a channel frame
#[derive(Debug, Clone, PartialEq)]
pub enum BookMessage {
    Snapshot {
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        timestamp: DateTime<Utc>,
    },
    Update(BufferedUpdate),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeTick {
    pub price: Decimal,
    pub amount: Decimal,
    pub side: Side,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickerTick {
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub volume: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub open: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpreadTick {
    pub bid: Decimal,
    pub ask: Decimal,
    pub bid_amount: Decimal,
    pub ask_amount: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandleTick {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Typed payload of a channel data frame
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelPayload {
    Book(BookMessage),
    Trades(Vec<TradeTick>),
    Ticker(TickerTick),
    Spread(SpreadTick),
    Candle(CandleTick),
}

impl ChannelPayload {
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelPayload::Book(_) => ChannelKind::Book,
            ChannelPayload::Trades(_) => ChannelKind::Trade,
            ChannelPayload::Ticker(_) => ChannelKind::Ticker,
            ChannelPayload::Spread(_) => ChannelKind::Spread,
            ChannelPayload::Candle(_) => ChannelKind::Candle,
        }
    }
}

/// One decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Heartbeat,
    Pong { request_id: Option<i64> },
    SystemStatus { status: String },
    SubscriptionStatus(SubscriptionAck),
    Error { request_id: Option<i64>, message: String },
    Channel { channel_id: ChannelId, payload: ChannelPayload },
}

impl Frame {
    /// Short name used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Heartbeat => "heartbeat",
            Frame::Pong { .. } => "pong",
            Frame::SystemStatus { .. } => "system_status",
            Frame::SubscriptionStatus(_) => "subscription_status",
            Frame::Error { .. } => "error",
            Frame::Channel { payload, .. } => payload.kind().as_str(),
        }
    }
}

/// Wire-level knowledge of one venue
pub trait StreamVenue: Send + Sync {
    /// Exchange name used as the book key component
    fn name(&self) -> &str;

    /// Asset class of every book this venue streams
    fn asset(&self) -> Asset {
        Asset::Spot
    }

    /// Request that subscribes `kind` for `pair`, tagged with `request_id`
    fn subscribe_request(
        &self,
        request_id: i64,
        kind: ChannelKind,
        pair: &CurrencyPair,
    ) -> Result<serde_json::Value>;

    /// Request that unsubscribes `kind` for `pair`, tagged with `request_id`
    fn unsubscribe_request(
        &self,
        request_id: i64,
        kind: ChannelKind,
        pair: &CurrencyPair,
    ) -> Result<serde_json::Value>;

    /// Application-level keepalive, or None to use transport pings
    fn heartbeat_request(&self, request_id: i64) -> Option<serde_json::Value>;

    /// Classify and decode one raw frame
    fn decode(&self, raw: &str) -> Result<Frame>;
}

impl TradeTick {
    pub fn into_event(self, exchange: &str, pair: &CurrencyPair, asset: Asset) -> Trade {
        Trade {
            exchange: exchange.to_string(),
            pair: pair.clone(),
            asset,
            price: self.price,
            amount: self.amount,
            side: self.side,
            timestamp: self.timestamp,
        }
    }
}

impl TickerTick {
    pub fn into_event(self, exchange: &str, pair: &CurrencyPair, asset: Asset) -> Ticker {
        Ticker {
            exchange: exchange.to_string(),
            pair: pair.clone(),
            asset,
            bid: self.bid,
            ask: self.ask,
            last: self.last,
            volume: self.volume,
            high: self.high,
            low: self.low,
            open: self.open,
        }
    }
}

impl SpreadTick {
    pub fn into_event(self, exchange: &str, pair: &CurrencyPair, asset: Asset) -> Spread {
        Spread {
            exchange: exchange.to_string(),
            pair: pair.clone(),
            asset,
            bid: self.bid,
            ask: self.ask,
            bid_amount: self.bid_amount,
            ask_amount: self.ask_amount,
            timestamp: self.timestamp,
        }
    }
}

impl CandleTick {
    pub fn into_event(self, exchange: &str, pair: &CurrencyPair, asset: Asset) -> Candle {
        Candle {
            exchange: exchange.to_string(),
            pair: pair.clone(),
            asset,
            start: self.start,
            end: self.end,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}
