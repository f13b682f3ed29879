//! Order book module
//!
//! Maintains synchronized order book state per (exchange, pair, asset) from
//! venue snapshots and deltas.

mod book;
mod buffer;
mod store;

pub use book::Depth;
pub use buffer::{BufferedUpdate, UpdateBuffer};
pub use store::OrderBookStore;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::currency::{Asset, CurrencyPair};

/// Side of the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

/// A single level in the order book
///
/// An amount of zero in a delta removes the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub amount: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, amount: Decimal) -> Self {
        Self { price, amount }
    }
}

/// Key of a book in the store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BookKey {
    pub exchange: String,
    pub pair: CurrencyPair,
    pub asset: Asset,
}

impl BookKey {
    pub fn new(exchange: &str, pair: CurrencyPair, asset: Asset) -> Self {
        Self {
            exchange: exchange.to_lowercase(),
            pair,
            asset,
        }
    }
}

/// Read-only copy of an order book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub exchange: String,
    pub pair: CurrencyPair,
    pub asset: Asset,
    /// Bids, highest price first
    pub bids: Vec<PriceLevel>,
    /// Asks, lowest price first
    pub asks: Vec<PriceLevel>,
    /// Venue timestamp of the most recent applied change
    pub last_updated: DateTime<Utc>,
    /// Count of applied mutations since the snapshot
    pub update_id: u64,
}

impl Book {
    /// Build a snapshot for loading into the store
    pub fn snapshot(
        exchange: &str,
        pair: CurrencyPair,
        asset: Asset,
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
        last_updated: DateTime<Utc>,
    ) -> Self {
        Self {
            exchange: exchange.to_lowercase(),
            pair,
            asset,
            bids,
            asks,
            last_updated,
            update_id: 0,
        }
    }

    pub fn key(&self) -> BookKey {
        BookKey::new(&self.exchange, self.pair.clone(), self.asset)
    }

    /// Get best bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    /// Get best ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Get mid price
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::from(2)),
            _ => None,
        }
    }

    /// Get spread in basis points
    pub fn spread_bps(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask(), self.mid_price()) {
            (Some(bid), Some(ask), Some(mid)) if mid > Decimal::ZERO => {
                Some((ask - bid) / mid * Decimal::from(10000))
            }
            _ => None,
        }
    }
}
