//! Core order book implementation
//!
//! Uses BTreeMap for efficient sorted price level management.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::cmp::Reverse;
use std::collections::BTreeMap;

use super::{Book, BookKey, PriceLevel, Side};

/// Live bid/ask state of a single book
///
/// Only reachable through [`OrderBookStore`](super::OrderBookStore), which
/// owns the locking.
#[derive(Debug, Clone)]
pub struct Depth {
    /// Bids sorted by price descending (highest first)
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    /// Asks sorted by price ascending (lowest first)
    asks: BTreeMap<Decimal, Decimal>,
    /// Venue timestamp of the last applied change
    last_updated: DateTime<Utc>,
    /// Mutations applied since the snapshot, the snapshot included
    update_id: u64,
    /// Maximum depth levels to maintain, 0 for unlimited
    max_depth: usize,
}

impl Depth {
    /// Initialize from a full snapshot
    pub fn from_snapshot(snapshot: &Book, max_depth: usize) -> Self {
        let mut depth = Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_updated: snapshot.last_updated,
            update_id: 1,
            max_depth,
        };

        for level in &snapshot.bids {
            if level.amount > Decimal::ZERO {
                depth.bids.insert(Reverse(level.price), level.amount);
            }
        }

        for level in &snapshot.asks {
            if level.amount > Decimal::ZERO {
                depth.asks.insert(level.price, level.amount);
            }
        }

        depth.trim_depth();
        depth
    }

    /// Apply a delta and move the marker forward
    ///
    /// Ordering checks are the caller's job.
    pub fn apply_delta(
        &mut self,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        timestamp: DateTime<Utc>,
    ) {
        for level in bids {
            self.apply_level(Side::Bid, level);
        }
        for level in asks {
            self.apply_level(Side::Ask, level);
        }

        self.last_updated = timestamp;
        self.update_id += 1;
        self.trim_depth();
    }

    /// Apply a single price level
    ///
    /// Returns false when the book already held exactly this state, which
    /// includes deleting a price that is not present.
    pub fn apply_level(&mut self, side: Side, level: &PriceLevel) -> bool {
        match side {
            Side::Bid => Self::merge(&mut self.bids, Reverse(level.price), level.amount),
            Side::Ask => Self::merge(&mut self.asks, level.price, level.amount),
        }
    }

    fn merge<K: Ord>(side: &mut BTreeMap<K, Decimal>, price: K, amount: Decimal) -> bool {
        match side.get_mut(&price) {
            Some(existing) if *existing == amount => false,
            Some(_) if amount == Decimal::ZERO => {
                side.remove(&price);
                true
            }
            Some(existing) => {
                *existing = amount;
                true
            }
            None if amount == Decimal::ZERO => false,
            None => {
                side.insert(price, amount);
                true
            }
        }
    }

    /// Move the marker after a buffered drain
    pub fn finish_drain(&mut self, timestamp: DateTime<Utc>) {
        if timestamp > self.last_updated {
            self.last_updated = timestamp;
        }
        self.update_id += 1;
        self.trim_depth();
    }

    /// Trim the book to max depth
    fn trim_depth(&mut self) {
        if self.max_depth == 0 {
            return;
        }
        while self.bids.len() > self.max_depth {
            self.bids.pop_last();
        }
        while self.asks.len() > self.max_depth {
            self.asks.pop_last();
        }
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    pub fn update_id(&self) -> u64 {
        self.update_id
    }

    /// Get best bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first_key_value().map(|(Reverse(p), _)| *p)
    }

    /// Get best ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first_key_value().map(|(p, _)| *p)
    }

    /// Copy the current state out for readers
    pub fn to_book(&self, key: &BookKey) -> Book {
        Book {
            exchange: key.exchange.clone(),
            pair: key.pair.clone(),
            asset: key.asset,
            bids: self
                .bids
                .iter()
                .map(|(Reverse(p), a)| PriceLevel::new(*p, *a))
                .collect(),
            asks: self
                .asks
                .iter()
                .map(|(p, a)| PriceLevel::new(*p, *a))
                .collect(),
            last_updated: self.last_updated,
            update_id: self.update_id,
        }
    }
}
