//! Order book store
//!
//! Owns the authoritative books for every (exchange, pair, asset). Every read
//! and write goes through the entry's shard lock, so a buffered drain is
//! atomic with respect to `get`.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use super::{Book, BookKey, BufferedUpdate, Depth, PriceLevel, Side, UpdateBuffer};
use crate::currency::{Asset, CurrencyPair};
use crate::error::{Result, StreamError};

#[derive(Debug)]
struct BookEntry {
    depth: Depth,
    pending: UpdateBuffer,
}

/// Manages order books for multiple exchanges and pairs
#[derive(Debug, Default)]
pub struct OrderBookStore {
    books: DashMap<BookKey, BookEntry>,
    max_depth: usize,
}

impl OrderBookStore {
    /// Create a store that keeps every level
    pub fn new() -> Self {
        Self::with_depth(0)
    }

    /// Create with a depth cap applied to every book
    pub fn with_depth(max_depth: usize) -> Self {
        Self {
            books: DashMap::new(),
            max_depth,
        }
    }

    /// Install a complete snapshot
    ///
    /// Fails with `AlreadyExists` when a book is present and `allow_override`
    /// is false; the existing book is left untouched in that case.
    pub fn load_snapshot(&self, book: Book, exchange: &str, allow_override: bool) -> Result<Book> {
        let key = BookKey::new(exchange, book.pair.clone(), book.asset);
        let depth = Depth::from_snapshot(&book, self.max_depth);
        let copy = depth.to_book(&key);

        match self.books.entry(key) {
            Entry::Occupied(mut occupied) => {
                if !allow_override {
                    let key = occupied.key();
                    return Err(StreamError::AlreadyExists {
                        exchange: key.exchange.clone(),
                        pair: key.pair.clone(),
                        asset: key.asset,
                    });
                }
                occupied.insert(BookEntry {
                    depth,
                    pending: UpdateBuffer::new(),
                });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(BookEntry {
                    depth,
                    pending: UpdateBuffer::new(),
                });
            }
        }

        debug!(
            exchange = %copy.exchange,
            pair = %copy.pair,
            bids = copy.bids.len(),
            asks = copy.asks.len(),
            "Order book snapshot loaded"
        );
        Ok(copy)
    }

    /// Apply a delta to an existing book
    ///
    /// The delta must carry a timestamp strictly after the book's marker.
    pub fn update(
        &self,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        pair: &CurrencyPair,
        timestamp: DateTime<Utc>,
        exchange: &str,
        asset: Asset,
    ) -> Result<Book> {
        let key = BookKey::new(exchange, pair.clone(), asset);
        let mut entry = self
            .books
            .get_mut(&key)
            .ok_or_else(|| not_found(&key))?;

        let marker = entry.depth.last_updated();
        if timestamp <= marker {
            return Err(out_of_order(&key, marker, timestamp));
        }

        entry.depth.apply_delta(bids, asks, timestamp);
        Ok(entry.depth.to_book(&key))
    }

    /// Buffer a delta and drain the buffer once it holds `threshold` entries
    ///
    /// Returns `Ok(None)` while the batching window is still filling and the
    /// post-drain book once it has been applied. When the earliest buffered
    /// delta is older than the book, the buffer is dropped and
    /// `OutOfOrderUpdate` is returned without touching the book.
    pub fn buffer_update(
        &self,
        key: &BookKey,
        update: BufferedUpdate,
        threshold: usize,
    ) -> Result<Option<Book>> {
        let mut guard = self.books.get_mut(key).ok_or_else(|| not_found(key))?;
        let entry = &mut *guard;

        entry.pending.push(update);
        if entry.pending.len() < threshold.max(1) {
            return Ok(None);
        }

        let batch = entry.pending.take_sorted();
        let (earliest, latest) = match (batch.first(), batch.last()) {
            (Some(first), Some(last)) => (first.timestamp, last.timestamp),
            _ => return Ok(None),
        };

        let marker = entry.depth.last_updated();
        if marker > earliest {
            warn!(
                exchange = %key.exchange,
                pair = %key.pair,
                dropped = batch.len(),
                "Buffered update precedes book, dropping buffer"
            );
            return Err(out_of_order(key, marker, earliest));
        }

        for update in &batch {
            for level in &update.bids {
                entry.depth.apply_level(Side::Bid, level);
            }
            for level in &update.asks {
                entry.depth.apply_level(Side::Ask, level);
            }
        }
        entry.depth.finish_drain(latest);

        Ok(Some(entry.depth.to_book(key)))
    }

    /// Get a copy of a book
    pub fn get(&self, exchange: &str, pair: &CurrencyPair, asset: Asset) -> Result<Book> {
        let key = BookKey::new(exchange, pair.clone(), asset);
        self.books
            .get(&key)
            .map(|entry| entry.depth.to_book(&key))
            .ok_or_else(|| not_found(&key))
    }

    /// Drop a book together with its pending buffer
    pub fn remove(&self, key: &BookKey) -> bool {
        self.books.remove(key).is_some()
    }

    /// Drop every book of an exchange, returning how many were removed
    pub fn remove_exchange(&self, exchange: &str) -> usize {
        let exchange = exchange.to_lowercase();
        let before = self.books.len();
        self.books.retain(|key, _| key.exchange != exchange);
        before - self.books.len()
    }

    /// Number of deltas waiting in a book's buffer
    pub fn pending_updates(&self, key: &BookKey) -> Option<usize> {
        self.books.get(key).map(|entry| entry.pending.len())
    }

    /// Keys of all books being tracked
    pub fn keys(&self) -> Vec<BookKey> {
        self.books.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}

fn not_found(key: &BookKey) -> StreamError {
    StreamError::BookNotFound {
        exchange: key.exchange.clone(),
        pair: key.pair.clone(),
        asset: key.asset,
    }
}

fn out_of_order(key: &BookKey, book: DateTime<Utc>, update: DateTime<Utc>) -> StreamError {
    StreamError::OutOfOrderUpdate {
        exchange: key.exchange.clone(),
        pair: key.pair.clone(),
        book_marker: book.to_rfc3339(),
        update_marker: update.to_rfc3339(),
    }
}
