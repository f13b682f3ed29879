//! Pending update buffer for venues whose deltas must be batched before
//! they can be applied in a consistent order.

use chrono::{DateTime, Utc};

use super::PriceLevel;

/// A delta waiting in the buffer
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedUpdate {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    /// Highest per-level timestamp found in the frame
    pub timestamp: DateTime<Utc>,
}

impl BufferedUpdate {
    pub fn new(bids: Vec<PriceLevel>, asks: Vec<PriceLevel>, timestamp: DateTime<Utc>) -> Self {
        Self {
            bids,
            asks,
            timestamp,
        }
    }
}

/// Deltas accumulated for one book
#[derive(Debug, Default, Clone)]
pub struct UpdateBuffer {
    updates: Vec<BufferedUpdate>,
}

impl UpdateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, update: BufferedUpdate) {
        self.updates.push(update);
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn clear(&mut self) {
        self.updates.clear();
    }

    /// Drain the buffer sorted ascending by timestamp
    ///
    /// The sort is stable so equal timestamps keep arrival order.
    pub fn take_sorted(&mut self) -> Vec<BufferedUpdate> {
        let mut drained = std::mem::take(&mut self.updates);
        drained.sort_by_key(|u| u.timestamp);
        drained
    }
}
