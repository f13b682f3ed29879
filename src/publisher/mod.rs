//! Publisher module
//!
//! The fan-out decouples the dispatch loops from whoever consumes events. A
//! slow consumer never blocks a connection indefinitely: lossy events are
//! dropped when the queue is full and book/connection events wait at most
//! a bounded time.

mod ipc;

pub use ipc::IpcPublisher;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tracing::{debug, warn};

use crate::events::StreamEvent;
use crate::metrics;

/// Bounded event queue shared by every producing connection
#[derive(Clone)]
pub struct EventFanout {
    tx: mpsc::Sender<StreamEvent>,
    critical_timeout: Duration,
    dropped: Arc<AtomicU64>,
}

impl EventFanout {
    /// Create a fan-out and the receiving end for the consumer
    pub fn channel(capacity: usize, critical_timeout: Duration) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                critical_timeout,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Publish an event, returning whether it was queued
    pub async fn publish(&self, event: StreamEvent) -> bool {
        let kind = event.kind();

        if event.is_critical() {
            match self.tx.send_timeout(event, self.critical_timeout).await {
                Ok(()) => true,
                Err(SendTimeoutError::Timeout(_)) => {
                    self.record_drop(kind);
                    warn!(
                        kind,
                        timeout_ms = self.critical_timeout.as_millis() as u64,
                        "Event consumer stalled, dropping event"
                    );
                    false
                }
                Err(SendTimeoutError::Closed(_)) => {
                    debug!(kind, "Event consumer gone");
                    false
                }
            }
        } else {
            match self.tx.try_send(event) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    self.record_drop(kind);
                    warn!(kind, "Event queue full, dropping event");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(kind, "Event consumer gone");
                    false
                }
            }
        }
    }

    /// Total events dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn record_drop(&self, kind: &'static str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::event_dropped(kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::{Asset, CurrencyPair};
    use crate::orderbook::Book;
    use chrono::Utc;
    use std::time::Instant;

    fn error_event(n: u32) -> StreamEvent {
        StreamEvent::Error {
            exchange: "kraken".to_string(),
            message: format!("error {n}"),
        }
    }

    fn book_event() -> StreamEvent {
        StreamEvent::BookChanged(Book::snapshot(
            "kraken",
            CurrencyPair::new("XBT", "USD"),
            Asset::Spot,
            vec![],
            vec![],
            Utc::now(),
        ))
    }

    #[tokio::test]
    async fn test_lossy_events_dropped_when_full() {
        let (fanout, mut rx) = EventFanout::channel(2, Duration::from_millis(50));

        assert!(fanout.publish(error_event(1)).await);
        assert!(fanout.publish(error_event(2)).await);
        assert!(!fanout.publish(error_event(3)).await);
        assert_eq!(fanout.dropped(), 1);

        match rx.recv().await.unwrap() {
            StreamEvent::Error { message, .. } => assert_eq!(message, "error 1"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_book_events_wait_bounded_time() {
        let (fanout, _rx) = EventFanout::channel(1, Duration::from_millis(100));
        assert!(fanout.publish(book_event()).await);

        let started = Instant::now();
        assert!(!fanout.publish(book_event()).await);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(fanout.dropped(), 1);
    }

    #[tokio::test]
    async fn test_book_event_delivered_once_consumer_catches_up() {
        let (fanout, mut rx) = EventFanout::channel(1, Duration::from_secs(2));
        assert!(fanout.publish(book_event()).await);

        let consumer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut received = 0;
            while rx.recv().await.is_some() {
                received += 1;
                if received == 2 {
                    break;
                }
            }
            received
        });

        assert!(fanout.publish(book_event()).await);
        assert_eq!(consumer.await.unwrap(), 2);
        assert_eq!(fanout.dropped(), 0);
    }
}
