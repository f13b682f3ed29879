//! Dispatch loop
//!
//! The single reader of a connection. Control-plane frames are handled
//! inline, channel data is routed to the book store or turned into events.

use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::error::StreamError;
use crate::events::StreamEvent;
use crate::metrics;
use crate::orderbook::{Book, BookKey, OrderBookStore};
use crate::publisher::EventFanout;
use crate::subscription::{ChannelSubscription, SubscriptionRegistry};
use crate::venue::{BookMessage, ChannelId, ChannelPayload, Frame, StreamVenue};
use crate::websocket::StreamConnection;

/// Lifecycle of a dispatch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

/// Book handling knobs
#[derive(Debug, Clone, Copy)]
pub struct BookSettings {
    /// Deltas buffered before a drain; 1 applies every delta directly
    pub batch_size: usize,
    pub allow_snapshot_override: bool,
}

impl Default for BookSettings {
    fn default() -> Self {
        Self {
            batch_size: 1,
            allow_snapshot_override: true,
        }
    }
}

pub struct Dispatcher {
    connection: Arc<StreamConnection>,
    registry: Arc<SubscriptionRegistry>,
    store: Arc<OrderBookStore>,
    venue: Arc<dyn StreamVenue>,
    fanout: EventFanout,
    tracker: TaskTracker,
    token: CancellationToken,
    settings: BookSettings,
    state: watch::Sender<DispatchState>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection: Arc<StreamConnection>,
        registry: Arc<SubscriptionRegistry>,
        store: Arc<OrderBookStore>,
        venue: Arc<dyn StreamVenue>,
        fanout: EventFanout,
        tracker: TaskTracker,
        token: CancellationToken,
        settings: BookSettings,
    ) -> Self {
        let (state, _) = watch::channel(DispatchState::Idle);
        Self {
            connection,
            registry,
            store,
            venue,
            fanout,
            tracker,
            token,
            settings,
            state,
        }
    }

    pub fn state(&self) -> DispatchState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn watch_state(&self) -> watch::Receiver<DispatchState> {
        self.state.subscribe()
    }

    /// Read and route frames until shutdown or a transport failure
    pub async fn run(&self) {
        self.state.send_replace(DispatchState::Running);
        info!(exchange = %self.venue.name(), "Dispatch loop running");

        let failure = loop {
            match self.connection.read_message().await {
                Ok(raw) => self.handle(&raw).await,
                Err(StreamError::ShuttingDown) => break None,
                Err(e) => break Some(e),
            }
        };

        self.state.send_replace(DispatchState::ShuttingDown);

        // Unwinds the heartbeat and any response waiter on this connection
        self.token.cancel();
        self.registry.clear();

        if let Some(e) = failure {
            error!(exchange = %self.venue.name(), error = %e, "Connection lost");
            self.fanout
                .publish(StreamEvent::ConnectionLost {
                    exchange: self.venue.name().to_string(),
                    reason: e.to_string(),
                })
                .await;
        }

        self.state.send_replace(DispatchState::Stopped);
        info!(exchange = %self.venue.name(), "Dispatch loop stopped");
    }

    /// Classify and route one raw frame
    pub async fn handle(&self, raw: &str) {
        let exchange = self.venue.name();
        let frame = match self.venue.decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                metrics::frame_dropped(exchange, "undecodable");
                warn!(exchange, error = %e, raw, "Dropping undecodable frame");
                return;
            }
        };
        metrics::frame_received(exchange, frame.kind());

        match frame {
            Frame::Heartbeat => trace!(exchange, "Heartbeat"),
            Frame::Pong { request_id } => {
                if let Some(id) = request_id {
                    self.connection.resolve(id, raw.to_string());
                }
            }
            Frame::SystemStatus { status } => info!(exchange, %status, "Venue status"),
            Frame::SubscriptionStatus(ack) => {
                // Register the channel before waking the subscriber so the
                // frame right after the ack already resolves
                self.registry.apply_ack(&ack);
                if let Some(id) = ack.request_id {
                    if !self.connection.resolve(id, raw.to_string()) {
                        debug!(exchange, request_id = id, "Ack with no waiter");
                    }
                }
            }
            Frame::Error { request_id, message } => {
                let resolved = request_id
                    .map(|id| self.connection.resolve(id, raw.to_string()))
                    .unwrap_or(false);
                if !resolved {
                    warn!(exchange, %message, "Venue error");
                    self.fanout
                        .publish(StreamEvent::Error {
                            exchange: exchange.to_string(),
                            message,
                        })
                        .await;
                }
            }
            Frame::Channel { channel_id, payload } => self.route(channel_id, payload).await,
        }
    }

    async fn route(&self, channel_id: ChannelId, payload: ChannelPayload) {
        let exchange = self.venue.name();
        let Some(sub) = self.registry.resolve(&channel_id) else {
            metrics::frame_dropped(exchange, "unknown_channel");
            debug!(exchange, channel = %channel_id, "Frame for unknown or resyncing channel");
            return;
        };
        if sub.kind != payload.kind() {
            metrics::frame_dropped(exchange, "kind_mismatch");
            warn!(
                exchange,
                channel = %channel_id,
                expected = %sub.kind,
                got = %payload.kind(),
                "Channel payload does not match subscription"
            );
            return;
        }

        let asset = self.venue.asset();
        match payload {
            ChannelPayload::Book(message) => self.book(sub, message).await,
            ChannelPayload::Trades(ticks) => {
                for tick in ticks {
                    self.fanout
                        .publish(StreamEvent::Trade(tick.into_event(exchange, &sub.pair, asset)))
                        .await;
                }
            }
            ChannelPayload::Ticker(tick) => {
                self.fanout
                    .publish(StreamEvent::Ticker(tick.into_event(exchange, &sub.pair, asset)))
                    .await;
            }
            ChannelPayload::Spread(tick) => {
                self.fanout
                    .publish(StreamEvent::Spread(tick.into_event(exchange, &sub.pair, asset)))
                    .await;
            }
            ChannelPayload::Candle(tick) => {
                self.fanout
                    .publish(StreamEvent::Candle(tick.into_event(exchange, &sub.pair, asset)))
                    .await;
            }
        }
    }

    async fn book(&self, sub: ChannelSubscription, message: BookMessage) {
        let exchange = self.venue.name();
        let asset = self.venue.asset();
        let label = match &message {
            BookMessage::Snapshot { .. } => "snapshot",
            BookMessage::Update(_) => "delta",
        };

        let result = match message {
            BookMessage::Snapshot {
                bids,
                asks,
                timestamp,
            } => {
                let book = Book::snapshot(exchange, sub.pair.clone(), asset, bids, asks, timestamp);
                self.store
                    .load_snapshot(book, exchange, self.settings.allow_snapshot_override)
                    .map(Some)
            }
            BookMessage::Update(update) if self.settings.batch_size <= 1 => self
                .store
                .update(
                    &update.bids,
                    &update.asks,
                    &sub.pair,
                    update.timestamp,
                    exchange,
                    asset,
                )
                .map(Some),
            BookMessage::Update(update) => {
                let key = BookKey::new(exchange, sub.pair.clone(), asset);
                self.store
                    .buffer_update(&key, update, self.settings.batch_size)
            }
        };

        match result {
            Ok(Some(book)) => {
                metrics::book_updated(exchange, label);
                self.fanout.publish(StreamEvent::BookChanged(book)).await;
            }
            Ok(None) => {}
            Err(e) if e.is_desync() => self.resync(sub, e).await,
            Err(e) => {
                warn!(exchange, pair = %sub.pair, error = %e, "Book frame rejected");
                self.fanout
                    .publish(StreamEvent::Error {
                        exchange: exchange.to_string(),
                        message: e.to_string(),
                    })
                    .await;
            }
        }
    }

    /// Throw the book away and fetch a fresh snapshot
    ///
    /// The resubscribe runs on the tracker: it waits for acks that only this
    /// loop can deliver.
    async fn resync(&self, sub: ChannelSubscription, cause: StreamError) {
        let exchange = self.venue.name().to_string();
        if self.registry.begin_resync(&sub.channel_id).is_none() {
            return;
        }

        warn!(exchange = %exchange, pair = %sub.pair, error = %cause, "Book desynchronised, resubscribing");
        metrics::resync(&exchange, sub.kind.as_str());
        self.store
            .remove(&BookKey::new(&exchange, sub.pair.clone(), self.venue.asset()));
        self.fanout
            .publish(StreamEvent::Error {
                exchange: exchange.clone(),
                message: cause.to_string(),
            })
            .await;

        let registry = self.registry.clone();
        let fanout = self.fanout.clone();
        self.tracker.spawn(async move {
            if let Err(e) = registry.resubscribe(sub.kind, sub.pair.clone()).await {
                error!(exchange = %exchange, pair = %sub.pair, error = %e, "Resubscribe failed");
                registry.forget(&sub.channel_id);
                fanout
                    .publish(StreamEvent::Error {
                        exchange,
                        message: format!("resubscribe {} {} failed: {e}", sub.kind, sub.pair),
                    })
                    .await;
            }
        });
    }
}
