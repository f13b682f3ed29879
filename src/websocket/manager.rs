//! Stream connection manager
//!
//! Owns the task set of one venue connection (dispatch loop and heartbeat)
//! and handles reconnection with exponential backoff.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::{StreamConnection, TransportConfig};
use crate::currency::CurrencyPair;
use crate::dispatch::{BookSettings, DispatchState, Dispatcher};
use crate::error::{Result, StreamError};
use crate::events::StreamEvent;
use crate::orderbook::OrderBookStore;
use crate::publisher::EventFanout;
use crate::subscription::{ChannelKind, SubscriptionRegistry};
use crate::venue::StreamVenue;

/// Maximum backoff delay in milliseconds (60 seconds)
const MAX_BACKOFF_MS: u64 = 60_000;
/// Cooldown period after which reconnect attempts are reset (5 minutes)
const RECONNECT_COOLDOWN_SECS: u64 = 300;

/// Tunables for a managed stream
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub book: BookSettings,
    pub response_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    /// 0 retries forever
    pub max_reconnect_attempts: u32,
    pub shutdown_grace: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            book: BookSettings::default(),
            response_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_delay: Duration::from_millis(1000),
            max_reconnect_attempts: 0,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// One live connection and its channel table
pub struct Session {
    connection: Arc<StreamConnection>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<Dispatcher>,
    token: CancellationToken,
}

impl Session {
    pub fn connection(&self) -> &Arc<StreamConnection> {
        &self.connection
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn state(&self) -> DispatchState {
        self.dispatcher.state()
    }

    /// Wait until the connection's task set has been told to stop
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

/// Manages venue connections with automatic reconnection
pub struct StreamManager {
    venue: Arc<dyn StreamVenue>,
    transport: TransportConfig,
    store: Arc<OrderBookStore>,
    fanout: EventFanout,
    settings: StreamSettings,
    subscriptions: Vec<(ChannelKind, CurrencyPair)>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl StreamManager {
    pub fn new(
        venue: Arc<dyn StreamVenue>,
        transport: TransportConfig,
        store: Arc<OrderBookStore>,
        fanout: EventFanout,
        settings: StreamSettings,
    ) -> Self {
        Self {
            venue,
            transport,
            store,
            fanout,
            settings,
            subscriptions: Vec::new(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Channels subscribed on every (re)connect
    pub fn with_subscriptions(mut self, subscriptions: Vec<(ChannelKind, CurrencyPair)>) -> Self {
        self.subscriptions = subscriptions;
        self
    }

    /// Process-wide shutdown token
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Dial, start the connection's tasks and subscribe the configured channels
    ///
    /// A channel that fails to subscribe is reported as an error event; the
    /// connection stays up for the others.
    pub async fn start(&self) -> Result<Session> {
        let token = self.shutdown.child_token();
        let connection = Arc::new(StreamConnection::new(
            self.venue.name(),
            self.transport.clone(),
            token.clone(),
        ));
        connection.dial().await?;

        let registry = Arc::new(SubscriptionRegistry::new(
            connection.clone(),
            self.venue.clone(),
            self.settings.response_timeout,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            connection.clone(),
            registry.clone(),
            self.store.clone(),
            self.venue.clone(),
            self.fanout.clone(),
            self.tracker.clone(),
            token.clone(),
            self.settings.book,
        ));

        {
            let dispatcher = dispatcher.clone();
            self.tracker.spawn(async move { dispatcher.run().await });
        }
        self.tracker.spawn(heartbeat(
            connection.clone(),
            self.venue.clone(),
            self.settings.heartbeat_interval,
            token.clone(),
        ));

        for (kind, pair) in &self.subscriptions {
            if let Err(e) = registry.subscribe(*kind, pair.clone()).await {
                warn!(exchange = %self.venue.name(), %kind, %pair, error = %e, "Subscription failed");
                if matches!(e, StreamError::ShuttingDown) {
                    return Err(e);
                }
                self.fanout
                    .publish(StreamEvent::Error {
                        exchange: self.venue.name().to_string(),
                        message: e.to_string(),
                    })
                    .await;
            }
        }

        info!(
            exchange = %self.venue.name(),
            channels = registry.len(),
            "Stream started"
        );

        Ok(Session {
            connection,
            registry,
            dispatcher,
            token,
        })
    }

    /// Signal every task to stop and wait up to the grace period
    ///
    /// Returns false if some task was still running when the grace period
    /// ran out.
    pub async fn shutdown(&self) -> bool {
        info!(exchange = %self.venue.name(), "Shutting down stream");
        self.shutdown.cancel();
        self.tracker.close();

        match timeout(self.settings.shutdown_grace, self.tracker.wait()).await {
            Ok(()) => {
                info!(exchange = %self.venue.name(), "All stream tasks stopped");
                true
            }
            Err(_) => {
                warn!(
                    exchange = %self.venue.name(),
                    remaining = self.tracker.len(),
                    "Stream tasks still running after grace period"
                );
                false
            }
        }
    }

    /// Keep a connection up until shutdown
    ///
    /// Books and channel ids do not survive a reconnect: every book of the
    /// venue is dropped and all channels are subscribed from scratch.
    pub async fn run(&self) -> Result<()> {
        info!(exchange = %self.venue.name(), "Starting stream manager");

        let mut reconnect_attempts: u32 = 0;

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            match self.start().await {
                Ok(session) => {
                    let connected_at = Instant::now();

                    session.closed().await;
                    session.connection().close().await;

                    let dropped = self.store.remove_exchange(self.venue.name());
                    debug!(exchange = %self.venue.name(), dropped, "Dropped books of closed connection");

                    if self.shutdown.is_cancelled() {
                        return Ok(());
                    }

                    // A connection that stayed up for a while resets the backoff
                    if connected_at.elapsed() > Duration::from_secs(RECONNECT_COOLDOWN_SECS)
                        && reconnect_attempts > 0
                    {
                        info!(
                            previous_attempts = reconnect_attempts,
                            "Resetting reconnect counter after cooldown period"
                        );
                        reconnect_attempts = 0;
                    }
                    warn!(exchange = %self.venue.name(), "Connection ended, reconnecting");
                }
                Err(StreamError::ShuttingDown) => return Ok(()),
                Err(e) => {
                    error!(exchange = %self.venue.name(), error = %e, "Connect failed");
                }
            }

            reconnect_attempts += 1;
            if self.settings.max_reconnect_attempts > 0
                && reconnect_attempts > self.settings.max_reconnect_attempts
            {
                error!(attempts = reconnect_attempts - 1, "Giving up reconnecting");
                return Err(StreamError::MaxReconnectAttemptsExceeded);
            }

            // Exponential backoff, capped at MAX_BACKOFF_MS
            let base_delay = self.settings.reconnect_delay.as_millis() as u64
                * 2u64.pow(reconnect_attempts.min(6));
            let delay = Duration::from_millis(base_delay.min(MAX_BACKOFF_MS));

            warn!(
                attempt = reconnect_attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting after backoff"
            );
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = sleep(delay) => {}
            }
        }
    }
}

/// Keep the connection alive until `token` fires
async fn heartbeat(
    connection: Arc<StreamConnection>,
    venue: Arc<dyn StreamVenue>,
    period: Duration,
    token: CancellationToken,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let request_id = connection.generate_message_id(false);
                let sent = match venue.heartbeat_request(request_id) {
                    Some(request) => connection.send_message(&request).await,
                    None => connection.ping().await,
                };
                if let Err(e) = sent {
                    warn!(exchange = %venue.name(), error = %e, "Heartbeat failed");
                }
            }
        }
    }

    debug!(exchange = %venue.name(), "Heartbeat stopped");
}
