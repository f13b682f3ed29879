//! Subscription registry
//!
//! Maps venue-assigned channel ids back to the (pair, kind) they carry. The
//! registry lives exactly as long as its connection: ids are not stable
//! across reconnects.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::currency::CurrencyPair;
use crate::error::{Result, StreamError};
use crate::venue::{AckStatus, ChannelId, Frame, StreamVenue, SubscriptionAck};
use crate::websocket::StreamConnection;

/// Kind of data a channel carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Ticker,
    Trade,
    Book,
    Candle,
    Spread,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Ticker => "ticker",
            ChannelKind::Trade => "trade",
            ChannelKind::Book => "book",
            ChannelKind::Candle => "candle",
            ChannelKind::Spread => "spread",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "ticker" => Ok(ChannelKind::Ticker),
            "trade" | "trades" => Ok(ChannelKind::Trade),
            "book" | "orderbook" => Ok(ChannelKind::Book),
            "candle" | "ohlc" => Ok(ChannelKind::Candle),
            "spread" => Ok(ChannelKind::Spread),
            other => Err(StreamError::Config(format!("unknown channel kind {other:?}"))),
        }
    }
}

/// A live channel on the current connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSubscription {
    pub channel_id: ChannelId,
    pub pair: CurrencyPair,
    pub kind: ChannelKind,
}

#[derive(Debug)]
struct RegistryEntry {
    subscription: ChannelSubscription,
    resyncing: bool,
}

/// Channel table of one connection
pub struct SubscriptionRegistry {
    connection: Arc<StreamConnection>,
    venue: Arc<dyn StreamVenue>,
    response_timeout: Duration,
    channels: DashMap<ChannelId, RegistryEntry>,
}

impl SubscriptionRegistry {
    pub fn new(
        connection: Arc<StreamConnection>,
        venue: Arc<dyn StreamVenue>,
        response_timeout: Duration,
    ) -> Self {
        Self {
            connection,
            venue,
            response_timeout,
            channels: DashMap::new(),
        }
    }

    /// Subscribe and wait for the venue to acknowledge
    ///
    /// The channel entry is created by the dispatch loop when the ack frame
    /// arrives; this call only reports the outcome.
    pub async fn subscribe(&self, kind: ChannelKind, pair: CurrencyPair) -> Result<()> {
        let request_id = self.connection.generate_message_id(false);
        let request = self.venue.subscribe_request(request_id, kind, &pair)?;

        info!(exchange = %self.venue.name(), %kind, %pair, request_id, "Subscribing");
        let reply = self
            .connection
            .send_message_return_response(request_id, &request, self.response_timeout)
            .await?;

        match self.venue.decode(&reply)? {
            Frame::SubscriptionStatus(SubscriptionAck {
                status: AckStatus::Subscribed,
                channel_id,
                ..
            }) => {
                info!(exchange = %self.venue.name(), %kind, %pair, channel = ?channel_id, "Subscribed");
                Ok(())
            }
            Frame::SubscriptionStatus(SubscriptionAck {
                status: AckStatus::Error(message),
                ..
            })
            | Frame::Error { message, .. } => Err(StreamError::SubscriptionFailed(format!(
                "{kind} {pair}: {message}"
            ))),
            other => Err(StreamError::SubscriptionFailed(format!(
                "{kind} {pair}: unexpected {} reply",
                other.kind()
            ))),
        }
    }

    /// Unsubscribe and wait for the ack
    ///
    /// Unsubscribing a channel that is already gone is a no-op, as is a venue
    /// reporting that it no longer knows the subscription.
    pub async fn unsubscribe(&self, kind: ChannelKind, pair: &CurrencyPair) -> Result<()> {
        let Some(channel_id) = self.find(kind, pair) else {
            debug!(exchange = %self.venue.name(), %kind, %pair, "No live channel to unsubscribe");
            return Ok(());
        };

        let request_id = self.connection.generate_message_id(false);
        let request = self.venue.unsubscribe_request(request_id, kind, pair)?;

        info!(exchange = %self.venue.name(), %kind, %pair, channel = %channel_id, "Unsubscribing");
        let reply = self
            .connection
            .send_message_return_response(request_id, &request, self.response_timeout)
            .await?;

        match self.venue.decode(&reply)? {
            Frame::SubscriptionStatus(SubscriptionAck {
                status: AckStatus::Error(message),
                ..
            })
            | Frame::Error { message, .. } => {
                warn!(exchange = %self.venue.name(), %kind, %pair, %message, "Venue rejected unsubscribe, dropping channel");
            }
            _ => {}
        }

        self.channels.remove(&channel_id);
        Ok(())
    }

    /// Unsubscribe then subscribe again to get a fresh snapshot
    ///
    /// Goes through the same calls as user-driven subscriptions.
    pub async fn resubscribe(&self, kind: ChannelKind, pair: CurrencyPair) -> Result<()> {
        if let Err(e) = self.unsubscribe(kind, &pair).await {
            warn!(exchange = %self.venue.name(), %kind, %pair, error = %e, "Unsubscribe failed during resync");
            if let Some(channel_id) = self.find(kind, &pair) {
                self.channels.remove(&channel_id);
            }
        }
        self.subscribe(kind, pair).await
    }

    /// Record the effect of an ack frame
    pub fn apply_ack(&self, ack: &SubscriptionAck) {
        match (&ack.status, &ack.channel_id) {
            (AckStatus::Subscribed, Some(channel_id)) => match (&ack.pair, ack.kind) {
                (Some(pair), Some(kind)) => {
                    debug!(channel = %channel_id, %kind, %pair, "Channel live");
                    self.channels.insert(
                        channel_id.clone(),
                        RegistryEntry {
                            subscription: ChannelSubscription {
                                channel_id: channel_id.clone(),
                                pair: pair.clone(),
                                kind,
                            },
                            resyncing: false,
                        },
                    );
                }
                _ => warn!(channel = %channel_id, "Subscription ack without pair or kind"),
            },
            (AckStatus::Unsubscribed, Some(channel_id)) => {
                self.channels.remove(channel_id);
            }
            (AckStatus::Unsubscribed, None) => {
                if let (Some(pair), Some(kind)) = (&ack.pair, ack.kind) {
                    if let Some(channel_id) = self.find(kind, pair) {
                        self.channels.remove(&channel_id);
                    }
                }
            }
            _ => {}
        }
    }

    /// Map a channel id to its subscription
    ///
    /// Channels being resynced resolve to None so their late frames are
    /// dropped.
    pub fn resolve(&self, channel_id: &ChannelId) -> Option<ChannelSubscription> {
        self.channels
            .get(channel_id)
            .filter(|entry| !entry.resyncing)
            .map(|entry| entry.subscription.clone())
    }

    /// Flag a channel for resync; None if unknown or already flagged
    pub fn begin_resync(&self, channel_id: &ChannelId) -> Option<ChannelSubscription> {
        let mut entry = self.channels.get_mut(channel_id)?;
        if entry.resyncing {
            return None;
        }
        entry.resyncing = true;
        Some(entry.subscription.clone())
    }

    pub fn is_resyncing(&self, channel_id: &ChannelId) -> bool {
        self.channels
            .get(channel_id)
            .map(|entry| entry.resyncing)
            .unwrap_or(false)
    }

    /// Drop a channel without talking to the venue
    pub fn forget(&self, channel_id: &ChannelId) {
        self.channels.remove(channel_id);
    }

    /// Channel id of a live (kind, pair) subscription
    pub fn find(&self, kind: ChannelKind, pair: &CurrencyPair) -> Option<ChannelId> {
        self.channels
            .iter()
            .find(|entry| entry.subscription.kind == kind && &entry.subscription.pair == pair)
            .map(|entry| entry.key().clone())
    }

    pub fn active(&self) -> Vec<ChannelSubscription> {
        self.channels
            .iter()
            .map(|entry| entry.subscription.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Forget every channel; called on connection teardown
    pub fn clear(&self) {
        self.channels.clear();
    }
}
