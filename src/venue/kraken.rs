//! Kraken public WebSocket (v1 framing)
//!
//! Control messages are JSON objects discriminated by `event`. Channel data
//! arrives as arrays: `[channelID, payload..., channelName, pair]`, where the
//! channel id is assigned in the subscription ack. Book levels carry their
//! own timestamps, so book deltas go through the buffered drain.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use tracing::trace;

use super::{
    AckStatus, BookMessage, CandleTick, ChannelId, ChannelPayload, Frame, SpreadTick,
    StreamVenue, SubscriptionAck, TickerTick, TradeTick,
};
use crate::currency::CurrencyPair;
use crate::error::{Result, StreamError};
use crate::orderbook::{BufferedUpdate, PriceLevel, Side};
use crate::subscription::ChannelKind;

/// Kraken public WebSocket URL
pub const KRAKEN_WS_URL: &str = "wss://ws.kraken.com";

const PAIR_DELIMITER: &str = "/";

/// Kraken venue adapter
#[derive(Debug, Clone)]
pub struct Kraken {
    /// Book depth requested on subscribe
    depth: u32,
    /// Candle interval in minutes
    ohlc_interval: u32,
}

impl Kraken {
    pub fn new(depth: u32, ohlc_interval: u32) -> Self {
        Self {
            depth,
            ohlc_interval,
        }
    }

    fn request(
        &self,
        event: &'static str,
        request_id: i64,
        kind: ChannelKind,
        pair: &CurrencyPair,
    ) -> Result<Value> {
        let subscription = SubscriptionSpec {
            name: channel_name(kind),
            depth: (kind == ChannelKind::Book).then_some(self.depth),
            interval: (kind == ChannelKind::Candle).then_some(self.ohlc_interval),
        };
        let request = SubscriptionRequest {
            event,
            reqid: request_id,
            pair: vec![pair.format_with(PAIR_DELIMITER)],
            subscription,
        };
        Ok(serde_json::to_value(request)?)
    }

    fn decode_event(&self, value: Value) -> Result<Frame> {
        let event: KrakenEvent = serde_json::from_value(value)?;
        Ok(match event {
            KrakenEvent::Heartbeat => Frame::Heartbeat,
            KrakenEvent::Pong { reqid } => Frame::Pong { request_id: reqid },
            KrakenEvent::SystemStatus { status } => Frame::SystemStatus { status },
            KrakenEvent::Error {
                reqid,
                error_message,
            } => Frame::Error {
                request_id: reqid,
                message: error_message.unwrap_or_default(),
            },
            KrakenEvent::SubscriptionStatus {
                channel_id,
                pair,
                status,
                subscription,
                error_message,
                reqid,
            } => {
                let status = match status.as_str() {
                    "subscribed" => AckStatus::Subscribed,
                    "unsubscribed" => AckStatus::Unsubscribed,
                    _ => AckStatus::Error(error_message.unwrap_or(status)),
                };
                Frame::SubscriptionStatus(SubscriptionAck {
                    request_id: reqid,
                    channel_id: channel_id.map(ChannelId::Number),
                    pair: pair
                        .as_deref()
                        .map(|p| CurrencyPair::parse(p, PAIR_DELIMITER))
                        .transpose()?,
                    kind: subscription.and_then(|s| kind_from_name(&s.name)),
                    status,
                })
            }
        })
    }

    fn decode_channel(&self, items: Vec<Value>) -> Result<Frame> {
        if items.len() < 4 {
            return Err(StreamError::Decode(format!(
                "channel frame has {} elements",
                items.len()
            )));
        }

        let channel_id = items[0]
            .as_i64()
            .map(ChannelId::Number)
            .ok_or_else(|| StreamError::Decode("channel id is not an integer".to_string()))?;
        let name = items[items.len() - 2]
            .as_str()
            .ok_or_else(|| StreamError::Decode("channel name is not a string".to_string()))?;
        let body = &items[1..items.len() - 2];

        let payload = match kind_from_name(name) {
            Some(ChannelKind::Book) => ChannelPayload::Book(decode_book(body)?),
            Some(ChannelKind::Trade) => ChannelPayload::Trades(decode_trades(&body[0])?),
            Some(ChannelKind::Ticker) => ChannelPayload::Ticker(decode_ticker(&body[0])?),
            Some(ChannelKind::Spread) => ChannelPayload::Spread(decode_spread(&body[0])?),
            Some(ChannelKind::Candle) => ChannelPayload::Candle(decode_candle(&body[0])?),
            None => {
                return Err(StreamError::Decode(format!("unknown channel {name}")));
            }
        };

        Ok(Frame::Channel {
            channel_id,
            payload,
        })
    }
}

impl Default for Kraken {
    fn default() -> Self {
        Self::new(10, 1)
    }
}

impl StreamVenue for Kraken {
    fn name(&self) -> &str {
        "kraken"
    }

    fn subscribe_request(
        &self,
        request_id: i64,
        kind: ChannelKind,
        pair: &CurrencyPair,
    ) -> Result<Value> {
        self.request("subscribe", request_id, kind, pair)
    }

    fn unsubscribe_request(
        &self,
        request_id: i64,
        kind: ChannelKind,
        pair: &CurrencyPair,
    ) -> Result<Value> {
        self.request("unsubscribe", request_id, kind, pair)
    }

    fn heartbeat_request(&self, request_id: i64) -> Option<Value> {
        Some(serde_json::json!({"event": "ping", "reqid": request_id}))
    }

    fn decode(&self, raw: &str) -> Result<Frame> {
        let value: Value = serde_json::from_str(raw)?;
        trace!(raw = %raw, "Decoding Kraken frame");
        match value {
            Value::Object(_) => self.decode_event(value),
            Value::Array(items) => self.decode_channel(items),
            other => Err(StreamError::Decode(format!("unexpected frame {other}"))),
        }
    }
}

#[derive(Debug, Serialize)]
struct SubscriptionRequest {
    event: &'static str,
    reqid: i64,
    pair: Vec<String>,
    subscription: SubscriptionSpec,
}

#[derive(Debug, Serialize)]
struct SubscriptionSpec {
    name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    depth: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    interval: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionInfo {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
enum KrakenEvent {
    Heartbeat,
    Pong {
        reqid: Option<i64>,
    },
    SystemStatus {
        status: String,
    },
    SubscriptionStatus {
        #[serde(rename = "channelID")]
        channel_id: Option<i64>,
        pair: Option<String>,
        status: String,
        subscription: Option<SubscriptionInfo>,
        #[serde(rename = "errorMessage")]
        error_message: Option<String>,
        reqid: Option<i64>,
    },
    Error {
        reqid: Option<i64>,
        #[serde(rename = "errorMessage")]
        error_message: Option<String>,
    },
}

fn channel_name(kind: ChannelKind) -> &'static str {
    match kind {
        ChannelKind::Book => "book",
        ChannelKind::Trade => "trade",
        ChannelKind::Ticker => "ticker",
        ChannelKind::Spread => "spread",
        ChannelKind::Candle => "ohlc",
    }
}

/// Channel names carry suffixes such as `book-10` or `ohlc-5`
fn kind_from_name(name: &str) -> Option<ChannelKind> {
    match name.split('-').next()? {
        "book" => Some(ChannelKind::Book),
        "trade" => Some(ChannelKind::Trade),
        "ticker" => Some(ChannelKind::Ticker),
        "spread" => Some(ChannelKind::Spread),
        "ohlc" => Some(ChannelKind::Candle),
        _ => None,
    }
}

/// Book frames hold one object, or two when bids and asks changed together
fn decode_book(body: &[Value]) -> Result<BookMessage> {
    let mut bids = Vec::new();
    let mut asks = Vec::new();
    let mut latest: Option<DateTime<Utc>> = None;
    let mut snapshot = false;

    for part in body {
        let object = part
            .as_object()
            .ok_or_else(|| StreamError::Decode("book payload is not an object".to_string()))?;

        for (key, levels) in object {
            let side = match key.as_str() {
                "bs" => {
                    snapshot = true;
                    &mut bids
                }
                "as" => {
                    snapshot = true;
                    &mut asks
                }
                "b" => &mut bids,
                "a" => &mut asks,
                // checksum
                _ => continue,
            };

            let levels = levels
                .as_array()
                .ok_or_else(|| StreamError::Decode(format!("book side {key} is not an array")))?;
            for level in levels {
                let (price_level, at) = decode_level(level)?;
                side.push(price_level);
                latest = Some(latest.map_or(at, |l| l.max(at)));
            }
        }
    }

    if snapshot {
        Ok(BookMessage::Snapshot {
            bids,
            asks,
            timestamp: latest.unwrap_or(DateTime::<Utc>::MIN_UTC),
        })
    } else {
        let timestamp =
            latest.ok_or_else(|| StreamError::Decode("book update has no levels".to_string()))?;
        Ok(BookMessage::Update(BufferedUpdate::new(bids, asks, timestamp)))
    }
}

/// `[price, volume, timestamp]` with an optional trailing republish flag
fn decode_level(level: &Value) -> Result<(PriceLevel, DateTime<Utc>)> {
    let fields = fields(level, 3, "book level")?;
    Ok((
        PriceLevel::new(decimal(&fields[0])?, decimal(&fields[1])?),
        timestamp(&fields[2])?,
    ))
}

fn decode_trades(body: &Value) -> Result<Vec<TradeTick>> {
    let trades = body
        .as_array()
        .ok_or_else(|| StreamError::Decode("trade payload is not an array".to_string()))?;

    trades
        .iter()
        .map(|trade| {
            let fields = fields(trade, 4, "trade")?;
            let side = match fields[3].as_str() {
                Some("b") => Side::Bid,
                Some("s") => Side::Ask,
                other => {
                    return Err(StreamError::Decode(format!("unknown trade side {other:?}")));
                }
            };
            Ok(TradeTick {
                price: decimal(&fields[0])?,
                amount: decimal(&fields[1])?,
                side,
                timestamp: timestamp(&fields[2])?,
            })
        })
        .collect()
}

fn decode_ticker(body: &Value) -> Result<TickerTick> {
    // Each field is an array; index 0 is today/price, index 1 the 24h value
    let pick = |key: &str, index: usize| -> Result<Decimal> {
        let field = body
            .get(key)
            .and_then(|v| v.get(index))
            .ok_or_else(|| StreamError::Decode(format!("ticker missing {key}[{index}]")))?;
        decimal(field)
    };

    Ok(TickerTick {
        bid: pick("b", 0)?,
        ask: pick("a", 0)?,
        last: pick("c", 0)?,
        volume: pick("v", 1)?,
        high: pick("h", 1)?,
        low: pick("l", 1)?,
        open: pick("o", 1)?,
    })
}

fn decode_spread(body: &Value) -> Result<SpreadTick> {
    let fields = fields(body, 5, "spread")?;
    Ok(SpreadTick {
        bid: decimal(&fields[0])?,
        ask: decimal(&fields[1])?,
        timestamp: timestamp(&fields[2])?,
        bid_amount: decimal(&fields[3])?,
        ask_amount: decimal(&fields[4])?,
    })
}

fn decode_candle(body: &Value) -> Result<CandleTick> {
    let fields = fields(body, 8, "ohlc")?;
    Ok(CandleTick {
        start: timestamp(&fields[0])?,
        end: timestamp(&fields[1])?,
        open: decimal(&fields[2])?,
        high: decimal(&fields[3])?,
        low: decimal(&fields[4])?,
        close: decimal(&fields[5])?,
        volume: decimal(&fields[7])?,
    })
}

fn fields<'a>(value: &'a Value, min: usize, what: &str) -> Result<&'a Vec<Value>> {
    match value.as_array() {
        Some(fields) if fields.len() >= min => Ok(fields),
        _ => Err(StreamError::Decode(format!(
            "{what} needs at least {min} fields: {value}"
        ))),
    }
}

fn decimal(value: &Value) -> Result<Decimal> {
    let parsed = match value {
        Value::String(s) => Decimal::from_str(s),
        Value::Number(n) => Decimal::from_str(&n.to_string()),
        other => return Err(StreamError::Decode(format!("expected decimal, got {other}"))),
    };
    parsed.map_err(|e| StreamError::Decode(format!("invalid decimal {value}: {e}")))
}

/// Seconds since the epoch with a fractional part, e.g. `"1534614057.321597"`
fn timestamp(value: &Value) -> Result<DateTime<Utc>> {
    let seconds = decimal(value)?;
    let whole = seconds.trunc();
    let nanos = ((seconds - whole) * Decimal::from(1_000_000_000u32))
        .round()
        .to_u32();

    match (whole.to_i64(), nanos) {
        (Some(secs), Some(nanos)) => Utc
            .timestamp_opt(secs, nanos)
            .single()
            .ok_or_else(|| StreamError::Decode(format!("timestamp out of range: {value}"))),
        _ => Err(StreamError::Decode(format!("invalid timestamp {value}"))),
    }
}
