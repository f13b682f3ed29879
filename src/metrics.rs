//! Prometheus metrics for the streaming layer

use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, Encoder, IntCounterVec, TextEncoder};

const LABEL_EXCHANGE: &str = "exchange";
const LABEL_KIND: &str = "kind";

/// Frames read from venue sockets
static FRAMES_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "stream_frames_total",
        "Frames received per exchange and frame kind",
        &[LABEL_EXCHANGE, LABEL_KIND]
    )
    .expect("Failed to register frames_total metric")
});

/// Frames that could not be decoded or routed
static FRAMES_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "stream_frames_dropped_total",
        "Frames dropped by the dispatch loop",
        &[LABEL_EXCHANGE, LABEL_KIND]
    )
    .expect("Failed to register frames_dropped metric")
});

/// Book changes applied to the store
static BOOK_UPDATES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "stream_book_updates_total",
        "Snapshots and drains applied to the order book store",
        &[LABEL_EXCHANGE, LABEL_KIND]
    )
    .expect("Failed to register book_updates metric")
});

/// Resubscriptions triggered by desync
static RESYNCS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "stream_resyncs_total",
        "Channel resubscriptions after a desync",
        &[LABEL_EXCHANGE, LABEL_KIND]
    )
    .expect("Failed to register resyncs metric")
});

/// Events dropped by the fan-out
static EVENTS_DROPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "stream_events_dropped_total",
        "Events dropped because the consumer fell behind",
        &[LABEL_KIND]
    )
    .expect("Failed to register events_dropped metric")
});

pub fn frame_received(exchange: &str, kind: &str) {
    FRAMES_TOTAL.with_label_values(&[exchange, kind]).inc();
}

pub fn frame_dropped(exchange: &str, kind: &str) {
    FRAMES_DROPPED.with_label_values(&[exchange, kind]).inc();
}

pub fn book_updated(exchange: &str, kind: &str) {
    BOOK_UPDATES.with_label_values(&[exchange, kind]).inc();
}

pub fn resync(exchange: &str, kind: &str) {
    RESYNCS.with_label_values(&[exchange, kind]).inc();
}

pub fn event_dropped(kind: &str) {
    EVENTS_DROPPED.with_label_values(&[kind]).inc();
}

/// Render the default registry in the text exposition format
pub fn encode() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        frame_received("testex", "heartbeat");
        resync("testex", "book");
        let text = encode();
        assert!(text.contains("stream_frames_total"));
        assert!(text.contains("stream_resyncs_total"));
    }
}
