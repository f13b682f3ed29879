//! Exchange Stream - market data service
//!
//! Connects to a venue websocket, keeps its order books in sync and forwards
//! normalized events to other system components.

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Json, Router};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use exchange_stream::{
    metrics, Config, EventFanout, IpcPublisher, Kraken, OrderBookStore, StreamEvent,
    StreamManager, StreamVenue,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting Exchange Stream");

    let config = Config::load()?;
    let channels = config.channels()?;
    info!(exchange = %config.exchange, endpoint = %config.ws_endpoint, channels = channels.len(), "Configuration loaded");

    let venue: Arc<dyn StreamVenue> = match config.exchange.as_str() {
        "kraken" => {
            // Kraken's deepest subscription when the store keeps every level
            let depth = u32::try_from(config.book_depth)
                .ok()
                .filter(|d| *d > 0)
                .unwrap_or(1000);
            Arc::new(Kraken::new(depth, 1))
        }
        other => anyhow::bail!("unsupported exchange {other:?}"),
    };

    let store = Arc::new(OrderBookStore::with_depth(config.book_depth));
    let (fanout, events) = EventFanout::channel(
        config.event_buffer,
        Duration::from_millis(config.book_event_timeout_ms),
    );

    let manager = Arc::new(
        StreamManager::new(
            venue,
            config.transport(),
            store.clone(),
            fanout,
            config.stream_settings(),
        )
        .with_subscriptions(channels),
    );
    let shutdown = manager.shutdown_token();

    // Start health check server
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_port).await {
            warn!(error = %e, "Health server error");
        }
    });

    // Periodic book status
    tokio::spawn(log_book_status(store.clone(), shutdown.clone()));

    // Drain the fan-out
    let consumer = tokio::spawn(consume_events(
        events,
        config.ipc_socket_path.clone(),
        shutdown.clone(),
    ));

    let runner = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.run().await })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received shutdown signal"),
        result = runner => match result {
            Ok(Ok(())) => info!("Stream manager exited"),
            Ok(Err(e)) => warn!(error = %e, "Stream manager failed"),
            Err(e) => warn!(error = %e, "Stream manager panicked"),
        },
    }

    if !manager.shutdown().await {
        warn!("Shutdown grace period elapsed with tasks still running");
    }
    let _ = consumer.await;

    info!("Exchange Stream stopped");
    Ok(())
}

/// Forward events over IPC when a socket is configured, otherwise log them
async fn consume_events(
    mut events: mpsc::Receiver<StreamEvent>,
    socket_path: Option<String>,
    shutdown: CancellationToken,
) {
    if let Some(path) = socket_path {
        let publisher = IpcPublisher::new(&path).await;
        publisher.forward(events, shutdown).await;
        return;
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(StreamEvent::BookChanged(book)) => debug!(
                    exchange = %book.exchange,
                    pair = %book.pair,
                    update_id = book.update_id,
                    "Book changed"
                ),
                Some(event) => debug!(kind = event.kind(), "Event"),
                None => break,
            },
        }
    }
}

async fn log_book_status(store: Arc<OrderBookStore>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                for key in store.keys() {
                    if let Ok(book) = store.get(&key.exchange, &key.pair, key.asset) {
                        if let Some(mid) = book.mid_price() {
                            info!(
                                exchange = %key.exchange,
                                pair = %key.pair,
                                mid_price = %mid,
                                spread_bps = ?book.spread_bps(),
                                "Order book status"
                            );
                        }
                    }
                }
            }
        }
    }
}

/// Start HTTP server for health checks and metrics
async fn start_health_server(port: u16) -> anyhow::Result<()> {
    use std::net::SocketAddr;

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(addr = %addr, "Starting health check server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "component": "exchange-stream",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics_handler() -> String {
    metrics::encode()
}
