//! End-to-end tests against a local Kraken-style websocket server

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};

use exchange_stream::venue::ChannelId;
use exchange_stream::{
    Asset, BookSettings, ChannelKind, CurrencyPair, DispatchState, EventFanout, Kraken,
    OrderBookStore, StreamError, StreamEvent, StreamManager, StreamSettings, TransportConfig,
};

/// Pair the fake venue never acknowledges
const SILENT_PAIR: &str = "SIL/ENT";

struct FakeVenue {
    url: String,
    /// Raw frames to push to the client
    push: mpsc::UnboundedSender<String>,
    /// Every request the client sent
    requests: mpsc::UnboundedReceiver<Value>,
}

/// Accept one connection and behave like Kraken's control plane
///
/// Channel ids are handed out from 1 upwards, a fresh one per subscribe.
async fn spawn_venue() -> FakeVenue {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<String>();
    let (req_tx, req_rx) = mpsc::unbounded_channel::<Value>();

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(tcp).await.unwrap();
        let mut next_channel = 1;
        let mut channels: Vec<(String, String, i64)> = Vec::new();

        loop {
            tokio::select! {
                frame = push_rx.recv() => match frame {
                    Some(frame) if frame == "CLOSE" => {
                        let _ = ws.close(None).await;
                        break;
                    }
                    Some(frame) => {
                        if ws.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                msg = ws.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(_)) => continue,
                        _ => break,
                    };
                    let request: Value = serde_json::from_str(&text).unwrap();
                    let _ = req_tx.send(request.clone());

                    let reqid = request["reqid"].clone();
                    let pair = request["pair"][0].as_str().unwrap_or_default().to_string();
                    let name = request["subscription"]["name"].as_str().unwrap_or_default().to_string();

                    let reply = match request["event"].as_str() {
                        Some("ping") => Some(json!({"event": "pong", "reqid": reqid})),
                        Some("subscribe") if pair == SILENT_PAIR => None,
                        Some("subscribe") => {
                            let id = next_channel;
                            next_channel += 1;
                            channels.push((name.clone(), pair.clone(), id));
                            Some(json!({
                                "channelID": id,
                                "channelName": name,
                                "event": "subscriptionStatus",
                                "pair": pair,
                                "reqid": reqid,
                                "status": "subscribed",
                                "subscription": {"name": name}
                            }))
                        }
                        Some("unsubscribe") => {
                            let position = channels.iter().position(|(n, p, _)| n == &name && p == &pair);
                            match position {
                                Some(index) => {
                                    let (_, _, id) = channels.remove(index);
                                    Some(json!({
                                        "channelID": id,
                                        "channelName": name,
                                        "event": "subscriptionStatus",
                                        "pair": pair,
                                        "reqid": reqid,
                                        "status": "unsubscribed",
                                        "subscription": {"name": name}
                                    }))
                                }
                                None => Some(json!({
                                    "errorMessage": "Subscription Not Found",
                                    "event": "subscriptionStatus",
                                    "pair": pair,
                                    "reqid": reqid,
                                    "status": "error",
                                    "subscription": {"name": name}
                                })),
                            }
                        }
                        _ => None,
                    };

                    if let Some(reply) = reply {
                        if ws.send(Message::Text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });

    FakeVenue {
        url: format!("ws://{addr}"),
        push: push_tx,
        requests: req_rx,
    }
}

fn book_frame(channel: i64, key: &str, levels: Value) -> String {
    json!([channel, {key: levels}, "book-10", "XBT/USD"]).to_string()
}

fn settings() -> StreamSettings {
    StreamSettings {
        book: BookSettings {
            batch_size: 1,
            allow_snapshot_override: true,
        },
        response_timeout: Duration::from_secs(1),
        heartbeat_interval: Duration::from_millis(200),
        reconnect_delay: Duration::from_millis(50),
        max_reconnect_attempts: 1,
        shutdown_grace: Duration::from_secs(2),
    }
}

fn manager(
    url: &str,
    settings: StreamSettings,
    subscriptions: Vec<(ChannelKind, CurrencyPair)>,
) -> (StreamManager, Arc<OrderBookStore>, mpsc::Receiver<StreamEvent>) {
    let store = Arc::new(OrderBookStore::new());
    let (fanout, events) = EventFanout::channel(256, Duration::from_millis(500));
    let manager = StreamManager::new(
        Arc::new(Kraken::default()),
        TransportConfig::new(url),
        store.clone(),
        fanout,
        settings,
    )
    .with_subscriptions(subscriptions);
    (manager, store, events)
}

fn xbt() -> CurrencyPair {
    CurrencyPair::new("XBT", "USD")
}

/// Next fan-out event, within a deadline
async fn next_event(events: &mut mpsc::Receiver<StreamEvent>) -> StreamEvent {
    timeout(Duration::from_secs(3), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("fan-out closed")
}

/// Next request with the given event name
async fn next_request(venue: &mut FakeVenue, event: &str) -> Value {
    timeout(Duration::from_secs(3), async {
        loop {
            let request = venue.requests.recv().await.expect("venue gone");
            if request["event"] == event {
                return request;
            }
        }
    })
    .await
    .expect("timed out waiting for request")
}

#[tokio::test]
async fn test_snapshot_and_deltas_converge() {
    let mut venue = spawn_venue().await;
    let (manager, store, mut events) =
        manager(&venue.url, settings(), vec![(ChannelKind::Book, xbt())]);

    let session = manager.start().await.unwrap();
    assert_eq!(session.state(), DispatchState::Running);
    assert_eq!(session.registry().len(), 1);
    let subscribe = next_request(&mut venue, "subscribe").await;
    assert_eq!(subscribe["subscription"]["name"], "book");

    venue
        .push
        .send(book_frame(
            1,
            "bs",
            json!([["100.0", "1.0", "1.000000"], ["99.0", "2.0", "1.000000"]]),
        ))
        .unwrap();
    assert!(matches!(next_event(&mut events).await, StreamEvent::BookChanged(_)));

    venue
        .push
        .send(book_frame(
            1,
            "b",
            json!([["100.0", "0.00000000", "2.000000"], ["98.5", "3.0", "2.000000"]]),
        ))
        .unwrap();

    match next_event(&mut events).await {
        StreamEvent::BookChanged(book) => {
            assert_eq!(book.bids.len(), 2);
            assert_eq!(book.bids[0].price, dec!(99.0));
            assert_eq!(book.bids[0].amount, dec!(2.0));
            assert_eq!(book.bids[1].price, dec!(98.5));
            assert_eq!(book.bids[1].amount, dec!(3.0));
        }
        other => panic!("unexpected event {other:?}"),
    }

    let book = store.get("kraken", &xbt(), Asset::Spot).unwrap();
    assert_eq!(book.best_bid(), Some(dec!(99.0)));
    assert_eq!(book.update_id, 2);

    assert!(manager.shutdown().await);
}

#[tokio::test]
async fn test_out_of_order_delta_triggers_resubscribe() {
    let mut venue = spawn_venue().await;
    let (manager, store, mut events) =
        manager(&venue.url, settings(), vec![(ChannelKind::Book, xbt())]);

    let session = manager.start().await.unwrap();
    next_request(&mut venue, "subscribe").await;

    venue
        .push
        .send(book_frame(1, "bs", json!([["100.0", "1.0", "5.000000"]])))
        .unwrap();
    assert!(matches!(next_event(&mut events).await, StreamEvent::BookChanged(_)));

    // Older than the snapshot
    venue
        .push
        .send(book_frame(1, "b", json!([["100.0", "4.0", "3.000000"]])))
        .unwrap();

    match next_event(&mut events).await {
        StreamEvent::Error { message, .. } => assert!(message.starts_with("Out of order update")),
        other => panic!("unexpected event {other:?}"),
    }

    let unsubscribe = next_request(&mut venue, "unsubscribe").await;
    assert_eq!(unsubscribe["pair"][0], "XBT/USD");
    let resubscribe = next_request(&mut venue, "subscribe").await;
    assert_eq!(resubscribe["subscription"]["name"], "book");

    // The fresh subscription gets a new channel id
    timeout(Duration::from_secs(3), async {
        while session.registry().find(ChannelKind::Book, &xbt()) != Some(ChannelId::Number(2)) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(matches!(
        store.get("kraken", &xbt(), Asset::Spot),
        Err(StreamError::BookNotFound { .. })
    ));

    venue
        .push
        .send(book_frame(2, "bs", json!([["101.0", "1.0", "6.000000"]])))
        .unwrap();
    match next_event(&mut events).await {
        StreamEvent::BookChanged(book) => assert_eq!(book.best_bid(), Some(dec!(101.0))),
        other => panic!("unexpected event {other:?}"),
    }

    assert!(manager.shutdown().await);
}

#[tokio::test]
async fn test_subscribe_timeout_leaves_connection_usable() {
    let mut venue = spawn_venue().await;
    let (manager, _store, _events) = manager(&venue.url, settings(), Vec::new());
    let session = manager.start().await.unwrap();

    let err = session
        .registry()
        .subscribe(ChannelKind::Book, CurrencyPair::parse(SILENT_PAIR, "/").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::ResponseTimeout { .. }));
    assert_eq!(session.connection().pending_requests(), 0);

    session
        .registry()
        .subscribe(ChannelKind::Trade, CurrencyPair::new("ETH", "USD"))
        .await
        .unwrap();
    assert_eq!(session.registry().len(), 1);
    next_request(&mut venue, "subscribe").await;

    assert!(manager.shutdown().await);
}

#[tokio::test]
async fn test_shutdown_unwinds_every_task() {
    let mut venue = spawn_venue().await;
    let mut settings = settings();
    settings.response_timeout = Duration::from_secs(30);
    let (manager, _store, _events) = manager(&venue.url, settings, Vec::new());
    let session = Arc::new(manager.start().await.unwrap());

    // Heartbeat is running
    next_request(&mut venue, "ping").await;

    // A request that will never be answered
    let waiter = {
        let session = session.clone();
        manager.tracker().spawn(async move {
            session
                .registry()
                .subscribe(ChannelKind::Book, CurrencyPair::parse(SILENT_PAIR, "/").unwrap())
                .await
        })
    };
    next_request(&mut venue, "subscribe").await;
    assert_eq!(manager.tracker().len(), 3);

    assert!(manager.shutdown().await);
    assert!(manager.tracker().is_empty());
    assert_eq!(session.state(), DispatchState::Stopped);
    assert!(matches!(waiter.await.unwrap(), Err(StreamError::ShuttingDown)));
}

#[tokio::test]
async fn test_connection_loss_is_reported() {
    let venue = spawn_venue().await;
    let (manager, _store, mut events) =
        manager(&venue.url, settings(), vec![(ChannelKind::Trade, xbt())]);
    let session = manager.start().await.unwrap();
    assert_eq!(session.registry().len(), 1);

    venue.push.send("CLOSE".to_string()).unwrap();

    match next_event(&mut events).await {
        StreamEvent::ConnectionLost { exchange, .. } => assert_eq!(exchange, "kraken"),
        other => panic!("unexpected event {other:?}"),
    }
    timeout(Duration::from_secs(2), session.closed()).await.unwrap();
    assert!(session.registry().is_empty());
    assert!(!session.connection().is_connected());

    assert!(manager.shutdown().await);
}

#[tokio::test]
async fn test_run_gives_up_after_max_attempts() {
    // Nothing listens here
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let (manager, _store, _events) = manager(&url, settings(), Vec::new());
    let result = timeout(Duration::from_secs(5), manager.run()).await.unwrap();
    assert!(matches!(result, Err(StreamError::MaxReconnectAttemptsExceeded)));
}
