//! WebSocket connection to a single venue
//!
//! Owns one physical socket and the table of requests waiting for a
//! correlated reply. Only the dispatch loop resolves entries in that table.

use chrono::Utc;
use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio_tungstenite::{
    client_async_tls, connect_async,
    tungstenite::client::IntoClientRequest,
    tungstenite::http::{header::AUTHORIZATION, HeaderValue},
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::error::{Result, StreamError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Largest proxy CONNECT response header we accept
const MAX_PROXY_RESPONSE: usize = 8 * 1024;

/// Transport settings supplied by the venue wrapper at dial time
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub url: String,
    /// HTTP proxy (`http://host:port`) tunnelled with CONNECT
    pub proxy: Option<String>,
    /// Sent as a bearer token on the handshake request
    pub auth_token: Option<String>,
    pub connect_timeout: Duration,
}

impl TransportConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            proxy: None,
            auth_token: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Streaming connection to one venue
pub struct StreamConnection {
    exchange: String,
    config: TransportConfig,
    writer: Mutex<Option<WsSink>>,
    reader: Mutex<Option<WsSource>>,
    connected: AtomicBool,
    pending: DashMap<i64, oneshot::Sender<String>>,
    last_id: AtomicI64,
    shutdown: CancellationToken,
}

impl StreamConnection {
    /// Create an undialled connection observing `shutdown`
    pub fn new(exchange: &str, config: TransportConfig, shutdown: CancellationToken) -> Self {
        Self {
            exchange: exchange.to_string(),
            config,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            connected: AtomicBool::new(false),
            pending: DashMap::new(),
            last_id: AtomicI64::new(0),
            shutdown,
        }
    }

    /// Establish the socket
    ///
    /// A second dial while connected fails with `AlreadyConnected`.
    pub async fn dial(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(StreamError::ShuttingDown);
        }
        if self
            .connected
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StreamError::AlreadyConnected);
        }

        match tokio::time::timeout(self.config.connect_timeout, self.handshake()).await {
            Ok(Ok(ws)) => {
                let (sink, source) = ws.split();
                *self.writer.lock().await = Some(sink);
                *self.reader.lock().await = Some(source);
                Ok(())
            }
            Ok(Err(e)) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(e)
            }
            Err(_) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(StreamError::WebSocket(format!(
                    "connect to {} timed out after {}ms",
                    self.config.url,
                    self.config.connect_timeout.as_millis()
                )))
            }
        }
    }

    async fn handshake(&self) -> Result<WsStream> {
        let mut request = self.config.url.as_str().into_client_request()?;
        if let Some(token) = &self.config.auth_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| StreamError::Config(format!("invalid auth token: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        info!(exchange = %self.exchange, url = %self.config.url, "Connecting to venue WebSocket");

        let (ws, response) = match &self.config.proxy {
            Some(proxy) => {
                let tcp = tunnel(proxy, &self.config.url).await?;
                client_async_tls(request, tcp).await?
            }
            None => connect_async(request).await?,
        };

        info!(exchange = %self.exchange, status = ?response.status(), "WebSocket connected");
        Ok(ws)
    }

    /// Serialize and send a payload
    pub async fn send_message<T: Serialize + ?Sized>(&self, payload: &T) -> Result<()> {
        let text = serde_json::to_string(payload)?;
        self.send_text(text).await
    }

    /// Send a text frame
    pub async fn send_text(&self, text: String) -> Result<()> {
        trace!(exchange = %self.exchange, payload = %text, "Sending frame");
        self.send_frame(Message::Text(text)).await
    }

    async fn send_frame(&self, message: Message) -> Result<()> {
        if !self.is_connected() {
            return Err(StreamError::NotConnected);
        }

        let mut guard = self.writer.lock().await;
        let sink = guard.as_mut().ok_or(StreamError::NotConnected)?;
        sink.send(message).await.map_err(|e| {
            warn!(exchange = %self.exchange, error = %e, "WebSocket write failed");
            StreamError::from(e)
        })
    }

    /// Send a request and wait for the reply carrying `request_id`
    ///
    /// The entry is removed on every exit path, so a timed-out request leaves
    /// the connection usable for others.
    pub async fn send_message_return_response<T: Serialize + ?Sized>(
        &self,
        request_id: i64,
        payload: &T,
        timeout: Duration,
    ) -> Result<String> {
        let (tx, rx) = oneshot::channel();
        if self.pending.insert(request_id, tx).is_some() {
            warn!(exchange = %self.exchange, request_id, "Replacing outstanding request with the same id");
        }

        if let Err(e) = self.send_message(payload).await {
            self.pending.remove(&request_id);
            return Err(e);
        }

        let result = tokio::select! {
            response = rx => response.map_err(|_| StreamError::ConnectionClosed),
            _ = tokio::time::sleep(timeout) => Err(StreamError::ResponseTimeout {
                request_id,
                timeout_ms: timeout.as_millis() as u64,
            }),
            _ = self.shutdown.cancelled() => Err(StreamError::ShuttingDown),
        };

        self.pending.remove(&request_id);
        result
    }

    /// Hand a reply to the request waiting on `request_id`
    ///
    /// Returns false when nobody is waiting, e.g. after a timeout.
    pub fn resolve(&self, request_id: i64, payload: String) -> bool {
        match self.pending.remove(&request_id) {
            Some((_, tx)) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Generate a request id unique on this connection
    ///
    /// Ids are time derived (nanoseconds when `high_precision`, otherwise
    /// milliseconds) and always strictly greater than the previous one.
    pub fn generate_message_id(&self, high_precision: bool) -> i64 {
        let now = Utc::now();
        let candidate = if high_precision {
            now.timestamp_nanos_opt().unwrap_or(i64::MAX)
        } else {
            now.timestamp_millis()
        };

        let next = |prev: i64| candidate.max(prev.saturating_add(1));
        match self
            .last_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| Some(next(prev)))
        {
            Ok(prev) | Err(prev) => next(prev),
        }
    }

    /// Read the next text frame
    ///
    /// Transport pings are answered here. Any transport failure closes the
    /// connection and is returned; reconnecting is the caller's job.
    pub async fn read_message(&self) -> Result<String> {
        let mut guard = self.reader.lock().await;
        let source = guard.as_mut().ok_or(StreamError::NotConnected)?;

        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(StreamError::ShuttingDown),
                next = source.next() => next,
            };

            match next {
                Some(Ok(Message::Text(text))) => {
                    trace!(exchange = %self.exchange, len = text.len(), "Received text frame");
                    return Ok(text);
                }
                Some(Ok(Message::Binary(data))) => {
                    return Ok(String::from_utf8_lossy(&data).into_owned());
                }
                Some(Ok(Message::Ping(data))) => {
                    debug!(exchange = %self.exchange, "Received ping, sending pong");
                    if let Err(e) = self.send_frame(Message::Pong(data)).await {
                        warn!(exchange = %self.exchange, error = %e, "Failed to answer ping");
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    trace!(exchange = %self.exchange, "Received pong");
                }
                Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    warn!(exchange = %self.exchange, frame = ?frame, "Received close frame");
                    self.mark_closed();
                    return Err(StreamError::ConnectionClosed);
                }
                Some(Err(e)) => {
                    error!(exchange = %self.exchange, error = %e, "WebSocket error");
                    self.mark_closed();
                    return Err(e.into());
                }
                None => {
                    warn!(exchange = %self.exchange, "WebSocket stream ended");
                    self.mark_closed();
                    return Err(StreamError::ConnectionClosed);
                }
            }
        }
    }

    /// Send a transport-level ping
    pub async fn ping(&self) -> Result<()> {
        self.send_frame(Message::Ping(Vec::new())).await
    }

    /// Close the socket's write half; the reader sees the close and stops
    pub async fn close(&self) {
        if let Some(mut sink) = self.writer.lock().await.take() {
            let _ = sink.close().await;
        }
        self.mark_closed();
    }

    fn mark_closed(&self) {
        self.connected.store(false, Ordering::SeqCst);
        // Dropping the senders fails every waiter with ConnectionClosed
        self.pending.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Number of requests waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }
}

/// Open a TCP tunnel to the target through an HTTP proxy
async fn tunnel(proxy: &str, target: &str) -> Result<TcpStream> {
    let proxy = Url::parse(proxy).map_err(|e| StreamError::Config(format!("invalid proxy url: {e}")))?;
    let target = Url::parse(target).map_err(|e| StreamError::Config(format!("invalid url: {e}")))?;

    let proxy_addr = host_port(&proxy)?;
    let target_addr = host_port(&target)?;

    debug!(proxy = %proxy_addr, target = %target_addr, "Opening proxy tunnel");

    let mut tcp = TcpStream::connect(&proxy_addr)
        .await
        .map_err(|e| StreamError::WebSocket(format!("proxy connect failed: {e}")))?;

    let connect = format!("CONNECT {target_addr} HTTP/1.1\r\nHost: {target_addr}\r\n\r\n");
    tcp.write_all(connect.as_bytes())
        .await
        .map_err(|e| StreamError::WebSocket(format!("proxy write failed: {e}")))?;

    // Byte at a time so nothing past the header is consumed
    let mut response = Vec::with_capacity(256);
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() >= MAX_PROXY_RESPONSE {
            return Err(StreamError::WebSocket("proxy response too large".to_string()));
        }
        let byte = tcp
            .read_u8()
            .await
            .map_err(|e| StreamError::WebSocket(format!("proxy read failed: {e}")))?;
        response.push(byte);
    }

    let head = String::from_utf8_lossy(&response);
    let status = head.lines().next().unwrap_or_default();
    if status.split_whitespace().nth(1) != Some("200") {
        return Err(StreamError::WebSocket(format!("proxy refused tunnel: {status}")));
    }

    Ok(tcp)
}

fn host_port(url: &Url) -> Result<String> {
    let host = url
        .host_str()
        .ok_or_else(|| StreamError::Config(format!("url {url} has no host")))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| StreamError::Config(format!("url {url} has no port")))?;
    Ok(format!("{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Instant;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Server that answers `{"event":"ping","reqid":n}` with a pong and
    /// ignores everything else.
    async fn spawn_pong_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["event"] == "ping" {
                        let pong = json!({"event": "pong", "reqid": value["reqid"]});
                        ws.send(Message::Text(pong.to_string())).await.unwrap();
                    }
                }
            }
        });

        format!("ws://{addr}")
    }

    fn connection(url: &str) -> Arc<StreamConnection> {
        Arc::new(StreamConnection::new(
            "test",
            TransportConfig::new(url),
            CancellationToken::new(),
        ))
    }

    /// Minimal reader that resolves replies by `reqid`
    fn spawn_resolver(conn: Arc<StreamConnection>) {
        tokio::spawn(async move {
            while let Ok(text) = conn.read_message().await {
                let value: Value = serde_json::from_str(&text).unwrap();
                if let Some(id) = value["reqid"].as_i64() {
                    conn.resolve(id, text);
                }
            }
        });
    }

    #[tokio::test]
    async fn test_send_before_dial_fails() {
        let conn = connection("ws://127.0.0.1:1");
        let err = conn.send_message(&json!({"event": "ping"})).await.unwrap_err();
        assert!(matches!(err, StreamError::NotConnected));
    }

    #[tokio::test]
    async fn test_second_dial_fails() {
        let url = spawn_pong_server().await;
        let conn = connection(&url);
        conn.dial().await.unwrap();

        let err = conn.dial().await.unwrap_err();
        assert!(matches!(err, StreamError::AlreadyConnected));
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_message_ids_strictly_increase() {
        let conn = connection("ws://127.0.0.1:1");
        let mut last = 0;
        for i in 0..1000 {
            let id = conn.generate_message_id(i % 2 == 0);
            assert!(id > last);
            last = id;
        }
    }

    #[tokio::test]
    async fn test_correlated_response() {
        let url = spawn_pong_server().await;
        let conn = connection(&url);
        conn.dial().await.unwrap();
        spawn_resolver(conn.clone());

        let id = conn.generate_message_id(false);
        let reply = conn
            .send_message_return_response(
                id,
                &json!({"event": "ping", "reqid": id}),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        let value: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["event"], "pong");
        assert_eq!(conn.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_response_timeout_keeps_connection_usable() {
        let url = spawn_pong_server().await;
        let conn = connection(&url);
        conn.dial().await.unwrap();
        spawn_resolver(conn.clone());

        let started = Instant::now();
        let err = conn
            .send_message_return_response(
                42,
                &json!({"event": "subscribe", "reqid": 42}),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, StreamError::ResponseTimeout { request_id: 42, .. }));
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(3));
        assert_eq!(conn.pending_requests(), 0);
        assert!(!conn.resolve(42, "late".to_string()));

        let reply = conn
            .send_message_return_response(
                43,
                &json!({"event": "ping", "reqid": 43}),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(reply.contains("pong"));
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_reader_and_waiter() {
        let url = spawn_pong_server().await;
        let shutdown = CancellationToken::new();
        let conn = Arc::new(StreamConnection::new(
            "test",
            TransportConfig::new(&url),
            shutdown.clone(),
        ));
        conn.dial().await.unwrap();

        let reader = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.read_message().await })
        };
        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.send_message_return_response(
                    7,
                    &json!({"event": "subscribe", "reqid": 7}),
                    Duration::from_secs(30),
                )
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        let (read, wait) = tokio::time::timeout(Duration::from_secs(2), async {
            (reader.await.unwrap(), waiter.await.unwrap())
        })
        .await
        .unwrap();
        assert!(matches!(read, Err(StreamError::ShuttingDown)));
        assert!(matches!(wait, Err(StreamError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_dial_through_proxy() {
        let target = spawn_pong_server().await;
        let target_addr = target.trim_start_matches("ws://").to_string();

        // CONNECT proxy that splices to the target
        let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut client, _) = proxy.accept().await.unwrap();
            let mut head = Vec::new();
            while !head.ends_with(b"\r\n\r\n") {
                head.push(client.read_u8().await.unwrap());
            }
            assert!(String::from_utf8_lossy(&head).starts_with(&format!("CONNECT {target_addr}")));
            let mut upstream = TcpStream::connect(&target_addr).await.unwrap();
            client
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await
                .unwrap();
            let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
        });

        let mut config = TransportConfig::new(&target);
        config.proxy = Some(format!("http://{proxy_addr}"));
        let conn = Arc::new(StreamConnection::new("test", config, CancellationToken::new()));
        conn.dial().await.unwrap();
        spawn_resolver(conn.clone());

        let reply = conn
            .send_message_return_response(
                1,
                &json!({"event": "ping", "reqid": 1}),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert!(reply.contains("pong"));
    }
}
