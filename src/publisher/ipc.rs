//! IPC consumer of the event fan-out
//!
//! Forwards events to another process over a Unix socket as length-prefixed
//! MessagePack frames.

use bytes::{BufMut, BytesMut};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, StreamError};
use crate::events::StreamEvent;

/// Publisher for sending stream events via Unix socket
pub struct IpcPublisher {
    socket_path: String,
    stream: Mutex<Option<UnixStream>>,
}

impl IpcPublisher {
    /// Create a new publisher
    pub async fn new(socket_path: &str) -> Self {
        let publisher = Self {
            socket_path: socket_path.to_string(),
            stream: Mutex::new(None),
        };

        // The reader may not be up yet
        if let Err(e) = publisher.connect().await {
            warn!(error = %e, "Initial IPC connection failed, will retry on publish");
        }

        publisher
    }

    /// Connect to the Unix socket
    async fn connect(&self) -> Result<()> {
        let path = Path::new(&self.socket_path);

        if !path.exists() {
            return Err(StreamError::Ipc(format!(
                "Socket path does not exist: {}",
                self.socket_path
            )));
        }

        let stream = UnixStream::connect(path).await.map_err(|e| {
            StreamError::Ipc(format!("Failed to connect to {}: {}", self.socket_path, e))
        })?;

        *self.stream.lock().await = Some(stream);

        info!(path = %self.socket_path, "Connected to IPC socket");
        Ok(())
    }

    /// Encode an event as `[u32 BE length][MessagePack body]`
    pub fn encode(event: &StreamEvent) -> Result<BytesMut> {
        let body = rmp_serde::to_vec_named(event)?;
        let mut frame = BytesMut::with_capacity(4 + body.len());
        frame.put_u32(body.len() as u32);
        frame.put_slice(&body);
        Ok(frame)
    }

    /// Publish one event
    ///
    /// Socket failures are logged and swallowed so the consumer keeps
    /// draining the fan-out.
    pub async fn publish(&self, event: &StreamEvent) -> Result<()> {
        let frame = Self::encode(event)?;

        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            drop(guard);
            if let Err(e) = self.connect().await {
                debug!(error = %e, "Failed to reconnect to IPC socket");
                return Ok(());
            }
            guard = self.stream.lock().await;
        }

        if let Some(stream) = guard.as_mut() {
            match stream.write_all(&frame).await {
                Ok(()) => debug!(kind = event.kind(), "Published event"),
                Err(e) => {
                    warn!(error = %e, "Failed to write to IPC socket");
                    *guard = None;
                }
            }
        }

        Ok(())
    }

    /// Drain the fan-out until it closes or shutdown fires
    pub async fn forward(&self, mut events: mpsc::Receiver<StreamEvent>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.publish(&event).await {
                            warn!(error = %e, "Failed to publish event");
                        }
                    }
                    None => break,
                },
            }
        }
        debug!(path = %self.socket_path, "IPC forwarder stopped");
    }
}
