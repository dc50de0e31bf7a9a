//! Monitor client - forwards local bus events to a monitor server
//!
//! The client subscribes to every event on a local bus and writes each one
//! as a line on the monitor socket. Forwarding never blocks the bus: lines go
//! through a bounded queue and are dropped when it is full. A write failure
//! marks the client disconnected; it does not reconnect.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use eyre::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::messages::IpcMessage;
use crate::events::{EventBus, SubscriptionId};

/// Default timeout for connecting to the server
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Lines waiting to be written before new ones are dropped
const SEND_QUEUE_CAPACITY: usize = 1024;

/// Forwards events from a local bus to the monitor socket
pub struct MonitorClient {
    socket_path: PathBuf,
    bus: Arc<EventBus>,
    subscription: Mutex<Option<SubscriptionId>>,
    connected: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    token: CancellationToken,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorClient {
    /// Connect and start forwarding; fails if the server is not reachable
    pub async fn connect(socket_path: impl Into<PathBuf>, bus: Arc<EventBus>) -> Result<Self> {
        let socket_path = socket_path.into();
        debug!(?socket_path, "MonitorClient::connect");

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(&socket_path))
            .await
            .context("Connection timeout")?
            .context("Failed to connect to monitor socket")?;

        let (tx, rx) = mpsc::channel::<String>(SEND_QUEUE_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));
        let dropped = Arc::new(AtomicU64::new(0));
        let token = CancellationToken::new();

        let writer = tokio::spawn(run_writer(stream, rx, token.clone(), connected.clone()));

        let subscription = {
            let connected = connected.clone();
            let dropped = dropped.clone();
            bus.subscribe_all(move |event| {
                if !connected.load(Ordering::Acquire) {
                    return;
                }
                let line = match IpcMessage::from_event(event).to_line() {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(task_id = %event.task_id, error = %e, "MonitorClient: failed to serialize event");
                        return;
                    }
                };
                if tx.try_send(line).is_err() {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(task_id = %event.task_id, "MonitorClient: send queue full, dropping event");
                }
            })
        };

        info!(?socket_path, "MonitorClient: connected");
        Ok(Self {
            socket_path,
            bus,
            subscription: Mutex::new(Some(subscription)),
            connected,
            dropped,
            token,
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Like connect(), but returns `None` when no server is listening
    pub async fn try_connect(socket_path: impl Into<PathBuf>, bus: Arc<EventBus>) -> Option<Self> {
        match Self::connect(socket_path, bus).await {
            Ok(client) => Some(client),
            Err(e) => {
                debug!(error = %e, "MonitorClient::try_connect: monitor not available");
                None
            }
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Events dropped because the send queue was full
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop forwarding, flush queued lines and close the connection
    pub async fn disconnect(&self) {
        let subscription = self.subscription.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(id) = subscription {
            self.bus.unsubscribe(id);
        }

        self.token.cancel();
        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(writer) = writer {
            if writer.await.is_err() {
                warn!("MonitorClient::disconnect: writer task failed");
            }
        }
        self.connected.store(false, Ordering::Release);
        debug!(socket_path = ?self.socket_path, "MonitorClient: disconnected");
    }

    /// Alias for disconnect()
    pub async fn close(&self) {
        self.disconnect().await;
    }
}

async fn run_writer(
    mut stream: UnixStream,
    mut rx: mpsc::Receiver<String>,
    token: CancellationToken,
    connected: Arc<AtomicBool>,
) {
    loop {
        let line = tokio::select! {
            biased;
            line = rx.recv() => line,
            _ = token.cancelled() => break,
        };
        let Some(line) = line else { break };
        if let Err(e) = stream.write_all(line.as_bytes()).await {
            warn!(error = %e, "MonitorClient: write failed, disconnecting");
            connected.store(false, Ordering::Release);
            return;
        }
    }

    // Flush whatever was queued before the cancel
    while let Ok(line) = rx.try_recv() {
        if stream.write_all(line.as_bytes()).await.is_err() {
            break;
        }
    }
    let _ = stream.shutdown().await;
    connected.store(false, Ordering::Release);
}
