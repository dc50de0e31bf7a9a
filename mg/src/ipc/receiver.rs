//! Monitor receiver - follows a monitor server as a viewer
//!
//! On connect the receiver sends a history request. The server answers with
//! one replay batch followed by live messages; both are decoded and published
//! to the local bus on a single ordering lane, so a viewer sees the history
//! oldest-first and then live events, exactly in server order.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use eyre::{Context, Result};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedReadHalf;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::listener::{parse_frame, read_frame};
use super::messages::IpcMessage;
use crate::events::EventBus;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Viewer connection that republishes server traffic on a local bus
pub struct MonitorReceiver {
    socket_path: PathBuf,
    connected: Arc<AtomicBool>,
    received: Arc<AtomicU64>,
    token: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorReceiver {
    /// Connect, request history, and start publishing to `bus`
    pub async fn connect(socket_path: impl Into<PathBuf>, bus: Arc<EventBus>) -> Result<Self> {
        let socket_path = socket_path.into();
        debug!(?socket_path, "MonitorReceiver::connect");

        let stream = tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(&socket_path))
            .await
            .context("Connection timeout")?
            .context("Failed to connect to monitor socket")?;
        let (read_half, mut write_half) = stream.into_split();

        let request = IpcMessage::history_request().to_line()?;
        write_half
            .write_all(request.as_bytes())
            .await
            .context("Failed to send history request")?;

        let connected = Arc::new(AtomicBool::new(true));
        let received = Arc::new(AtomicU64::new(0));
        let token = CancellationToken::new();
        let ordering_key = format!("monitor:{}", socket_path.display());

        let reader = tokio::spawn({
            let connected = connected.clone();
            let received = received.clone();
            let token = token.clone();
            async move {
                read_loop(read_half, Lane { bus, key: ordering_key }, received, token).await;
                // Keep the write half open until reading stops
                drop(write_half);
                connected.store(false, Ordering::Release);
            }
        });

        info!(?socket_path, "MonitorReceiver: connected");
        Ok(Self {
            socket_path,
            connected,
            received,
            token,
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Events published to the local bus so far, replayed ones included
    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Resolves once the server closes the connection or disconnect() is called
    pub async fn closed(&self) {
        let reader = self.reader.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }
    }

    pub async fn disconnect(&self) {
        self.token.cancel();
        self.closed().await;
        self.connected.store(false, Ordering::Release);
        debug!(socket_path = ?self.socket_path, "MonitorReceiver: disconnected");
    }
}

/// Bus plus the ordering key every republished event goes out under
struct Lane {
    bus: Arc<EventBus>,
    key: String,
}

impl Lane {
    fn publish(&self, received: &AtomicU64, message: &IpcMessage) {
        received.fetch_add(1, Ordering::Relaxed);
        if !self.bus.publish_keyed(&self.key, message.to_event()) {
            debug!(message_type = %message.message_type, "MonitorReceiver: bus did not accept event");
        }
    }
}

async fn read_loop(read_half: OwnedReadHalf, lane: Lane, received: Arc<AtomicU64>, token: CancellationToken) {
    let mut reader = BufReader::new(read_half);
    let mut frame = Vec::new();
    loop {
        let read = tokio::select! {
            _ = token.cancelled() => break,
            read = read_frame(&mut reader, &mut frame) => read,
        };
        match read {
            Ok(true) => {}
            Ok(false) => {
                info!("MonitorReceiver: server closed connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "MonitorReceiver: read failed");
                break;
            }
        }

        let message = match parse_frame(&frame) {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                warn!(error = %e, "MonitorReceiver: skipping malformed line");
                continue;
            }
            None => continue,
        };

        if message.is_replay() {
            let entries = message.replay_entries();
            debug!(count = entries.len(), "MonitorReceiver: received replay");
            for entry in entries {
                lane.publish(&received, &entry);
            }
        } else if message.is_history_request() {
            debug!("MonitorReceiver: ignoring history request from server");
        } else {
            lane.publish(&received, &message);
        }
    }
}
