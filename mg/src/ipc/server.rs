//! Monitor server - accepts producers and viewers on the monitor socket
//!
//! Every connection is read line by line. Event lines are recorded in the
//! history ring, decoded, and published to the local bus. A line holding a
//! history request turns its connection into a viewer: the server writes one
//! replay batch of the retained history, then every message that arrives
//! afterwards.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use eyre::Result;
use tokio::io::BufReader;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::history::EventHistory;
use super::listener::{cleanup_socket, create_listener_at, parse_frame, read_frame, write_message};
use super::messages::IpcMessage;
use crate::events::EventBus;

/// How long stop() waits for connection tasks to finish
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// State shared by the accept loop and connection tasks
struct Shared {
    bus: Arc<EventBus>,
    history: EventHistory,
    clients: Mutex<HashSet<u64>>,
    next_client: AtomicU64,
}

/// Removes a connection from the client set when its task ends
struct ClientGuard {
    shared: Arc<Shared>,
    id: u64,
}

impl ClientGuard {
    fn register(shared: Arc<Shared>) -> Self {
        let id = shared.next_client.fetch_add(1, Ordering::Relaxed);
        shared.clients.lock().unwrap_or_else(PoisonError::into_inner).insert(id);
        Self { shared, id }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.shared
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Unix socket server that feeds a local event bus and serves viewers
pub struct MonitorServer {
    socket_path: PathBuf,
    shared: Arc<Shared>,
    shutdown: Mutex<Option<CancellationToken>>,
    tracker: TaskTracker,
}

impl MonitorServer {
    pub fn new(socket_path: impl Into<PathBuf>, bus: Arc<EventBus>, history_capacity: usize) -> Self {
        let socket_path = socket_path.into();
        debug!(?socket_path, history_capacity, "MonitorServer::new");
        Self {
            socket_path,
            shared: Arc::new(Shared {
                bus,
                history: EventHistory::new(history_capacity),
                clients: Mutex::new(HashSet::new()),
                next_client: AtomicU64::new(1),
            }),
            shutdown: Mutex::new(None),
            tracker: TaskTracker::new(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bind the socket and start accepting in the background
    ///
    /// Cancelling `ctx` shuts the server down; stop() does the same and also
    /// waits for connections to close and removes the socket file.
    pub fn start(&self, ctx: &CancellationToken) -> Result<()> {
        let mut shutdown = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner);
        if shutdown.is_some() {
            eyre::bail!("Monitor server already started");
        }

        let listener = create_listener_at(&self.socket_path)?;
        let token = ctx.child_token();
        self.tracker.reopen();
        self.tracker.spawn(accept_loop(
            listener,
            token.clone(),
            self.tracker.clone(),
            self.shared.clone(),
        ));
        *shutdown = Some(token);

        info!(socket_path = ?self.socket_path, "MonitorServer: listening");
        Ok(())
    }

    /// Start, serve until `ctx` is cancelled, then stop
    pub async fn run(&self, ctx: CancellationToken) -> Result<()> {
        self.start(&ctx)?;
        let token = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(token) = token {
            token.cancelled().await;
        }
        self.stop().await;
        Ok(())
    }

    /// Close the listener and every connection, then remove the socket file
    ///
    /// Safe to call more than once.
    pub async fn stop(&self) {
        let token = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(token) = token else {
            debug!("MonitorServer::stop: not running");
            return;
        };

        debug!("MonitorServer::stop: shutting down");
        token.cancel();
        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.tracker.wait()).await.is_err() {
            warn!("MonitorServer::stop: connections did not close within grace period");
        }
        cleanup_socket(&self.socket_path);
        info!(socket_path = ?self.socket_path, "MonitorServer: stopped");
    }

    /// Number of open connections
    pub fn client_count(&self) -> usize {
        self.shared.clients.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of messages retained for replay
    pub fn buffered_event_count(&self) -> usize {
        self.shared.history.len()
    }

    /// Retained messages, oldest first
    pub fn buffered_events(&self) -> Vec<IpcMessage> {
        self.shared.history.snapshot()
    }
}

async fn accept_loop(listener: UnixListener, token: CancellationToken, tracker: TaskTracker, shared: Arc<Shared>) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tracker.spawn(handle_connection(stream, token.clone(), tracker.clone(), shared.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "MonitorServer: accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
    debug!("MonitorServer: accept loop exited");
}

async fn handle_connection(stream: UnixStream, token: CancellationToken, tracker: TaskTracker, shared: Arc<Shared>) {
    let guard = ClientGuard::register(shared.clone());
    let client = guard.id;
    debug!(client, "MonitorServer: client connected");

    let (read_half, write_half) = stream.into_split();
    let mut write_half = Some(write_half);
    let mut reader = BufReader::new(read_half);
    let mut frame = Vec::new();
    let connection = token.child_token();
    // One ordering lane per connection keeps each producer's events in order
    let ordering_key = format!("client-{client}");

    loop {
        let read = tokio::select! {
            _ = connection.cancelled() => break,
            read = read_frame(&mut reader, &mut frame) => read,
        };
        match read {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                debug!(client, error = %e, "MonitorServer: read failed");
                break;
            }
        }

        let message = match parse_frame(&frame) {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                warn!(client, error = %e, "MonitorServer: skipping malformed line");
                continue;
            }
            None => continue,
        };

        if message.is_history_request() {
            match write_half.take() {
                Some(writer) => {
                    let (history, live) = shared.history.snapshot_and_subscribe();
                    debug!(client, replayed = history.len(), "MonitorServer: serving viewer");
                    tracker.spawn(serve_viewer(client, writer, history, live, connection.clone()));
                }
                None => debug!(client, "MonitorServer: duplicate history request ignored"),
            }
            continue;
        }
        if message.is_replay() {
            debug!(client, "MonitorServer: ignoring replay sent by client");
            continue;
        }

        shared.history.push(message.clone());
        let event = message.to_event();
        if !shared.bus.publish_keyed(&ordering_key, event) {
            debug!(client, message_type = %message.message_type, "MonitorServer: bus did not accept event");
        }
    }

    // Ends the viewer writer, if any
    connection.cancel();
    debug!(client, "MonitorServer: client disconnected");
}

async fn serve_viewer(
    client: u64,
    mut writer: OwnedWriteHalf,
    history: Vec<IpcMessage>,
    mut live: broadcast::Receiver<IpcMessage>,
    token: CancellationToken,
) {
    if let Err(e) = write_message(&mut writer, &IpcMessage::replay(&history)).await {
        debug!(client, error = %e, "MonitorServer: failed to send replay");
        return;
    }

    loop {
        let message = tokio::select! {
            _ = token.cancelled() => break,
            message = live.recv() => message,
        };
        match message {
            Ok(message) => {
                if let Err(e) = write_message(&mut writer, &message).await {
                    debug!(client, error = %e, "MonitorServer: viewer write failed");
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(client, skipped, "MonitorServer: viewer lagging, skipped messages");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use tokio::io::Lines;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
    use tokio::net::unix::OwnedReadHalf;

    use super::*;
    use crate::events::{Event, EventKind, EventType, TaskStarted};

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    fn event_line(task_id: &str) -> String {
        let event = Event::new(task_id, EventKind::TaskStarted(TaskStarted::default()));
        IpcMessage::from_event(&event).to_line().unwrap()
    }

    async fn next_message(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> IpcMessage {
        let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    fn server(temp: &TempDir, capacity: usize) -> (MonitorServer, Arc<EventBus>) {
        let bus = Arc::new(EventBus::with_defaults());
        let server = MonitorServer::new(temp.path().join("monitor.sock"), bus.clone(), capacity);
        (server, bus)
    }

    #[tokio::test]
    async fn test_start_twice_fails_and_stop_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let (server, _bus) = server(&temp, 10);
        let ctx = CancellationToken::new();

        server.start(&ctx).unwrap();
        assert!(server.socket_path().exists());
        assert!(server.start(&ctx).is_err());

        server.stop().await;
        assert!(!server.socket_path().exists());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_producer_lines_reach_bus_and_history() {
        let temp = TempDir::new().unwrap();
        let (server, bus) = server(&temp, 10);
        let received = Arc::new(AtomicU64::new(0));
        let r = received.clone();
        bus.subscribe(EventType::TaskStarted, move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });
        server.start(&CancellationToken::new()).unwrap();

        let mut stream = UnixStream::connect(server.socket_path()).await.unwrap();
        stream.write_all(event_line("a").as_bytes()).await.unwrap();
        stream.write_all(b"this is not json\n").await.unwrap();
        stream.write_all(b"\xff\xfe garbage\n").await.unwrap();
        stream.write_all(event_line("b").as_bytes()).await.unwrap();

        wait_until(|| received.load(Ordering::SeqCst) == 2).await;
        assert_eq!(server.buffered_event_count(), 2);
        let ids: Vec<String> = server.buffered_events().into_iter().map(|m| m.task_id).collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(server.client_count(), 1);

        drop(stream);
        wait_until(|| server.client_count() == 0).await;
        server.stop().await;
    }

    #[tokio::test]
    async fn test_viewer_gets_replay_then_live() {
        let temp = TempDir::new().unwrap();
        let (server, _bus) = server(&temp, 10);
        server.start(&CancellationToken::new()).unwrap();

        let mut producer = UnixStream::connect(server.socket_path()).await.unwrap();
        for i in 0..15 {
            producer.write_all(event_line(&format!("t{i}")).as_bytes()).await.unwrap();
        }
        wait_until(|| server.buffered_events().last().is_some_and(|m| m.task_id == "t14")).await;

        let viewer = UnixStream::connect(server.socket_path()).await.unwrap();
        let (read_half, mut write_half) = viewer.into_split();
        write_message(&mut write_half, &IpcMessage::history_request()).await.unwrap();
        let mut lines = BufReader::new(read_half).lines();

        let replay = next_message(&mut lines).await;
        assert!(replay.is_replay());
        assert_eq!(replay.data["count"], 10);
        let ids: Vec<String> = replay.replay_entries().into_iter().map(|m| m.task_id).collect();
        let expected: Vec<String> = (5..15).map(|i| format!("t{i}")).collect();
        assert_eq!(ids, expected);

        producer.write_all(event_line("live").as_bytes()).await.unwrap();
        let live = next_message(&mut lines).await;
        assert_eq!(live.task_id, "live");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_context_stops_run() {
        let temp = TempDir::new().unwrap();
        let (server, _bus) = server(&temp, 10);
        let server = Arc::new(server);
        let ctx = CancellationToken::new();

        let running = {
            let server = server.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { server.run(ctx).await })
        };
        wait_until(|| server.socket_path().exists()).await;

        ctx.cancel();
        tokio::time::timeout(Duration::from_secs(3), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!server.socket_path().exists());
    }
}
