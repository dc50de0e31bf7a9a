//! Event consumer - tails a JSONL events file onto a local bus
//!
//! An alternative to the monitor socket: producers append event lines to a
//! shared file and the consumer republishes them. Filesystem notifications
//! wake the reader early; a fixed poll interval runs regardless, so the
//! consumer keeps working when notifications are unavailable.

mod config;
mod tail;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use eyre::{Context, Result};
use notify::event::ModifyKind;
use notify::{EventKind as FsEventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use config::ConsumerConfig;
pub use tail::Tail;

use crate::events::{EventBus, decode_record};

/// Counters kept by a running consumer
#[derive(Debug, Default)]
struct Counters {
    offset: AtomicU64,
    lines: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
    malformed: AtomicU64,
    rotations: AtomicU64,
}

/// Snapshot of consumer counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub offset: u64,
    pub lines: u64,
    pub published: u64,
    pub dropped: u64,
    pub malformed: u64,
    pub rotations: u64,
}

/// Tails the events file and publishes each line as an event
pub struct EventConsumer {
    config: ConsumerConfig,
    bus: Arc<EventBus>,
    counters: Arc<Counters>,
    running: Arc<AtomicBool>,
    shutdown: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventConsumer {
    pub fn new(config: ConsumerConfig, bus: Arc<EventBus>) -> Self {
        debug!(event_file = ?config.event_file, "EventConsumer::new");
        Self {
            config,
            bus,
            counters: Arc::new(Counters::default()),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Create the directory and file if needed and start tailing
    ///
    /// Failing to create the directory is a hard error; everything after
    /// that is absorbed and logged. Starting twice is an error.
    pub fn start(&self, ctx: &CancellationToken) -> Result<()> {
        let mut shutdown = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner);
        if shutdown.is_some() {
            eyre::bail!("Event consumer already running");
        }

        let path = self.config.event_file.clone();
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir).context(format!("Failed to create events directory {}", dir.display()))?;
        if let Err(e) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            warn!(?path, error = %e, "EventConsumer: could not create events file, waiting for it");
        }

        let (fs_tx, fs_rx) = mpsc::unbounded_channel();
        let watcher = match watch_dir(&dir, fs_tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(?dir, error = %e, "EventConsumer: file notifications unavailable, polling only");
                None
            }
        };

        let token = ctx.child_token();
        let worker = TailWorker {
            lane: format!("file:{}", path.display()),
            tail: Tail::new(&path, self.config.buffer_size),
            bus: self.bus.clone(),
            counters: self.counters.clone(),
        };
        let running = self.running.clone();
        running.store(true, Ordering::Release);
        let interval = self.config.poll_interval();
        let handle = tokio::spawn({
            let token = token.clone();
            async move {
                worker.run(token, interval, watcher, fs_rx).await;
                running.store(false, Ordering::Release);
            }
        });

        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        *shutdown = Some(token);
        info!(?path, "EventConsumer: started");
        Ok(())
    }

    /// Stop tailing and release the file and watcher; safe to call again
    pub async fn stop(&self) {
        let token = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(token) = token else {
            return;
        };
        token.cancel();

        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task
            && task.await.is_err()
        {
            warn!("EventConsumer::stop: tail task failed");
        }
        self.running.store(false, Ordering::Release);
        info!(path = ?self.config.event_file, "EventConsumer: stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn event_file(&self) -> &Path {
        &self.config.event_file
    }

    /// Byte offset just past the last consumed line
    pub fn current_offset(&self) -> u64 {
        self.counters.offset.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ConsumerStats {
        let c = &self.counters;
        ConsumerStats {
            offset: c.offset.load(Ordering::Relaxed),
            lines: c.lines.load(Ordering::Relaxed),
            published: c.published.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            rotations: c.rotations.load(Ordering::Relaxed),
        }
    }
}

type FsEvents = mpsc::UnboundedReceiver<notify::Result<notify::Event>>;

fn watch_dir(dir: &Path, tx: mpsc::UnboundedSender<notify::Result<notify::Event>>) -> notify::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let _ = tx.send(res);
    })?;
    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

struct TailWorker {
    /// Ordering key, so lines are delivered in file order
    lane: String,
    tail: Tail,
    bus: Arc<EventBus>,
    counters: Arc<Counters>,
}

impl TailWorker {
    async fn run(
        mut self,
        token: CancellationToken,
        interval: std::time::Duration,
        watcher: Option<RecommendedWatcher>,
        mut fs_events: FsEvents,
    ) {
        let mut watching = watcher.is_some();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
                fs_event = fs_events.recv(), if watching => match fs_event {
                    Some(Ok(event)) => {
                        if self.is_rotation(&event) {
                            self.tail.force_reopen();
                        }
                    }
                    Some(Err(e)) => warn!(error = %e, "EventConsumer: watcher error"),
                    None => watching = false,
                },
            }
            self.read_available().await;
        }

        drop(watcher);
        debug!(path = ?self.tail.path(), "EventConsumer: tail loop exited");
    }

    /// Remove or rename of the tailed file itself
    fn is_rotation(&self, event: &notify::Event) -> bool {
        let touches_file = event
            .paths
            .iter()
            .any(|p| p.file_name().is_some() && p.file_name() == self.tail.path().file_name());
        touches_file && matches!(event.kind, FsEventKind::Remove(_) | FsEventKind::Modify(ModifyKind::Name(_)))
    }

    async fn read_available(&mut self) {
        let bus = self.bus.clone();
        let counters = self.counters.clone();
        let lane = self.lane.as_str();
        let mut sink = |line: &[u8]| handle_line(&bus, lane, &counters, line);

        if let Err(e) = self.tail.poll(&mut sink).await {
            warn!(path = ?self.tail.path(), error = %e, "EventConsumer: read failed");
        }
        self.counters.offset.store(self.tail.offset(), Ordering::Relaxed);
        self.counters.rotations.store(self.tail.rotations(), Ordering::Relaxed);
    }
}

fn handle_line(bus: &EventBus, lane: &str, counters: &Counters, raw: &[u8]) {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    counters.lines.fetch_add(1, Ordering::Relaxed);

    let record = match serde_json::from_str(text) {
        Ok(record) => record,
        Err(e) => {
            counters.malformed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, "EventConsumer: skipping malformed line");
            return;
        }
    };
    let Some(event) = decode_record(record) else {
        counters.malformed.fetch_add(1, Ordering::Relaxed);
        warn!("EventConsumer: skipping line that is not a JSON object");
        return;
    };

    if bus.publish_keyed(lane, event) {
        counters.published.fetch_add(1, Ordering::Relaxed);
    } else {
        counters.dropped.fetch_add(1, Ordering::Relaxed);
        warn!("EventConsumer: bus queue full, event dropped");
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::events::{Event, EventKind};

    fn config(temp: &TempDir) -> ConsumerConfig {
        ConsumerConfig {
            event_file: temp.path().join("morgana").join("events.jsonl"),
            poll_interval_ms: 20,
            buffer_size: 128,
        }
    }

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    fn collecting_bus() -> (Arc<EventBus>, Arc<StdMutex<Vec<Event>>>) {
        let bus = Arc::new(EventBus::with_defaults());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let s = seen.clone();
        bus.subscribe_all(move |event| s.lock().unwrap().push(event.clone()));
        (bus, seen)
    }

    async fn wait_for(seen: &StdMutex<Vec<Event>>, count: usize) {
        for _ in 0..300 {
            if seen.lock().unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {count} events, saw {}", seen.lock().unwrap().len());
    }

    #[tokio::test]
    async fn test_start_creates_file_and_rejects_second_start() {
        let temp = TempDir::new().unwrap();
        let (bus, _) = collecting_bus();
        let consumer = EventConsumer::new(config(&temp), bus);
        let ctx = CancellationToken::new();

        consumer.start(&ctx).unwrap();
        assert!(consumer.event_file().exists());
        assert!(consumer.is_running());
        assert!(consumer.start(&ctx).is_err());

        consumer.stop().await;
        assert!(!consumer.is_running());
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_publishes_flat_and_envelope_lines() {
        let temp = TempDir::new().unwrap();
        let (bus, seen) = collecting_bus();
        let consumer = EventConsumer::new(config(&temp), bus);
        consumer.start(&CancellationToken::new()).unwrap();

        append(
            consumer.event_file(),
            concat!(
                r#"{"event_type":"task.started","task_id":"a","agent_type":"code-implementer"}"#,
                "\n",
                "not json at all\n",
                r#"{"type":"task.progress","task_id":"a","data":{"stage":"execution","progress":0.5}}"#,
                "\n",
            ),
        );
        wait_for(&seen, 2).await;

        let seen = seen.lock().unwrap().clone();
        assert!(matches!(seen[0].kind, EventKind::TaskStarted(_)));
        match &seen[1].kind {
            EventKind::TaskProgress(p) => assert_eq!(p.progress, 0.5),
            other => panic!("Expected TaskProgress, got {other:?}"),
        }
        let stats = consumer.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.malformed, 1);
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_partial_line_waits_for_newline() {
        let temp = TempDir::new().unwrap();
        let (bus, seen) = collecting_bus();
        let consumer = EventConsumer::new(config(&temp), bus);
        consumer.start(&CancellationToken::new()).unwrap();

        append(consumer.event_file(), r#"{"event_type":"task.started","task_id":"p"}"#);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(consumer.current_offset(), 0);
        assert_eq!(consumer.stats().malformed, 0);

        append(consumer.event_file(), "\n");
        wait_for(&seen, 1).await;
        assert_eq!(seen.lock().unwrap()[0].task_id, "p");
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_survives_truncation() {
        let temp = TempDir::new().unwrap();
        let (bus, seen) = collecting_bus();
        let consumer = EventConsumer::new(config(&temp), bus);
        consumer.start(&CancellationToken::new()).unwrap();

        let line = |id: &str| format!("{{\"event_type\":\"task.started\",\"task_id\":\"{id}\"}}\n");
        append(consumer.event_file(), &(line("one") + &line("two")));
        wait_for(&seen, 2).await;

        std::fs::write(consumer.event_file(), line("three")).unwrap();
        wait_for(&seen, 3).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let ids: Vec<String> = seen.lock().unwrap().iter().map(|e| e.task_id.clone()).collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&"three".to_string()));
        assert_eq!(consumer.current_offset(), line("three").len() as u64);
        assert!(consumer.is_running());
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_context_stops_tailing() {
        let temp = TempDir::new().unwrap();
        let (bus, _) = collecting_bus();
        let consumer = EventConsumer::new(config(&temp), bus);
        let ctx = CancellationToken::new();
        consumer.start(&ctx).unwrap();

        ctx.cancel();
        for _ in 0..100 {
            if !consumer.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!consumer.is_running());
        consumer.stop().await;
    }

    #[tokio::test]
    async fn test_unwritable_directory_is_hard_error() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let (bus, _) = collecting_bus();
        let consumer = EventConsumer::new(
            ConsumerConfig {
                event_file: blocker.join("sub").join("events.jsonl"),
                ..config(&temp)
            },
            bus,
        );
        assert!(consumer.start(&CancellationToken::new()).is_err());
        assert!(!consumer.is_running());
    }
}
