//! Event Bus - typed publish/subscribe with a bounded worker pool
//!
//! Publishers hand events to [`EventBus::publish_async`], which never blocks:
//! the event lands in one of N bounded shard queues or is dropped and counted.
//! The shard is picked by an ordering key that names the producer (a socket
//! connection, an orchestrator batch). Each shard is drained by its own worker
//! task, so events published under one key are delivered in the order they
//! were accepted. Unkeyed publishes share a single lane.
//!
//! Subscriber callbacks run on the worker tasks. A panicking callback is
//! caught and logged; the worker and every other subscriber keep going.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::types::{
    AdapterExecution, AdapterPromptLoad, AdapterValidation, Event, EventKind, EventType, TaskCompleted, TaskFailed,
    TaskProgress, TaskStarted,
};

/// Default total queue capacity (events)
pub const DEFAULT_BUFFER_SIZE: usize = 10_000;

/// Default number of dispatch workers
pub const DEFAULT_WORKERS: usize = 4;

/// Errors returned by bus lifecycle operations
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BusError {
    #[error("event bus already closed")]
    Closed,
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_close_grace_ms() -> u64 {
    1000
}

/// Event bus sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BusConfig {
    /// Total queue capacity across all workers
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Number of dispatch workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How long close() waits for queued events to drain
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            workers: default_workers(),
            close_grace_ms: default_close_grace_ms(),
        }
    }
}

impl BusConfig {
    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    fn worker_count(&self) -> usize {
        self.workers.max(1)
    }

    fn shard_capacity(&self) -> usize {
        (self.buffer_size / self.worker_count()).max(1)
    }
}

/// Handle returned by subscribe calls, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId {
    id: u64,
    all: bool,
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.all {
            write!(f, "all_sub_{}", self.id)
        } else {
            write!(f, "sub_{}", self.id)
        }
    }
}

/// Subscriber callback
pub type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Subscriber predicate; the callback only sees events it accepts
pub type Filter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

#[derive(Clone)]
struct Subscriber {
    callback: Callback,
    filter: Option<Filter>,
}

#[derive(Default)]
struct Registry {
    by_type: HashMap<EventType, BTreeMap<SubscriptionId, Subscriber>>,
    all: BTreeMap<SubscriptionId, Subscriber>,
}

impl Registry {
    /// Type-specific subscribers first, then catch-all subscribers
    fn matching(&self, event_type: &EventType) -> Vec<(SubscriptionId, Subscriber)> {
        let typed = self.by_type.get(event_type).into_iter().flat_map(|subs| subs.iter());
        typed
            .chain(self.all.iter())
            .map(|(id, sub)| (*id, sub.clone()))
            .collect()
    }

    fn counts_by_type(&self) -> BTreeMap<String, usize> {
        self.by_type
            .iter()
            .filter(|(_, subs)| !subs.is_empty())
            .map(|(event_type, subs)| (event_type.to_string(), subs.len()))
            .collect()
    }
}

/// State shared between the bus handle and its workers
struct Shared {
    registry: RwLock<Registry>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn dispatch(&self, event: &Event) {
        let event_type = event.event_type();
        let targets = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .matching(&event_type);

        for (id, sub) in targets {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                if sub.filter.as_ref().is_none_or(|accept| accept(event)) {
                    (sub.callback)(event);
                }
            }));
            if let Err(payload) = outcome {
                error!(
                    subscription = %id,
                    event_type = %event_type,
                    task_id = %event.task_id,
                    panic = panic_message(payload.as_ref()),
                    "EventBus: subscriber panicked"
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

fn shard_for(key: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

/// Point-in-time bus statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BusStats {
    /// Publish attempts made while the bus was open (accepted + dropped)
    pub total_published: u64,
    /// Never greater than `total_published`
    pub total_dropped: u64,
    /// Events currently waiting in the queues
    pub queue_size: usize,
    pub queue_capacity: usize,
    /// Type-specific plus catch-all subscriptions
    pub active_subscribers: usize,
    /// Catch-all subscriptions
    pub all_subscribers: usize,
    pub subscribers_by_type: BTreeMap<String, usize>,
    pub workers: usize,
    pub closed: bool,
}

/// Central event bus
///
/// Must be created inside a Tokio runtime; the workers are spawned on it.
pub struct EventBus {
    shared: Arc<Shared>,
    shards: RwLock<Option<Vec<mpsc::Sender<Event>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    config: BusConfig,
}

impl EventBus {
    /// Create a bus and start its workers
    pub fn new(config: BusConfig) -> Self {
        let worker_count = config.worker_count();
        let shard_capacity = config.shard_capacity();
        debug!(worker_count, shard_capacity, "EventBus::new: creating event bus");

        let shared = Arc::new(Shared {
            registry: RwLock::new(Registry::default()),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for worker in 0..worker_count {
            let (tx, rx) = mpsc::channel(shard_capacity);
            senders.push(tx);
            workers.push(tokio::spawn(run_worker(worker, rx, shared.clone())));
        }

        Self {
            shared,
            shards: RwLock::new(Some(senders)),
            workers: Mutex::new(workers),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            config,
        }
    }

    /// Create a bus with default sizing
    pub fn with_defaults() -> Self {
        Self::new(BusConfig::default())
    }

    /// Subscribe to one event type
    pub fn subscribe<F>(&self, event_type: impl Into<EventType>, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.insert(Some(event_type.into()), Arc::new(callback), None)
    }

    /// Subscribe to one event type, seeing only events the filter accepts
    pub fn subscribe_with_filter<F, P>(&self, event_type: impl Into<EventType>, callback: F, filter: P) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.insert(Some(event_type.into()), Arc::new(callback), Some(Arc::new(filter)))
    }

    /// Subscribe to every event
    pub fn subscribe_all<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(callback), None)
    }

    fn insert(&self, event_type: Option<EventType>, callback: Callback, filter: Option<Filter>) -> SubscriptionId {
        let id = SubscriptionId {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            all: event_type.is_none(),
        };
        let subscriber = Subscriber { callback, filter };

        let mut registry = self.shared.registry.write().unwrap_or_else(PoisonError::into_inner);
        match event_type {
            Some(event_type) => {
                debug!(subscription = %id, %event_type, "EventBus::subscribe");
                registry.by_type.entry(event_type).or_default().insert(id, subscriber);
            }
            None => {
                debug!(subscription = %id, "EventBus::subscribe_all");
                registry.all.insert(id, subscriber);
            }
        }
        id
    }

    /// Remove a subscription; returns false if it was not registered
    ///
    /// Events already dequeued by a worker may still reach the callback.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = self.shared.registry.write().unwrap_or_else(PoisonError::into_inner);
        let removed = if id.all {
            registry.all.remove(&id).is_some()
        } else {
            let mut removed = false;
            registry.by_type.retain(|_, subs| {
                removed |= subs.remove(&id).is_some();
                !subs.is_empty()
            });
            removed
        };
        debug!(subscription = %id, removed, "EventBus::unsubscribe");
        removed
    }

    /// Enqueue an event without blocking, on the shared unkeyed lane
    ///
    /// Returns false when the queue is full (the event is dropped and
    /// counted) or the bus is closed.
    pub fn publish_async(&self, event: Event) -> bool {
        self.publish_keyed("", event)
    }

    /// Enqueue an event on the lane for `key` without blocking
    ///
    /// Events sharing a key reach every subscriber in publish order; events
    /// under different keys may be dispatched in parallel.
    pub fn publish_keyed(&self, key: &str, event: Event) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let shards = self.shards.read().unwrap_or_else(PoisonError::into_inner);
        let Some(shards) = shards.as_ref() else {
            return false;
        };

        // Counted before any drop so stats() never sees dropped > published
        self.shared.published.fetch_add(1, Ordering::Release);
        let shard = shard_for(key, shards.len());
        match shards[shard].try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                self.shared.dropped.fetch_add(1, Ordering::Release);
                debug!(
                    shard,
                    key,
                    event_type = event.type_name(),
                    task_id = %event.task_id,
                    "EventBus::publish_keyed: queue full, dropping event"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.shared.dropped.fetch_add(1, Ordering::Release);
                false
            }
        }
    }

    /// Deliver an event synchronously on the calling thread
    ///
    /// Bypasses the queues, so ordering relative to queued events is not
    /// guaranteed. Returns false once the bus is closed.
    pub fn publish(&self, event: Event) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.shared.published.fetch_add(1, Ordering::Release);
        self.shared.dispatch(&event);
        true
    }

    /// Stop accepting events and drain the queues
    ///
    /// Workers get the configured grace period to finish; any still running
    /// after that are aborted. Closing twice is an error.
    pub async fn close(&self) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(BusError::Closed);
        }
        debug!("EventBus::close: closing");

        // Dropping the senders lets each worker finish its queue and exit
        drop(self.shards.write().unwrap_or_else(PoisonError::into_inner).take());

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        let aborts: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
        let grace = self.config.close_grace();

        if tokio::time::timeout(grace, futures::future::join_all(workers)).await.is_err() {
            warn!(?grace, "EventBus::close: workers did not drain within grace period, aborting");
            for handle in aborts {
                handle.abort();
            }
        }
        debug!("EventBus::close: closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Snapshot counters, queue depth and subscriber counts
    pub fn stats(&self) -> BusStats {
        let (subscribers_by_type, all_subscribers) = {
            let registry = self.shared.registry.read().unwrap_or_else(PoisonError::into_inner);
            (registry.counts_by_type(), registry.all.len())
        };

        let shards = self.shards.read().unwrap_or_else(PoisonError::into_inner);
        let queue_size = shards
            .as_ref()
            .map(|txs| txs.iter().map(|tx| tx.max_capacity() - tx.capacity()).sum())
            .unwrap_or(0);

        // Dropped first: every drop it observes was preceded by its publish
        let total_dropped = self.shared.dropped.load(Ordering::Acquire);
        let total_published = self.shared.published.load(Ordering::Acquire);

        BusStats {
            total_published,
            total_dropped,
            queue_size,
            queue_capacity: self.config.shard_capacity() * self.config.worker_count(),
            active_subscribers: subscribers_by_type.values().sum::<usize>() + all_subscribers,
            all_subscribers,
            subscribers_by_type,
            workers: self.config.worker_count(),
            closed: self.is_closed(),
        }
    }

    /// Create an emitter handle for a specific task
    pub fn emitter_for(self: &Arc<Self>, task_id: impl Into<String>, agent_type: impl Into<String>) -> EventEmitter {
        EventEmitter {
            bus: self.clone(),
            task_id: task_id.into(),
            agent_type: agent_type.into(),
            ordering_key: String::new(),
        }
    }
}

async fn run_worker(worker: usize, mut rx: mpsc::Receiver<Event>, shared: Arc<Shared>) {
    debug!(worker, "EventBus worker: started");
    while let Some(event) = rx.recv().await {
        shared.dispatch(&event);
    }
    debug!(worker, "EventBus worker: queue closed, exiting");
}

/// Handle for emitting task events with a pre-set task ID and agent type
///
/// Every method is fire-and-forget through [`EventBus::publish_keyed`].
#[derive(Clone)]
pub struct EventEmitter {
    bus: Arc<EventBus>,
    task_id: String,
    agent_type: String,
    ordering_key: String,
}

impl EventEmitter {
    /// Publish on the lane of `key` instead of the unkeyed lane
    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = key.into();
        self
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Emit a raw event kind for this task
    pub fn emit(&self, kind: EventKind) {
        let event = Event::new(self.task_id.clone(), kind);
        if !self.bus.publish_keyed(&self.ordering_key, event) {
            debug!(task_id = %self.task_id, "EventEmitter::emit: event not accepted");
        }
    }

    pub fn task_started(&self, started: TaskStarted) {
        self.emit(EventKind::TaskStarted(TaskStarted {
            agent_type: self.agent_type.clone(),
            ..started
        }));
    }

    pub fn task_progress(&self, stage: &str, message: &str, progress: f64, elapsed: Duration) {
        self.emit(EventKind::TaskProgress(TaskProgress {
            agent_type: self.agent_type.clone(),
            stage: stage.to_string(),
            message: message.to_string(),
            progress,
            duration: elapsed,
        }));
    }

    pub fn task_completed(&self, output: &str, model: &str, elapsed: Duration) {
        self.emit(EventKind::TaskCompleted(TaskCompleted {
            agent_type: self.agent_type.clone(),
            output: output.to_string(),
            output_length: output.len(),
            duration: elapsed,
            model: model.to_string(),
        }));
    }

    pub fn task_failed(&self, error: &str, stage: &str, retry_count: u32, elapsed: Duration) {
        self.emit(EventKind::TaskFailed(TaskFailed {
            agent_type: self.agent_type.clone(),
            error: error.to_string(),
            duration: elapsed,
            stage: stage.to_string(),
            retry_count,
        }));
    }

    pub fn adapter_validation(&self, valid: bool, error: Option<&str>) {
        self.emit(EventKind::AdapterValidation(AdapterValidation {
            agent_type: self.agent_type.clone(),
            valid,
            error: error.unwrap_or_default().to_string(),
        }));
    }

    pub fn adapter_prompt_load(&self, prompt_length: usize, error: Option<&str>) {
        self.emit(EventKind::AdapterPromptLoad(AdapterPromptLoad {
            agent_type: self.agent_type.clone(),
            success: error.is_none(),
            prompt_length,
            error: error.unwrap_or_default().to_string(),
        }));
    }

    pub fn adapter_execution(&self, phase: &str, model: &str, elapsed: Duration, error: Option<&str>) {
        self.emit(EventKind::AdapterExecution(AdapterExecution {
            agent_type: self.agent_type.clone(),
            phase: phase.to_string(),
            model: model.to_string(),
            duration: elapsed,
            success: error.is_none(),
            error: error.unwrap_or_default().to_string(),
        }));
    }
}
