//! Integration tests for Morgana
//!
//! These tests wire the bus, IPC transport, consumer and orchestrator
//! together the way the `mg` binary and agent processes do.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use morgana::consumer::{ConsumerConfig, EventConsumer};
use morgana::events::{Event, EventBus, EventFileWriter, EventKind, TaskCompleted, TaskProgress, TaskStarted};
use morgana::ipc::{MonitorClient, MonitorReceiver, MonitorServer};
use morgana::orchestrator::{ExecError, Orchestrator, Task, TaskExecutor};

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Records (task_id, event type) for every event on a bus
fn collect(bus: &EventBus) -> Arc<Mutex<Vec<(String, String)>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    bus.subscribe_all(move |event| {
        s.lock()
            .unwrap()
            .push((event.task_id.clone(), event.type_name().to_string()));
    });
    seen
}

fn started(task_id: &str) -> Event {
    Event::new(
        task_id,
        EventKind::TaskStarted(TaskStarted {
            agent_type: "code-implementer".to_string(),
            prompt: format!("prompt for {task_id}"),
            ..Default::default()
        }),
    )
}

struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(&self, task: &Task, _cancel: &CancellationToken) -> Result<String, ExecError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(format!("done: {}", task.prompt))
    }
}

// =============================================================================
// Event Bus
// =============================================================================

#[tokio::test]
async fn test_bus_delivers_task_lifecycle() {
    let bus = Arc::new(EventBus::with_defaults());
    let seen = collect(&bus);

    let emitter = bus.emitter_for("task_1_00000001", "code-implementer");
    emitter.task_started(TaskStarted::default());
    emitter.task_progress("execution", "working", 0.5, Duration::from_millis(10));
    emitter.task_completed("hello", "claude-sonnet", Duration::from_millis(20));

    wait_until("three events", || seen.lock().unwrap().len() == 3).await;
    let types: Vec<_> = seen.lock().unwrap().iter().map(|(_, t)| t.clone()).collect();
    assert_eq!(types, ["task.started", "task.progress", "task.completed"]);

    bus.close().await.unwrap();
    let stats = bus.stats();
    assert!(stats.closed);
    assert_eq!(stats.total_published, 3);
    assert_eq!(stats.total_dropped, 0);
}

// =============================================================================
// IPC
// =============================================================================

#[tokio::test]
async fn test_history_keeps_latest_and_viewer_sees_replay_then_live() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("monitor.sock");
    let ctx = CancellationToken::new();

    let server_bus = Arc::new(EventBus::with_defaults());
    let server = MonitorServer::new(&socket, server_bus.clone(), 3);
    server.start(&ctx).unwrap();

    let producer_bus = Arc::new(EventBus::with_defaults());
    let client = MonitorClient::connect(&socket, producer_bus.clone()).await.unwrap();
    for id in ["A", "B", "C", "D", "E"] {
        // Synchronous publish keeps the wire order identical to this loop
        assert!(producer_bus.publish(started(id)));
    }

    wait_until("five messages at the server", || {
        server_bus.stats().total_published == 5 && server.buffered_event_count() == 3
    })
    .await;
    let buffered: Vec<_> = server.buffered_events().into_iter().map(|m| m.task_id).collect();
    assert_eq!(buffered, ["C", "D", "E"]);

    let viewer_bus = Arc::new(EventBus::with_defaults());
    let seen = collect(&viewer_bus);
    let receiver = MonitorReceiver::connect(&socket, viewer_bus.clone()).await.unwrap();
    wait_until("replay", || seen.lock().unwrap().len() == 3).await;

    assert!(producer_bus.publish(started("F")));
    wait_until("live event", || seen.lock().unwrap().len() == 4).await;

    // Replay in history order, then live, nothing duplicated
    tokio::time::sleep(Duration::from_millis(50)).await;
    let ids: Vec<_> = seen.lock().unwrap().iter().map(|(id, _)| id.clone()).collect();
    assert_eq!(ids, ["C", "D", "E", "F"]);
    assert_eq!(receiver.received_count(), 4);

    receiver.disconnect().await;
    client.disconnect().await;
    server.stop().await;
    assert!(!socket.exists());
}

#[tokio::test]
async fn test_server_tracks_connected_clients() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("monitor.sock");
    let ctx = CancellationToken::new();

    let server = MonitorServer::new(&socket, Arc::new(EventBus::with_defaults()), 100);
    server.start(&ctx).unwrap();

    let first = MonitorClient::connect(&socket, Arc::new(EventBus::with_defaults()))
        .await
        .unwrap();
    let second = MonitorClient::connect(&socket, Arc::new(EventBus::with_defaults()))
        .await
        .unwrap();
    wait_until("two clients", || server.client_count() == 2).await;

    first.close().await;
    second.close().await;
    wait_until("clients gone", || server.client_count() == 0).await;

    ctx.cancel();
    server.stop().await;
}

#[tokio::test]
async fn test_try_connect_without_server() {
    let temp = TempDir::new().unwrap();
    let client = MonitorClient::try_connect(temp.path().join("absent.sock"), Arc::new(EventBus::with_defaults())).await;
    assert!(client.is_none());
}

// =============================================================================
// Orchestrator across processes
// =============================================================================

#[tokio::test]
async fn test_orchestrator_events_reach_late_viewer() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("monitor.sock");
    let ctx = CancellationToken::new();

    let server = MonitorServer::new(&socket, Arc::new(EventBus::with_defaults()), 1000);
    server.start(&ctx).unwrap();

    // Agent process: orchestrator publishes, client forwards
    let producer_bus = Arc::new(EventBus::with_defaults());
    let client = MonitorClient::connect(&socket, producer_bus.clone()).await.unwrap();
    let orchestrator = Orchestrator::new(Arc::new(EchoExecutor), 2).with_event_bus(producer_bus.clone());
    let tasks = (0..4)
        .map(|i| Task::new("code-implementer", format!("task {i}")))
        .collect();
    let results = orchestrator.run_parallel(&CancellationToken::new(), tasks, 0).await;
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r.is_success()));
    assert_eq!(results[2].output, "done: task 2");

    // Batch start + 4 x (started, completed) + batch completed
    wait_until("ten buffered events", || server.buffered_event_count() == 10).await;
    client.disconnect().await;

    let viewer_bus = Arc::new(EventBus::with_defaults());
    let seen = collect(&viewer_bus);
    let receiver = MonitorReceiver::connect(&socket, viewer_bus.clone()).await.unwrap();
    wait_until("ten replayed events", || seen.lock().unwrap().len() == 10).await;

    let seen = seen.lock().unwrap().clone();
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for (_, event_type) in &seen {
        *counts.entry(event_type.as_str()).or_default() += 1;
    }
    assert_eq!(counts["orchestrator.started"], 1);
    assert_eq!(counts["task.started"], 4);
    assert_eq!(counts["task.completed"], 4);
    assert_eq!(counts["orchestrator.completed"], 1);

    // The batch brackets its tasks even on the far side of the socket
    assert_eq!(seen[0].1, "orchestrator.started");
    assert_eq!(seen[9].1, "orchestrator.completed");
    assert_eq!(seen[0].0, seen[9].0);

    // Per task, started precedes completed
    for result in &results {
        let order: Vec<_> = seen
            .iter()
            .filter(|(id, _)| *id == result.task_id)
            .map(|(_, t)| t.as_str())
            .collect();
        assert_eq!(order, ["task.started", "task.completed"]);
    }

    receiver.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn test_adapter_events_cross_the_socket() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("monitor.sock");
    let ctx = CancellationToken::new();

    let server_bus = Arc::new(EventBus::with_defaults());
    let received = Arc::new(Mutex::new(Vec::new()));
    let r = received.clone();
    server_bus.subscribe_all(move |event| r.lock().unwrap().push(event.clone()));
    let server = MonitorServer::new(&socket, server_bus.clone(), 10);
    server.start(&ctx).unwrap();

    let producer_bus = Arc::new(EventBus::with_defaults());
    let client = MonitorClient::connect(&socket, producer_bus.clone()).await.unwrap();
    let emitter = producer_bus
        .emitter_for("task_9_0000abcd", "code-reviewer")
        .with_ordering_key("adapter");
    emitter.adapter_validation(true, None);
    emitter.adapter_prompt_load(2048, None);
    emitter.adapter_execution("task_call", "claude-opus", Duration::from_millis(1500), Some("rate limited"));

    wait_until("three adapter events", || received.lock().unwrap().len() == 3).await;
    let events = received.lock().unwrap().clone();
    assert!(events.iter().all(|e| e.task_id == "task_9_0000abcd"));

    match &events[0].kind {
        EventKind::AdapterValidation(v) => {
            assert_eq!(v.agent_type, "code-reviewer");
            assert!(v.valid);
            assert!(v.error.is_empty());
        }
        other => panic!("expected adapter validation, got {other:?}"),
    }
    match &events[1].kind {
        EventKind::AdapterPromptLoad(p) => {
            assert!(p.success);
            assert_eq!(p.prompt_length, 2048);
        }
        other => panic!("expected prompt load, got {other:?}"),
    }
    match &events[2].kind {
        EventKind::AdapterExecution(x) => {
            assert_eq!(x.phase, "task_call");
            assert_eq!(x.model, "claude-opus");
            assert_eq!(x.duration, Duration::from_millis(1500));
            assert!(!x.success);
            assert_eq!(x.error, "rate limited");
        }
        other => panic!("expected adapter execution, got {other:?}"),
    }

    client.disconnect().await;
    server.stop().await;
}

#[tokio::test]
async fn test_server_run_stops_on_cancel() {
    let temp = TempDir::new().unwrap();
    let socket = temp.path().join("monitor.sock");
    let server = Arc::new(MonitorServer::new(&socket, Arc::new(EventBus::with_defaults()), 10));
    let ctx = CancellationToken::new();

    let handle = tokio::spawn({
        let server = server.clone();
        let ctx = ctx.clone();
        async move { server.run(ctx).await }
    });
    wait_until("socket bound", || socket.exists()).await;

    ctx.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), handle).await;
    assert!(result.unwrap().unwrap().is_ok());
    assert!(!socket.exists());
}

// =============================================================================
// Events file
// =============================================================================

#[tokio::test]
async fn test_recorded_events_are_consumed_from_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("logs").join("events.jsonl");

    let producer_bus = Arc::new(EventBus::with_defaults());
    let writer = Arc::new(EventFileWriter::open(&path).unwrap());
    writer.attach(&producer_bus);

    let consumer_bus = Arc::new(EventBus::with_defaults());
    let seen = collect(&consumer_bus);
    let consumer = EventConsumer::new(
        ConsumerConfig {
            event_file: path.clone(),
            poll_interval_ms: 20,
            ..Default::default()
        },
        consumer_bus.clone(),
    );
    let ctx = CancellationToken::new();
    consumer.start(&ctx).unwrap();

    producer_bus.publish(started("task_1_aaaaaaaa"));
    producer_bus.publish(Event::new(
        "task_1_aaaaaaaa",
        EventKind::TaskProgress(TaskProgress {
            stage: "execution".to_string(),
            progress: 0.25,
            ..Default::default()
        }),
    ));
    producer_bus.publish(Event::new(
        "task_1_aaaaaaaa",
        EventKind::TaskCompleted(TaskCompleted {
            output: "ok".to_string(),
            ..Default::default()
        }),
    ));

    wait_until("three consumed events", || seen.lock().unwrap().len() == 3).await;
    let types: Vec<_> = seen.lock().unwrap().iter().map(|(_, t)| t.clone()).collect();
    assert_eq!(types, ["task.started", "task.progress", "task.completed"]);

    let file_len = std::fs::metadata(&path).unwrap().len();
    wait_until("offset at end of file", || consumer.current_offset() == file_len).await;
    let stats = consumer.stats();
    assert_eq!(stats.published, 3);
    assert_eq!(stats.malformed, 0);

    ctx.cancel();
    consumer.stop().await;
    assert!(!consumer.is_running());
}
