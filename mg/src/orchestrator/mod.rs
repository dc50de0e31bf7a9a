//! Orchestrator - runs batches of tasks and emits their lifecycle events
//!
//! A batch runs sequentially or with bounded parallelism. Every batch emits
//! `orchestrator.started` and then either `orchestrator.completed` or, when
//! cancellation left tasks unfinished, `orchestrator.failed`. Every task that
//! starts emits `task.started` and then `task.completed` or `task.failed`.
//!
//! Task failures are data: they land in the task's [`TaskResult`] and never
//! abort sibling tasks. Event emission is fire-and-forget, so a closed or
//! saturated bus never affects execution.

mod executor;
mod task;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
pub use executor::mock;
pub use executor::{AgentTimeouts, ExecError, TaskExecutor, TimeoutExecutor};
pub use task::{CANCELLED_BEFORE_START, Task, TaskResult};

use crate::events::{
    Event, EventBus, EventKind, OrchestratorCompleted, OrchestratorFailed, OrchestratorStarted, TaskIdGenerator,
    TaskStarted,
};

/// Concurrency used when zero is requested
pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

const SEQUENTIAL: &str = "sequential";
const PARALLEL: &str = "parallel";

/// A task's result plus whether it ran to completion
struct TaskRun {
    result: TaskResult,
    finished: bool,
}

impl TaskRun {
    fn not_started(task_id: String) -> Self {
        Self {
            result: TaskResult::failure(task_id, CANCELLED_BEFORE_START),
            finished: false,
        }
    }
}

/// Executes one task and emits its events; cheap to clone into spawned tasks
#[derive(Clone)]
struct Runner {
    executor: Arc<dyn TaskExecutor>,
    bus: Option<Arc<EventBus>>,
}

impl Runner {
    /// Task events share the batch's ordering lane, after its started event
    async fn run(&self, batch_id: &str, task_id: String, task: Task, cancel: CancellationToken) -> TaskRun {
        let emitter = self.bus.as_ref().map(|bus| {
            bus.emitter_for(task_id.clone(), task.agent_type.clone())
                .with_ordering_key(batch_id)
        });
        let timeout = self.executor.timeout_for(&task.agent_type).unwrap_or_default();

        if let Some(emitter) = &emitter {
            emitter.task_started(TaskStarted {
                prompt: task.prompt.clone(),
                options: task.options.clone(),
                retry_count: task.retry_count,
                model_hint: task.model_hint.clone(),
                complexity: task.complexity.clone(),
                timeout,
                ..Default::default()
            });
        }
        debug!(%task_id, agent_type = %task.agent_type, "Orchestrator: task started");

        let started = Instant::now();
        let execution = AssertUnwindSafe(self.executor.execute(&task, &cancel)).catch_unwind();
        let outcome = tokio::select! {
            biased;
            outcome = execution => outcome,
            _ = cancel.cancelled() => Ok(Err(ExecError::Cancelled)),
        };
        let elapsed = started.elapsed();

        let (result, finished) = match outcome {
            Ok(Ok(output)) => {
                if let Some(emitter) = &emitter {
                    emitter.task_completed(&output, &task.model_hint, elapsed);
                }
                (TaskResult::success(task_id.clone(), output), true)
            }
            Ok(Err(e)) => {
                if let Some(emitter) = &emitter {
                    emitter.task_failed(&e.to_string(), e.stage(), task.retry_count, elapsed);
                }
                let finished = e != ExecError::Cancelled;
                (TaskResult::failure(task_id.clone(), e.to_string()), finished)
            }
            Err(panic) => {
                let message = format!("executor panicked: {}", panic_message(panic.as_ref()));
                warn!(%task_id, agent_type = %task.agent_type, %message, "Orchestrator: task panicked");
                if let Some(emitter) = &emitter {
                    emitter.task_failed(&message, "execution", task.retry_count, elapsed);
                }
                (TaskResult::failure(task_id.clone(), message), true)
            }
        };

        debug!(%task_id, success = result.is_success(), ?elapsed, "Orchestrator: task finished");
        TaskRun { result, finished }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs batches of tasks against a [`TaskExecutor`]
pub struct Orchestrator {
    runner: Runner,
    max_concurrency: usize,
    ids: TaskIdGenerator,
}

impl Orchestrator {
    /// A `max_concurrency` of zero means [`DEFAULT_MAX_CONCURRENCY`]
    pub fn new(executor: Arc<dyn TaskExecutor>, max_concurrency: usize) -> Self {
        Self {
            runner: Runner { executor, bus: None },
            max_concurrency: if max_concurrency == 0 {
                DEFAULT_MAX_CONCURRENCY
            } else {
                max_concurrency
            },
            ids: TaskIdGenerator::new(),
        }
    }

    /// Emit lifecycle events to this bus
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.runner.bus = Some(bus);
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Run tasks one after another
    ///
    /// Once `ctx` is cancelled the running task is told to stop and the rest
    /// are not started. Results always line up with `tasks`.
    pub async fn run_sequential(&self, ctx: &CancellationToken, tasks: Vec<Task>) -> Vec<TaskResult> {
        let batch_id = self.ids.next_id();
        let task_count = tasks.len();
        info!(%batch_id, task_count, "Orchestrator: starting sequential batch");
        self.emit(&batch_id, EventKind::OrchestratorStarted(OrchestratorStarted {
            mode: SEQUENTIAL.to_string(),
            task_count,
            max_concurrency: 1,
        }));

        let started = Instant::now();
        let mut runs = Vec::with_capacity(task_count);
        for task in tasks {
            let task_id = self.ids.next_id();
            if ctx.is_cancelled() {
                runs.push(TaskRun::not_started(task_id));
                continue;
            }
            runs.push(self.runner.run(&batch_id, task_id, task, ctx.clone()).await);
        }

        self.finish(&batch_id, SEQUENTIAL, runs, started.elapsed())
    }

    /// Run tasks concurrently, at most `max_concurrency` at a time
    ///
    /// Zero uses the orchestrator's configured limit. Tasks waiting for a
    /// slot when `ctx` is cancelled are not started. Results always line up
    /// with `tasks`, whatever order they finish in.
    pub async fn run_parallel(
        &self,
        ctx: &CancellationToken,
        tasks: Vec<Task>,
        max_concurrency: usize,
    ) -> Vec<TaskResult> {
        let limit = if max_concurrency == 0 {
            self.max_concurrency
        } else {
            max_concurrency
        };
        let batch_id = self.ids.next_id();
        let task_count = tasks.len();
        info!(%batch_id, task_count, limit, "Orchestrator: starting parallel batch");
        self.emit(&batch_id, EventKind::OrchestratorStarted(OrchestratorStarted {
            mode: PARALLEL.to_string(),
            task_count,
            max_concurrency: limit,
        }));

        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(limit));
        let handles: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                let task_id = self.ids.next_id();
                let runner = self.runner.clone();
                let semaphore = semaphore.clone();
                let ctx = ctx.clone();
                let batch_id = batch_id.clone();
                let handle = tokio::spawn({
                    let task_id = task_id.clone();
                    async move {
                        let permit = tokio::select! {
                            biased;
                            _ = ctx.cancelled() => None,
                            permit = semaphore.acquire_owned() => permit.ok(),
                        };
                        let Some(_permit) = permit else {
                            return TaskRun::not_started(task_id);
                        };
                        runner.run(&batch_id, task_id, task, ctx).await
                    }
                });
                (task_id, handle)
            })
            .collect();

        let mut runs = Vec::with_capacity(task_count);
        for (task_id, handle) in handles {
            match handle.await {
                Ok(run) => runs.push(run),
                Err(e) => {
                    warn!(%task_id, error = %e, "Orchestrator: task join failed");
                    runs.push(TaskRun {
                        result: TaskResult::failure(task_id, format!("task aborted: {e}")),
                        finished: true,
                    });
                }
            }
        }

        self.finish(&batch_id, PARALLEL, runs, started.elapsed())
    }

    fn finish(&self, batch_id: &str, mode: &str, runs: Vec<TaskRun>, duration: Duration) -> Vec<TaskResult> {
        let task_count = runs.len();
        let completed_count = runs.iter().filter(|run| run.finished).count();
        let success_count = runs.iter().filter(|run| run.result.is_success()).count();
        let failure_count = task_count - success_count;

        if completed_count < task_count {
            warn!(%batch_id, mode, completed_count, task_count, "Orchestrator: batch cancelled");
            self.emit(batch_id, EventKind::OrchestratorFailed(OrchestratorFailed {
                mode: mode.to_string(),
                task_count,
                completed_count,
                error: "cancelled".to_string(),
                duration,
            }));
        } else {
            info!(%batch_id, mode, success_count, failure_count, ?duration, "Orchestrator: batch completed");
            self.emit(batch_id, EventKind::OrchestratorCompleted(OrchestratorCompleted {
                mode: mode.to_string(),
                task_count,
                success_count,
                failure_count,
                duration,
            }));
        }

        runs.into_iter().map(|run| run.result).collect()
    }

    fn emit(&self, batch_id: &str, kind: EventKind) {
        if let Some(bus) = &self.runner.bus
            && !bus.publish_keyed(batch_id, Event::new(batch_id, kind))
        {
            debug!(%batch_id, "Orchestrator: batch event not accepted");
        }
    }
}
