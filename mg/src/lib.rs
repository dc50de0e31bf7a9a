//! Morgana - real-time monitoring core for multi-agent task runs
//!
//! Agents run as short-lived processes. Each one publishes lifecycle events
//! to an in-process [`events::EventBus`]; an [`ipc::MonitorClient`] forwards
//! them over a Unix socket to a long-lived [`ipc::MonitorServer`], which keeps
//! a bounded history and streams it to late-joining viewers
//! ([`ipc::MonitorReceiver`]). Events appended to a JSONL file can be ingested
//! instead by the [`consumer::EventConsumer`].
//!
//! # Modules
//!
//! - [`events`] - Event model, event bus, JSONL decoding
//! - [`ipc`] - Monitor server, forwarding client, viewer receiver
//! - [`consumer`] - Events file tailing
//! - [`orchestrator`] - Sequential and bounded-parallel task batches
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod cli;
pub mod config;
pub mod consumer;
pub mod events;
pub mod ipc;
pub mod orchestrator;
pub mod render;

pub use config::Config;
pub use consumer::{ConsumerConfig, ConsumerStats, EventConsumer};
pub use events::{BusConfig, BusStats, Event, EventBus, EventEmitter, EventKind, EventType, SubscriptionId};
pub use ipc::{EventHistory, IpcMessage, MonitorClient, MonitorReceiver, MonitorServer};
pub use orchestrator::{AgentTimeouts, ExecError, Orchestrator, Task, TaskExecutor, TaskResult, TimeoutExecutor};
