//! Event model and in-process event bus
//!
//! ```text
//!   Orchestrator ──┐                       ┌── subscriber callbacks
//!   MonitorServer ─┼──► EventBus shards ───┼── MonitorClient (forward to socket)
//!   EventConsumer ─┘    (N bounded queues) └── EventFileWriter (JSONL)
//! ```
//!
//! Producers call [`EventBus::publish_async`], which never blocks. Each shard
//! worker delivers its queue in order to the matching subscribers.

mod bus;
mod decode;
mod id;
mod logger;
mod types;

pub use bus::{
    BusConfig, BusError, BusStats, Callback, DEFAULT_BUFFER_SIZE, DEFAULT_WORKERS, EventBus, EventEmitter, Filter,
    SubscriptionId,
};
pub use decode::{UNKNOWN_EVENT_TYPE, decode, decode_record, parse_timestamp};
pub use id::TaskIdGenerator;
pub use logger::{EventFileWriter, read_events};
pub use types::*;
