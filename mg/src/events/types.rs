//! Event types for task and orchestrator activity
//!
//! Every event is an [`Event`]: a task ID, a timestamp and a typed
//! [`EventKind`] payload. The wire name of each kind (`task.started`,
//! `orchestrator.completed`, ...) is its [`EventType`].
//!
//! - Task lifecycle (started, progress, completed, failed)
//! - Orchestrator batches (started, completed, failed)
//! - Adapter phases (validation, prompt load, execution)
//! - Anything else arrives as [`EventKind::Generic`] with its raw payload

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Wire name for [`EventType::TaskStarted`]
pub const TASK_STARTED: &str = "task.started";
/// Wire name for [`EventType::TaskProgress`]
pub const TASK_PROGRESS: &str = "task.progress";
/// Wire name for [`EventType::TaskCompleted`]
pub const TASK_COMPLETED: &str = "task.completed";
/// Wire name for [`EventType::TaskFailed`]
pub const TASK_FAILED: &str = "task.failed";
/// Wire name for [`EventType::OrchestratorStarted`]
pub const ORCHESTRATOR_STARTED: &str = "orchestrator.started";
/// Wire name for [`EventType::OrchestratorCompleted`]
pub const ORCHESTRATOR_COMPLETED: &str = "orchestrator.completed";
/// Wire name for [`EventType::OrchestratorFailed`]
pub const ORCHESTRATOR_FAILED: &str = "orchestrator.failed";
/// Wire name for [`EventType::AdapterValidation`]
pub const ADAPTER_VALIDATION: &str = "adapter.validation";
/// Wire name for [`EventType::AdapterPromptLoad`]
pub const ADAPTER_PROMPT_LOAD: &str = "adapter.prompt_load";
/// Wire name for [`EventType::AdapterExecution`]
pub const ADAPTER_EXECUTION: &str = "adapter.execution";

/// Type discriminant of an event
///
/// Subscriptions are keyed by this. Unknown wire names are kept verbatim in
/// [`EventType::Other`] so legacy producers can still be subscribed to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    TaskStarted,
    TaskProgress,
    TaskCompleted,
    TaskFailed,
    OrchestratorStarted,
    OrchestratorCompleted,
    OrchestratorFailed,
    AdapterValidation,
    AdapterPromptLoad,
    AdapterExecution,
    Other(String),
}

impl EventType {
    /// Parse a wire name; never fails
    pub fn parse(name: &str) -> Self {
        match name {
            TASK_STARTED => Self::TaskStarted,
            TASK_PROGRESS => Self::TaskProgress,
            TASK_COMPLETED => Self::TaskCompleted,
            TASK_FAILED => Self::TaskFailed,
            ORCHESTRATOR_STARTED => Self::OrchestratorStarted,
            ORCHESTRATOR_COMPLETED => Self::OrchestratorCompleted,
            ORCHESTRATOR_FAILED => Self::OrchestratorFailed,
            ADAPTER_VALIDATION => Self::AdapterValidation,
            ADAPTER_PROMPT_LOAD => Self::AdapterPromptLoad,
            ADAPTER_EXECUTION => Self::AdapterExecution,
            other => Self::Other(other.to_string()),
        }
    }

    /// The wire name
    pub fn as_str(&self) -> &str {
        match self {
            Self::TaskStarted => TASK_STARTED,
            Self::TaskProgress => TASK_PROGRESS,
            Self::TaskCompleted => TASK_COMPLETED,
            Self::TaskFailed => TASK_FAILED,
            Self::OrchestratorStarted => ORCHESTRATOR_STARTED,
            Self::OrchestratorCompleted => ORCHESTRATOR_COMPLETED,
            Self::OrchestratorFailed => ORCHESTRATOR_FAILED,
            Self::AdapterValidation => ADAPTER_VALIDATION,
            Self::AdapterPromptLoad => ADAPTER_PROMPT_LOAD,
            Self::AdapterExecution => ADAPTER_EXECUTION,
            Self::Other(name) => name,
        }
    }

    /// True for kinds that describe a single task
    pub fn is_task_scoped(&self) -> bool {
        matches!(
            self,
            Self::TaskStarted | Self::TaskProgress | Self::TaskCompleted | Self::TaskFailed
        )
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        Self::parse(name)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task has begun execution
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskStarted {
    pub agent_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub prompt: String,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
    #[serde(skip_serializing_if = "is_zero")]
    pub retry_count: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub model_hint: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub complexity: String,
    #[serde(with = "duration_nanos")]
    pub timeout: Duration,
}

/// Progress report from a running task
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskProgress {
    pub agent_type: String,
    /// validation, prompt_load, execution
    pub stage: String,
    pub message: String,
    /// Always within `0.0..=1.0`
    pub progress: f64,
    /// Time elapsed since the task started
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
}

/// A task finished successfully
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskCompleted {
    pub agent_type: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output: String,
    pub output_length: usize,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    pub model: String,
}

/// A task failed
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskFailed {
    pub agent_type: String,
    pub error: String,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    /// Where the failure occurred
    pub stage: String,
    pub retry_count: u32,
}

/// An orchestrator batch has begun
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorStarted {
    /// sequential or parallel
    pub mode: String,
    pub task_count: usize,
    #[serde(skip_serializing_if = "is_zero_usize")]
    pub max_concurrency: usize,
}

/// An orchestrator batch ran every task
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorCompleted {
    pub mode: String,
    pub task_count: usize,
    pub success_count: usize,
    pub failure_count: usize,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
}

/// An orchestrator batch was aborted before running every task
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorFailed {
    pub mode: String,
    pub task_count: usize,
    pub completed_count: usize,
    pub error: String,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterValidation {
    pub agent_type: String,
    pub valid: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterPromptLoad {
    pub agent_type: String,
    pub success: bool,
    #[serde(skip_serializing_if = "is_zero_usize")]
    pub prompt_length: usize,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterExecution {
    pub agent_type: String,
    /// start, model_selection, task_call, complete
    pub phase: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    pub success: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Unrecognised or legacy event, payload kept as received
#[derive(Clone, Debug, PartialEq)]
pub struct GenericEvent {
    pub event_type: String,
    pub data: Value,
}

/// Kind-specific payload of an [`Event`]
#[derive(Clone, Debug, PartialEq)]
pub enum EventKind {
    TaskStarted(TaskStarted),
    TaskProgress(TaskProgress),
    TaskCompleted(TaskCompleted),
    TaskFailed(TaskFailed),
    OrchestratorStarted(OrchestratorStarted),
    OrchestratorCompleted(OrchestratorCompleted),
    OrchestratorFailed(OrchestratorFailed),
    AdapterValidation(AdapterValidation),
    AdapterPromptLoad(AdapterPromptLoad),
    AdapterExecution(AdapterExecution),
    Generic(GenericEvent),
}

/// An immutable record of something that happened
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl Event {
    /// Create an event stamped with the current time
    pub fn new(task_id: impl Into<String>, kind: EventKind) -> Self {
        Self::with_timestamp(task_id, Utc::now(), kind)
    }

    /// Create an event with an explicit timestamp
    pub fn with_timestamp(task_id: impl Into<String>, timestamp: DateTime<Utc>, kind: EventKind) -> Self {
        let kind = match kind {
            EventKind::TaskProgress(mut p) => {
                p.progress = clamp_progress(p.progress);
                EventKind::TaskProgress(p)
            }
            EventKind::TaskCompleted(mut c) => {
                if c.output_length == 0 {
                    c.output_length = c.output.len();
                }
                EventKind::TaskCompleted(c)
            }
            other => other,
        };
        Self {
            task_id: task_id.into(),
            timestamp,
            kind,
        }
    }

    /// Get the type discriminant
    pub fn event_type(&self) -> EventType {
        EventType::parse(self.type_name())
    }

    /// Get the wire name of this event's type
    pub fn type_name(&self) -> &str {
        match &self.kind {
            EventKind::TaskStarted(_) => TASK_STARTED,
            EventKind::TaskProgress(_) => TASK_PROGRESS,
            EventKind::TaskCompleted(_) => TASK_COMPLETED,
            EventKind::TaskFailed(_) => TASK_FAILED,
            EventKind::OrchestratorStarted(_) => ORCHESTRATOR_STARTED,
            EventKind::OrchestratorCompleted(_) => ORCHESTRATOR_COMPLETED,
            EventKind::OrchestratorFailed(_) => ORCHESTRATOR_FAILED,
            EventKind::AdapterValidation(_) => ADAPTER_VALIDATION,
            EventKind::AdapterPromptLoad(_) => ADAPTER_PROMPT_LOAD,
            EventKind::AdapterExecution(_) => ADAPTER_EXECUTION,
            EventKind::Generic(g) => &g.event_type,
        }
    }

    /// Agent type for kinds that carry one
    pub fn agent_type(&self) -> Option<&str> {
        match &self.kind {
            EventKind::TaskStarted(e) => Some(e.agent_type.as_str()),
            EventKind::TaskProgress(e) => Some(e.agent_type.as_str()),
            EventKind::TaskCompleted(e) => Some(e.agent_type.as_str()),
            EventKind::TaskFailed(e) => Some(e.agent_type.as_str()),
            EventKind::AdapterValidation(e) => Some(e.agent_type.as_str()),
            EventKind::AdapterPromptLoad(e) => Some(e.agent_type.as_str()),
            EventKind::AdapterExecution(e) => Some(e.agent_type.as_str()),
            EventKind::Generic(g) => g.data.get("agent_type").and_then(Value::as_str),
            _ => None,
        }
    }

    /// Flat JSON object: base fields plus the kind-specific payload
    ///
    /// This is the `data` of a wire envelope and the shape of one line in an
    /// events file. Generic events return their raw payload untouched.
    pub fn to_data(&self) -> Value {
        let payload = match &self.kind {
            EventKind::TaskStarted(e) => serde_json::to_value(e),
            EventKind::TaskProgress(e) => serde_json::to_value(e),
            EventKind::TaskCompleted(e) => serde_json::to_value(e),
            EventKind::TaskFailed(e) => serde_json::to_value(e),
            EventKind::OrchestratorStarted(e) => serde_json::to_value(e),
            EventKind::OrchestratorCompleted(e) => serde_json::to_value(e),
            EventKind::OrchestratorFailed(e) => serde_json::to_value(e),
            EventKind::AdapterValidation(e) => serde_json::to_value(e),
            EventKind::AdapterPromptLoad(e) => serde_json::to_value(e),
            EventKind::AdapterExecution(e) => serde_json::to_value(e),
            EventKind::Generic(g) => return g.data.clone(),
        };

        // Payload structs only hold strings, numbers and maps
        let mut object = match payload {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        object.insert("event_type".to_string(), Value::String(self.type_name().to_string()));
        object.insert("task_id".to_string(), Value::String(self.task_id.clone()));
        object.insert(
            "timestamp".to_string(),
            Value::String(self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)),
        );
        Value::Object(object)
    }
}

/// Clamp a progress fraction into `0.0..=1.0` (NaN becomes 0)
pub fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() { 0.0 } else { progress.clamp(0.0, 1.0) }
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

fn is_zero_usize(n: &usize) -> bool {
    *n == 0
}

/// Durations travel as integer nanoseconds
///
/// Decoding also accepts Go-style duration strings (`"1.5s"`, `"1m30s"`) and
/// floating point nanoseconds. Anything unreadable decodes as zero rather than
/// failing the whole event.
pub mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(from_value(&value).unwrap_or_default())
    }

    /// Read a duration from a JSON value
    pub fn from_value(value: &Value) -> Option<Duration> {
        match value {
            Value::Number(n) => {
                if let Some(nanos) = n.as_u64() {
                    Some(Duration::from_nanos(nanos))
                } else {
                    n.as_f64().filter(|f| *f >= 0.0).map(|f| Duration::from_nanos(f as u64))
                }
            }
            Value::String(s) => parse(s),
            _ => None,
        }
    }

    /// Parse a Go-style duration string such as `300ms`, `1.5h` or `2h45m`
    pub fn parse(input: &str) -> Option<Duration> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }
        if input == "0" {
            return Some(Duration::ZERO);
        }

        let mut total = 0f64;
        let mut rest = input;
        while !rest.is_empty() {
            let number_len = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
            if number_len == 0 {
                return None;
            }
            let number: f64 = rest[..number_len].parse().ok()?;
            rest = &rest[number_len..];

            let unit_len = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
            let nanos_per_unit = match &rest[..unit_len] {
                "ns" => 1.0,
                "us" | "µs" | "μs" => 1e3,
                "ms" => 1e6,
                "s" => 1e9,
                "m" => 60e9,
                "h" => 3600e9,
                _ => return None,
            };
            rest = &rest[unit_len..];
            total += number * nanos_per_unit;
        }

        Some(Duration::from_nanos(total as u64))
    }
}
