//! Task and result types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Error recorded for tasks a cancelled batch never started
pub const CANCELLED_BEFORE_START: &str = "task cancelled before start";

/// A unit of work for an agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    pub agent_type: String,
    pub prompt: String,
    pub options: Map<String, Value>,
    pub retry_count: u32,
    pub model_hint: String,
    pub complexity: String,
}

impl Task {
    pub fn new(agent_type: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn with_model_hint(mut self, model_hint: impl Into<String>) -> Self {
        self.model_hint = model_hint.into();
        self
    }
}

/// Outcome of one task; `error` is `None` on success
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn success(task_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            output: output.into(),
            error: None,
        }
    }

    pub fn failure(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            output: String::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
