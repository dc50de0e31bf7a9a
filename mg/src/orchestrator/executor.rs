//! Task execution contract
//!
//! The orchestrator knows nothing about how a task runs; it only calls a
//! [`TaskExecutor`]. [`TimeoutExecutor`] wraps any executor with per-agent
//! time limits.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::task::Task;

/// Why a task did not produce output
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    #[error("task cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl ExecError {
    /// Stage reported in the TaskFailed event
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "execution",
        }
    }
}

/// Runs one task to completion
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute the task, returning its output
    ///
    /// Implementations should stop early once `cancel` fires.
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> Result<String, ExecError>;

    /// Time limit applied to this agent type, if any
    fn timeout_for(&self, _agent_type: &str) -> Option<Duration> {
        None
    }
}

fn default_timeout_secs() -> u64 {
    120
}

/// Per-agent-type timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AgentTimeouts {
    /// Applied to agent types without an override
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Agent type to timeout in seconds
    #[serde(default)]
    pub timeouts: BTreeMap<String, u64>,
}

impl Default for AgentTimeouts {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            timeouts: BTreeMap::new(),
        }
    }
}

impl AgentTimeouts {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn timeout_for(&self, agent_type: &str) -> Duration {
        self.timeouts
            .get(agent_type)
            .map(|secs| Duration::from_secs(*secs))
            .unwrap_or_else(|| self.default_timeout())
    }
}

/// Enforces per-agent-type timeouts around another executor
pub struct TimeoutExecutor<E> {
    inner: E,
    timeouts: AgentTimeouts,
}

impl<E: TaskExecutor> TimeoutExecutor<E> {
    pub fn new(inner: E, timeouts: AgentTimeouts) -> Self {
        Self { inner, timeouts }
    }
}

#[async_trait]
impl<E: TaskExecutor> TaskExecutor for TimeoutExecutor<E> {
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> Result<String, ExecError> {
        let limit = self.timeouts.timeout_for(&task.agent_type);
        debug!(agent_type = %task.agent_type, ?limit, "TimeoutExecutor::execute");
        match tokio::time::timeout(limit, self.inner.execute(task, cancel)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(agent_type = %task.agent_type, ?limit, "TimeoutExecutor: task timed out");
                Err(ExecError::Timeout(limit))
            }
        }
    }

    fn timeout_for(&self, agent_type: &str) -> Option<Duration> {
        Some(self.timeouts.timeout_for(agent_type))
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockExecutor;
    use super::*;

    #[test]
    fn test_agent_timeouts_lookup() {
        let mut timeouts = AgentTimeouts::default();
        timeouts.timeouts.insert("code-implementer".to_string(), 300);

        assert_eq!(timeouts.timeout_for("code-implementer"), Duration::from_secs(300));
        assert_eq!(timeouts.timeout_for("anything-else"), Duration::from_secs(120));
    }

    #[test]
    fn test_agent_timeouts_yaml() {
        let yaml = "default-timeout-secs: 30\ntimeouts:\n  test-specialist: 90\n";
        let timeouts: AgentTimeouts = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(timeouts.default_timeout(), Duration::from_secs(30));
        assert_eq!(timeouts.timeout_for("test-specialist"), Duration::from_secs(90));
    }

    #[tokio::test]
    async fn test_timeout_executor_passes_fast_tasks() {
        let executor = TimeoutExecutor::new(MockExecutor::new(), AgentTimeouts::default());
        let output = executor
            .execute(&Task::new("a", "hello"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output, "hello");
        assert_eq!(executor.timeout_for("a"), Some(Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn test_timeout_executor_times_out() {
        let mut timeouts = AgentTimeouts::default();
        timeouts.timeouts.insert("slow".to_string(), 0);
        let executor = TimeoutExecutor::new(MockExecutor::new(), timeouts);

        let task = Task::new("slow", "zzz").with_option("delay_ms", 5_000);
        let err = executor.execute(&task, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err, ExecError::Timeout(Duration::ZERO));
        assert_eq!(err.stage(), "timeout");
    }

    #[test]
    fn test_error_display() {
        assert_eq!(ExecError::Failed("boom".to_string()).to_string(), "boom");
        assert_eq!(ExecError::Cancelled.to_string(), "task cancelled");
    }
}
