//! Event consumer configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_event_file() -> PathBuf {
    PathBuf::from("/tmp/morgana/events.jsonl")
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_buffer_size() -> usize {
    64 * 1024
}

/// Where and how often to tail the events file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConsumerConfig {
    /// JSONL file to tail
    #[serde(default = "default_event_file")]
    pub event_file: PathBuf,

    /// Fallback poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Read chunk size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            event_file: default_event_file(),
            poll_interval_ms: default_poll_interval_ms(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl ConsumerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConsumerConfig::default();
        assert_eq!(config.event_file, PathBuf::from("/tmp/morgana/events.jsonl"));
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.buffer_size, 65536);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: ConsumerConfig = serde_yaml::from_str("poll-interval-ms: 250").unwrap();
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.buffer_size, 65536);
    }
}
