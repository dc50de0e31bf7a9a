//! Morgana configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::consumer::ConsumerConfig;
use crate::events::BusConfig;
use crate::ipc::{DEFAULT_HISTORY_CAPACITY, socket_path};
use crate::orchestrator::{AgentTimeouts, DEFAULT_MAX_CONCURRENCY};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Event bus sizing
    pub bus: BusConfig,

    /// Monitor socket and history
    pub monitor: MonitorConfig,

    /// Events file tailing
    pub consumer: ConsumerConfig,

    /// Batch execution
    pub orchestrator: OrchestratorConfig,

    /// Per-agent-type timeouts
    pub agents: AgentTimeouts,

    /// TRACE, DEBUG, INFO, WARN or ERROR
    pub log_level: Option<String>,
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// An explicit path must load. Otherwise `./.morgana.yml`, then
    /// `~/.config/morgana/morgana.yml`, then defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        for candidate in Self::candidates() {
            if !candidate.exists() {
                continue;
            }
            match Self::load_from_file(&candidate) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", candidate.display(), e);
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        let path = match config_path {
            Some(path) => path.clone(),
            None => Self::candidates().into_iter().find(|p| p.exists())?,
        };
        let content = fs::read_to_string(path).ok()?;
        let config: Self = serde_yaml::from_str(&content).ok()?;
        config.log_level
    }

    fn candidates() -> Vec<PathBuf> {
        let mut candidates = vec![PathBuf::from(".morgana.yml")];
        if let Some(config_dir) = dirs::config_dir() {
            candidates.push(config_dir.join("morgana").join("morgana.yml"));
        }
        candidates
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

fn default_history_capacity() -> usize {
    DEFAULT_HISTORY_CAPACITY
}

/// Monitor server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MonitorConfig {
    /// Socket path; defaults to the runtime directory
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// Messages retained for viewer replay
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            history_capacity: default_history_capacity(),
        }
    }
}

impl MonitorConfig {
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(socket_path)
    }
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OrchestratorConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}
