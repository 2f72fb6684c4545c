//! promptd configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::agent::AgentConfig;
use crate::domain::{QueueDefaults, RoutingStrategy};
use crate::pool::DEFAULT_UNREACHABLE_AFTER;
use crate::ratelimit::BackoffPolicy;
use crate::scheduler::SchedulerConfig;

/// Main promptd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level used when `--log-level` is not given
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Submission bounds and defaults
    pub queue: QueueConfig,

    /// Scheduler loop settings
    pub scheduler: SchedulerConfig,

    /// Retry backoff
    pub backoff: BackoffConfig,

    /// Routing defaults
    pub router: RouterConfig,

    /// Agent pool health settings
    pub pool: PoolConfig,

    /// Agents registered when the scheduler starts
    pub agents: Vec<AgentConfig>,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Catches inconsistent bounds and duplicate agent ids early with clear
    /// error messages.
    pub fn validate(&self) -> Result<()> {
        let queue = &self.queue;
        if queue.min_priority > queue.max_priority {
            return Err(eyre::eyre!(
                "queue.min-priority ({}) is greater than queue.max-priority ({})",
                queue.min_priority,
                queue.max_priority
            ));
        }
        if queue.default_priority < queue.min_priority || queue.default_priority > queue.max_priority {
            return Err(eyre::eyre!(
                "queue.default-priority ({}) is outside [{}, {}]",
                queue.default_priority,
                queue.min_priority,
                queue.max_priority
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(eyre::eyre!("backoff.jitter must be within 0.0..=1.0, got {}", self.backoff.jitter));
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                return Err(eyre::eyre!("Agent definitions need a non-empty id"));
            }
            if !seen.insert(agent.id.as_str()) {
                return Err(eyre::eyre!("Duplicate agent id: {}", agent.id));
            }
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .promptd.yml
        let local_config = PathBuf::from(".promptd.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/promptd/promptd.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("promptd").join("promptd.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the entry store and event log
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        // XDG data directory (~/.local/share/promptd/store on Linux)
        let path = dirs::data_local_dir()
            .map(|d| d.join("promptd").join("store"))
            .unwrap_or_else(|| PathBuf::from(".promptd"));
        Self { path }
    }
}

impl StorageConfig {
    /// JSONL event log next to the store
    pub fn events_path(&self) -> PathBuf {
        self.path.join("events.jsonl")
    }
}

/// Submission bounds and defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    #[serde(rename = "min-priority")]
    pub min_priority: i32,

    #[serde(rename = "max-priority")]
    pub max_priority: i32,

    #[serde(rename = "default-priority")]
    pub default_priority: i32,

    #[serde(rename = "default-max-retries")]
    pub default_max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let defaults = QueueDefaults::default();
        Self {
            min_priority: defaults.min_priority,
            max_priority: defaults.max_priority,
            default_priority: defaults.default_priority,
            default_max_retries: defaults.default_max_retries,
        }
    }
}

impl QueueConfig {
    pub fn defaults(&self) -> QueueDefaults {
        QueueDefaults {
            min_priority: self.min_priority,
            max_priority: self.max_priority,
            default_priority: self.default_priority,
            default_max_retries: self.default_max_retries,
        }
    }
}

/// Retry backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry in milliseconds
    #[serde(rename = "base-ms")]
    pub base_ms: u64,

    /// Upper bound on any retry delay in milliseconds
    #[serde(rename = "max-ms")]
    pub max_ms: u64,

    /// Random spread applied to each delay, 0.0..=1.0
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 30_000,
            max_ms: 1_800_000,
            jitter: 0.2,
        }
    }
}

impl BackoffConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.base_ms),
            Duration::from_millis(self.max_ms),
            self.jitter,
        )
    }
}

/// Routing defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Strategy for entries that do not name one
    pub strategy: RoutingStrategy,

    /// Throttle window assumed when a backend signals a limit without a
    /// resume time
    #[serde(rename = "default-rate-limit-secs")]
    pub default_rate_limit_secs: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::Capability,
            default_rate_limit_secs: 60,
        }
    }
}

impl RouterConfig {
    pub fn default_rate_limit(&self) -> Duration {
        Duration::from_secs(self.default_rate_limit_secs)
    }
}

/// Agent pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Consecutive reachability failures before an agent is marked unreachable
    #[serde(rename = "unreachable-after")]
    pub unreachable_after: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            unreachable_after: DEFAULT_UNREACHABLE_AFTER,
        }
    }
}
