//! Scheduler configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ratelimit::RequestWindow;

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SchedulerConfig {
    /// Upper bound on the wait for new work when the queue is idle
    pub poll_interval_ms: u64,

    /// Max agent calls in flight
    pub concurrent_tasks: usize,

    /// Deadline for a single agent call
    pub execution_timeout_ms: u64,

    /// How often `rate_limited` entries are checked for an elapsed window
    pub sweep_interval_ms: u64,

    /// How often unreachable agents are probed
    pub health_check_interval_ms: u64,

    /// Throttle cycles an entry may go through before it fails; unset is
    /// unbounded
    pub max_rate_limit_cycles: Option<u32>,

    /// Dispatches allowed per backend within `rate-window-secs`; unset
    /// disables the proactive window
    pub max_requests_per_window: Option<u32>,

    /// Proactive request window duration in seconds
    pub rate_window_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            concurrent_tasks: 2,
            execution_timeout_ms: 3_600_000,
            sweep_interval_ms: 5_000,
            health_check_interval_ms: 60_000,
            max_rate_limit_cycles: None,
            max_requests_per_window: None,
            rate_window_secs: 60,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }

    /// Get the rate window as a Duration
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.rate_window_secs)
    }

    /// Proactive per-backend request window, if configured
    pub fn request_window(&self) -> Option<RequestWindow> {
        self.max_requests_per_window.map(|max_requests| RequestWindow {
            max_requests: max_requests.max(1),
            window: self.rate_window(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.concurrent_tasks, 2);
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.execution_timeout(), Duration::from_secs(3600));
        assert!(config.max_rate_limit_cycles.is_none());
        assert!(config.request_window().is_none());
    }

    #[test]
    fn test_request_window() {
        let config = SchedulerConfig {
            max_requests_per_window: Some(5),
            rate_window_secs: 120,
            ..Default::default()
        };
        assert_eq!(
            config.request_window(),
            Some(RequestWindow {
                max_requests: 5,
                window: Duration::from_secs(120),
            })
        );
    }

    #[test]
    fn test_parse_kebab_case_partial() {
        let yaml = "concurrent-tasks: 4\nmax-rate-limit-cycles: 10\n";
        let config: SchedulerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.concurrent_tasks, 4);
        assert_eq!(config.max_rate_limit_cycles, Some(10));
        assert_eq!(config.sweep_interval_ms, 5_000);
    }
}
