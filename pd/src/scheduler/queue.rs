//! Dispatch results and scheduler statistics

use std::fmt;

use serde::Serialize;

/// Result of one dispatch attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchResult {
    /// Entry bound to its agents and started
    Dispatched { entry_id: String, agents: Vec<String> },

    /// No agent can serve the entry; it stays queued until `until`
    Deferred { entry_id: String, until: i64 },

    /// Routed backend is throttled; entry moved to `rate_limited`
    Parked { entry_id: String, resume_at: i64 },

    /// Every slot or every capable agent is busy
    AtCapacity,

    /// Nothing is eligible right now
    Idle,
}

impl DispatchResult {
    /// Whether another dispatch attempt in the same cycle may make progress
    pub fn made_progress(&self) -> bool {
        matches!(
            self,
            Self::Dispatched { .. } | Self::Deferred { .. } | Self::Parked { .. }
        )
    }
}

/// Statistics for the scheduler
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    /// Retryable failures sent back to `queued`
    pub retried: u64,
    /// Entries moved to `rate_limited`, on dispatch or after a call
    pub rate_limited: u64,
    /// Entries deferred because no agent could serve them
    pub deferred: u64,
    pub peak_concurrent: usize,
}

impl fmt::Display for SchedulerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dispatched: {}, completed: {}, failed: {}, retried: {}, rate_limited: {}, deferred: {}, peak_concurrent: {}",
            self.dispatched,
            self.completed,
            self.failed,
            self.retried,
            self.rate_limited,
            self.deferred,
            self.peak_concurrent
        )
    }
}
