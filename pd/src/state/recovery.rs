//! Crash recovery
//!
//! Entries left `executing` by a crashed process never got an agent outcome,
//! so they go back to `queued` without consuming a retry.

use tracing::{debug, info, warn};

use super::{StateError, StateManager};
use crate::domain::{EntryState, EntryUpdate};

/// Recovery statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Entries moved from `executing` back to `queued`
    pub requeued: usize,
    /// Entries still parked in `rate_limited`, left for the sweep
    pub rate_limited: usize,
}

impl std::fmt::Display for RecoveryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "requeued: {}, rate_limited: {}", self.requeued, self.rate_limited)
    }
}

/// Requeue every entry that was mid-execution when the last process stopped
///
/// `retry_count` is kept and `assigned_agent_id` is cleared by the
/// `executing -> queued` transition.
pub async fn recover(state: &StateManager) -> eyre::Result<RecoveryStats> {
    debug!("recover: called");
    let mut stats = RecoveryStats::default();

    let executing = state
        .list(Some(EntryState::Executing))
        .await
        .map_err(|e| eyre::eyre!("Failed to list executing entries: {}", e))?;

    for entry in &executing {
        debug!(id = %entry.id, agent = ?entry.assigned_agent_id, "Found executing entry needing recovery");
        match state.transition(&entry.id, EntryState::Queued, EntryUpdate::new()).await {
            Ok(_) => stats.requeued += 1,
            // Another process moved it first
            Err(StateError::InvalidTransition(e)) => warn!(id = %entry.id, error = %e, "Entry changed during recovery"),
            Err(e) => return Err(eyre::eyre!("Failed to requeue {}: {}", entry.id, e)),
        }
    }

    stats.rate_limited = state
        .list(Some(EntryState::RateLimited))
        .await
        .map_err(|e| eyre::eyre!("Failed to list rate-limited entries: {}", e))?
        .len();

    if stats.requeued > 0 || stats.rate_limited > 0 {
        info!(%stats, "Recovery complete");
    } else {
        debug!("recover: nothing to recover");
    }
    Ok(stats)
}
