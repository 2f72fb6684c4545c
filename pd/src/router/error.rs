//! Router errors

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
    /// No healthy agent matches the entry. Transient: the scheduler defers
    /// the entry without consuming a retry.
    #[error("No eligible agent for {entry_id}: {reason}")]
    NoEligibleAgent { entry_id: String, reason: String },

    /// Matching agents exist but all are at their concurrency limit
    #[error("All eligible agents for {entry_id} are at capacity")]
    AtCapacity { entry_id: String },

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),
}

impl RouterError {
    pub fn no_eligible(entry_id: &str, reason: impl Into<String>) -> Self {
        Self::NoEligibleAgent {
            entry_id: entry_id.to_string(),
            reason: reason.into(),
        }
    }
}
