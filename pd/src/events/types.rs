//! Event types published on the bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentHealth;
use crate::domain::EntryState;

/// Observable queue activity
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum QueueEvent {
    /// An entry changed state. `old_state` is `None` for a new submission.
    StateChanged {
        entry_id: String,
        old_state: Option<EntryState>,
        new_state: EntryState,
        /// Unix milliseconds
        timestamp: i64,
    },
    /// A backend was marked throttled
    BackendThrottled {
        backend_id: String,
        resume_at: i64,
        timestamp: i64,
    },
    /// An agent's health changed
    AgentHealthChanged {
        agent_id: String,
        health: AgentHealth,
        timestamp: i64,
    },
}

impl QueueEvent {
    /// Get the event type name (for logging)
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "StateChanged",
            Self::BackendThrottled { .. } => "BackendThrottled",
            Self::AgentHealthChanged { .. } => "AgentHealthChanged",
        }
    }

    /// Entry this event refers to, if any
    pub fn entry_id(&self) -> Option<&str> {
        match self {
            Self::StateChanged { entry_id, .. } => Some(entry_id),
            _ => None,
        }
    }
}

/// Event wrapper with wall-clock timestamp, one per JSONL line
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventLogEntry {
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    pub event: QueueEvent,
}

impl EventLogEntry {
    /// Create a new log entry with current timestamp
    pub fn new(event: QueueEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}
