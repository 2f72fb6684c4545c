//! State manager messages
//!
//! Commands and responses for the actor pattern.

use thiserror::Error;
use tokio::sync::oneshot;

use super::manager::QueueStats;
use crate::domain::{EntryDraft, EntryState, EntryUpdate, InvalidTransition, PromptEntry, RateLimitWindow};

/// Errors from Entry Store operations
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    /// Submission rejected before reaching the store
    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Channel error")]
    ChannelError,
}

impl StateError {
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, Self::InvalidTransition(_))
    }
}

/// Response from state operations
pub type StateResponse<T> = Result<T, StateError>;

/// Commands sent to the StateManager actor
#[derive(Debug)]
pub enum StateCommand {
    Submit {
        draft: EntryDraft,
        reply: oneshot::Sender<StateResponse<PromptEntry>>,
    },
    Get {
        id: String,
        reply: oneshot::Sender<StateResponse<Option<PromptEntry>>>,
    },
    List {
        state_filter: Option<EntryState>,
        reply: oneshot::Sender<StateResponse<Vec<PromptEntry>>>,
    },
    /// Queued entries with `eligible_at <= now`, in dispatch order
    Eligible {
        now: i64,
        reply: oneshot::Sender<StateResponse<Vec<PromptEntry>>>,
    },
    Transition {
        id: String,
        new_state: EntryState,
        update: EntryUpdate,
        reply: oneshot::Sender<StateResponse<PromptEntry>>,
    },
    Cancel {
        id: String,
        reply: oneshot::Sender<StateResponse<PromptEntry>>,
    },
    Defer {
        id: String,
        until: i64,
        reply: oneshot::Sender<StateResponse<PromptEntry>>,
    },
    Stats {
        reply: oneshot::Sender<StateResponse<QueueStats>>,
    },

    // Rate-limit windows
    SaveRateLimit {
        window: RateLimitWindow,
        reply: oneshot::Sender<StateResponse<()>>,
    },
    ListRateLimits {
        reply: oneshot::Sender<StateResponse<Vec<RateLimitWindow>>>,
    },
    ClearRateLimit {
        backend_id: String,
        reply: oneshot::Sender<StateResponse<()>>,
    },

    /// Stop the actor; the reply is sent after the store is closed
    Shutdown { reply: oneshot::Sender<()> },
}
