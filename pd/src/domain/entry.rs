//! PromptEntry - a queued unit of work and its lifecycle
//!
//! State machine:
//!
//! ```text
//! queued -> executing -> completed
//!    |          |-----> queued        (retryable failure, retries left)
//!    |          |-----> rate_limited  (backend throttled)
//!    |          |-----> failed        (fatal, or retries exhausted)
//!    |-> rate_limited                 (routed backend already throttled)
//!    |     rate_limited -> queued     (window elapsed)
//!    |     rate_limited -> cancelled
//!    '-> cancelled
//! ```
//!
//! `completed`, `failed` and `cancelled` are terminal.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use promptstore::{IndexValue, Record, now_ms};

use super::id::generate_id;
use super::strategy::{Collaboration, RoutingStrategy};

/// Lifecycle state of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    /// Waiting to be picked up
    #[default]
    Queued,
    /// Bound to an agent and running
    Executing,
    /// Agent returned success
    Completed,
    /// Fatal failure or retries exhausted
    Failed,
    /// Cancelled by a caller
    Cancelled,
    /// Parked until the backend's rate-limit window elapses
    RateLimited,
}

impl EntryState {
    /// All states, in display order
    pub const ALL: [EntryState; 6] = [
        Self::Queued,
        Self::Executing,
        Self::RateLimited,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `next` is reachable from this state in one step
    pub fn can_transition_to(&self, next: EntryState) -> bool {
        use EntryState::*;
        matches!(
            (self, next),
            (Queued, Executing)
                // routed to a backend that is already throttled
                | (Queued, RateLimited)
                | (Executing, Completed)
                | (Executing, Queued)
                | (Executing, RateLimited)
                | (Executing, Failed)
                | (RateLimited, Queued)
                | (Queued, Cancelled)
                | (RateLimited, Cancelled)
        )
    }

    /// Whether an external cancel is allowed from this state
    pub fn is_cancellable(&self) -> bool {
        self.can_transition_to(Self::Cancelled)
    }
}

impl std::fmt::Display for EntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Executing => write!(f, "executing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::RateLimited => write!(f, "rate_limited"),
        }
    }
}

impl std::str::FromStr for EntryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "queued" => Ok(Self::Queued),
            "executing" => Ok(Self::Executing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            "rate_limited" => Ok(Self::RateLimited),
            _ => Err(format!("Unknown entry state: {}", s)),
        }
    }
}

/// Rejected state change
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid transition for {id}: {from} -> {to}")]
pub struct InvalidTransition {
    pub id: String,
    pub from: EntryState,
    pub to: EntryState,
}

/// Classification of the most recent failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Retryable,
    Fatal,
    Timeout,
    RateLimit,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retryable => write!(f, "retryable"),
            Self::Fatal => write!(f, "fatal"),
            Self::Timeout => write!(f, "timeout"),
            Self::RateLimit => write!(f, "rate_limit"),
        }
    }
}

/// Structured description of a failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryError {
    pub kind: ErrorKind,
    pub message: String,
    /// When the failure was observed (Unix ms)
    pub at: i64,
}

impl EntryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: now_ms(),
        }
    }
}

/// Queue-wide defaults applied at submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueDefaults {
    pub min_priority: i32,
    pub max_priority: i32,
    pub default_priority: i32,
    pub default_max_retries: u32,
}

impl Default for QueueDefaults {
    fn default() -> Self {
        Self {
            min_priority: -100,
            max_priority: 100,
            default_priority: 0,
            default_max_retries: 3,
        }
    }
}

/// Caller-supplied fields of a new entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryDraft {
    pub content: String,
    pub priority: Option<i32>,
    pub working_directory: Option<String>,
    #[serde(default)]
    pub context_files: Vec<String>,
    pub max_retries: Option<u32>,
    pub estimated_tokens: Option<u64>,
    pub required_capability: Option<String>,
    pub strategy: Option<RoutingStrategy>,
    pub collaboration: Option<Collaboration>,
}

impl EntryDraft {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_context_files(mut self, files: Vec<String>) -> Self {
        self.context_files = files;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = Some(tokens);
        self
    }

    pub fn with_capability(mut self, tag: impl Into<String>) -> Self {
        self.required_capability = Some(tag.into());
        self
    }

    pub fn with_strategy(mut self, strategy: RoutingStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_collaboration(mut self, collaboration: Collaboration) -> Self {
        self.collaboration = Some(collaboration);
        self
    }

    /// Check the draft against queue bounds
    pub fn validate(&self, defaults: &QueueDefaults) -> Result<(), String> {
        if self.content.trim().is_empty() {
            return Err("content must not be empty".to_string());
        }
        if let Some(priority) = self.priority {
            if priority < defaults.min_priority || priority > defaults.max_priority {
                return Err(format!(
                    "priority {} outside [{}, {}]",
                    priority, defaults.min_priority, defaults.max_priority
                ));
            }
        }
        if let Some(collab) = &self.collaboration {
            if collab.agents.is_empty() && collab.size == 0 {
                return Err("collaboration needs at least one agent".to_string());
            }
        }
        Ok(())
    }
}

/// Field changes that accompany a state transition
///
/// `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryUpdate {
    pub retry_count: Option<u32>,
    pub eligible_at: Option<i64>,
    pub resume_at: Option<i64>,
    pub last_error: Option<EntryError>,
    pub assigned_agent_id: Option<String>,
    pub result: Option<String>,
    pub rate_limit_cycles: Option<u32>,
}

impl EntryUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn eligible_at(mut self, at: i64) -> Self {
        self.eligible_at = Some(at);
        self
    }

    pub fn resume_at(mut self, at: i64) -> Self {
        self.resume_at = Some(at);
        self
    }

    pub fn error(mut self, error: EntryError) -> Self {
        self.last_error = Some(error);
        self
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.assigned_agent_id = Some(agent_id.into());
        self
    }

    pub fn result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn rate_limit_cycles(mut self, cycles: u32) -> Self {
        self.rate_limit_cycles = Some(cycles);
        self
    }
}

/// A queued prompt and everything the scheduler knows about it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptEntry {
    /// Unique, ordered identifier
    pub id: String,

    /// Store-assigned submission sequence number
    pub seq: u64,

    /// Task body handed to the agent verbatim
    pub content: String,

    /// Higher runs first
    pub priority: i32,

    pub state: EntryState,

    pub retry_count: u32,
    pub max_retries: u32,

    pub working_directory: String,
    pub context_files: Vec<String>,
    pub estimated_tokens: Option<u64>,

    /// Capability tag the agent must advertise
    pub required_capability: Option<String>,

    /// Per-entry routing override
    pub strategy: Option<RoutingStrategy>,

    pub collaboration: Option<Collaboration>,

    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,

    /// Earliest dispatch time (Unix ms); backoff pushes this forward
    pub eligible_at: i64,

    /// When a rate-limited entry may resume (Unix ms)
    pub resume_at: Option<i64>,

    /// Number of times this entry has been parked for rate limiting
    pub rate_limit_cycles: u32,

    pub last_error: Option<EntryError>,
    pub assigned_agent_id: Option<String>,

    /// Output recorded on success
    pub result: Option<String>,
}

impl PromptEntry {
    /// Build a queued entry from a validated draft
    pub fn from_draft(seq: u64, draft: EntryDraft, defaults: &QueueDefaults) -> Self {
        let now = now_ms();
        Self {
            id: generate_id(seq, &draft.content),
            seq,
            content: draft.content,
            priority: draft.priority.unwrap_or(defaults.default_priority),
            state: EntryState::Queued,
            retry_count: 0,
            max_retries: draft.max_retries.unwrap_or(defaults.default_max_retries),
            working_directory: draft.working_directory.unwrap_or_else(|| ".".to_string()),
            context_files: draft.context_files,
            estimated_tokens: draft.estimated_tokens,
            required_capability: draft.required_capability,
            strategy: draft.strategy,
            collaboration: draft.collaboration,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            eligible_at: now,
            resume_at: None,
            rate_limit_cycles: 0,
            last_error: None,
            assigned_agent_id: None,
            result: None,
        }
    }

    /// Check if the entry is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the entry can be dispatched at `now`
    pub fn is_eligible(&self, now: i64) -> bool {
        self.state == EntryState::Queued && self.eligible_at <= now
    }

    /// Dispatch ordering: priority descending, then creation order
    pub fn dispatch_order(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.created_at.cmp(&other.created_at))
            .then_with(|| self.seq.cmp(&other.seq))
    }

    /// Apply a state change and its accompanying fields
    ///
    /// Leaves the entry untouched on error.
    pub fn apply_transition(
        &mut self,
        next: EntryState,
        update: EntryUpdate,
        now: i64,
    ) -> Result<EntryState, InvalidTransition> {
        let previous = self.state;
        if !previous.can_transition_to(next) {
            return Err(InvalidTransition {
                id: self.id.clone(),
                from: previous,
                to: next,
            });
        }

        self.state = next;
        self.updated_at = now;

        match next {
            EntryState::Executing => {
                self.started_at = Some(now);
                self.resume_at = None;
            }
            EntryState::Queued => {
                self.assigned_agent_id = None;
                self.resume_at = None;
                self.eligible_at = now;
            }
            EntryState::RateLimited => {
                self.assigned_agent_id = None;
            }
            EntryState::Completed | EntryState::Failed | EntryState::Cancelled => {
                self.completed_at = Some(now);
            }
        }

        if let Some(count) = update.retry_count {
            self.retry_count = count;
        }
        if let Some(at) = update.eligible_at {
            self.eligible_at = at;
        }
        if let Some(at) = update.resume_at {
            self.resume_at = Some(at);
        }
        if let Some(error) = update.last_error {
            self.last_error = Some(error);
        }
        if let Some(agent) = update.assigned_agent_id {
            self.assigned_agent_id = Some(agent);
        }
        if let Some(result) = update.result {
            self.result = Some(result);
        }
        if let Some(cycles) = update.rate_limit_cycles {
            self.rate_limit_cycles = cycles;
        }

        Ok(previous)
    }
}

impl Record for PromptEntry {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "prompts"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("state".to_string(), IndexValue::String(self.state.to_string()));
        fields.insert("priority".to_string(), IndexValue::Int(self.priority as i64));
        fields.insert("seq".to_string(), IndexValue::Int(self.seq as i64));
        if let Some(agent) = &self.assigned_agent_id {
            fields.insert("agent".to_string(), IndexValue::String(agent.clone()));
        }
        fields
    }
}
