//! promptd - persistent prompt queue and multi-agent scheduler
//!
//! Prompts are submitted as entries into a durable queue. A single scheduler
//! loop routes each eligible entry to one agent (or a collaborative group),
//! runs it under a deadline and turns the outcome into a state transition.
//!
//! # Core Concepts
//!
//! - **Entries survive restarts**: every state lives in the promptstore
//!   database; anything left `executing` by a crash is requeued
//! - **Failures are typed**: retryable, rate-limited and fatal outcomes each
//!   take their own path through the state machine
//! - **Throttling is per backend**: a rate limit parks work bound for that
//!   backend until its window elapses, without consuming retries
//! - **Agents are interchangeable**: the pool only knows the [`agent::Agent`]
//!   trait, so CLI and HTTP backends route the same way
//!
//! # Modules
//!
//! - [`domain`] - PromptEntry, RateLimitWindow and the state machine
//! - [`state`] - Entry Store actor and crash recovery
//! - [`events`] - Event bus and JSONL event log
//! - [`ratelimit`] - Rate Limit Tracker and retry backoff
//! - [`agent`] - Agent trait and concrete backends
//! - [`pool`] - Agent Pool with load and health tracking
//! - [`router`] - Agent selection and collaborative execution
//! - [`scheduler`] - The queue processor loop
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod agent;
pub mod cli;
pub mod config;
pub mod domain;
pub mod events;
pub mod pool;
pub mod ratelimit;
pub mod router;
pub mod scheduler;
pub mod state;

// Re-export commonly used types
pub use agent::{Agent, AgentConfig, AgentDescriptor, AgentHealth, AgentKind, AgentResponse, ExecutionContext, Outcome};
pub use config::Config;
pub use domain::{
    Collaboration, CoordinationMode, EntryDraft, EntryError, EntryState, EntryUpdate, ErrorKind, PromptEntry,
    QueueDefaults, RateLimitWindow, RoutingStrategy,
};
pub use events::{EventBus, QueueEvent, create_event_bus, spawn_event_logger};
pub use pool::{AgentLease, AgentPool, PoolStats};
pub use ratelimit::{BackoffPolicy, RateLimitTracker};
pub use router::{RouteDecision, Router, RouterError};
pub use scheduler::{DispatchResult, Scheduler, SchedulerConfig, SchedulerStats};
pub use state::{QueueStats, RecoveryStats, StateError, StateManager, recover};
