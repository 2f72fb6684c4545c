//! Domain types for promptd
//!
//! Core domain types: PromptEntry, RateLimitWindow
//! Both implement the Record trait for PromptStore persistence.

mod entry;
mod id;
mod rate_limit;
mod strategy;

pub use entry::{
    EntryDraft, EntryError, EntryState, EntryUpdate, ErrorKind, InvalidTransition, PromptEntry, QueueDefaults,
};
pub use id::{IdResolver, generate_id};
pub use rate_limit::RateLimitWindow;
pub use strategy::{Collaboration, CoordinationMode, RoutingStrategy};

// Re-export promptstore types for convenience
pub use promptstore::{Filter, FilterOp, IndexValue, Record, Store, now_ms};
