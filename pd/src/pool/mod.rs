//! Agent Pool: registry of live agents with load and health tracking

mod lease;
mod registry;

pub use lease::AgentLease;
pub use registry::{AgentPool, DEFAULT_UNREACHABLE_AFTER, PoolStats};
