//! Scheduler for prompt execution
//!
//! One control loop per process. Decisions are made on the loop task; each
//! bound agent call runs on its own task, up to `concurrent-tasks` at once.

mod config;
mod core;
mod queue;

pub use config::SchedulerConfig;
pub use self::core::Scheduler;
pub use queue::{DispatchResult, SchedulerStats};
