//! Rate Limit Tracker and retry backoff
//!
//! The tracker holds one [`RateLimitWindow`](crate::domain::RateLimitWindow)
//! per backend identifier. Windows carry absolute `resume_at` timestamps so
//! the scheduler can persist them and restore them after a restart.

mod backoff;
mod tracker;

pub use backoff::BackoffPolicy;
pub use tracker::{RateLimitTracker, RequestWindow};
