//! Router: binds entries to agents from the pool
//!
//! Single selection via [`Router::select`], collaborative groups via
//! [`Router::select_group`] and [`execute_group`].

mod capability;
mod error;
mod group;
mod selector;

pub use capability::{CAPABILITY_TAGS, infer_capabilities};
pub use error::RouterError;
pub use group::{GroupOutcome, MemberResult, execute_group};
pub use selector::{RouteDecision, Router};
