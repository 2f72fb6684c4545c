//! Entry Store
//!
//! [`StateManager`] is a cloneable handle to an actor task that owns the
//! promptstore [`Store`](crate::domain::Store). Every write goes through the
//! actor, which makes it the single writer for each entry. Cross-process
//! writers (the CLI while a scheduler runs) are serialized by SQLite
//! IMMEDIATE transactions underneath.

mod manager;
mod messages;
mod recovery;

pub use manager::{QueueStats, StateManager};
pub use messages::{StateCommand, StateError, StateResponse};
pub use recovery::{RecoveryStats, recover};
