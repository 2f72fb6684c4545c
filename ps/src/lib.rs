//! PromptStore - persistent record storage for promptd
//!
//! Records are stored as JSON documents in SQLite, one table shared by all
//! collections. Each record declares a set of indexed fields which are kept
//! in a side table so that `list` can filter without deserializing every
//! document.
//!
//! # Modules
//!
//! - [`record`] - the `Record` trait and index values
//! - [`filter`] - query filters for `Store::list`
//! - [`store`] - the SQLite-backed `Store`

pub mod filter;
pub mod record;
pub mod store;

pub use filter::{Filter, FilterOp};
pub use record::{IndexValue, Record};
pub use store::Store;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as Unix milliseconds
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
