//! Notifier: best-effort fan-out of queue activity
//!
//! Every Entry Store transition publishes a [`QueueEvent::StateChanged`] to the
//! [`EventBus`] before the transition call returns. Consumers (a web layer,
//! the JSONL [`EventLogger`]) subscribe to the bus. Delivery is at-most-once:
//! a lagging subscriber loses events and must fall back to polling the store.
//!
//! ```text
//!   StateManager ──┐
//!   Scheduler ─────┼──> EventBus (tokio broadcast) ──> EventLogger (.jsonl)
//!   AgentPool ─────┘                               └─> any other subscriber
//! ```

mod bus;
mod logger;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, create_event_bus};
pub use logger::{EventLogger, read_events, spawn_event_logger};
pub use types::{EventLogEntry, QueueEvent};
