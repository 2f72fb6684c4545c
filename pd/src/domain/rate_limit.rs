//! Persisted per-backend throttling window

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use promptstore::{IndexValue, Record, now_ms};

/// Throttling window for one backend
///
/// `resume_at` is an absolute Unix-millisecond timestamp so that a restart
/// does not reset the wait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitWindow {
    /// Backend identifier (also the record id)
    pub backend_id: String,

    /// Whether the backend is currently throttled
    pub throttled: bool,

    /// Earliest time the backend may be called again (Unix ms)
    pub resume_at: i64,

    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
}

impl RateLimitWindow {
    /// Create a throttled window
    pub fn new(backend_id: impl Into<String>, resume_at: i64) -> Self {
        Self {
            backend_id: backend_id.into(),
            throttled: true,
            resume_at,
            updated_at: now_ms(),
        }
    }

    /// Whether the backend can be called at `now`
    pub fn is_open(&self, now: i64) -> bool {
        !self.throttled || now >= self.resume_at
    }
}

impl Record for RateLimitWindow {
    fn id(&self) -> &str {
        &self.backend_id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "rate_limits"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("throttled".to_string(), IndexValue::Bool(self.throttled));
        fields
    }
}
