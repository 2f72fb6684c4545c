//! Per-backend throttling windows
//!
//! Reads vastly outnumber writes, so the map sits behind a `RwLock`. Every
//! operation holds the lock only for a map lookup or insert.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::domain::RateLimitWindow;

/// Proactive request window: at most `max_requests` dispatches per backend
/// within `window`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestWindow {
    pub max_requests: u32,
    pub window: Duration,
}

/// Tracks which backends are throttled and until when
#[derive(Debug, Default)]
pub struct RateLimitTracker {
    windows: RwLock<HashMap<String, RateLimitWindow>>,
    request_window: Option<RequestWindow>,
    /// Dispatch timestamps per backend (Unix ms), oldest first
    request_times: Mutex<HashMap<String, VecDeque<i64>>>,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker that also throttles backends proactively
    pub fn with_request_window(request_window: RequestWindow) -> Self {
        debug!(?request_window, "RateLimitTracker::with_request_window");
        Self {
            request_window: Some(request_window),
            ..Self::default()
        }
    }

    /// Set or overwrite the window for `backend_id`
    pub fn mark_throttled(&self, backend_id: &str, resume_at: i64) -> RateLimitWindow {
        info!(%backend_id, resume_at, "Backend throttled");
        let window = RateLimitWindow::new(backend_id, resume_at);
        match self.windows.write() {
            Ok(mut windows) => {
                windows.insert(backend_id.to_string(), window.clone());
            }
            Err(poisoned) => {
                warn!("RateLimitTracker::mark_throttled: lock poisoned, recovering");
                poisoned.into_inner().insert(backend_id.to_string(), window.clone());
            }
        }
        window
    }

    /// True if no window exists or `now >= resume_at`
    pub fn is_available(&self, backend_id: &str, now: i64) -> bool {
        self.window(backend_id).is_none_or(|w| w.is_open(now))
    }

    /// Drop the window for `backend_id`; returns whether one existed
    pub fn clear(&self, backend_id: &str) -> bool {
        let removed = match self.windows.write() {
            Ok(mut windows) => windows.remove(backend_id).is_some(),
            Err(poisoned) => poisoned.into_inner().remove(backend_id).is_some(),
        };
        if removed {
            debug!(%backend_id, "RateLimitTracker::clear: window cleared");
        }
        removed
    }

    pub fn window(&self, backend_id: &str) -> Option<RateLimitWindow> {
        match self.windows.read() {
            Ok(windows) => windows.get(backend_id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(backend_id).cloned(),
        }
    }

    /// Backends still throttled at `now`, with their resume times
    pub fn throttled_backends(&self, now: i64) -> HashMap<String, i64> {
        let snapshot = match self.windows.read() {
            Ok(windows) => windows.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        snapshot
            .into_values()
            .filter(|w| !w.is_open(now))
            .map(|w| (w.backend_id, w.resume_at))
            .collect()
    }

    /// Load persisted windows, skipping ones that already elapsed
    pub fn restore(&self, windows: impl IntoIterator<Item = RateLimitWindow>, now: i64) -> usize {
        let mut restored = 0;
        let mut guard = match self.windows.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for window in windows {
            if window.is_open(now) {
                continue;
            }
            guard.insert(window.backend_id.clone(), window);
            restored += 1;
        }
        debug!(restored, "RateLimitTracker::restore");
        restored
    }

    /// Record a dispatch against `backend_id`
    ///
    /// With a request window configured, returns the window created when this
    /// dispatch fills it. The backend then stays throttled until the oldest
    /// request leaves the window.
    pub fn record_request(&self, backend_id: &str, now: i64) -> Option<RateLimitWindow> {
        let limit = self.request_window?;
        let window_ms = i64::try_from(limit.window.as_millis()).unwrap_or(i64::MAX);

        let resume_at = {
            let mut times = match self.request_times.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let queue = times.entry(backend_id.to_string()).or_default();
            queue.push_back(now);
            let window_start = now.saturating_sub(window_ms);
            while queue.front().is_some_and(|t| *t <= window_start) {
                queue.pop_front();
            }
            if queue.len() < limit.max_requests as usize {
                return None;
            }
            queue.front().copied().unwrap_or(now).saturating_add(window_ms)
        };

        if self.window(backend_id).is_some_and(|w| !w.is_open(now) && w.resume_at >= resume_at) {
            debug!(%backend_id, "RateLimitTracker::record_request: longer window already set");
            return None;
        }
        debug!(%backend_id, resume_at, "RateLimitTracker::record_request: request window full");
        Some(self.mark_throttled(backend_id, resume_at))
    }
}
