//! Per-client failure windows for brute-force defense.
//!
//! One limiter instance backs the general authorizer, another the hook
//! handler's failure table. The map is insertion-ordered so overflow can
//! drop the stalest half deterministically.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use indexmap::IndexMap;

const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
const DEFAULT_MAX_FAILURES: usize = 20;
const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct FailureWindow {
    window_start: Instant,
    count: usize,
}

/// Outcome of recording (or attempting to record) a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle {
    pub throttled: bool,
    pub retry_after: Option<Duration>,
}

impl Throttle {
    const ALLOWED: Self = Self {
        throttled: false,
        retry_after: None,
    };
}

/// Sliding-window per-key failure counter with bounded memory.
///
/// Keys whose window elapsed reset on the next failure. When the map grows
/// past capacity, expired entries are pruned first; if that is not enough,
/// the oldest half (by insertion order) is dropped. Every update
/// removes-then-reinserts the key so recency is reflected in the order.
pub struct AuthRateLimiter {
    window: Duration,
    max_failures: usize,
    capacity: usize,
    entries: Mutex<IndexMap<String, FailureWindow>>,
}

impl Default for AuthRateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_MAX_FAILURES, DEFAULT_CAPACITY)
    }
}

impl AuthRateLimiter {
    pub fn new(window: Duration, max_failures: usize, capacity: usize) -> Self {
        Self {
            window,
            max_failures,
            capacity: capacity.max(2),
            entries: Mutex::new(IndexMap::new()),
        }
    }

    /// Record an auth failure for `key`, or report that the key is already
    /// throttled (in which case nothing further is recorded).
    pub fn record_failure(&self, key: &str) -> Throttle {
        self.record_failure_at(key, Instant::now())
    }

    pub fn record_failure_at(&self, key: &str, now: Instant) -> Throttle {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        // Remove-then-reinsert so the key becomes the most recent entry.
        let state = match entries.shift_remove(key) {
            Some(w) if now.duration_since(w.window_start) < self.window => w,
            _ => FailureWindow {
                window_start: now,
                count: 0,
            },
        };

        if state.count >= self.max_failures {
            let retry_after = self
                .window
                .saturating_sub(now.duration_since(state.window_start));
            entries.insert(key.to_string(), state);
            self.evict_overflow(&mut entries, now);
            return Throttle {
                throttled: true,
                retry_after: Some(retry_after),
            };
        }

        entries.insert(key.to_string(), FailureWindow {
            window_start: state.window_start,
            count: state.count + 1,
        });
        self.evict_overflow(&mut entries, now);
        Throttle::ALLOWED
    }

    /// Forget all failures for `key` (successful authentication).
    pub fn clear(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.shift_remove(key);
    }

    /// Number of live entries (test/status visibility).
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_overflow(&self, entries: &mut IndexMap<String, FailureWindow>, now: Instant) {
        if entries.len() <= self.capacity {
            return;
        }
        // First pass: drop entries whose window has elapsed.
        entries.retain(|_, w| now.duration_since(w.window_start) < self.window);
        if entries.len() <= self.capacity {
            return;
        }
        // Still over capacity: drop the oldest half by insertion order.
        let drop_count = entries.len() / 2;
        entries.drain(..drop_count);
    }
}
