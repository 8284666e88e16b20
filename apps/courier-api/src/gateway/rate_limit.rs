//! Fixed-window inbound rate limiting, per identity.
//!
//! The window resets rather than slides: once `reset_at` passes, the next
//! message replaces the record with a fresh count of 1. This matches the
//! observable edge-case timing the rest of the system was built against —
//! do not swap in a sliding window without updating the tests below, which
//! pin the reset semantics.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Default policy: 60 messages per 60-second window per identity.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_CEILING: u32 = 60;

struct WindowRecord {
    count: u32,
    reset_at: Instant,
}

/// Per-identity fixed-window limiter. Records are independent per key, so
/// a sharded map suffices — no cross-key coordination is ever needed.
pub struct RateLimiter {
    window: Duration,
    ceiling: u32,
    records: DashMap<String, WindowRecord>,
}

impl RateLimiter {
    pub fn new(window: Duration, ceiling: u32) -> Self {
        Self {
            window,
            ceiling,
            records: DashMap::new(),
        }
    }

    /// Admit or reject one inbound message from the identity, against this
    /// limiter's configured policy.
    pub fn check(&self, user_id: &str) -> bool {
        self.check_with(user_id, self.window, self.ceiling)
    }

    /// Admit or reject with an explicit window and ceiling for this call.
    pub fn check_with(&self, user_id: &str, window: Duration, ceiling: u32) -> bool {
        let now = Instant::now();
        let mut entry = self
            .records
            .entry(user_id.to_string())
            .or_insert_with(|| WindowRecord {
                count: 0,
                reset_at: now + window,
            });

        // Expired window: replace, don't slide.
        if now >= entry.reset_at {
            entry.count = 1;
            entry.reset_at = now + window;
            return true;
        }

        if entry.count >= ceiling {
            return false;
        }
        entry.count += 1;
        true
    }

    /// Clear an identity's record early (administrative override).
    pub fn reset(&self, user_id: &str) {
        self.records.remove(user_id);
    }

    /// Drop records whose window has expired, bounding memory for
    /// identities that stopped sending. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records.retain(|_, record| record.reset_at > now);
        before - self.records.len()
    }

    pub fn tracked_identities(&self) -> usize {
        self.records.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_CEILING)
    }
}
