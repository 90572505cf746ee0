//! Per-key counter state.

use serde::Serialize;

use super::policy::RateLimitPolicy;

/// Requests observed for one key in its current window.
///
/// A record is created on the first request of a window and mutated in place
/// by every admitted request until `window_reset_at` passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterRecord {
    /// Requests counted in the current window (always >= 1)
    pub count: u64,
    /// Epoch milliseconds at which the current window ends
    pub window_reset_at: i64,
}

impl CounterRecord {
    /// Open a new window at `now` holding a single request.
    pub fn open(now: i64, policy: &RateLimitPolicy) -> Self {
        Self {
            count: 1,
            window_reset_at: now.saturating_add(policy.window_ms()),
        }
    }

    /// Whether the window has ended as of `now`.
    ///
    /// A clock that moved backwards simply keeps the window open.
    pub fn is_expired(&self, now: i64) -> bool {
        self.window_reset_at <= now
    }

    /// Milliseconds until the window resets, never negative.
    pub fn retry_after_ms(&self, now: i64) -> u64 {
        u64::try_from(self.window_reset_at.saturating_sub(now)).unwrap_or(0)
    }
}
