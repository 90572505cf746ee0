//! Core rate limiter implementation.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::policy::RateLimitPolicy;
use super::record::CounterRecord;

/// Outcome of a single rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests still permitted in the current window
    pub remaining: u64,
    /// Epoch milliseconds at which the current window ends
    pub reset_at: i64,
    /// Milliseconds to wait before retrying; zero when allowed
    pub retry_after_ms: u64,
}

impl Verdict {
    fn allowed(remaining: u64, reset_at: i64) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_at,
            retry_after_ms: 0,
        }
    }

    fn denied(reset_at: i64, retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            reset_at,
            retry_after_ms,
        }
    }

    /// Value for a `Retry-After` header, in whole seconds rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after_ms.div_ceil(1000)
    }
}

/// A fixed-window rate limiter over an in-memory counter store.
///
/// Each key owns at most one [`CounterRecord`]. Checks are atomic per key:
/// the store is sharded and a check holds its shard's lock for the whole
/// read-modify-write, so concurrent requests for one key never over-admit.
/// The limiter is thread-safe and meant to be shared behind an `Arc`.
pub struct RateLimiter {
    /// Counter records indexed by key
    records: DashMap<String, CounterRecord>,
    /// Time source for [`RateLimiter::check`]
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a new rate limiter reading wall-clock time.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a new rate limiter with a custom time source.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    /// Current time according to this limiter's clock.
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Check and count one request for `key` at the current time.
    pub fn check(&self, key: &str, policy: &RateLimitPolicy) -> Verdict {
        self.check_at(key, policy, self.now_ms())
    }

    /// Check and count one request for `key` at `now` (epoch milliseconds).
    ///
    /// A window that has ended is replaced by a fresh one. Once a window has
    /// admitted `limit` requests every further request in it is denied
    /// without touching the record. A zero limit denies everything and never
    /// creates a record.
    pub fn check_at(&self, key: &str, policy: &RateLimitPolicy, now: i64) -> Verdict {
        let limit = policy.limit();

        trace!(key = %key, limit = limit, now = now, "Checking rate limit");

        if limit == 0 {
            let reset_at = now.saturating_add(policy.window_ms());
            debug!(key = %key, "Rate limit is zero, denying");
            return Verdict::denied(reset_at, policy.window_ms() as u64);
        }

        match self.records.entry(key.to_owned()) {
            Entry::Vacant(vacant) => {
                let record = CounterRecord::open(now, policy);
                vacant.insert(record);
                debug!(
                    key = %key,
                    limit = limit,
                    reset_at = record.window_reset_at,
                    "Opened rate limit window"
                );
                Verdict::allowed(limit - 1, record.window_reset_at)
            }
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();

                if record.is_expired(now) {
                    *record = CounterRecord::open(now, policy);
                    debug!(
                        key = %key,
                        limit = limit,
                        reset_at = record.window_reset_at,
                        "Rolled over rate limit window"
                    );
                    Verdict::allowed(limit - 1, record.window_reset_at)
                } else if record.count >= limit {
                    debug!(
                        key = %key,
                        count = record.count,
                        limit = limit,
                        "Rate limit exceeded"
                    );
                    Verdict::denied(record.window_reset_at, record.retry_after_ms(now))
                } else {
                    record.count += 1;
                    Verdict::allowed(limit - record.count, record.window_reset_at)
                }
            }
        }
    }

    /// Delete every record whose window has ended, at the current time.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(self.now_ms())
    }

    /// Delete every record whose window has ended as of `now`.
    ///
    /// Returns the number of records removed.
    pub fn sweep_expired_at(&self, now: i64) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        let removed = before.saturating_sub(self.records.len());

        if removed > 0 {
            debug!(removed = removed, remaining = self.records.len(), "Swept expired counters");
        }
        removed
    }

    /// Get a copy of the record for `key`.
    ///
    /// Returns `None` if no record exists. Expired records are returned until
    /// a check or sweep replaces them.
    pub fn record(&self, key: &str) -> Option<CounterRecord> {
        self.records.get(key).map(|record| *record)
    }

    /// Clear all records.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.records.clear();
    }

    /// Get the number of stored records.
    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use std::sync::Barrier;

    fn policy(limit: u64, window_ms: u64) -> RateLimitPolicy {
        RateLimitPolicy::new(limit, window_ms).unwrap()
    }

    #[test]
    fn test_rate_limiter_creation() {
        let limiter = RateLimiter::new();
        assert_eq!(limiter.record_count(), 0);
    }

    #[test]
    fn test_documented_scenario() {
        let limiter = RateLimiter::new();
        let policy = policy(3, 1_000);
        let key = "api:1.2.3.4";

        let remaining: Vec<u64> = (0..3)
            .map(|_| {
                let verdict = limiter.check_at(key, &policy, 0);
                assert!(verdict.allowed);
                assert_eq!(verdict.reset_at, 1_000);
                assert_eq!(verdict.retry_after_ms, 0);
                verdict.remaining
            })
            .collect();
        assert_eq!(remaining, vec![2, 1, 0]);

        let denied = limiter.check_at(key, &policy, 500);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after_ms, 500);
        assert_eq!(denied.reset_at, 1_000);

        let rolled = limiter.check_at(key, &policy, 1_000);
        assert!(rolled.allowed);
        assert_eq!(rolled.remaining, 2);
        assert_eq!(rolled.reset_at, 2_000);
    }

    #[test]
    fn test_admission_bound() {
        let limiter = RateLimiter::new();
        let policy = policy(10, 60_000);

        for i in 0..10u64 {
            let verdict = limiter.check_at("auth:user", &policy, 100 + i as i64);
            assert!(verdict.allowed, "request {} should be allowed", i + 1);
            assert_eq!(verdict.remaining, 9 - i);
        }

        let verdict = limiter.check_at("auth:user", &policy, 200);
        assert!(!verdict.allowed);
        assert_eq!(verdict.remaining, 0);
        assert_eq!(limiter.record("auth:user").unwrap().count, 10);
    }

    #[test]
    fn test_denied_does_not_mutate_record() {
        let limiter = RateLimiter::new();
        let policy = policy(1, 1_000);

        limiter.check_at("k", &policy, 0);
        let before = limiter.record("k").unwrap();
        for now in [1, 2, 999] {
            assert!(!limiter.check_at("k", &policy, now).allowed);
        }
        assert_eq!(limiter.record("k").unwrap(), before);
    }

    #[test]
    fn test_retry_after_matches_reset() {
        let limiter = RateLimiter::new();
        let policy = policy(2, 5_000);

        limiter.check_at("k", &policy, 1_000);
        limiter.check_at("k", &policy, 1_000);

        for now in [1_000, 2_345, 5_999] {
            let verdict = limiter.check_at("k", &policy, now);
            assert!(!verdict.allowed);
            assert_eq!(verdict.retry_after_ms as i64, verdict.reset_at - now);
        }
    }

    #[test]
    fn test_retry_after_secs_rounds_up() {
        let limiter = RateLimiter::new();
        let policy = policy(1, 10_000);

        limiter.check_at("k", &policy, 0);
        assert_eq!(limiter.check_at("k", &policy, 8_999).retry_after_secs(), 2);
        assert_eq!(limiter.check_at("k", &policy, 9_000).retry_after_secs(), 1);
        assert_eq!(limiter.check_at("k", &policy, 9_999).retry_after_secs(), 1);
        assert_eq!(limiter.check_at("k", &policy, 0).retry_after_secs(), 10);
    }

    #[test]
    fn test_zero_limit_denies_fresh_key() {
        let limiter = RateLimiter::new();
        let policy = policy(0, 1_000);

        for now in [0, 10, 5_000] {
            let verdict = limiter.check_at("export:tenant", &policy, now);
            assert!(!verdict.allowed);
            assert_eq!(verdict.remaining, 0);
            assert_eq!(verdict.retry_after_ms as i64, verdict.reset_at - now);
        }
        assert_eq!(limiter.record_count(), 0);
    }

    #[test]
    fn test_different_keys_have_separate_counters() {
        let limiter = RateLimiter::new();
        let policy = policy(2, 1_000);

        assert!(limiter.check_at("api:a", &policy, 0).allowed);
        assert!(limiter.check_at("api:b", &policy, 0).allowed);
        assert!(limiter.check_at("api:a", &policy, 1).allowed);
        assert!(!limiter.check_at("api:a", &policy, 2).allowed);

        let b = limiter.check_at("api:b", &policy, 3);
        assert!(b.allowed);
        assert_eq!(b.remaining, 0);
        assert_eq!(limiter.record("api:a").unwrap().count, 2);
        assert_eq!(limiter.record("api:b").unwrap().count, 2);
    }

    #[test]
    fn test_boundary_burst_is_accepted() {
        let limiter = RateLimiter::new();
        let policy = policy(5, 1_000);

        for _ in 0..5 {
            assert!(limiter.check_at("k", &policy, 999).allowed);
        }
        for _ in 0..5 {
            assert!(limiter.check_at("k", &policy, 1_999).allowed);
        }
        assert!(!limiter.check_at("k", &policy, 1_999).allowed);
    }

    #[test]
    fn test_backward_clock_keeps_window() {
        let limiter = RateLimiter::new();
        let policy = policy(2, 1_000);

        limiter.check_at("k", &policy, 10_000);
        limiter.check_at("k", &policy, 10_000);

        let verdict = limiter.check_at("k", &policy, 3_000);
        assert!(!verdict.allowed);
        assert_eq!(verdict.reset_at, 11_000);
        assert_eq!(verdict.retry_after_ms, 8_000);
    }

    #[test]
    fn test_empty_key_is_valid() {
        let limiter = RateLimiter::new();
        let policy = policy(1, 1_000);

        assert!(limiter.check_at("", &policy, 0).allowed);
        assert!(!limiter.check_at("", &policy, 0).allowed);
    }

    #[test]
    fn test_check_uses_injected_clock() {
        let clock = Arc::new(ManualClock::new(50_000));
        let limiter = RateLimiter::with_clock(clock.clone());
        let policy = policy(1, 1_000);

        let first = limiter.check("k", &policy);
        assert_eq!(first.reset_at, 51_000);
        assert!(!limiter.check("k", &policy).allowed);

        clock.advance(1_000);
        assert!(limiter.check("k", &policy).allowed);
    }

    #[test]
    fn test_concurrent_same_key_admission() {
        const LIMIT: u64 = 32;
        let limiter = RateLimiter::new();
        let policy = policy(LIMIT, 60_000);
        let barrier = Barrier::new((LIMIT * 2) as usize);

        let allowed: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..LIMIT * 2)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        limiter.check_at("api:shared", &policy, 0).allowed
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .filter(|allowed| *allowed)
                .count()
        });

        assert_eq!(allowed as u64, LIMIT);
        assert_eq!(limiter.record("api:shared").unwrap().count, LIMIT);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let limiter = RateLimiter::new();
        let short = policy(5, 1_000);
        let long = policy(5, 10_000);

        limiter.check_at("short", &short, 0);
        limiter.check_at("long", &long, 0);

        assert_eq!(limiter.sweep_expired_at(999), 0);
        assert_eq!(limiter.sweep_expired_at(1_000), 1);
        assert!(limiter.record("short").is_none());
        assert!(limiter.record("long").is_some());
    }

    #[test]
    fn test_sweep_never_changes_verdicts() {
        let policy = policy(3, 1_000);
        let swept = RateLimiter::new();
        let unswept = RateLimiter::new();

        let schedule = [0, 0, 0, 200, 999, 1_000, 1_000, 1_500, 2_000, 2_001, 2_001, 2_001, 2_001];
        for (i, now) in schedule.into_iter().enumerate() {
            let key = if i % 4 == 0 { "api:x" } else { "api:y" };
            swept.sweep_expired_at(now);
            assert_eq!(
                swept.check_at(key, &policy, now),
                unswept.check_at(key, &policy, now),
                "verdict diverged at step {}",
                i
            );
        }
    }

    #[test]
    fn test_clear_records() {
        let limiter = RateLimiter::new();
        let policy = policy(1, 1_000);

        limiter.check_at("k", &policy, 0);
        assert_eq!(limiter.record_count(), 1);

        limiter.clear();
        assert_eq!(limiter.record_count(), 0);
        assert!(limiter.check_at("k", &policy, 0).allowed);
    }
}
