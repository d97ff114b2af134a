use std::collections::HashMap;
use std::time::{Duration, Instant};

use subtle::ConstantTimeEq;
use tracing::debug;

/// Compare a candidate password against the configured one in constant time.
///
/// A length mismatch still performs an equal-length compare so the timing
/// does not leak the configured password's length.
pub fn verify_password(expected: &str, candidate: &str) -> bool {
    let expected = expected.as_bytes();
    let candidate = candidate.as_bytes();
    if expected.len() != candidate.len() {
        let _ = candidate.ct_eq(candidate);
        return false;
    }
    expected.ct_eq(candidate).into()
}

/// Outcome of asking the rate limiter whether an auth attempt may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Too many attempts; retry after this many seconds.
    Limited { retry_after_secs: u64 },
}

struct AttemptWindow {
    count: u32,
    window_start: Instant,
}

/// Per-address sliding-window limiter for authentication attempts.
///
/// Each address tracks `{count, window_start}`. A window older than
/// `window` resets the count; at `max_attempts` failures the attempt is
/// rejected before the password compare runs. Success clears the entry.
pub struct RateLimiter {
    window: Duration,
    max_attempts: u32,
    attempts: HashMap<String, AttemptWindow>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_attempts: u32) -> Self {
        Self {
            window,
            max_attempts,
            attempts: HashMap::new(),
        }
    }

    /// Check whether an attempt from `addr` may run the password compare.
    pub fn begin_attempt(&mut self, addr: &str) -> RateDecision {
        self.begin_attempt_at(addr, Instant::now())
    }

    /// Record a failed compare for `addr`.
    pub fn record_failure(&mut self, addr: &str) {
        self.record_failure_at(addr, Instant::now())
    }

    /// Clear the entry for `addr` after a successful authentication.
    pub fn clear(&mut self, addr: &str) {
        self.attempts.remove(addr);
    }

    fn begin_attempt_at(&mut self, addr: &str, now: Instant) -> RateDecision {
        let entry = self
            .attempts
            .entry(addr.to_string())
            .or_insert(AttemptWindow {
                count: 0,
                window_start: now,
            });

        let elapsed = now.saturating_duration_since(entry.window_start);
        if elapsed > self.window {
            entry.count = 0;
            entry.window_start = now;
        }

        if entry.count >= self.max_attempts {
            let remaining = self
                .window
                .saturating_sub(now.saturating_duration_since(entry.window_start));
            let retry_after_secs = remaining.as_millis().div_ceil(1000) as u64;
            debug!(
                event = "daemon.auth.rate_limited",
                addr = addr,
                retry_after_secs = retry_after_secs,
            );
            return RateDecision::Limited { retry_after_secs };
        }

        RateDecision::Allowed
    }

    fn record_failure_at(&mut self, addr: &str, now: Instant) {
        let entry = self
            .attempts
            .entry(addr.to_string())
            .or_insert(AttemptWindow {
                count: 0,
                window_start: now,
            });
        entry.count += 1;
    }
}
