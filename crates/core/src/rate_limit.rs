//! Sliding-window quotas per `(policy, principal)`.
//!
//! Buckets are keyed by policy and an opaque principal string (client IP for
//! HTTP endpoints, hub connection handle for signaling methods). The map
//! itself is a concurrent map so insertion of a brand-new bucket never
//! blocks unrelated principals; each bucket then serializes its own
//! timestamp queue under its own lock, mirroring the per-entity locking the
//! session registry uses.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

/// The closed set of rate-limited operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Policy {
    SessionCreate,
    SessionJoin,
    SignalingMessage,
    IceCandidate,
}

impl Policy {
    /// `(max_requests, window)` for this policy.
    const fn limits(self) -> (u32, Duration) {
        match self {
            Self::SessionCreate => (10, Duration::from_secs(3600)),
            Self::SessionJoin => (30, Duration::from_secs(60)),
            Self::SignalingMessage => (100, Duration::from_secs(1)),
            Self::IceCandidate => (200, Duration::from_secs(1)),
        }
    }
}

/// Result of a `check` call.
#[derive(Debug, Clone, Copy)]
pub struct CheckResult {
    pub allowed: bool,
    pub remaining: u32,
    /// Populated only when `allowed` is false.
    pub retry_after: Option<Duration>,
}

struct Bucket {
    window: Duration,
    max_requests: u32,
    timestamps: VecDeque<Instant>,
    last_access: Instant,
}

impl Bucket {
    fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            window,
            max_requests,
            timestamps: VecDeque::new(),
            last_access: Instant::now(),
        }
    }

    fn check(&mut self, now: Instant) -> CheckResult {
        self.last_access = now;

        while let Some(&front) = self.timestamps.front() {
            if now.duration_since(front) >= self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }

        if self.timestamps.len() as u32 >= self.max_requests {
            let oldest = *self.timestamps.front().expect("len >= max_requests > 0");
            let raw = (oldest + self.window).saturating_duration_since(now);
            return CheckResult {
                allowed: false,
                remaining: 0,
                retry_after: Some(floor_to_100ms(raw)),
            };
        }

        self.timestamps.push_back(now);
        CheckResult {
            allowed: true,
            remaining: self.max_requests - self.timestamps.len() as u32,
            retry_after: None,
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access)
    }
}

/// Rounds a duration down to the nearest 100ms, never below 100ms if the
/// input was non-zero (a zero retry-after would read as "already allowed").
fn floor_to_100ms(d: Duration) -> Duration {
    let millis = d.as_millis();
    let floored = (millis / 100) * 100;
    Duration::from_millis(if floored == 0 && millis > 0 { 100 } else { floored as u64 })
}

const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// The sliding-window rate limiter, sharded per `(policy, principal)`.
pub struct RateLimiter {
    buckets: DashMap<(Policy, String), Mutex<Bucket>, ahash::RandomState>,
}

impl RateLimiter {
    pub fn new() -> std::sync::Arc<Self> {
        let this = std::sync::Arc::new(Self {
            buckets: DashMap::with_hasher(ahash::RandomState::new()),
        });

        let sweeper = this.clone();
        std::thread::spawn(move || {
            loop {
                std::thread::sleep(SWEEP_INTERVAL);
                sweeper.sweep();
            }
        });

        this
    }

    /// Checks and records one request against `policy` for `key`, creating
    /// the bucket lazily on first use.
    pub fn check(&self, policy: Policy, key: &str) -> CheckResult {
        let (max_requests, window) = policy.limits();
        let now = Instant::now();

        let entry = self
            .buckets
            .entry((policy, key.to_string()))
            .or_insert_with(|| Mutex::new(Bucket::new(max_requests, window)));

        entry.lock().check(now)
    }

    /// Drops every bucket associated with `key`, across all policies.
    /// Called on hub disconnect so a departed connection's buckets don't
    /// linger until the sweeper gets to them.
    pub fn clear_key(&self, key: &str) {
        self.buckets.retain(|(_, bucket_key), _| bucket_key != key);
    }

    /// Removes buckets idle for longer than twice their window. Runs every
    /// five minutes on a background thread.
    fn sweep(&self) {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            let guard = bucket.lock();
            guard.idle_for(now) < guard.window * 2
        });
        let removed = before - self.buckets.len();
        if removed > 0 {
            log::debug!("rate limiter sweep: removed {removed} idle buckets");
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        // `new()` returns an `Arc`; `Default` is provided for embedding in
        // structs that want an owned, non-shared instance (tests only).
        Self {
            buckets: DashMap::with_hasher(ahash::RandomState::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_limit_then_denies() {
        let limiter = RateLimiter::default();
        for i in 0..10 {
            let result = limiter.check(Policy::SessionCreate, "1.2.3.4");
            assert!(result.allowed, "request {i} should be allowed");
        }
        let denied = limiter.check(Policy::SessionCreate, "1.2.3.4");
        assert!(!denied.allowed);
        assert!(denied.retry_after.unwrap() > Duration::ZERO);
    }

    #[test]
    fn buckets_are_independent_per_key() {
        let limiter = RateLimiter::default();
        for _ in 0..30 {
            assert!(limiter.check(Policy::SessionJoin, "a").allowed);
        }
        assert!(limiter.check(Policy::SessionJoin, "b").allowed);
    }

    #[test]
    fn sliding_window_evicts_old_timestamps() {
        let limiter = RateLimiter::default();
        for _ in 0..100 {
            assert!(limiter.check(Policy::SignalingMessage, "conn-1").allowed);
        }
        assert!(!limiter.check(Policy::SignalingMessage, "conn-1").allowed);
        std::thread::sleep(Duration::from_millis(1100));
        assert!(limiter.check(Policy::SignalingMessage, "conn-1").allowed);
    }

    #[test]
    fn clear_key_drops_all_policies_for_that_key() {
        let limiter = RateLimiter::default();
        limiter.check(Policy::SignalingMessage, "conn-2");
        limiter.check(Policy::IceCandidate, "conn-2");
        limiter.clear_key("conn-2");
        assert_eq!(limiter.buckets.len(), 0);
    }

    #[test]
    fn floor_to_100ms_never_reports_zero_for_a_positive_duration() {
        assert_eq!(floor_to_100ms(Duration::from_millis(50)), Duration::from_millis(100));
        assert_eq!(floor_to_100ms(Duration::from_millis(250)), Duration::from_millis(200));
        assert_eq!(floor_to_100ms(Duration::ZERO), Duration::ZERO);
    }
}
