//! Per-host throttle manager: adaptive RPM with 429-triggered backoff.
//!
//! `HostState` is exclusively owned by this manager; callers only ever see snapshots via
//! `snapshot`. Mutation happens only inside `&self` methods here, guarded per-host by a
//! `parking_lot::Mutex` in a `DashMap` (the same per-domain-lock-in-a-concurrent-map shape
//! a common rate limiter and circuit breaker use, minus the lock-free atomics that
//! require a nightly feature this crate does not enable).

pub mod budget;

use dashmap::DashMap;
use rand::Rng;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

pub use budget::{BudgetManager, HostBudget};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Exclusively owned by `ThrottleManager`; mutated only inside its methods.
#[derive(Debug, Clone)]
pub struct HostState {
    pub rpm: u32,
    pub next_request_at: u64,
    pub backoff_until: u64,
    pub success_streak: u32,
    pub err_429_streak: u32,
    pub is_limited: bool,
    /// Set once `success_streak` crosses the re-acceleration threshold while `is_limited`,
    /// so the rpm increase happens once per qualifying streak rather than every success.
    was_limited_when_streak_started: bool,
}

impl HostState {
    fn new(default_rpm: u32) -> Self {
        Self {
            rpm: default_rpm,
            next_request_at: 0,
            backoff_until: 0,
            success_streak: 0,
            err_429_streak: 0,
            is_limited: false,
            was_limited_when_streak_started: false,
        }
    }

    /// Rebuilds a host's state from persisted fields (`host_state` table); the
    /// streak-gate flag is not persisted and starts fresh, which only delays one
    /// re-acceleration step rather than affecting correctness.
    #[must_use]
    pub fn from_persisted(
        rpm: u32,
        next_request_at: u64,
        backoff_until: u64,
        success_streak: u32,
        err_429_streak: u32,
    ) -> Self {
        Self {
            rpm,
            next_request_at,
            backoff_until,
            success_streak,
            err_429_streak,
            is_limited: err_429_streak > 0,
            was_limited_when_streak_started: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ThrottleConfig {
    pub default_rpm: u32,
    pub max_rpm: u32,
    pub reacceleration_successes: u32,
    pub reacceleration_factor: f64,
    pub min_blackout_ms: u64,
    pub jitter_ratio: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            default_rpm: 30,
            max_rpm: 300,
            reacceleration_successes: 100,
            reacceleration_factor: 1.1,
            min_blackout_ms: 45_000,
            jitter_ratio: 0.1,
        }
    }
}

pub struct ThrottleManager {
    hosts: DashMap<String, HostState>,
    config: ThrottleConfig,
}

impl ThrottleManager {
    #[must_use]
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            hosts: DashMap::new(),
            config,
        }
    }

    fn entry(&self, host: &str) -> dashmap::mapref::one::RefMut<'_, String, HostState> {
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| HostState::new(self.config.default_rpm))
    }

    /// Read-only snapshot of a host's state; `None` if the host has never been seen.
    #[must_use]
    pub fn snapshot(&self, host: &str) -> Option<HostState> {
        self.hosts.get(host).map(|e| e.clone())
    }

    /// `nextRequestAt`/`backoffUntil` combined: the earliest time this host may next be
    /// contacted, or `None` if it can be contacted now.
    #[must_use]
    pub fn deferred_until(&self, host: &str) -> Option<u64> {
        let state = self.hosts.get(host)?;
        let gate = state.next_request_at.max(state.backoff_until);
        let now = now_ms();
        if gate > now {
            Some(gate)
        } else {
            None
        }
    }

    #[must_use]
    pub fn is_rate_limited(&self, host: &str) -> bool {
        self.hosts.get(host).is_some_and(|s| s.is_limited)
    }

    /// Grant a request slot: advances `nextRequestAt` by `60_000/rpm` to realise the RPM.
    /// Call immediately before dispatching a request to this host.
    pub fn grant(&self, host: &str) {
        let mut state = self.entry(host);
        let now = now_ms();
        let interval = (60_000 / state.rpm.max(1) as u64).max(1);
        let base = state.next_request_at.max(now);
        state.next_request_at = base + interval;
    }

    /// Record a successful (2xx/304) response.
    pub fn record_success(&self, host: &str) {
        let mut state = self.entry(host);
        state.success_streak += 1;
        state.err_429_streak = 0;

        if state.is_limited && state.success_streak > self.config.reacceleration_successes {
            let new_rpm = ((state.rpm as f64) * self.config.reacceleration_factor)
                .min(self.config.max_rpm as f64);
            debug!(
                host,
                old_rpm = state.rpm,
                new_rpm,
                "throttle: re-accelerating after sustained success"
            );
            state.rpm = new_rpm.round() as u32;
            state.success_streak = 0;
            state.is_limited = false;
        }
    }

    /// Record a 429 response; `retry_after` is the parsed `Retry-After` header, if any.
    pub fn record_rate_limited(&self, host: &str, retry_after_ms: Option<u64>) {
        let mut state = self.entry(host);
        state.err_429_streak += 1;
        state.is_limited = true;
        state.success_streak = 0;

        let escalation_ms = match state.err_429_streak {
            0 | 1 => 0,
            2 => 5 * 60_000,
            _ => 15 * 60_000,
        };
        let base = retry_after_ms
            .unwrap_or(self.config.min_blackout_ms)
            .max(escalation_ms);

        let jitter_span = (base as f64 * self.config.jitter_ratio) as i64;
        let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
        let blackout = (base as i64 + jitter).max(0) as u64;

        state.backoff_until = now_ms() + blackout;
        state.rpm = (state.rpm / 4).max(1);

        warn!(
            host,
            streak = state.err_429_streak,
            blackout_ms = blackout,
            new_rpm = state.rpm,
            "throttle: host rate-limited"
        );
    }

    /// Restores a host's state from a persisted snapshot (startup resume).
    pub fn restore(&self, host: &str, state: HostState) {
        self.hosts.insert(host.to_string(), state);
    }

    #[must_use]
    pub fn all_hosts(&self) -> Vec<String> {
        self.hosts.iter().map(|entry| entry.key().clone()).collect()
    }
}

/// Engine-wide minimum-interval gate (`rateLimitMs`), consulted by `FetchPipeline` in
/// addition to the per-host `ThrottleManager`. Unlike host throttling, this isn't
/// something `QueueManager::pull_next` can defer on up front (it isn't keyed by host), so
/// the pipeline awaits it directly: a single `AtomicU64` "next allowed dispatch time",
/// advanced with a compare-and-swap loop so concurrent workers queue up rather than race.
pub struct GlobalLimiter {
    next_request_at: std::sync::atomic::AtomicU64,
}

impl Default for GlobalLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_request_at: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// No-op when `interval_ms` is 0 (global limiter disabled, the default). Otherwise
    /// waits until the gate opens and advances it by `interval_ms` before returning.
    pub async fn acquire(&self, interval_ms: u64) {
        if interval_ms == 0 {
            return;
        }
        loop {
            let now = now_ms();
            let current = self.next_request_at.load(Ordering::SeqCst);
            let dispatch_at = current.max(now);
            if self
                .next_request_at
                .compare_exchange(
                    current,
                    dispatch_at + interval_ms,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                if dispatch_at > now {
                    tokio::time::sleep(std::time::Duration::from_millis(dispatch_at - now)).await;
                }
                return;
            }
        }
    }
}

/// Per-host concurrency gate: caps the number of simultaneously in-flight fetches to any
/// one host at `perHostConcurrency` (spec.md §3). One lazily-created `tokio::sync::Semaphore`
/// per host, keyed by host rather than owned by a single long-lived per-host actor, since this
/// engine does not pool one.
pub struct HostConcurrency {
    permits: DashMap<String, Arc<Semaphore>>,
    per_host: usize,
}

impl HostConcurrency {
    #[must_use]
    pub fn new(per_host: usize) -> Self {
        Self {
            permits: DashMap::new(),
            per_host: per_host.max(1),
        }
    }

    fn semaphore(&self, host: &str) -> Arc<Semaphore> {
        self.permits
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host)))
            .clone()
    }

    /// Waits for a free in-flight slot for `host`, returning a permit that releases the
    /// slot back to the host when dropped.
    pub async fn acquire(&self, host: &str) -> OwnedSemaphorePermit {
        self.semaphore(host)
            .acquire_owned()
            .await
            .expect("semaphore is never closed")
    }
}

#[cfg(test)]
mod host_concurrency_tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_waits_for_first_to_drop() {
        let gate = Arc::new(HostConcurrency::new(1));
        let permit = gate.acquire("example.com").await;

        let gate2 = gate.clone();
        let waiter = tokio::spawn(async move {
            let _permit = gate2.acquire("example.com").await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished(), "second acquire should block while first permit is held");

        drop(permit);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn distinct_hosts_do_not_contend() {
        let gate = HostConcurrency::new(1);
        let _a = gate.acquire("a.example").await;
        let b = tokio::time::timeout(std::time::Duration::from_millis(50), gate.acquire("b.example")).await;
        assert!(b.is_ok(), "distinct hosts should not share a permit pool");
    }
}

#[cfg(test)]
mod global_limiter_tests {
    use super::*;

    #[tokio::test]
    async fn disabled_limiter_never_waits() {
        let limiter = GlobalLimiter::new();
        let start = std::time::Instant::now();
        for _ in 0..5 {
            limiter.acquire(0).await;
        }
        assert!(start.elapsed() < std::time::Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn serializes_concurrent_acquires_to_the_interval() {
        let limiter = std::sync::Arc::new(GlobalLimiter::new());
        let start = tokio::time::Instant::now();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire(100).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(start.elapsed() >= std::time::Duration::from_millis(200));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_host_is_not_deferred() {
        let mgr = ThrottleManager::new(ThrottleConfig::default());
        assert!(mgr.deferred_until("example.com").is_none());
    }

    #[test]
    fn rate_limited_host_reduces_rpm_and_sets_backoff() {
        let mgr = ThrottleManager::new(ThrottleConfig::default());
        mgr.record_rate_limited("hot.example", Some(5_000));
        let snap = mgr.snapshot("hot.example").unwrap();
        assert!(snap.is_limited);
        assert_eq!(snap.err_429_streak, 1);
        assert!(snap.rpm <= 7, "rpm should drop to ~25% of default 30");
        assert!(mgr.deferred_until("hot.example").unwrap() >= now_ms());
    }

    #[test]
    fn grant_advances_next_request_at_per_rpm() {
        let mgr = ThrottleManager::new(ThrottleConfig {
            default_rpm: 60,
            ..Default::default()
        });
        mgr.grant("example.com");
        let snap = mgr.snapshot("example.com").unwrap();
        assert!(snap.next_request_at >= now_ms());
    }

    #[test]
    fn success_resets_429_streak() {
        let mgr = ThrottleManager::new(ThrottleConfig::default());
        mgr.record_rate_limited("example.com", None);
        mgr.record_success("example.com");
        assert_eq!(mgr.snapshot("example.com").unwrap().err_429_streak, 0);
    }

    #[test]
    fn politeness_respects_rpm_bound() {
        // Requests dispatched within a 60s window should not exceed the host's rpm.
        let mgr = ThrottleManager::new(ThrottleConfig {
            default_rpm: 30,
            ..Default::default()
        });
        let mut dispatched = 0;
        for _ in 0..100 {
            if mgr.deferred_until("example.com").is_none() {
                mgr.grant("example.com");
                dispatched += 1;
            } else {
                break;
            }
        }
        // With interval 2000ms per grant, only the first slot is immediately available;
        // subsequent grants push next_request_at into the future rather than allowing
        // unlimited immediate dispatch.
        assert!(dispatched <= 30);
    }
}
