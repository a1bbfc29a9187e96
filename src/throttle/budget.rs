//! Host failure circuit breaker ("budget manager").
//!
//! Resolves failure decay by window aging: `HostBudget.failures` is always "count of
//! failures in the trailing `windowMs`", recomputed from a ring of failure timestamps
//! rather than a counter with an explicit reset (see DESIGN.md).

use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Exclusively owned by `BudgetManager`.
#[derive(Debug, Clone, Default)]
pub struct HostBudget {
    failures: VecDeque<u64>,
    pub lock_expires_at: Option<u64>,
}

impl HostBudget {
    fn prune(&mut self, window_ms: u64, now: u64) {
        let cutoff = now.saturating_sub(window_ms);
        while matches!(self.failures.front(), Some(ts) if *ts < cutoff) {
            self.failures.pop_front();
        }
    }

    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    #[must_use]
    pub fn oldest_failure_at(&self) -> Option<u64> {
        self.failures.front().copied()
    }

    /// All failure timestamps in the window, for persistence (`host_budget` table).
    #[must_use]
    pub fn failure_timestamps(&self) -> Vec<u64> {
        self.failures.iter().copied().collect()
    }

    /// Rebuilds a budget from persisted failure timestamps and lock state (startup resume).
    #[must_use]
    pub fn from_persisted(failures: Vec<u64>, lock_expires_at: Option<u64>) -> Self {
        Self {
            failures: failures.into(),
            lock_expires_at,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BudgetConfig {
    pub max_errors: u32,
    pub window_ms: u64,
    pub lockout_ms: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_errors: 6,
            window_ms: 5 * 60_000,
            lockout_ms: 2 * 60_000,
        }
    }
}

pub struct BudgetManager {
    hosts: DashMap<String, HostBudget>,
    config: BudgetConfig,
}

impl BudgetManager {
    #[must_use]
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            hosts: DashMap::new(),
            config,
        }
    }

    /// `Some(retry_after_ms)` if the host is currently locked out; `None` otherwise.
    /// Boundary behaviour: transitions exactly at `failures == max_errors`.
    #[must_use]
    pub fn lock_retry_after_ms(&self, host: &str) -> Option<u64> {
        let mut entry = self.hosts.get_mut(host)?;
        let now = now_ms();
        entry.prune(self.config.window_ms, now);
        match entry.lock_expires_at {
            Some(expires) if expires > now => Some(expires - now),
            Some(_) => {
                entry.lock_expires_at = None;
                None
            }
            None => None,
        }
    }

    /// Record a failure. 404/410 must be excluded by the caller before calling this
    /// (`FetchErrorKind::counts_toward_host_budget`).
    pub fn record_failure(&self, host: &str) {
        let mut entry = self.hosts.entry(host.to_string()).or_default();
        let now = now_ms();
        entry.prune(self.config.window_ms, now);
        entry.failures.push_back(now);

        if entry.failures.len() as u32 >= self.config.max_errors && entry.lock_expires_at.is_none()
        {
            entry.lock_expires_at = Some(now + self.config.lockout_ms);
            warn!(
                host,
                failures = entry.failures.len(),
                lockout_ms = self.config.lockout_ms,
                "budget: host locked out"
            );
        }
    }

    /// Record a success. With window-aging decay this is a no-op on `failures` itself
    /// (they age out naturally); a live lock is left to expire on its own schedule so a
    /// single success cannot bypass an active lockout.
    pub fn record_success(&self, host: &str) {
        if let Some(mut entry) = self.hosts.get_mut(host) {
            entry.prune(self.config.window_ms, now_ms());
        }
    }

    #[must_use]
    pub fn failure_count(&self, host: &str) -> usize {
        self.hosts
            .get_mut(host)
            .map(|mut e| {
                e.prune(self.config.window_ms, now_ms());
                e.failure_count()
            })
            .unwrap_or(0)
    }

    /// Read-only snapshot for persistence (`host_budget` table); callers never
    /// mutate the manager's state through it.
    #[must_use]
    pub fn snapshot(&self, host: &str) -> Option<HostBudget> {
        self.hosts.get(host).map(|entry| entry.clone())
    }

    /// Restores a host's budget state from a persisted snapshot (used at startup to resume
    /// an in-progress lockout across restarts).
    pub fn restore(&self, host: &str, budget: HostBudget) {
        self.hosts.insert(host.to_string(), budget);
    }

    #[must_use]
    pub fn all_hosts(&self) -> Vec<String> {
        self.hosts.iter().map(|entry| entry.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn locks_out_at_exactly_max_errors_boundary() {
        let mgr = BudgetManager::new(BudgetConfig {
            max_errors: 3,
            window_ms: 60_000,
            lockout_ms: 30_000,
        });
        mgr.record_failure("flaky.example");
        mgr.record_failure("flaky.example");
        assert!(mgr.lock_retry_after_ms("flaky.example").is_none());

        mgr.record_failure("flaky.example");
        let retry_after = mgr.lock_retry_after_ms("flaky.example");
        assert!(retry_after.is_some());
        assert!(retry_after.unwrap() <= 30_000);
    }

    #[test]
    fn failures_age_out_of_window() {
        let mgr = BudgetManager::new(BudgetConfig {
            max_errors: 2,
            window_ms: 50,
            lockout_ms: 1_000,
        });
        mgr.record_failure("example.com");
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(mgr.failure_count("example.com"), 0);
    }

    #[test]
    fn no_lock_below_threshold() {
        let mgr = BudgetManager::new(BudgetConfig::default());
        mgr.record_failure("example.com");
        assert!(mgr.lock_retry_after_ms("example.com").is_none());
    }
}
