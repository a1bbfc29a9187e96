//! Headless browser fallback pool.
//!
//! Wraps a [`crate::browser_pool::BrowserPool`] (one Chrome process per pooled browser)
//! with a second, page-level concurrency limit (`maxPagesPerBrowser` pages in flight per
//! browser, enforced engine-wide as a single semaphore of `maxBrowsers * maxPagesPerBrowser`
//! permits) and a consecutive-crash circuit that drops the pool into a cooldown "degraded
//! mode" rather than hammering a browser that keeps dying.

mod navigate;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{error, warn};

use crate::browser_pool::{BrowserPool, BrowserPoolConfig};
use crate::config::HeadlessConfig;
use crate::fetch::{HeadlessFetchOutcome, HeadlessFetcher};
use crate::url::ImUrl;

/// How long a degraded pool refuses new headless fetches after tripping, before it is
/// given another chance. Not separately configurable in `HeadlessConfig`; derived from
/// `health_check_interval_ms` since that is already the unit the caller tunes for
/// "how often do you expect to notice and recover from trouble".
fn degraded_cooldown(config: &HeadlessConfig) -> Duration {
    Duration::from_millis(config.health_check_interval_ms.max(1_000) * 4)
}

pub struct HeadlessPool {
    browsers: Arc<BrowserPool>,
    page_slots: Semaphore,
    config: HeadlessConfig,
    consecutive_errors: AtomicU32,
    degraded_until_ms: AtomicU64,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl HeadlessPool {
    /// Construct the pool without starting background tasks; call `start` before use.
    #[must_use]
    pub fn new(config: HeadlessConfig) -> Arc<Self> {
        let browser_pool_config = BrowserPoolConfig {
            min_pool_size: 1.max(config.max_browsers.min(2)),
            max_pool_size: config.max_browsers.max(1),
            keepalive_interval: Duration::from_millis(config.health_check_interval_ms),
            idle_timeout: Duration::from_millis(config.max_session_age_ms),
            headless: true,
        };
        let total_permits = (config.max_browsers.max(1)) * config.max_pages_per_browser.max(1);
        Arc::new(Self {
            browsers: BrowserPool::new(browser_pool_config),
            page_slots: Semaphore::new(total_permits),
            config,
            consecutive_errors: AtomicU32::new(0),
            degraded_until_ms: AtomicU64::new(0),
        })
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.browsers.start().await
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.browsers.shutdown().await
    }

    fn is_degraded(&self) -> bool {
        self.degraded_until_ms.load(Ordering::Acquire) > now_ms()
    }

    fn record_crash(&self) {
        let streak = self.consecutive_errors.fetch_add(1, Ordering::AcqRel) + 1;
        if streak >= self.config.max_consecutive_errors {
            let cooldown = degraded_cooldown(&self.config);
            self.degraded_until_ms
                .store(now_ms() + cooldown.as_millis() as u64, Ordering::Release);
            error!(
                streak,
                cooldown_ms = cooldown.as_millis() as u64,
                "headless: entering degraded mode after repeated crashes"
            );
        }
    }

    fn record_recovery(&self) {
        self.consecutive_errors.store(0, Ordering::Release);
    }
}

#[async_trait::async_trait]
impl HeadlessFetcher for HeadlessPool {
    async fn fetch(&self, url: &ImUrl, timeout: Duration) -> HeadlessFetchOutcome {
        if self.is_degraded() {
            return HeadlessFetchOutcome {
                success: false,
                html: None,
                error: Some(
                    "headless pool degraded, cooling down after repeated crashes".to_string(),
                ),
                render_time_ms: 0,
            };
        }

        let Ok(_permit) = self.page_slots.acquire().await else {
            return HeadlessFetchOutcome {
                success: false,
                html: None,
                error: Some("headless page semaphore closed".to_string()),
                render_time_ms: 0,
            };
        };

        let browser = match self.browsers.acquire().await {
            Ok(guard) => guard,
            Err(err) => {
                self.record_crash();
                warn!(error = %err, "headless: failed to acquire a pooled browser");
                return HeadlessFetchOutcome {
                    success: false,
                    html: None,
                    error: Some(err.to_string()),
                    render_time_ms: 0,
                };
            }
        };

        let start = Instant::now();
        match navigate::render(browser.browser_arc(), url, timeout).await {
            Ok(html) => {
                self.record_recovery();
                HeadlessFetchOutcome {
                    success: true,
                    html: Some(html),
                    error: None,
                    render_time_ms: start.elapsed().as_millis() as u64,
                }
            }
            Err(err) => {
                self.record_crash();
                warn!(url = url.as_str(), error = %err, "headless: render failed");
                HeadlessFetchOutcome {
                    success: false,
                    html: None,
                    error: Some(err.to_string()),
                    render_time_ms: start.elapsed().as_millis() as u64,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_mode_trips_after_max_consecutive_errors() {
        let pool = HeadlessPool::new(HeadlessConfig {
            max_consecutive_errors: 2,
            ..HeadlessConfig::default()
        });
        assert!(!pool.is_degraded());
        pool.record_crash();
        assert!(!pool.is_degraded());
        pool.record_crash();
        assert!(pool.is_degraded());
    }

    #[test]
    fn recovery_resets_the_streak() {
        let pool = HeadlessPool::new(HeadlessConfig {
            max_consecutive_errors: 2,
            ..HeadlessConfig::default()
        });
        pool.record_crash();
        pool.record_recovery();
        pool.record_crash();
        assert!(!pool.is_degraded());
    }
}
