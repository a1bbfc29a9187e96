//! Type-safe builder for `CrawlConfig` using the typestate pattern.
//!
//! `build()` is only callable once `start_url` has been set, enforced at compile time via
//! the `State` marker rather than a runtime check.

use anyhow::{anyhow, Result};
use regex::Regex;
use std::marker::PhantomData;
use std::path::PathBuf;

use super::types::{
    ClassifierConfig, CrawlConfig, CrawlMode, HeadlessConfig, HostBudgetConfig, PriorityConfig,
    RetryConfig,
};

/// Compile a soft/hard-failure signature string into a case-insensitive regex, once, at
/// config build time rather than on every response body scan. Re-used by callers that
/// need to re-compile the configured signature lists against a response body (`fetch::pipeline`,
/// `classify::stage2`).
pub(crate) fn compile_signature(pattern: &str) -> Result<Regex> {
    regex::RegexBuilder::new(&regex::escape(pattern))
        .case_insensitive(true)
        .build()
        .map_err(|e| anyhow!("invalid signature pattern '{pattern}': {e}"))
}

pub struct WithStartUrl;
pub struct Complete;

pub struct CrawlConfigBuilder<State = ()> {
    start_url: Option<String>,
    crawl_type: CrawlMode,
    data_dir: PathBuf,
    db_path: Option<PathBuf>,
    concurrency: usize,
    max_queue: usize,
    max_depth: u32,
    max_downloads: Option<usize>,
    discovery_acquisition_ratio: (u32, u32),
    queue_burst_cap: u32,
    rate_limit_ms: u64,
    prefer_cache: bool,
    max_age_ms: i64,
    max_age_article_ms: i64,
    max_age_hub_ms: i64,
    request_timeout_ms: u64,
    shutdown_grace_ms: u64,
    stall_threshold_ms: u64,
    retry: RetryConfig,
    host_budget: HostBudgetConfig,
    headless: HeadlessConfig,
    priority: PriorityConfig,
    classifier: ClassifierConfig,
    https_upgrade_hosts: Vec<String>,
    store_error_response_bodies: bool,
    verbose: u8,
    _phantom: PhantomData<State>,
}

impl Default for CrawlConfigBuilder<()> {
    fn default() -> Self {
        let defaults = CrawlConfig::default();
        Self {
            start_url: None,
            crawl_type: defaults.crawl_type,
            data_dir: defaults.data_dir,
            db_path: defaults.db_path,
            concurrency: defaults.concurrency,
            max_queue: defaults.max_queue,
            max_depth: defaults.max_depth,
            max_downloads: defaults.max_downloads,
            discovery_acquisition_ratio: defaults.discovery_acquisition_ratio,
            queue_burst_cap: defaults.queue_burst_cap,
            rate_limit_ms: defaults.rate_limit_ms,
            prefer_cache: defaults.prefer_cache,
            max_age_ms: defaults.max_age_ms,
            max_age_article_ms: defaults.max_age_article_ms,
            max_age_hub_ms: defaults.max_age_hub_ms,
            request_timeout_ms: defaults.request_timeout_ms,
            shutdown_grace_ms: defaults.shutdown_grace_ms,
            stall_threshold_ms: defaults.stall_threshold_ms,
            retry: defaults.retry,
            host_budget: defaults.host_budget,
            headless: defaults.headless,
            priority: defaults.priority,
            classifier: defaults.classifier,
            https_upgrade_hosts: defaults.https_upgrade_hosts,
            store_error_response_bodies: defaults.store_error_response_bodies,
            verbose: defaults.verbose,
            _phantom: PhantomData,
        }
    }
}

impl CrawlConfigBuilder<()> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the seed URL. Adds a `https://` scheme if none is present, the same
    /// normalization a common builder applies to `start_url`.
    pub fn start_url(self, url: impl Into<String>) -> CrawlConfigBuilder<WithStartUrl> {
        let raw = url.into();
        let normalized = if raw.starts_with("http://") || raw.starts_with("https://") {
            raw
        } else {
            format!("https://{raw}")
        };
        CrawlConfigBuilder {
            start_url: Some(normalized),
            crawl_type: self.crawl_type,
            data_dir: self.data_dir,
            db_path: self.db_path,
            concurrency: self.concurrency,
            max_queue: self.max_queue,
            max_depth: self.max_depth,
            max_downloads: self.max_downloads,
            discovery_acquisition_ratio: self.discovery_acquisition_ratio,
            queue_burst_cap: self.queue_burst_cap,
            rate_limit_ms: self.rate_limit_ms,
            prefer_cache: self.prefer_cache,
            max_age_ms: self.max_age_ms,
            max_age_article_ms: self.max_age_article_ms,
            max_age_hub_ms: self.max_age_hub_ms,
            request_timeout_ms: self.request_timeout_ms,
            shutdown_grace_ms: self.shutdown_grace_ms,
            stall_threshold_ms: self.stall_threshold_ms,
            retry: self.retry,
            host_budget: self.host_budget,
            headless: self.headless,
            priority: self.priority,
            classifier: self.classifier,
            https_upgrade_hosts: self.https_upgrade_hosts,
            store_error_response_bodies: self.store_error_response_bodies,
            verbose: self.verbose,
            _phantom: PhantomData,
        }
    }
}

/// Methods available regardless of builder state.
impl<State> CrawlConfigBuilder<State> {
    #[must_use]
    pub fn crawl_type(mut self, mode: CrawlMode) -> Self {
        self.crawl_type = mode;
        self
    }

    #[must_use]
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    #[must_use]
    pub fn db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    #[must_use]
    pub fn max_queue(mut self, n: usize) -> Self {
        self.max_queue = n;
        self
    }

    #[must_use]
    pub fn max_depth(mut self, n: u32) -> Self {
        self.max_depth = n;
        self
    }

    #[must_use]
    pub fn max_downloads(mut self, n: usize) -> Self {
        self.max_downloads = Some(n);
        self
    }

    #[must_use]
    pub fn discovery_acquisition_ratio(mut self, ratio: (u32, u32)) -> Self {
        self.discovery_acquisition_ratio = ratio;
        self
    }

    #[must_use]
    pub fn queue_burst_cap(mut self, cap: u32) -> Self {
        self.queue_burst_cap = cap;
        self
    }

    #[must_use]
    pub fn rate_limit_ms(mut self, ms: u64) -> Self {
        self.rate_limit_ms = ms;
        self
    }

    #[must_use]
    pub fn prefer_cache(mut self, prefer: bool) -> Self {
        self.prefer_cache = prefer;
        self
    }

    #[must_use]
    pub fn max_age_ms(mut self, ms: i64) -> Self {
        self.max_age_ms = ms;
        self
    }

    #[must_use]
    pub fn max_age_article_ms(mut self, ms: i64) -> Self {
        self.max_age_article_ms = ms;
        self
    }

    #[must_use]
    pub fn max_age_hub_ms(mut self, ms: i64) -> Self {
        self.max_age_hub_ms = ms;
        self
    }

    #[must_use]
    pub fn verbose(mut self, level: u8) -> Self {
        self.verbose = level;
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn host_budget(mut self, budget: HostBudgetConfig) -> Self {
        self.host_budget = budget;
        self
    }

    #[must_use]
    pub fn headless(mut self, headless: HeadlessConfig) -> Self {
        self.headless = headless;
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: PriorityConfig) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn classifier(mut self, classifier: ClassifierConfig) -> Self {
        self.classifier = classifier;
        self
    }

    #[must_use]
    pub fn https_upgrade_hosts(mut self, hosts: Vec<String>) -> Self {
        self.https_upgrade_hosts = hosts;
        self
    }
}

impl CrawlConfigBuilder<WithStartUrl> {
    /// Validate and produce a `CrawlConfig`. Compiles soft/hard-failure signatures once;
    /// rejects an empty or invalid data directory the same way `config/builder.rs`'s
    /// `compile_glob_pattern` rejects an invalid glob up front rather than at use time.
    pub fn build(self) -> Result<CrawlConfig> {
        for sig in self
            .classifier
            .soft_failure_signatures
            .iter()
            .chain(self.classifier.hard_failure_signatures.iter())
        {
            compile_signature(sig)?;
        }

        let data_dir = if self.data_dir.is_absolute() {
            self.data_dir
        } else {
            std::env::current_dir()
                .map_err(|e| anyhow!("cannot resolve data dir to absolute path: {e}"))?
                .join(self.data_dir)
        };

        Ok(CrawlConfig {
            start_url: self
                .start_url
                .ok_or_else(|| anyhow!("start_url is required"))?,
            crawl_type: self.crawl_type,
            data_dir,
            db_path: self.db_path,
            concurrency: self.concurrency.max(1),
            max_queue: self.max_queue,
            max_depth: self.max_depth,
            max_downloads: self.max_downloads,
            discovery_acquisition_ratio: self.discovery_acquisition_ratio,
            queue_burst_cap: self.queue_burst_cap,
            rate_limit_ms: self.rate_limit_ms,
            prefer_cache: self.prefer_cache,
            max_age_ms: self.max_age_ms,
            max_age_article_ms: self.max_age_article_ms,
            max_age_hub_ms: self.max_age_hub_ms,
            request_timeout_ms: self.request_timeout_ms,
            shutdown_grace_ms: self.shutdown_grace_ms,
            stall_threshold_ms: self.stall_threshold_ms,
            retry: self.retry,
            host_budget: self.host_budget,
            headless: self.headless,
            priority: self.priority,
            classifier: self.classifier,
            https_upgrade_hosts: self.https_upgrade_hosts,
            store_error_response_bodies: self.store_error_response_bodies,
            verbose: self.verbose,
            event_bus: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_requires_start_url() {
        let config = CrawlConfigBuilder::new()
            .start_url("example.com")
            .build()
            .unwrap();
        assert_eq!(config.start_url, "https://example.com");
    }

    #[test]
    fn build_preserves_explicit_scheme() {
        let config = CrawlConfigBuilder::new()
            .start_url("http://example.com")
            .build()
            .unwrap();
        assert_eq!(config.start_url, "http://example.com");
    }

    #[test]
    fn concurrency_floors_at_one() {
        let config = CrawlConfigBuilder::new()
            .start_url("example.com")
            .concurrency(0)
            .build()
            .unwrap();
        assert_eq!(config.concurrency, 1);
    }
}
