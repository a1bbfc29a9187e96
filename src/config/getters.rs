//! Read-only accessors for `CrawlConfig`.
//!
//! Fields are `pub(crate)` so construction stays centralized in the builder; everything
//! else reads the config through these accessors, mirroring the "mutated only inside
//! managers, read via snapshot accessors" rule applied to shared state elsewhere in the
//! engine.

use std::path::Path;

use super::types::{
    ClassifierConfig, CrawlConfig, CrawlMode, HeadlessConfig, HostBudgetConfig, PriorityConfig,
    RetryConfig,
};

impl CrawlConfig {
    #[must_use]
    pub fn start_url(&self) -> &str {
        &self.start_url
    }

    #[must_use]
    pub fn crawl_type(&self) -> CrawlMode {
        self.crawl_type
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        self.db_path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    #[must_use]
    pub fn max_queue(&self) -> usize {
        self.max_queue
    }

    #[must_use]
    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    #[must_use]
    pub fn max_downloads(&self) -> Option<usize> {
        self.max_downloads
    }

    #[must_use]
    pub fn discovery_acquisition_ratio(&self) -> (u32, u32) {
        self.discovery_acquisition_ratio
    }

    #[must_use]
    pub fn queue_burst_cap(&self) -> u32 {
        self.queue_burst_cap
    }

    #[must_use]
    pub fn rate_limit_ms(&self) -> u64 {
        self.rate_limit_ms
    }

    #[must_use]
    pub fn prefer_cache(&self) -> bool {
        self.prefer_cache
    }

    #[must_use]
    pub fn request_timeout_ms(&self) -> u64 {
        self.request_timeout_ms
    }

    #[must_use]
    pub fn shutdown_grace_ms(&self) -> u64 {
        self.shutdown_grace_ms
    }

    #[must_use]
    pub fn stall_threshold_ms(&self) -> u64 {
        self.stall_threshold_ms
    }

    #[must_use]
    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    #[must_use]
    pub fn host_budget(&self) -> &HostBudgetConfig {
        &self.host_budget
    }

    #[must_use]
    pub fn headless(&self) -> &HeadlessConfig {
        &self.headless
    }

    #[must_use]
    pub fn priority(&self) -> &PriorityConfig {
        &self.priority
    }

    #[must_use]
    pub fn classifier(&self) -> &ClassifierConfig {
        &self.classifier
    }

    #[must_use]
    pub fn https_upgrade_hosts(&self) -> &[String] {
        &self.https_upgrade_hosts
    }

    #[must_use]
    pub fn store_error_response_bodies(&self) -> bool {
        self.store_error_response_bodies
    }

    #[must_use]
    pub fn verbose(&self) -> u8 {
        self.verbose
    }
}
