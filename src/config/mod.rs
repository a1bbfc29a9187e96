//! Engine configuration.
//!
//! `CrawlConfig` enumerates every option named in the external interfaces: crawl mode and
//! bounds, global/per-host rate limiting, cache policy, retry policy, host-budget policy,
//! headless-fallback policy, priority/scoring policy, and classifier thresholds. Values are
//! loaded from a config document (TOML/JSON via `serde`) or built programmatically through
//! `CrawlConfigBuilder`, then wrapped in a hot-reloadable `ConfigHandle`.

pub mod builder;
pub mod getters;
pub mod handle;
pub mod methods;
pub mod types;

pub use builder::{Complete, CrawlConfigBuilder, WithStartUrl};
pub use handle::ConfigHandle;
pub use types::{
    ClassifierConfig, CrawlConfig, CrawlMode, HeadlessConfig, HostBudgetConfig, PriorityConfig,
    RetryConfig, Stage2Thresholds,
};
