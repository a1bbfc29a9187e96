//! A polite, resilient fetch-and-schedule engine for large-scale news crawling: a
//! priority queue, a multi-layer fetch pipeline (cache, per-host throttle, network,
//! retry, headless fallback), a three-stage page classifier, and a telemetry bus, wired
//! together by [`engine::Engine`].

pub mod browser_pool;
pub mod browser_profile;
pub mod browser_setup;
pub mod cache;
pub mod classify;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod fetch;
pub mod headless;
pub mod queue;
pub mod store;
pub mod throttle;
pub mod url;
pub mod utils;

pub use config::{ConfigHandle, CrawlConfig, CrawlConfigBuilder, CrawlMode};
pub use engine::{CrawlStats, Engine};
pub use errors::{EngineError, FetchError, FetchErrorKind};
pub use events::{CrawlPhase, EventBus, EventEnvelope, EventType};
pub use fetch::{FetchMeta, FetchMethod, FetchRequest, FetchResult, FetchSource};
pub use queue::{ItemKind, ItemMeta, QueueManager};
pub use url::ImUrl;
