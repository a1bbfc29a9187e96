//! Fetch pipeline: the single path every queued item passes through to become either an
//! HTML body or a classified failure.

pub mod http;
pub mod pipeline;
pub mod redirect;
pub mod retry;
pub mod types;

pub use pipeline::FetchPipeline;
pub use types::{FetchMeta, FetchMethod, FetchRequest, FetchResult, FetchSource, FetchTiming};

use std::time::Duration;

use crate::url::ImUrl;

/// Outcome of a single headless-rendered fetch attempt, consumed by the pipeline's
/// fallback phase. Implemented by `crate::headless::HeadlessPool`; kept as a trait object
/// here so `fetch` has no compile-time dependency on the browser-pool internals.
#[async_trait::async_trait]
pub trait HeadlessFetcher: Send + Sync {
    async fn fetch(&self, url: &ImUrl, timeout: Duration) -> HeadlessFetchOutcome;
}

#[derive(Debug, Clone)]
pub struct HeadlessFetchOutcome {
    pub success: bool,
    pub html: Option<String>,
    pub error: Option<String>,
    pub render_time_ms: u64,
}
