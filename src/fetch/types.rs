//! Fetch result types.

use std::collections::HashMap;
use std::time::Duration;

use crate::errors::FetchErrorKind;

/// Where a successful `FetchResult` originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Network,
    Cache,
    StaleCache,
}

/// How the network attempt was ultimately satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMethod {
    Http,
    PuppeteerFallback,
}

#[derive(Debug, Clone, Default)]
pub struct FetchTiming {
    pub ttfb_ms: u64,
    pub download_ms: u64,
    pub total_ms: u64,
    pub bytes_downloaded: u64,
    pub transfer_kbps: f64,
}

#[derive(Debug, Clone)]
pub struct FetchMeta {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub http_status: u16,
    pub source: FetchSource,
    pub fetch_method: FetchMethod,
    pub redirect_chain: Vec<String>,
    pub timing: FetchTiming,
    pub age_seconds: Option<u64>,
}

/// Tagged union result of a `fetch` call.
#[derive(Debug, Clone)]
pub enum FetchResult {
    Success { html: String, meta: FetchMeta },
    NotModified { meta: FetchMeta },
    Skipped { reason: String },
    Error(Box<FetchResultError>),
    HostLocked { retry_after_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct FetchResultError {
    pub kind: FetchErrorKind,
    pub http_status: Option<u16>,
    pub retryable: bool,
    pub retry_after_ms: Option<u64>,
    pub message: String,
    pub attempts: u32,
    pub duration: Duration,
}

impl FetchResult {
    #[must_use]
    pub fn error(
        kind: FetchErrorKind,
        message: impl Into<String>,
        attempts: u32,
        duration: Duration,
    ) -> Self {
        Self::Error(Box::new(FetchResultError {
            kind,
            http_status: None,
            retryable: kind.is_retryable(),
            retry_after_ms: None,
            message: message.into(),
            attempts,
            duration,
        }))
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. } | Self::NotModified { .. })
    }
}

/// Conditional request / origin response context threaded through a single fetch call chain.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    pub attempt_index: u32,
    pub retry_after_ms: Option<u64>,
    pub last_error_kind: Option<FetchErrorKind>,
}

/// A request for `FetchPipeline::fetch`.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: crate::url::ImUrl,
    pub kind: crate::queue::ItemKind,
    pub prefer_cache: bool,
    pub force_cache: bool,
    /// Per-request override for `RetryConfig::max_attempts` (the retry budget, not a total
    /// send count — the pipeline always sends once more than this).
    pub retry_count: u32,
    pub extra_headers: HashMap<String, String>,
}
