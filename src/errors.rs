//! Error taxonomy for the fetch-and-schedule engine.
//!
//! `FetchError` names the *kinds* of failure the pipeline must distinguish, not the
//! underlying transport type. Classification is performed once, at the point an error
//! is produced, so the rest of the engine (retry policy, host budget, telemetry) only
//! ever matches on `FetchErrorKind`.

use std::time::Duration;
use thiserror::Error;

/// A single failure kind in the fetch error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchErrorKind {
    /// connection-reset, broken-pipe, timeout, DNS-temporary, connection-refused, unreachable
    TransientNetwork,
    /// connection-reset that should route through headless fallback instead of ordinary retry
    TlsFingerprintBlock,
    /// HTTP 408/429/500/502/503/504
    ServerRetryable,
    /// HTTP 304
    NotModified,
    /// HTTP 404/410
    Gone,
    /// other 4xx
    PermanentClient,
    /// body signature indicates access-denied / blocked
    ContentHardFailure,
    /// body signature indicates anti-bot challenge or JS-required interstitial
    ContentSoftFailure,
    /// rejected by eligibility/decision service before any request was made
    PolicySkip,
    /// queue-full, max-depth, duplicate: engine-local, non-retryable from this call
    QueueFull,
    MaxDepth,
    Duplicate,
    /// host circuit open
    HostLocked,
    /// caller requested abort
    Aborted,
    /// store unreachable, headless pool stuck in degraded state beyond cooldown
    Fatal,
}

impl FetchErrorKind {
    /// Whether a fresh attempt of the *same kind* (ordinary retry, not fallback) makes sense.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransientNetwork | Self::ServerRetryable)
    }

    /// Whether this error should route through the headless fallback instead of a retry.
    #[must_use]
    pub fn wants_headless_fallback(self) -> bool {
        matches!(self, Self::TlsFingerprintBlock | Self::ContentSoftFailure)
    }

    /// Whether the failure counts toward the host's rolling failure budget.
    /// 404/410 are explicitly excluded.
    #[must_use]
    pub fn counts_toward_host_budget(self) -> bool {
        !matches!(
            self,
            Self::Gone | Self::NotModified | Self::PolicySkip | Self::Aborted
        )
    }

    /// Multiplier applied to the base retry delay for this error kind. Server-retryable
    /// errors (5xx/429/408) back off slightly more aggressively than bare transient network
    /// failures, since they indicate the origin itself is under strain.
    #[must_use]
    pub fn delay_multiplier(self) -> f64 {
        match self {
            Self::ServerRetryable => 1.5,
            Self::TransientNetwork => 1.0,
            _ => 1.0,
        }
    }
}

/// A classified, terminal-or-retryable fetch failure.
#[derive(Debug, Error, Clone)]
#[error("{kind:?}: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub http_status: Option<u16>,
    pub retryable: bool,
    pub retry_after: Option<Duration>,
    pub message: String,
    /// Raw response body, captured only when `storeErrorResponseBodies` is enabled and
    /// the attempt reached a non-2xx HTTP response (never populated for transport-level
    /// failures, which have no body to capture).
    pub body: Option<String>,
}

impl FetchError {
    #[must_use]
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        let retryable = kind.is_retryable();
        Self {
            kind,
            http_status: None,
            retryable,
            retry_after: None,
            message: message.into(),
            body: None,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    #[must_use]
    pub fn with_retry_after(mut self, d: Duration) -> Self {
        self.retry_after = Some(d);
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Classify a raw HTTP status code into an error kind.
    #[must_use]
    pub fn classify_status(status: u16) -> FetchErrorKind {
        match status {
            304 => FetchErrorKind::NotModified,
            404 | 410 => FetchErrorKind::Gone,
            408 | 429 | 500 | 502 | 503 | 504 => FetchErrorKind::ServerRetryable,
            400..=499 => FetchErrorKind::PermanentClient,
            _ => FetchErrorKind::PermanentClient,
        }
    }

    /// Classify a `reqwest::Error` (or similar transport failure) by inspecting its
    /// textual representation for known substrings. Transport libraries do not expose a
    /// stable enum for these conditions, so substring matching against the lower-cased
    /// display/debug text is the same approach the underlying HTTP stack's own error
    /// messages are built from.
    ///
    /// `fallback_on_connection_reset` gates whether a connection-reset is classified as
    /// `TlsFingerprintBlock` (routes to headless fallback) or plain `TransientNetwork`
    /// (ordinary retry only) — the policy named in `HeadlessConfig`.
    #[must_use]
    pub fn classify_transport(
        err: &(dyn std::error::Error + 'static),
        fallback_on_connection_reset: bool,
    ) -> FetchErrorKind {
        let text = format!("{err:?} {err}").to_lowercase();
        let is_reset = text.contains("connection reset")
            || text.contains("econnreset")
            || text.contains("reset by peer");
        if is_reset {
            return if fallback_on_connection_reset {
                FetchErrorKind::TlsFingerprintBlock
            } else {
                FetchErrorKind::TransientNetwork
            };
        }
        if text.contains("broken pipe")
            || text.contains("timed out")
            || text.contains("timeout")
            || text.contains("temporary failure in name resolution")
            || text.contains("connection refused")
            || text.contains("network is unreachable")
            || text.contains("no route to host")
            || text.contains("dns error")
        {
            return FetchErrorKind::TransientNetwork;
        }
        FetchErrorKind::PermanentClient
    }
}

/// Engine-level errors that are not per-fetch: config loading, persistence, fatal conditions.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("persistence error: {0}")]
    Store(#[from] anyhow::Error),
    #[error("fatal: {0}")]
    Fatal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_status_codes_per_taxonomy() {
        assert_eq!(FetchError::classify_status(304), FetchErrorKind::NotModified);
        assert_eq!(FetchError::classify_status(404), FetchErrorKind::Gone);
        assert_eq!(FetchError::classify_status(410), FetchErrorKind::Gone);
        assert_eq!(
            FetchError::classify_status(429),
            FetchErrorKind::ServerRetryable
        );
        assert_eq!(
            FetchError::classify_status(503),
            FetchErrorKind::ServerRetryable
        );
        assert_eq!(
            FetchError::classify_status(403),
            FetchErrorKind::PermanentClient
        );
    }

    #[test]
    fn gone_is_excluded_from_host_budget() {
        assert!(!FetchErrorKind::Gone.counts_toward_host_budget());
        assert!(FetchErrorKind::ServerRetryable.counts_toward_host_budget());
    }

    #[test]
    fn server_retryable_and_transient_are_retryable() {
        assert!(FetchErrorKind::ServerRetryable.is_retryable());
        assert!(FetchErrorKind::TransientNetwork.is_retryable());
        assert!(!FetchErrorKind::Gone.is_retryable());
        assert!(!FetchErrorKind::PermanentClient.is_retryable());
    }
}
