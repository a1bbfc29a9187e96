//! `FetchPipeline::fetch`: decision → cache check → throttle/budget gates → network
//! attempt (with manual redirect following) → status handling → retry/fallback → terminate
//!.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use reqwest::Client;
use tracing::{debug, info, warn};

use crate::cache::{ArticleCache, CacheEntry};
use crate::config::methods::CacheKind;
use crate::config::ConfigHandle;
use crate::errors::{FetchError, FetchErrorKind};
use crate::queue::ItemKind;
use crate::throttle::{BudgetManager, GlobalLimiter, HostConcurrency, ThrottleManager};
use crate::url::ImUrl;

use super::http::{build_headers, location_of, parse_retry_after_ms};
use super::redirect::{self, RedirectDecision};
use super::retry::compute_delay_ms;
use super::types::{FetchMeta, FetchMethod, FetchRequest, FetchResult, FetchSource, FetchTiming};
use super::HeadlessFetcher;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn cache_kind_for(kind: ItemKind) -> CacheKind {
    match kind {
        ItemKind::Article | ItemKind::Refresh | ItemKind::History => CacheKind::Article,
        ItemKind::Hub | ItemKind::HubSeed => CacheKind::Hub,
        ItemKind::Nav | ItemKind::Default => CacheKind::Other,
    }
}

enum AttemptOutcome {
    Success { html: String, meta: FetchMeta },
    NotModified { meta: FetchMeta },
    Failure { error: FetchError },
}

pub struct FetchPipeline {
    client: Client,
    throttle: Arc<ThrottleManager>,
    budget: Arc<BudgetManager>,
    cache: Arc<ArticleCache>,
    headless: Option<Arc<dyn HeadlessFetcher>>,
    config: ConfigHandle,
    global_limiter: Arc<GlobalLimiter>,
    host_concurrency: Arc<HostConcurrency>,
}

impl FetchPipeline {
    #[must_use]
    pub fn new(
        client: Client,
        throttle: Arc<ThrottleManager>,
        budget: Arc<BudgetManager>,
        cache: Arc<ArticleCache>,
        headless: Option<Arc<dyn HeadlessFetcher>>,
        config: ConfigHandle,
    ) -> Self {
        let per_host = config.load().host_budget().per_host_concurrency as usize;
        Self::with_global_limiter(
            client,
            throttle,
            budget,
            cache,
            headless,
            config,
            Arc::new(GlobalLimiter::new()),
            Arc::new(HostConcurrency::new(per_host)),
        )
    }

    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn with_global_limiter(
        client: Client,
        throttle: Arc<ThrottleManager>,
        budget: Arc<BudgetManager>,
        cache: Arc<ArticleCache>,
        headless: Option<Arc<dyn HeadlessFetcher>>,
        config: ConfigHandle,
        global_limiter: Arc<GlobalLimiter>,
        host_concurrency: Arc<HostConcurrency>,
    ) -> Self {
        Self {
            client,
            throttle,
            budget,
            cache,
            headless,
            config,
            global_limiter,
            host_concurrency,
        }
    }

    /// Run the full fetch decision pipeline for one queued item.
    pub async fn fetch(&self, request: &FetchRequest) -> FetchResult {
        let start = Instant::now();
        let cfg = self.config.load();

        let Ok(host) = request.url.host_key() else {
            return FetchResult::error(FetchErrorKind::PolicySkip, "url has no host", 0, start.elapsed());
        };

        if let Some(retry_after_ms) = self.budget.lock_retry_after_ms(&host) {
            return FetchResult::HostLocked { retry_after_ms };
        }

        let cached = self.cache.get(&request.url).await.unwrap_or(None);
        let max_age = cfg.max_age_ms_for(cache_kind_for(request.kind));

        if let Some(entry) = &cached {
            let fresh = request.force_cache
                || crate::cache::should_use_cache(
                    request.prefer_cache || cfg.prefer_cache(),
                    max_age,
                    entry.fetched_at,
                    now_ms(),
                );
            if fresh {
                if let Some(html) = &entry.html {
                    debug!(host, url = request.url.as_str(), "fetch: served from cache");
                    return FetchResult::Success {
                        html: html.clone(),
                        meta: meta_from_cache_entry(entry, FetchSource::Cache),
                    };
                }
            }
        }

        if self.cache.is_known_404(&request.url).await.unwrap_or(false) {
            return FetchResult::Skipped {
                reason: "known-404".to_string(),
            };
        }

        // `retry_count` is a maxAttempts override, not a total-sends count: the request
        // is sent once, then retried while attempt < max_retries, for max_retries + 1
        // sends total.
        let max_retries = request.retry_count.max(cfg.retry().max_attempts);
        let max_attempts = max_retries + 1;
        let mut attempt = 0u32;
        let mut last_error: Option<FetchError> = None;

        // Held across every attempt/retry to this host, so total in-flight fetches to a
        // single host never exceeds `perHostConcurrency` regardless of how many worker
        // tasks are pulling from the queue concurrently.
        let _host_slot = self.host_concurrency.acquire(&host).await;

        loop {
            self.global_limiter.acquire(cfg.rate_limit_ms()).await;
            self.throttle.grant(&host);

            let outcome = self
                .attempt_with_redirects(
                    &request.url,
                    cached.as_ref(),
                    Duration::from_millis(cfg.request_timeout_ms()),
                    cfg.headless().fallback_on_connection_reset,
                    cfg.store_error_response_bodies(),
                )
                .await;

            match outcome {
                AttemptOutcome::Success { html, meta } => {
                    self.throttle.record_success(&host);
                    self.budget.record_success(&host);
                    self.store_entry(&request.url, Some(&html), &meta).await;
                    return FetchResult::Success { html, meta };
                }
                AttemptOutcome::NotModified { meta } => {
                    self.throttle.record_success(&host);
                    self.budget.record_success(&host);
                    return FetchResult::NotModified { meta };
                }
                AttemptOutcome::Failure { error } => {
                    if error.kind == FetchErrorKind::Gone {
                        let _ = self.cache.mark_known_404(&request.url).await;
                        return self.finish_error(&request.url, error, attempt + 1, start.elapsed()).await;
                    }

                    // Route through the headless fetcher *before* this attempt counts
                    // against the host's failure budget: a reset/challenge replaced by a
                    // successful render is not held against the host (spec scenario 4).
                    if error.kind.wants_headless_fallback() {
                        if let Some(result) = self.try_headless_fallback(request, &cfg).await {
                            return result;
                        }
                    }

                    if error.kind.counts_toward_host_budget() {
                        self.budget.record_failure(&host);
                    }
                    if error.kind == FetchErrorKind::ServerRetryable && error.http_status == Some(429)
                    {
                        self.throttle
                            .record_rate_limited(&host, error.retry_after.map(|d| d.as_millis() as u64));
                    }

                    let is_last_attempt = attempt + 1 >= max_attempts;
                    if !error.kind.is_retryable() || is_last_attempt {
                        last_error = Some(error);
                        break;
                    }

                    let delay_ms = compute_delay_ms(
                        attempt,
                        error.kind,
                        error.retry_after.map(|d| d.as_millis() as u64),
                        cfg.retry(),
                    );
                    warn!(
                        host,
                        attempt,
                        delay_ms,
                        kind = ?error.kind,
                        "fetch: retrying after backoff"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                    last_error = Some(error);
                }
            }
        }

        let error = last_error.expect("loop only exits via break with an error set");

        if let Some(entry) = cached.filter(|e| e.html.is_some()) {
            info!(
                host,
                url = request.url.as_str(),
                "fetch: network exhausted, serving stale cache"
            );
            return FetchResult::Success {
                html: entry.html.clone().expect("filtered for Some"),
                meta: meta_from_cache_entry(&entry, FetchSource::StaleCache),
            };
        }

        self.finish_error(&request.url, error, attempt + 1, start.elapsed()).await
    }

    /// Persist a captured error body (when `storeErrorResponseBodies` is enabled and the
    /// terminal attempt had one) before converting the error into the caller-facing
    /// `FetchResult`. Error bodies share the same `cache` table as successful fetches
    /// (spec.md §6 names one `cache` table, not a separate error table).
    async fn finish_error(
        &self,
        url: &ImUrl,
        error: FetchError,
        attempts: u32,
        duration: Duration,
    ) -> FetchResult {
        if let Some(body) = &error.body {
            let meta = FetchMeta {
                etag: None,
                last_modified: None,
                http_status: error.http_status.unwrap_or(0),
                source: FetchSource::Network,
                fetch_method: FetchMethod::Http,
                redirect_chain: Vec::new(),
                timing: FetchTiming::default(),
                age_seconds: None,
            };
            self.store_entry(url, Some(body), &meta).await;
        }
        FetchResult::Error(Box::new(super::types::FetchResultError {
            kind: error.kind,
            http_status: error.http_status,
            retryable: error.retryable,
            retry_after_ms: error.retry_after.map(|d| d.as_millis() as u64),
            message: error.message,
            attempts,
            duration,
        }))
    }

    async fn store_entry(&self, url: &ImUrl, html: Option<&str>, meta: &FetchMeta) {
        let entry = CacheEntry {
            url: url.as_str().to_string(),
            html: html.map(str::to_string),
            fetched_at: now_ms(),
            etag: meta.etag.clone(),
            last_modified: meta.last_modified.clone(),
            http_status: meta.http_status,
        };
        if let Err(err) = self.cache.put(entry).await {
            warn!(url = url.as_str(), error = %err, "fetch: failed to persist cache entry");
        }
    }

    async fn try_headless_fallback(
        &self,
        request: &FetchRequest,
        cfg: &crate::config::CrawlConfig,
    ) -> Option<FetchResult> {
        if !cfg.headless().enabled {
            return None;
        }
        let headless = self.headless.as_ref()?;
        let outcome = headless
            .fetch(&request.url, Duration::from_millis(cfg.request_timeout_ms()))
            .await;

        if !outcome.success {
            return None;
        }
        let html = outcome.html?;
        let meta = FetchMeta {
            etag: None,
            last_modified: None,
            http_status: 200,
            source: FetchSource::Network,
            fetch_method: FetchMethod::PuppeteerFallback,
            redirect_chain: Vec::new(),
            timing: FetchTiming {
                total_ms: outcome.render_time_ms,
                ..Default::default()
            },
            age_seconds: None,
        };
        self.store_entry(&request.url, Some(&html), &meta).await;
        Some(FetchResult::Success { html, meta })
    }

    /// Scan a 2xx body against the configured hard/soft failure signatures ( step
    /// 8, §7). Hard-failure signatures win if both match, since "access denied" is terminal
    /// regardless of an accompanying JS-challenge banner.
    fn scan_content_signatures(&self, html: &str) -> Option<FetchErrorKind> {
        let cfg = self.config.load();
        let classifier = cfg.classifier();

        for pattern in &classifier.hard_failure_signatures {
            if let Ok(re) = crate::config::builder::compile_signature(pattern) {
                if re.is_match(html) {
                    return Some(FetchErrorKind::ContentHardFailure);
                }
            }
        }
        for pattern in &classifier.soft_failure_signatures {
            if let Ok(re) = crate::config::builder::compile_signature(pattern) {
                if re.is_match(html) {
                    return Some(FetchErrorKind::ContentSoftFailure);
                }
            }
        }
        None
    }

    /// Execute one logical attempt: the network call plus up to `MAX_REDIRECTS` manual
    /// redirect hops, each re-resolved for an HTTPS upgrade before being followed.
    async fn attempt_with_redirects(
        &self,
        start_url: &ImUrl,
        cached: Option<&CacheEntry>,
        timeout: Duration,
        fallback_on_connection_reset: bool,
        store_error_bodies: bool,
    ) -> AttemptOutcome {
        let mut current = start_url.clone();
        let mut redirect_chain = Vec::new();
        let attempt_start = Instant::now();

        for hop in 0.. {
            if let RedirectDecision::TooManyRedirects = redirect::decide(hop) {
                return AttemptOutcome::Failure {
                    error: FetchError::new(FetchErrorKind::PermanentClient, "too many redirects"),
                };
            }

            let to_send = {
                let cfg = self.config.load();
                if cfg.should_upgrade_to_https(current.host().unwrap_or_default())
                    && current.scheme() != "https"
                {
                    current.with_scheme("https").unwrap_or_else(|_| current.clone())
                } else {
                    current.clone()
                }
            };

            let headers = build_headers(
                cached.and_then(|e| e.etag.as_deref()),
                cached.and_then(|e| e.last_modified.as_deref()),
            );

            let request_start = Instant::now();
            let response = self
                .client
                .get(to_send.as_str())
                .headers(headers)
                .timeout(timeout)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(err) => {
                    return AttemptOutcome::Failure {
                        error: FetchError::new(
                            FetchError::classify_transport(&err, fallback_on_connection_reset),
                            err.to_string(),
                        ),
                    };
                }
            };

            let ttfb_ms = request_start.elapsed().as_millis() as u64;
            let status = response.status().as_u16();

            if response.status().is_redirection() {
                match location_of(&response, &to_send) {
                    Ok(next) => {
                        redirect_chain.push(to_send.as_str().to_string());
                        current = next;
                        continue;
                    }
                    Err(err) => {
                        return AttemptOutcome::Failure {
                            error: FetchError::new(FetchErrorKind::PermanentClient, err.to_string())
                                .with_status(status),
                        };
                    }
                }
            }

            let etag = response
                .headers()
                .get(reqwest::header::ETAG)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let last_modified = response
                .headers()
                .get(reqwest::header::LAST_MODIFIED)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            if status == 304 {
                return AttemptOutcome::NotModified {
                    meta: FetchMeta {
                        etag,
                        last_modified,
                        http_status: status,
                        source: FetchSource::Network,
                        fetch_method: FetchMethod::Http,
                        redirect_chain,
                        timing: FetchTiming {
                            ttfb_ms,
                            total_ms: attempt_start.elapsed().as_millis() as u64,
                            ..Default::default()
                        },
                        age_seconds: None,
                    },
                };
            }

            let retry_after_ms = parse_retry_after_ms(&response);

            if response.status().is_success() {
                let download_start = Instant::now();
                let html = match response.text().await {
                    Ok(body) => body,
                    Err(err) => {
                        return AttemptOutcome::Failure {
                            error: FetchError::new(
                                FetchErrorKind::TransientNetwork,
                                format!("failed to read body: {err}"),
                            ),
                        };
                    }
                };
                let download_ms = download_start.elapsed().as_millis() as u64;
                let total_ms = attempt_start.elapsed().as_millis() as u64;
                let bytes_downloaded = html.len() as u64;
                let transfer_kbps = if download_ms > 0 {
                    (bytes_downloaded as f64 / 1024.0) / (download_ms as f64 / 1000.0)
                } else {
                    0.0
                };

                if let Some(kind) = self.scan_content_signatures(&html) {
                    return AttemptOutcome::Failure {
                        error: FetchError::new(kind, "response body matched a configured content signature")
                            .with_status(status),
                    };
                }

                return AttemptOutcome::Success {
                    html,
                    meta: FetchMeta {
                        etag,
                        last_modified,
                        http_status: status,
                        source: FetchSource::Network,
                        fetch_method: FetchMethod::Http,
                        redirect_chain,
                        timing: FetchTiming {
                            ttfb_ms,
                            download_ms,
                            total_ms,
                            bytes_downloaded,
                            transfer_kbps,
                        },
                        age_seconds: None,
                    },
                };
            }

            let kind = FetchError::classify_status(status);
            let mut error = FetchError::new(kind, format!("unexpected status {status}")).with_status(status);
            if let Some(ra) = retry_after_ms {
                error = error.with_retry_after(Duration::from_millis(ra));
            }
            if store_error_bodies {
                if let Ok(body) = response.text().await {
                    error = error.with_body(body);
                }
            }
            return AttemptOutcome::Failure { error };
        }

        unreachable!("redirect loop only exits via return")
    }
}

fn meta_from_cache_entry(entry: &CacheEntry, source: FetchSource) -> FetchMeta {
    FetchMeta {
        etag: entry.etag.clone(),
        last_modified: entry.last_modified.clone(),
        http_status: entry.http_status,
        source,
        fetch_method: FetchMethod::Http,
        redirect_chain: Vec::new(),
        timing: FetchTiming::default(),
        age_seconds: Some(now_ms().saturating_sub(entry.fetched_at) / 1000),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DurableStore;
    use crate::throttle::budget::BudgetConfig;
    use crate::throttle::ThrottleConfig;
    use dashmap::DashMap;
    use mockito::Server;

    struct NullStore {
        known_404: DashMap<String, u64>,
    }

    #[async_trait::async_trait]
    impl DurableStore for NullStore {
        async fn get_cache_entry(&self, _url: &str) -> anyhow::Result<Option<CacheEntry>> {
            Ok(None)
        }
        async fn put_cache_entry(&self, _entry: &CacheEntry) -> anyhow::Result<()> {
            Ok(())
        }
        async fn get_known_404(&self, url: &str) -> anyhow::Result<Option<u64>> {
            Ok(self.known_404.get(url).map(|v| *v))
        }
        async fn put_known_404(&self, url: &str, fetched_at: u64) -> anyhow::Result<()> {
            self.known_404.insert(url.to_string(), fetched_at);
            Ok(())
        }
    }

    fn pipeline() -> FetchPipeline {
        let client = crate::fetch::http::build_client(Duration::from_secs(5)).unwrap();
        let throttle = Arc::new(ThrottleManager::new(ThrottleConfig::default()));
        let budget = Arc::new(BudgetManager::new(BudgetConfig::default()));
        let store = Arc::new(NullStore {
            known_404: DashMap::new(),
        });
        let cache = Arc::new(ArticleCache::new(store, 100, 86_400_000));
        let config = ConfigHandle::new(
            crate::config::CrawlConfig::builder()
                .start_url("https://example.com")
                .retry(crate::config::RetryConfig {
                    max_attempts: 2,
                    base_delay_ms: 5,
                    max_delay_ms: 20,
                    jitter_ratio: 0.1,
                })
                .build()
                .unwrap(),
        );
        FetchPipeline::new(client, throttle, budget, cache, None, config)
    }

    #[tokio::test]
    async fn successful_fetch_returns_html_and_timing() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/article")
            .with_status(200)
            .with_body("<html>hi</html>")
            .create_async()
            .await;

        let pipeline = pipeline();
        let url = ImUrl::parse(&format!("{}/article", server.url())).unwrap();
        let request = FetchRequest {
            url,
            kind: ItemKind::Article,
            prefer_cache: false,
            force_cache: false,
            retry_count: 1,
            extra_headers: Default::default(),
        };

        let result = pipeline.fetch(&request).await;
        mock.assert_async().await;
        match result {
            FetchResult::Success { html, meta } => {
                assert_eq!(html, "<html>hi</html>");
                assert_eq!(meta.http_status, 200);
                assert_eq!(meta.source, FetchSource::Network);
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn not_found_marks_known_404_and_returns_gone_error() {
        let mut server = Server::new_async().await;
        server.mock("GET", "/missing").with_status(404).create_async().await;

        let pipeline = pipeline();
        let url = ImUrl::parse(&format!("{}/missing", server.url())).unwrap();
        let request = FetchRequest {
            url: url.clone(),
            kind: ItemKind::Article,
            prefer_cache: false,
            force_cache: false,
            retry_count: 1,
            extra_headers: Default::default(),
        };

        let result = pipeline.fetch(&request).await;
        assert!(matches!(result, FetchResult::Error(ref e) if e.kind == FetchErrorKind::Gone));
        assert!(pipeline.cache.is_known_404(&url).await.unwrap());
    }

    #[tokio::test]
    async fn server_error_retries_then_fails() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/flaky")
            .with_status(503)
            .expect_at_least(2)
            .create_async()
            .await;

        let pipeline = pipeline();
        let url = ImUrl::parse(&format!("{}/flaky", server.url())).unwrap();
        let request = FetchRequest {
            url,
            kind: ItemKind::Article,
            prefer_cache: false,
            force_cache: false,
            retry_count: 2,
            extra_headers: Default::default(),
        };

        let result = pipeline.fetch(&request).await;
        assert!(matches!(
            result,
            FetchResult::Error(ref e) if e.kind == FetchErrorKind::ServerRetryable
        ));
    }
}
