//! Cross-module end-to-end scenarios from spec §8: a mock origin server driving
//! `FetchPipeline` together with `ThrottleManager`, `BudgetManager`, `ArticleCache` and
//! (for scenario 4) a fake `HeadlessFetcher`, exercised the way `engine.rs` wires them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use mockito::Server;

use newsreap::cache::{ArticleCache, CacheEntry, DurableStore};
use newsreap::config::{
    ClassifierConfig, ConfigHandle, CrawlConfig, HeadlessConfig, HostBudgetConfig, RetryConfig,
};
use newsreap::errors::FetchErrorKind;
use newsreap::fetch::{FetchMethod, FetchPipeline, FetchRequest, FetchResult, FetchSource, HeadlessFetchOutcome, HeadlessFetcher};
use newsreap::queue::ItemKind;
use newsreap::throttle::budget::BudgetConfig;
use newsreap::throttle::{BudgetManager, ThrottleConfig, ThrottleManager};
use newsreap::ImUrl;

struct InMemoryStore {
    known_404: DashMap<String, u64>,
}

impl InMemoryStore {
    fn new() -> Self {
        Self { known_404: DashMap::new() }
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
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

struct Harness {
    pipeline: FetchPipeline,
    throttle: Arc<ThrottleManager>,
    budget: Arc<BudgetManager>,
}

fn build_harness(config: CrawlConfig) -> Harness {
    let client = newsreap::fetch::http::build_client(Duration::from_secs(5)).unwrap();
    let throttle = Arc::new(ThrottleManager::new(ThrottleConfig::default()));
    let budget = Arc::new(BudgetManager::new(BudgetConfig {
        max_errors: config.host_budget().max_errors,
        window_ms: config.host_budget().window_ms,
        lockout_ms: config.host_budget().lockout_ms,
    }));
    let cache = Arc::new(ArticleCache::new(Arc::new(InMemoryStore::new()), 100, 86_400_000));
    let handle = ConfigHandle::new(config);
    let pipeline = FetchPipeline::new(client, throttle.clone(), budget.clone(), cache, None, handle);
    Harness { pipeline, throttle, budget }
}

fn build_harness_with_headless(config: CrawlConfig, headless: Arc<dyn HeadlessFetcher>) -> Harness {
    let client = newsreap::fetch::http::build_client(Duration::from_secs(5)).unwrap();
    let throttle = Arc::new(ThrottleManager::new(ThrottleConfig::default()));
    let budget = Arc::new(BudgetManager::new(BudgetConfig {
        max_errors: config.host_budget().max_errors,
        window_ms: config.host_budget().window_ms,
        lockout_ms: config.host_budget().lockout_ms,
    }));
    let cache = Arc::new(ArticleCache::new(Arc::new(InMemoryStore::new()), 100, 86_400_000));
    let handle = ConfigHandle::new(config);
    let pipeline = FetchPipeline::new(client, throttle.clone(), budget.clone(), cache, Some(headless), handle);
    Harness { pipeline, throttle, budget }
}

/// `retry_count` mirrors how `engine.rs` populates it from `cfg.retry().max_attempts` —
/// `FetchPipeline::fetch` takes `max(request.retry_count, cfg.retry().max_attempts) + 1` total
/// sends, so it must track whatever `RetryConfig` a given harness was built with to mean what
/// it says.
fn article_request(url: &str, max_attempts: u32) -> FetchRequest {
    FetchRequest {
        url: ImUrl::parse(url).unwrap(),
        kind: ItemKind::Article,
        prefer_cache: false,
        force_cache: false,
        retry_count: max_attempts,
        extra_headers: Default::default(),
    }
}

const ARTICLE_HTML: &str = r#"<html><head>
<script type="application/ld+json">{"@type": "NewsArticle"}</script>
</head><body><article>
<p>First paragraph of a real news story about the economy and jobs and growth.</p>
<p>Second paragraph with substantially more reporting detail, quotes, and context for readers.</p>
<p>Third paragraph continuing the narrative with additional sourcing and analysis throughout.</p>
</article></body></html>"#;

/// Scenario 1 (spec §8): happy-path fetch, classified as an article with high confidence,
/// cache entry written for the conditional-request follow-up in scenario 2.
#[tokio::test]
async fn scenario1_happy_path_fetch_and_classify() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/world/2024/jan/15/story-alpha")
        .with_status(200)
        .with_header("etag", "\"abc123\"")
        .with_body(ARTICLE_HTML)
        .create_async()
        .await;

    let config = CrawlConfig::builder().start_url(server.url()).build().unwrap();
    let harness = build_harness(config);

    let url = format!("{}/world/2024/jan/15/story-alpha", server.url());
    let result = harness.pipeline.fetch(&article_request(&url, 3)).await;
    mock.assert_async().await;

    let FetchResult::Success { html, meta } = result else {
        panic!("expected success, got {result:?}");
    };
    assert_eq!(meta.http_status, 200);
    assert_eq!(meta.source, FetchSource::Network);
    assert_eq!(meta.etag.as_deref(), Some("\"abc123\""));

    let classifier = newsreap::classify::ClassifierCascade::new(ClassifierConfig::default(), None);
    let article_url = ImUrl::parse(&url).unwrap();
    let classification = classifier.classify(&article_url, Some(&html), false).await;
    assert_eq!(classification.label, newsreap::classify::Label::Article);
    assert!(classification.confidence >= 0.7, "confidence {} too low", classification.confidence);
}

/// Scenario 2 (spec §8): a refresh re-fetch carries `If-None-Match` from the cached etag and
/// the origin's 304 is surfaced as `NotModified` without a new cache write.
#[tokio::test]
async fn scenario2_conditional_304_reuses_cached_etag() {
    let mut server = Server::new_async().await;
    let first = server
        .mock("GET", "/refresh-me")
        .with_status(200)
        .with_header("etag", "\"v1\"")
        .with_body(ARTICLE_HTML)
        .create_async()
        .await;
    let second = server
        .mock("GET", "/refresh-me")
        .match_header("if-none-match", "\"v1\"")
        .with_status(304)
        .create_async()
        .await;

    let config = CrawlConfig::builder().start_url(server.url()).build().unwrap();
    let harness = build_harness(config);
    let url = format!("{}/refresh-me", server.url());

    let first_result = harness.pipeline.fetch(&article_request(&url, 3)).await;
    assert!(matches!(first_result, FetchResult::Success { .. }));
    first.assert_async().await;

    let mut refresh_request = article_request(&url, 3);
    refresh_request.kind = ItemKind::Refresh;
    let refresh_result = harness.pipeline.fetch(&refresh_request).await;
    second.assert_async().await;

    assert!(matches!(refresh_result, FetchResult::NotModified { .. }));
}

/// Scenario 3 (spec §8): a 429 with `Retry-After: 5` drops rpm to <= 7 (25% of 30, floored)
/// and sets a backoff of at least 5s; a second request to the same host observes the host as
/// still rate-limited and sees `next_request_at` pushed out.
#[tokio::test]
async fn scenario3_429_with_retry_after_throttles_host() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/hot")
        .with_status(429)
        .with_header("retry-after", "5")
        .create_async()
        .await;

    let config = CrawlConfig::builder()
        .start_url(server.url())
        .retry(RetryConfig {
            max_attempts: 1,
            base_delay_ms: 5,
            max_delay_ms: 20,
            jitter_ratio: 0.0,
        })
        .build()
        .unwrap();
    let harness = build_harness(config);
    let url = format!("{}/hot", server.url());
    let host = ImUrl::parse(&url).unwrap().host_key().unwrap();

    let result = harness.pipeline.fetch(&article_request(&url, 1)).await;
    assert!(matches!(
        result,
        FetchResult::Error(e) if e.kind == FetchErrorKind::ServerRetryable && e.http_status == Some(429)
    ));

    let state = harness.throttle.snapshot(&host).expect("host state recorded");
    assert!(state.rpm <= 7, "rpm {} should drop to <= 25% of 30", state.rpm);
    assert_eq!(state.err_429_streak, 1);
    assert!(harness.throttle.is_rate_limited(&host));
    assert!(harness.throttle.deferred_until(&host).is_some());
}

/// Scenario 4 (spec §8): a soft-failure body signature (anti-bot challenge) routes through
/// headless fallback rather than an ordinary retry, and a successful render is returned
/// without the replaced attempt counting against the host's failure budget.
#[tokio::test]
async fn scenario4_soft_failure_routes_through_headless_and_spares_budget() {
    struct FakeHeadless;
    #[async_trait]
    impl HeadlessFetcher for FakeHeadless {
        async fn fetch(&self, _url: &ImUrl, _timeout: Duration) -> HeadlessFetchOutcome {
            HeadlessFetchOutcome {
                success: true,
                html: Some("<html><body>rendered article body</body></html>".to_string()),
                error: None,
                render_time_ms: 42,
            }
        }
    }

    let mut server = Server::new_async().await;
    server
        .mock("GET", "/challenge")
        .with_status(200)
        .with_body("<html><body>Checking your browser before accessing this site.</body></html>")
        .create_async()
        .await;

    let config = CrawlConfig::builder()
        .start_url(server.url())
        .headless(HeadlessConfig {
            enabled: true,
            ..HeadlessConfig::default()
        })
        .build()
        .unwrap();
    let harness = build_harness_with_headless(config, Arc::new(FakeHeadless));
    let url = format!("{}/challenge", server.url());
    let host = ImUrl::parse(&url).unwrap().host_key().unwrap();

    let result = harness.pipeline.fetch(&article_request(&url, 3)).await;
    let FetchResult::Success { html, meta } = result else {
        panic!("expected headless fallback success, got {result:?}");
    };
    assert_eq!(meta.fetch_method, FetchMethod::PuppeteerFallback);
    assert!(html.contains("rendered article body"));
    assert_eq!(
        harness.budget.failure_count(&host),
        0,
        "attempt replaced by a successful headless render must not count toward the budget"
    );
}

/// Scenario 5 (spec §8): three consecutive 500s trip the host's failure budget; the next
/// fetch to the same host is returned as `host-locked` before any request is issued.
#[tokio::test]
async fn scenario5_host_budget_exhaustion_locks_out_host() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/flaky")
        .with_status(500)
        .expect(3)
        .create_async()
        .await;

    let config = CrawlConfig::builder()
        .start_url(server.url())
        .retry(RetryConfig {
            max_attempts: 1,
            base_delay_ms: 1,
            max_delay_ms: 5,
            jitter_ratio: 0.0,
        })
        .host_budget(HostBudgetConfig {
            max_errors: 3,
            window_ms: 60_000,
            lockout_ms: 30_000,
            per_host_concurrency: 1,
        })
        .build()
        .unwrap();
    let harness = build_harness(config);
    let url = format!("{}/flaky", server.url());
    let host = ImUrl::parse(&url).unwrap().host_key().unwrap();

    for i in 0..3 {
        let result = harness.pipeline.fetch(&article_request(&url, 1)).await;
        assert!(
            matches!(result, FetchResult::Error(e) if e.kind == FetchErrorKind::ServerRetryable),
            "attempt {i} should be a plain server error before the budget trips"
        );
    }
    mock.assert_async().await;

    assert_eq!(harness.budget.failure_count(&host), 3);
    let retry_after = harness
        .budget
        .lock_retry_after_ms(&host)
        .expect("host should be locked after reaching max_errors");
    assert!(retry_after > 0 && retry_after <= 30_000);

    // The pipeline itself checks the budget before issuing any request.
    let locked_result = harness.pipeline.fetch(&article_request(&url, 1)).await;
    assert!(matches!(locked_result, FetchResult::HostLocked { .. }));
}

/// Boundary behaviour (spec §8): a chain of exactly `MAX_REDIRECTS` (5) redirects is
/// still accepted — the request landing on the final resource is the 6th send overall.
#[tokio::test]
async fn redirect_chain_of_five_requests_succeeds() {
    let mut server = Server::new_async().await;
    let base = server.url();

    let mut mocks = Vec::new();
    for hop in 0..5u32 {
        let from = format!("/hop{hop}");
        let to = format!("{base}/hop{}", hop + 1);
        mocks.push(
            server
                .mock("GET", from.as_str())
                .with_status(302)
                .with_header("location", &to)
                .create_async()
                .await,
        );
    }
    let final_mock = server
        .mock("GET", "/hop5")
        .with_status(200)
        .with_body("landed")
        .create_async()
        .await;

    let config = CrawlConfig::builder().start_url(server.url()).build().unwrap();
    let harness = build_harness(config);
    let url = format!("{base}/hop0");
    let result = harness.pipeline.fetch(&article_request(&url, 3)).await;
    for mock in &mocks {
        mock.assert_async().await;
    }
    final_mock.assert_async().await;
    assert!(matches!(result, FetchResult::Success { .. }));
}

#[tokio::test]
async fn redirect_chain_of_six_hops_is_cut_off() {
    let mut server = Server::new_async().await;
    let base = server.url();

    let mut mocks = Vec::new();
    for hop in 0..6u32 {
        let from = format!("/loop{hop}");
        let to = format!("{base}/loop{}", hop + 1);
        mocks.push(
            server
                .mock("GET", from.as_str())
                .with_status(302)
                .with_header("location", &to)
                .create_async()
                .await,
        );
    }

    let config = CrawlConfig::builder().start_url(server.url()).build().unwrap();
    let harness = build_harness(config);
    let url = format!("{base}/loop0");
    let result = harness.pipeline.fetch(&article_request(&url, 3)).await;
    assert!(matches!(
        result,
        FetchResult::Error(e) if e.kind == FetchErrorKind::PermanentClient
    ));
}
