//! Top-level engine: owns every collaborator and runs the worker-pool
//! concurrency model. `Engine::new` wires config -> store -> throttle/budget/cache/
//! headless/classifier/queue/pipeline/events; `Engine::run` drives a crawl to
//! completion, to abort, or to a fatal stop.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use scraper::{Html, Selector};
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::{ArticleCache, DurableStore, MemoFreshnessGate};
use crate::classify::{ClassifierCascade, Label};
use crate::config::methods::CacheKind;
use crate::config::{ConfigHandle, CrawlConfig};
use crate::events::{CrawlPhase, EventBus, EventBusConfig, EventType};
use crate::fetch::{self, FetchPipeline, FetchRequest, FetchResult, HeadlessFetcher};
use crate::headless::HeadlessPool;
use crate::queue::{
    EnqueueOutcome, HostGate, ItemKind, ItemMeta, PullOutcome, QueueManager, QueueManagerConfig,
};
use crate::store::SqliteStore;
use crate::throttle::budget::BudgetConfig;
use crate::throttle::{BudgetManager, GlobalLimiter, HostConcurrency, ThrottleConfig, ThrottleManager};
use crate::url::ImUrl;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Final tally returned by `Engine::run`; also what gets persisted into `checkpoint.stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlStats {
    pub fetched: u64,
    pub articles: u64,
    pub errors: u64,
    pub skipped: u64,
    pub queued: u64,
}

/// Bridges `ThrottleManager` + `BudgetManager` into the single `HostGate` the queue
/// consults on `pull_next` (neither manager implements the trait directly since each
/// only owns half of the gating decision).
struct CombinedHostGate<'a> {
    throttle: &'a ThrottleManager,
    budget: &'a BudgetManager,
}

impl HostGate for CombinedHostGate<'_> {
    fn deferred_until(&self, host: &str) -> Option<u64> {
        self.throttle.deferred_until(host)
    }

    fn is_rate_limited(&self, host: &str) -> bool {
        self.throttle.is_rate_limited(host)
    }

    fn host_lock_retry_after_ms(&self, host: &str) -> Option<u64> {
        self.budget.lock_retry_after_ms(host)
    }
}

static ANCHOR_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("static selector is valid"));

/// Extract anchor targets from a fetched hub/nav document, resolved against `base` and
/// normalized, for re-entry into the discovery queue. Parses the raw HTML string with
/// `scraper`, the same static-DOM idiom `classify::stage2` uses for content signals —
/// deliberately not a common chromiumoxide-page link extractor, which requires a
/// live browser tab and has no raw-HTML-string entry point.
fn extract_links(base: &ImUrl, html: &str) -> Vec<ImUrl> {
    let document = Html::parse_document(html);
    document
        .select(&ANCHOR_SELECTOR)
        .filter_map(|el| el.value().attr("href"))
        .filter_map(|href| base.join(href).ok())
        .collect()
}

fn crawl_type_str(config: &CrawlConfig) -> String {
    format!("{:?}", config.crawl_type()).to_lowercase()
}

/// Derive the in-memory cache LRU capacity from `NEWSREAP_MEMORY_CAP_MB`, assuming an
/// average cached entry is roughly 50 KB of HTML. Falls back to a fixed 10,000-entry
/// default when the variable is unset or invalid, same as `browser_setup`'s handling of
/// `CHROMIUM_PATH` not being set.
fn memo_capacity_from_env() -> usize {
    const DEFAULT_CAPACITY: usize = 10_000;
    const AVG_ENTRY_KB: usize = 50;

    std::env::var("NEWSREAP_MEMORY_CAP_MB")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .map(|mb| (mb * 1024 / AVG_ENTRY_KB).clamp(100, 1_000_000))
        .unwrap_or(DEFAULT_CAPACITY)
}

/// Owns every fetch-and-schedule collaborator and the worker pool that drives them.
pub struct Engine {
    job_id: String,
    config: ConfigHandle,
    queue: Arc<QueueManager>,
    throttle: Arc<ThrottleManager>,
    budget: Arc<BudgetManager>,
    cache: Arc<ArticleCache>,
    pipeline: Arc<FetchPipeline>,
    classifier: Arc<ClassifierCascade>,
    events: Arc<EventBus>,
    store: Arc<SqliteStore>,
    headless: Option<Arc<HeadlessPool>>,
    abort: AtomicBool,
    hard_stop: AtomicBool,
    downloaded: AtomicU64,
    in_flight: AtomicUsize,
    pending_requeues: AtomicUsize,
    last_activity_ms: AtomicU64,
    stopped_emitted: AtomicBool,
    stats: Mutex<CrawlStats>,
}

impl Engine {
    /// Construct every collaborator, loading persisted host state/budgets from the
    /// configured store. Does not enqueue the start URL or spawn workers; call `run`.
    pub async fn new(config: CrawlConfig) -> Result<Arc<Self>> {
        let job_id = uuid::Uuid::new_v4().to_string();

        tokio::fs::create_dir_all(config.data_dir())
            .await
            .with_context(|| format!("failed to create data dir {:?}", config.data_dir()))?;

        let db_path = if config.db_path().as_os_str().is_empty() {
            config.data_dir().join("newsreap.sqlite3")
        } else {
            config.db_path().to_path_buf()
        };
        let store = Arc::new(SqliteStore::open(&db_path).await?);

        let throttle = Arc::new(ThrottleManager::new(ThrottleConfig::default()));
        let host_budget_cfg = config.host_budget().clone();
        let budget = Arc::new(BudgetManager::new(BudgetConfig {
            max_errors: host_budget_cfg.max_errors,
            window_ms: host_budget_cfg.window_ms,
            lockout_ms: host_budget_cfg.lockout_ms,
        }));
        if let Err(err) = store.load_host_states(&throttle).await {
            warn!(%err, "failed to restore persisted host throttle state");
        }
        if let Err(err) = store.load_host_budgets(&budget).await {
            warn!(%err, "failed to restore persisted host budget state");
        }

        let cache = Arc::new(ArticleCache::new(
            store.clone() as Arc<dyn DurableStore>,
            memo_capacity_from_env(),
            24 * 60 * 60 * 1000,
        ));

        let headless = if config.headless().enabled {
            let pool = HeadlessPool::new(config.headless().clone());
            pool.start().await.context("failed to start headless pool")?;
            Some(pool)
        } else {
            None
        };
        let headless_dyn: Option<Arc<dyn HeadlessFetcher>> = headless
            .clone()
            .map(|pool| pool as Arc<dyn HeadlessFetcher>);

        let classifier = Arc::new(ClassifierCascade::new(
            config.classifier().clone(),
            headless_dyn.clone(),
        ));

        let events = Arc::new(EventBus::new(EventBusConfig::default()));
        events.spawn_batchers();

        let config = config.with_event_bus(events.clone());
        let config_handle = ConfigHandle::new(config.clone());

        let client = fetch::http::build_client(Duration::from_millis(config.request_timeout_ms()))
            .context("failed to build HTTP client")?;

        let queue = Arc::new(QueueManager::new(
            config.priority().clone(),
            QueueManagerConfig {
                max_queue: config.max_queue(),
                max_depth: config.max_depth(),
                total_prioritization_focus_tokens: Vec::new(),
                discovery_acquisition_ratio: config.discovery_acquisition_ratio(),
                queue_burst_cap: config.queue_burst_cap(),
            },
        ));

        let pipeline = Arc::new(FetchPipeline::with_global_limiter(
            client,
            throttle.clone(),
            budget.clone(),
            cache.clone(),
            headless_dyn,
            config_handle.clone(),
            Arc::new(GlobalLimiter::new()),
            Arc::new(HostConcurrency::new(
                config.host_budget().per_host_concurrency as usize,
            )),
        ));

        Ok(Arc::new(Self {
            job_id,
            config: config_handle,
            queue,
            throttle,
            budget,
            cache,
            pipeline,
            classifier,
            events,
            store,
            headless,
            abort: AtomicBool::new(false),
            hard_stop: AtomicBool::new(false),
            downloaded: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            pending_requeues: AtomicUsize::new(0),
            last_activity_ms: AtomicU64::new(now_ms()),
            stopped_emitted: AtomicBool::new(false),
            stats: Mutex::new(CrawlStats::default()),
        }))
    }

    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    #[must_use]
    pub fn events(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    /// Request graceful shutdown: stop pulling new work, let in-flight fetches finish.
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
        self.queue.wake.notify_waiters();
    }

    /// Request immediate shutdown: abort worker tasks without waiting for in-flight work.
    pub fn request_hard_stop(&self) {
        self.hard_stop.store(true, Ordering::SeqCst);
        self.queue.wake.notify_waiters();
    }

    #[must_use]
    pub fn stats(&self) -> CrawlStats {
        self.stats.lock().clone()
    }

    #[must_use]
    pub fn shutdown_grace_ms(&self) -> u64 {
        self.config.load().shutdown_grace_ms()
    }

    /// Run the crawl to completion: enqueue the start URL, spawn `concurrency` workers,
    /// watch for stalls, and persist a checkpoint on exit.
    pub async fn run(self: &Arc<Self>) -> Result<CrawlStats> {
        let cfg = self.config.load();
        let crawl_type = crawl_type_str(&cfg);

        self.events.report_progress(
            &self.job_id,
            &crawl_type,
            serde_json::json!({"phase": "starting", "startUrl": cfg.start_url()}),
        );
        self.events
            .phase_changed(&self.job_id, &crawl_type, CrawlPhase::Initializing);

        let start_depth = 0;
        match self.queue.enqueue(
            cfg.start_url(),
            start_depth,
            ItemKind::Default,
            ItemMeta::default(),
            Some(-1_000_000_000),
        ) {
            EnqueueOutcome::Enqueued { .. } => {
                self.stats.lock().queued += 1;
            }
            EnqueueOutcome::Rejected { reason } => {
                return Err(anyhow::anyhow!("start URL rejected: {:?}", reason));
            }
        }

        self.events
            .phase_changed(&self.job_id, &crawl_type, CrawlPhase::Crawling);

        let concurrency = cfg.concurrency().max(1);
        let mut workers = Vec::with_capacity(concurrency);
        for worker_id in 0..concurrency {
            let engine = Arc::clone(self);
            workers.push(tokio::spawn(async move {
                engine.worker_loop(worker_id).await;
            }));
        }

        let watchdog = {
            let engine = Arc::clone(self);
            tokio::spawn(async move { engine.stall_watchdog().await })
        };

        for handle in workers {
            if let Err(err) = handle.await {
                warn!(%err, "worker task panicked");
            }
        }
        watchdog.abort();

        self.save_checkpoint().await;

        let stats = self.stats();
        let phase = if self.hard_stop.load(Ordering::SeqCst) {
            CrawlPhase::Stopped
        } else {
            CrawlPhase::Completed
        };
        self.events.phase_changed(&self.job_id, &crawl_type, phase);
        self.emit_terminal_event(&crawl_type, &stats);

        Ok(stats)
    }

    fn emit_terminal_event(&self, crawl_type: &str, stats: &CrawlStats) {
        let event_type = if self.abort.load(Ordering::SeqCst) || self.hard_stop.load(Ordering::SeqCst) {
            if self.stopped_emitted.swap(true, Ordering::SeqCst) {
                return;
            }
            EventType::CrawlStopped
        } else {
            EventType::CrawlCompleted
        };
        self.events.record_url_event(
            event_type,
            &self.job_id,
            crawl_type,
            serde_json::to_value(stats).unwrap_or(serde_json::Value::Null),
        );
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, job_id = %self.job_id, "worker started");
        loop {
            if self.hard_stop.load(Ordering::SeqCst) {
                break;
            }

            let cfg = self.config.load();
            if let Some(max) = cfg.max_downloads() {
                if self.downloaded.load(Ordering::SeqCst) >= max as u64 {
                    self.request_abort();
                }
            }
            if self.abort.load(Ordering::SeqCst) {
                break;
            }

            let gate = CombinedHostGate {
                throttle: &self.throttle,
                budget: &self.budget,
            };
            let cache_gate = MemoFreshnessGate {
                cache: &self.cache,
                max_age_ms: cfg.max_age_ms_for(CacheKind::Other),
            };

            match self.queue.pull_next(&gate, &cache_gate) {
                PullOutcome::Item(item) => {
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    self.last_activity_ms.store(now_ms(), Ordering::SeqCst);
                    self.process_item(item).await;
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    self.queue.wake.notify_waiters();
                }
                PullOutcome::HostLocked { item, retry_after_ms } => {
                    self.events.record_url_event(
                        EventType::RateLimited,
                        &self.job_id,
                        &crawl_type_str(&cfg),
                        serde_json::json!({"url": item.url.as_str(), "retryAfterMs": retry_after_ms}),
                    );
                    self.schedule_requeue(item, retry_after_ms);
                }
                PullOutcome::Empty { wake_at } => {
                    if self.queue.size() == 0
                        && self.in_flight.load(Ordering::SeqCst) == 0
                        && self.pending_requeues.load(Ordering::SeqCst) == 0
                    {
                        break;
                    }
                    let now = now_ms();
                    let wait_ms = wake_at
                        .map(|at| at.saturating_sub(now))
                        .unwrap_or(250)
                        .clamp(10, 250);
                    tokio::select! {
                        () = self.queue.wake.notified() => {}
                        () = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
                    }
                }
            }
        }
        debug!(worker_id, job_id = %self.job_id, "worker stopped");
    }

    /// Deliver a pulled item to the fetch pipeline, classify the result, and enqueue any
    /// links discovered on hub/nav pages. Also used to redeliver a host-locked item after
    /// its lockout expires (bypassing the queue's dedup set, since this is a continuation
    /// of a unit of work already dequeued once, not a fresh enqueue — see `schedule_requeue`).
    async fn process_item(&self, item: crate::queue::QueueItem) {
        let cfg = self.config.load();
        let crawl_type = crawl_type_str(&cfg);
        let url = item.url.clone();

        let request = FetchRequest {
            url: url.clone(),
            kind: item.kind,
            prefer_cache: item.force_cache || cfg.prefer_cache(),
            force_cache: item.force_cache,
            retry_count: cfg.retry().max_attempts,
            extra_headers: Default::default(),
        };

        let result = self.pipeline.fetch(&request).await;
        self.last_activity_ms.store(now_ms(), Ordering::SeqCst);

        match result {
            FetchResult::Success { html, meta } => {
                self.downloaded.fetch_add(1, Ordering::SeqCst);
                self.stats.lock().fetched += 1;
                self.events.record_url_event(
                    EventType::UrlVisited,
                    &self.job_id,
                    &crawl_type,
                    serde_json::json!({
                        "url": url.as_str(),
                        "status": meta.http_status,
                        "fetchMethod": format!("{:?}", meta.fetch_method),
                    }),
                );

                let high_value = item.depth == 0;
                let classification = self.classifier.classify(&url, Some(&html), high_value).await;
                match classification.label {
                    Label::Article => {
                        self.stats.lock().articles += 1;
                    }
                    Label::Hub | Label::Nav if item.depth < cfg.max_depth() => {
                        self.discover_links(&url, &html, item.depth, classification.label, &crawl_type);
                    }
                    _ => {}
                }
            }
            FetchResult::NotModified { .. } => {
                self.stats.lock().fetched += 1;
            }
            FetchResult::Skipped { reason } => {
                self.stats.lock().skipped += 1;
                self.events.record_url_event(
                    EventType::UrlSkipped,
                    &self.job_id,
                    &crawl_type,
                    serde_json::json!({"url": url.as_str(), "reason": reason}),
                );
            }
            FetchResult::HostLocked { retry_after_ms } => {
                self.events.record_url_event(
                    EventType::RateLimited,
                    &self.job_id,
                    &crawl_type,
                    serde_json::json!({"url": url.as_str(), "retryAfterMs": retry_after_ms}),
                );
                self.schedule_requeue(item, retry_after_ms);
            }
            FetchResult::Error(err) => {
                self.stats.lock().errors += 1;
                self.events.record_url_event(
                    EventType::UrlError,
                    &self.job_id,
                    &crawl_type,
                    serde_json::json!({
                        "url": url.as_str(),
                        "kind": format!("{:?}", err.kind),
                        "httpStatus": err.http_status,
                        "attempts": err.attempts,
                        "message": err.message,
                    }),
                );
            }
        }
    }

    fn discover_links(&self, base: &ImUrl, html: &str, depth: u32, label: Label, crawl_type: &str) {
        let kind = if label == Label::Hub {
            ItemKind::HubSeed
        } else {
            ItemKind::Nav
        };
        for link in extract_links(base, html) {
            let meta = ItemMeta {
                discovery_method: Some("link-extraction".to_string()),
                ..Default::default()
            };
            match self.queue.enqueue(link.as_str(), depth + 1, kind, meta, None) {
                EnqueueOutcome::Enqueued { .. } => {
                    self.stats.lock().queued += 1;
                    self.events.record_url_event(
                        EventType::UrlQueued,
                        &self.job_id,
                        crawl_type,
                        serde_json::json!({"url": link.as_str(), "kind": kind.as_config_key()}),
                    );
                }
                EnqueueOutcome::Rejected { .. } => {}
            }
        }
    }

    /// Redeliver a host-locked item once its lockout window has passed. Goes straight
    /// back through `process_item` rather than `QueueManager::enqueue`: the item was
    /// already dequeued once (the dedup entry it left behind would reject a plain
    /// re-enqueue as a duplicate), so this is a continuation of the original pull, not
    /// a new queue item.
    fn schedule_requeue(self: &Arc<Self>, item: crate::queue::QueueItem, retry_after_ms: u64) {
        self.pending_requeues.fetch_add(1, Ordering::SeqCst);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(retry_after_ms.max(1))).await;
            if !engine.hard_stop.load(Ordering::SeqCst) && !engine.abort.load(Ordering::SeqCst) {
                engine.in_flight.fetch_add(1, Ordering::SeqCst);
                engine.process_item(item).await;
                engine.in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            engine.pending_requeues.fetch_sub(1, Ordering::SeqCst);
            engine.queue.wake.notify_waiters();
        });
    }

    async fn stall_watchdog(self: Arc<Self>) {
        loop {
            let cfg = self.config.load();
            tokio::time::sleep(Duration::from_millis(cfg.stall_threshold_ms().max(1000))).await;
            if self.hard_stop.load(Ordering::SeqCst) {
                break;
            }
            let idle_for = now_ms().saturating_sub(self.last_activity_ms.load(Ordering::SeqCst));
            if idle_for >= cfg.stall_threshold_ms()
                && (self.queue.size() > 0 || self.in_flight.load(Ordering::SeqCst) > 0)
            {
                warn!(job_id = %self.job_id, idle_for, "crawl stalled: no progress within stallThreshold");
                self.events.record_url_event(
                    EventType::Stalled,
                    &self.job_id,
                    &crawl_type_str(&cfg),
                    serde_json::json!({"idleForMs": idle_for}),
                );
            }
        }
    }

    async fn save_checkpoint(&self) {
        let queue_snapshot = serde_json::json!({"remaining": self.queue.size()});
        let stats = serde_json::to_value(self.stats()).unwrap_or(serde_json::Value::Null);
        if let Err(err) = self
            .store
            .save_checkpoint(&self.job_id, &queue_snapshot, &serde_json::Value::Null, &stats)
            .await
        {
            warn!(%err, "failed to persist checkpoint");
        } else {
            self.events.record_url_event(
                EventType::CheckpointSaved,
                &self.job_id,
                &crawl_type_str(&self.config.load()),
                serde_json::Value::Null,
            );
        }
        if let Err(err) = self.store.save_host_states(&self.throttle).await {
            warn!(%err, "failed to persist host throttle state");
        }
        if let Err(err) = self.store.save_host_budgets(&self.budget).await {
            warn!(%err, "failed to persist host budget state");
        }
    }

    /// Close the headless pool and durable store. Call after `run` returns.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(pool) = &self.headless {
            pool.shutdown().await.context("failed to shut down headless pool")?;
        }
        self.store.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crawl_type_str_is_lowercase() {
        let config = CrawlConfig::builder()
            .start_url("example.com")
            .build()
            .unwrap();
        assert_eq!(crawl_type_str(&config), "basic");
    }

    #[test]
    fn extract_links_resolves_relative_hrefs_against_base() {
        let base = ImUrl::parse_normalized("https://news.example.com/world/").unwrap();
        let html = r#"<html><body>
            <a href="/world/story-one">One</a>
            <a href="story-two">Two</a>
            <a href="https://other.example.com/x">Other</a>
            <a>no href</a>
            </body></html>"#;
        let links = extract_links(&base, html);
        let strs: Vec<_> = links.iter().map(ImUrl::as_str).collect();
        assert!(strs.iter().any(|s| s.contains("world/story-one")));
        assert!(strs.iter().any(|s| s.contains("story-two")));
        assert!(strs.iter().any(|s| s.contains("other.example.com")));
        assert_eq!(links.len(), 3);
    }
}
