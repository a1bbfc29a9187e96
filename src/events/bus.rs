//! `EventBus`: the telemetry bridge. Turns engine events into a bounded,
//! batched, replayable broadcast stream. Grounded on a common
//! `crawl_events/bus/{core,publishing}.rs` broadcast-channel-plus-metrics shape, simplified to
//! the batching contracts this system actually calls for (progress coalescing, url-event
//! batching, bounded history replay) rather than a common backpressure-mode knob, which
//! this event volume doesn't need.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::types::{CrawlPhase, EventDraft, EventEnvelope, EventType, Severity, SCHEMA_VERSION};

#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Broadcast channel capacity; a slow/absent subscriber causes it to lag, not block.
    pub channel_capacity: usize,
    /// Bounded history ring kept for late subscribers.
    pub history_capacity: usize,
    /// `progress` coalescing interval.
    pub progress_batch_interval_ms: u64,
    /// Max url-level events per `crawl:url:batch`.
    pub url_batch_max_size: usize,
    /// Max wait before flushing a partial url-event batch.
    pub url_batch_max_interval_ms: u64,
    /// When true, url-level events are published individually instead of batched.
    pub per_url_broadcast: bool,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            history_capacity: 200,
            progress_batch_interval_ms: 500,
            url_batch_max_size: 50,
            url_batch_max_interval_ms: 200,
            per_url_broadcast: false,
        }
    }
}

struct PendingUrlBatch {
    items: Vec<Value>,
    opened_at: std::time::Instant,
}

struct Inner {
    sender: broadcast::Sender<EventEnvelope>,
    history: Mutex<VecDeque<EventEnvelope>>,
    next_id: AtomicU64,
    config: EventBusConfig,
    pending_progress: Mutex<Option<(EventDraft, Value)>>,
    pending_url_batch: Mutex<Option<PendingUrlBatch>>,
}

/// Shared telemetry bridge. Cheap to clone (it's an `Arc` wrapper); `subscribe` replays
/// bounded history atomically before live delivery begins.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

/// A subscription that yields replayed history first, then live events, without a gap: a
/// second subscriber joining while a publish is in flight either sees the event in its replay
/// (if it landed in history before the snapshot was taken) or in `live` (if after) — never both,
/// never neither, because the snapshot and the broadcast subscribe happen under the same lock.
pub struct Subscription {
    replay: std::vec::IntoIter<EventEnvelope>,
    live: broadcast::Receiver<EventEnvelope>,
}

impl Subscription {
    /// Next event: drains replay history first, then blocks on live delivery.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        if let Some(event) = self.replay.next() {
            return Some(event);
        }
        loop {
            match self.live.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "telemetry subscriber lagged, events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl EventBus {
    #[must_use]
    pub fn new(config: EventBusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity);
        let inner = Arc::new(Inner {
            sender,
            history: Mutex::new(VecDeque::with_capacity(config.history_capacity)),
            next_id: AtomicU64::new(1),
            config,
            pending_progress: Mutex::new(None),
            pending_url_batch: Mutex::new(None),
        });
        Self { inner }
    }

    /// Spawns the background flush tasks for progress coalescing and url-event batching.
    /// Requires a Tokio runtime; called once by the engine during startup.
    pub fn spawn_batchers(&self) {
        let progress = self.clone();
        let interval = Duration::from_millis(self.inner.config.progress_batch_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                progress.flush_progress();
            }
        });

        let url = self.clone();
        let interval = Duration::from_millis(self.inner.config.url_batch_max_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                url.flush_url_batch_if_stale();
            }
        });
    }

    fn stamp(&self, draft: EventDraft) -> EventEnvelope {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        EventEnvelope {
            schema_version: SCHEMA_VERSION,
            id,
            event_type: draft.event_type,
            topic: draft.event_type.topic().to_string(),
            tags: draft.tags,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            job_id: draft.job_id,
            crawl_type: draft.crawl_type,
            severity: draft.severity,
            message: draft.message,
            source: draft.source.to_string(),
            data: draft.data,
        }
    }

    /// Publishes immediately: used for lifecycle, phase, rate-limit, stall, checkpoint events
    /// — everything except `progress` and url-level events, which go through the batchers.
    pub fn publish(&self, draft: EventDraft) {
        let event = self.stamp(draft);
        self.record_history(event.clone());
        if self.inner.sender.send(event).is_err() {
            debug!("telemetry event published with no active subscribers");
        }
    }

    fn record_history(&self, event: EventEnvelope) {
        let mut history = self.inner.history.lock();
        if history.len() >= self.inner.config.history_capacity {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Records progress state; only the latest value survives until the next flush tick.
    pub fn report_progress(
        &self,
        job_id: impl Into<String>,
        crawl_type: impl Into<String>,
        data: Value,
    ) {
        let draft =
            EventDraft::new(EventType::Progress, job_id, crawl_type).with_data(data.clone());
        *self.inner.pending_progress.lock() = Some((draft, data));
    }

    fn flush_progress(&self) {
        let pending = self.inner.pending_progress.lock().take();
        if let Some((draft, _)) = pending {
            self.publish(draft);
        }
    }

    /// Records a url-level event for batching. Under `per_url_broadcast` each is published
    /// individually; otherwise it accumulates into the pending `crawl:url:batch`, flushed at
    /// `urlBatchMaxSize` or `urlBatchMaxIntervalMs`, whichever comes first.
    pub fn record_url_event(
        &self,
        event_type: EventType,
        job_id: impl Into<String>,
        crawl_type: impl Into<String>,
        data: Value,
    ) {
        if self.inner.config.per_url_broadcast {
            self.publish(EventDraft::new(event_type, job_id, crawl_type).with_data(data));
            return;
        }

        let job_id = job_id.into();
        let crawl_type = crawl_type.into();
        let entry = serde_json::json!({ "type": event_type.topic(), "data": data });

        let should_flush = {
            let mut pending = self.inner.pending_url_batch.lock();
            let batch = pending.get_or_insert_with(|| PendingUrlBatch {
                items: Vec::with_capacity(self.inner.config.url_batch_max_size),
                opened_at: std::time::Instant::now(),
            });
            batch.items.push(entry);
            batch.items.len() >= self.inner.config.url_batch_max_size
        };

        if should_flush {
            self.flush_url_batch(job_id, crawl_type);
        }
    }

    fn flush_url_batch_if_stale(&self) {
        let max_age = Duration::from_millis(self.inner.config.url_batch_max_interval_ms.max(1));
        let is_stale = self
            .inner
            .pending_url_batch
            .lock()
            .as_ref()
            .is_some_and(|batch| batch.opened_at.elapsed() >= max_age);
        if is_stale {
            self.flush_url_batch("".to_string(), "".to_string());
        }
    }

    fn flush_url_batch(&self, job_id: String, crawl_type: String) {
        let batch = self.inner.pending_url_batch.lock().take();
        let Some(batch) = batch else { return };
        if batch.items.is_empty() {
            return;
        }
        let draft = EventDraft::new(EventType::UrlBatch, job_id, crawl_type)
            .with_data(Value::Array(batch.items));
        self.publish(draft);
    }

    /// Atomically snapshots history and subscribes to live delivery so no event is missed or
    /// duplicated across the boundary.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let history_guard = self.inner.history.lock();
        let live = self.inner.sender.subscribe();
        let replay: Vec<EventEnvelope> = history_guard.iter().cloned().collect();
        drop(history_guard);
        Subscription {
            replay: replay.into_iter(),
            live,
        }
    }

    pub fn phase_changed(
        &self,
        job_id: impl Into<String>,
        crawl_type: impl Into<String>,
        phase: CrawlPhase,
    ) {
        let data = serde_json::json!({ "phase": phase });
        self.publish(
            EventDraft::new(EventType::PhaseChanged, job_id, crawl_type)
                .with_data(data)
                .with_message(format!("{phase:?}")),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> EventBus {
        EventBus::new(EventBusConfig {
            history_capacity: 4,
            ..EventBusConfig::default()
        })
    }

    #[test]
    fn history_ring_is_bounded() {
        let bus = bus();
        for i in 0..10 {
            bus.publish(
                EventDraft::new(EventType::CrawlStarted, "job", "basic")
                    .with_message(format!("{i}")),
            );
        }
        assert_eq!(bus.inner.history.lock().len(), 4);
    }

    #[tokio::test]
    async fn subscribe_replays_history_before_live() {
        let bus = bus();
        bus.publish(EventDraft::new(EventType::CrawlStarted, "job", "basic"));
        let mut sub = bus.subscribe();
        bus.publish(EventDraft::new(EventType::CrawlCompleted, "job", "basic"));

        let first = sub.recv().await.unwrap();
        assert_eq!(first.event_type, EventType::CrawlStarted);
        let second = sub.recv().await.unwrap();
        assert_eq!(second.event_type, EventType::CrawlCompleted);
    }

    #[test]
    fn url_batch_flushes_at_max_size() {
        let bus = EventBus::new(EventBusConfig {
            url_batch_max_size: 2,
            ..EventBusConfig::default()
        });
        let mut sub_live = bus.inner.sender.subscribe();
        bus.record_url_event(
            EventType::UrlVisited,
            "job",
            "basic",
            serde_json::json!({"url": "a"}),
        );
        assert!(sub_live.try_recv().is_err());
        bus.record_url_event(
            EventType::UrlVisited,
            "job",
            "basic",
            serde_json::json!({"url": "b"}),
        );
        let event = sub_live.try_recv().expect("batch should flush at max size");
        assert_eq!(event.event_type, EventType::UrlBatch);
        let arr = event.data.as_array().unwrap();
        assert_eq!(arr.len(), 2);
    }

    #[test]
    fn progress_keeps_only_latest_pending() {
        let bus = bus();
        bus.report_progress("job", "basic", serde_json::json!({"n": 1}));
        bus.report_progress("job", "basic", serde_json::json!({"n": 2}));
        bus.flush_progress();
        let history = bus.inner.history.lock();
        let last = history.back().unwrap();
        assert_eq!(last.data, serde_json::json!({"n": 2}));
    }
}
