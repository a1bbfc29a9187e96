//! `QueueManager`: a bounded, deduplicated, priority-ordered set of outstanding work,
//! split into a `discovery` queue (hub, nav, default, hub-seed) and an `acquisition` queue
//! (article, refresh, history).

pub mod priority;
pub mod types;

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::url::ImUrl;
pub use priority::{NullScorerHooks, ScorerHooks};
pub use types::{EnqueueOutcome, ItemKind, ItemMeta, PullOutcome, QueueItem, RejectReason};
use types::{now_ms, HeapEntry, QueueName};

/// At most this many items are inspected per `pull_next` call while searching for an
/// eligible one.
const MAX_SCAN: usize = 64;

/// How a candidate item's host currently gates dispatch. Implemented by the throttle
/// manager; kept as a trait here so the queue has no compile-time dependency on it.
pub trait HostGate: Send + Sync {
    /// `Some(t)` if the host may not be contacted again before time `t` (ms epoch),
    /// combining `nextRequestAt` and `backoffUntil`.
    fn deferred_until(&self, host: &str) -> Option<u64>;
    /// Whether the host is currently 429-limited (throttle manager's `isLimited`).
    fn is_rate_limited(&self, host: &str) -> bool;
    /// `Some(retry_after_ms)` if the host's failure budget has locked it out.
    fn host_lock_retry_after_ms(&self, host: &str) -> Option<u64>;
}

/// Whether a fresh (non-expired) cache entry exists for a URL, consulted only on the
/// 429-limited forced-cache path.
pub trait CacheFreshnessGate: Send + Sync {
    fn has_fresh_entry(&self, url: &ImUrl) -> bool;
}

/// Per-item eligibility policy (visited set, allow-list, depth bypass), consulted on
/// enqueue. Implemented by the engine's URL decision service.
pub trait EligibilityPolicy: Send + Sync {
    fn is_eligible(&self, url: &ImUrl, kind: ItemKind) -> Result<(), RejectReason>;
    fn should_bypass_depth(&self, url: &ImUrl, kind: ItemKind) -> bool {
        let _ = (url, kind);
        false
    }
}

pub struct AllowAllPolicy;
impl EligibilityPolicy for AllowAllPolicy {
    fn is_eligible(&self, _url: &ImUrl, _kind: ItemKind) -> Result<(), RejectReason> {
        Ok(())
    }
}

struct SubQueue {
    heap: Mutex<BinaryHeap<HeapEntry>>,
    deferred: Mutex<Vec<QueueItem>>,
}

impl SubQueue {
    fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            deferred: Mutex::new(Vec::new()),
        }
    }

    fn len(&self) -> usize {
        self.heap.lock().len() + self.deferred.lock().len()
    }
}

/// Configuration consumed directly by the queue, mirroring `CrawlConfig`'s relevant fields
/// without creating a dependency on the whole config type.
#[derive(Debug, Clone)]
pub struct QueueManagerConfig {
    pub max_queue: usize,
    pub max_depth: u32,
    pub total_prioritization_focus_tokens: Vec<String>,
    /// `(discovery, acquisition)` consecutive-pull weights. Default `(1, 1)` alternates
    /// every pull; a higher weight on one side runs that many consecutive pulls from it
    /// before yielding to the other, up to `queue_burst_cap`.
    pub discovery_acquisition_ratio: (u32, u32),
    /// Ceiling on consecutive pulls from either side regardless of its ratio weight.
    pub queue_burst_cap: u32,
}

impl Default for QueueManagerConfig {
    fn default() -> Self {
        Self {
            max_queue: 100_000,
            max_depth: 10,
            total_prioritization_focus_tokens: Vec::new(),
            discovery_acquisition_ratio: (1, 1),
            queue_burst_cap: 4,
        }
    }
}

pub struct QueueManager {
    discovery: SubQueue,
    acquisition: SubQueue,
    dedup: DashSet<String>,
    priority_config: crate::config::PriorityConfig,
    queue_config: QueueManagerConfig,
    hooks: Arc<dyn ScorerHooks>,
    eligibility: Arc<dyn EligibilityPolicy>,
    seq: AtomicU64,
    total_len: AtomicUsize,
    /// Woken whenever an item is enqueued or an item's deferral lapses might be relevant.
    pub wake: Notify,
    last_queue_pulled: Mutex<QueueName>,
    burst_count: AtomicUsize,
}

impl QueueManager {
    #[must_use]
    pub fn new(
        priority_config: crate::config::PriorityConfig,
        queue_config: QueueManagerConfig,
    ) -> Self {
        Self::with_collaborators(
            priority_config,
            queue_config,
            Arc::new(NullScorerHooks),
            Arc::new(AllowAllPolicy),
        )
    }

    #[must_use]
    pub fn with_collaborators(
        priority_config: crate::config::PriorityConfig,
        queue_config: QueueManagerConfig,
        hooks: Arc<dyn ScorerHooks>,
        eligibility: Arc<dyn EligibilityPolicy>,
    ) -> Self {
        Self {
            discovery: SubQueue::new(),
            acquisition: SubQueue::new(),
            dedup: DashSet::new(),
            priority_config,
            queue_config,
            hooks,
            eligibility,
            seq: AtomicU64::new(0),
            total_len: AtomicUsize::new(0),
            wake: Notify::new(),
            last_queue_pulled: Mutex::new(QueueName::Discovery),
            burst_count: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.total_len.load(Ordering::Acquire)
    }

    /// Composition of the queue by discovery method and depth bucket, for observability.
    #[must_use]
    pub fn heatmap(&self) -> Vec<(String, u32, usize)> {
        let mut counts: std::collections::HashMap<(String, u32), usize> =
            std::collections::HashMap::new();
        for sub in [&self.discovery, &self.acquisition] {
            for entry in sub.heap.lock().iter() {
                let method = entry
                    .0
                    .meta
                    .discovery_method
                    .clone()
                    .unwrap_or_else(|| "none".to_string());
                *counts.entry((method, entry.0.depth)).or_insert(0) += 1;
            }
        }
        counts
            .into_iter()
            .map(|((method, depth), n)| (method, depth, n))
            .collect()
    }

    /// Attempt to enqueue a new unit of work.
    pub fn enqueue(
        &self,
        url: &str,
        depth: u32,
        kind: ItemKind,
        meta: ItemMeta,
        explicit_priority: Option<i64>,
    ) -> EnqueueOutcome {
        let Ok(parsed) = ImUrl::parse_normalized(url) else {
            return EnqueueOutcome::Rejected {
                reason: RejectReason::InvalidUrl,
            };
        };

        if depth > self.queue_config.max_depth
            && !self.eligibility.should_bypass_depth(&parsed, kind)
        {
            return EnqueueOutcome::Rejected {
                reason: RejectReason::MaxDepth,
            };
        }

        if let Err(reason) = self.eligibility.is_eligible(&parsed, kind) {
            return EnqueueOutcome::Rejected { reason };
        }

        if !self.dedup.insert(parsed.as_str().to_string()) {
            return EnqueueOutcome::Rejected {
                reason: RejectReason::Duplicate,
            };
        }

        if self.size() >= self.queue_config.max_queue {
            self.dedup.remove(parsed.as_str());
            return EnqueueOutcome::Rejected {
                reason: RejectReason::QueueFull,
            };
        }

        let priority = explicit_priority.unwrap_or_else(|| {
            priority::compute_priority(
                kind,
                depth,
                now_ms(),
                &meta,
                &self.priority_config,
                self.hooks.as_ref(),
                &parsed,
                &self.queue_config.total_prioritization_focus_tokens,
            )
        });

        let item = QueueItem {
            url: parsed,
            depth,
            kind,
            discovered_at: now_ms(),
            meta,
            priority,
            priority_source: if explicit_priority.is_some() {
                "explicit"
            } else {
                "computed"
            },
            enqueued_at: now_ms(),
            deferred_until: None,
            force_cache: false,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };

        let sub = match kind.queue() {
            QueueName::Discovery => &self.discovery,
            QueueName::Acquisition => &self.acquisition,
        };
        sub.heap.lock().push(HeapEntry(item));
        self.total_len.fetch_add(1, Ordering::AcqRel);
        self.wake.notify_waiters();

        EnqueueOutcome::Enqueued { priority }
    }

    /// Consecutive-pull limit for `name`, from the configured ratio weight capped by
    /// `queue_burst_cap`.
    fn burst_limit(&self, name: QueueName) -> usize {
        let (discovery_weight, acquisition_weight) = self.queue_config.discovery_acquisition_ratio;
        let weight = match name {
            QueueName::Discovery => discovery_weight,
            QueueName::Acquisition => acquisition_weight,
        };
        (weight.max(1) as usize).min(self.queue_config.queue_burst_cap.max(1) as usize)
    }

    fn pick_queue(&self) -> QueueName {
        let mut last = self.last_queue_pulled.lock();
        let burst = self.burst_count.load(Ordering::Relaxed);
        let next = if burst >= self.burst_limit(*last) {
            self.burst_count.store(0, Ordering::Relaxed);
            match *last {
                QueueName::Discovery => QueueName::Acquisition,
                QueueName::Acquisition => QueueName::Discovery,
            }
        } else {
            *last
        };
        self.burst_count.fetch_add(1, Ordering::Relaxed);
        *last = next;
        next
    }

    fn sub_queue(&self, name: QueueName) -> &SubQueue {
        match name {
            QueueName::Discovery => &self.discovery,
            QueueName::Acquisition => &self.acquisition,
        }
    }

    /// Pull the next eligible item, respecting host throttle/backoff and host lockout.
    pub fn pull_next(
        &self,
        host_gate: &dyn HostGate,
        cache_gate: &dyn CacheFreshnessGate,
    ) -> PullOutcome {
        let primary = self.pick_queue();
        let order = [primary, Self::other(primary)];

        for queue_name in order {
            let sub = self.sub_queue(queue_name);
            let mut scanned = 0usize;
            let mut set_aside = Vec::new();
            let now = now_ms();

            let outcome = loop {
                if scanned >= MAX_SCAN {
                    break None;
                }
                let Some(HeapEntry(mut item)) = sub.heap.lock().pop() else {
                    break None;
                };
                scanned += 1;

                let host = match item.url.host_key() {
                    Ok(h) => h,
                    Err(_) => continue,
                };

                if let Some(retry_after_ms) = host_gate.host_lock_retry_after_ms(&host) {
                    self.dedup.remove(item.url.as_str());
                    self.total_len.fetch_sub(1, Ordering::AcqRel);
                    break Some(PullOutcome::HostLocked {
                        item,
                        retry_after_ms,
                    });
                }

                if let Some(deferred_at) = host_gate.deferred_until(&host) {
                    if deferred_at > now {
                        if host_gate.is_rate_limited(&host) && cache_gate.has_fresh_entry(&item.url)
                        {
                            item.force_cache = true;
                            self.total_len.fetch_sub(1, Ordering::AcqRel);
                            break Some(PullOutcome::Item(item));
                        }
                        item.deferred_until = Some(deferred_at);
                        set_aside.push(item);
                        continue;
                    }
                }

                self.total_len.fetch_sub(1, Ordering::AcqRel);
                break Some(PullOutcome::Item(item));
            };

            {
                let mut heap = sub.heap.lock();
                for deferred in set_aside.drain(..) {
                    heap.push(HeapEntry(deferred));
                }
            }

            if let Some(result) = outcome {
                return result;
            }
        }

        let wake_at = [&self.discovery, &self.acquisition]
            .iter()
            .flat_map(|s| {
                s.heap
                    .lock()
                    .iter()
                    .filter_map(|e| e.0.deferred_until)
                    .collect::<Vec<_>>()
            })
            .min();
        PullOutcome::Empty { wake_at }
    }

    fn other(name: QueueName) -> QueueName {
        match name {
            QueueName::Discovery => QueueName::Acquisition,
            QueueName::Acquisition => QueueName::Discovery,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PriorityConfig;

    struct NeverGated;
    impl HostGate for NeverGated {
        fn deferred_until(&self, _host: &str) -> Option<u64> {
            None
        }
        fn is_rate_limited(&self, _host: &str) -> bool {
            false
        }
        fn host_lock_retry_after_ms(&self, _host: &str) -> Option<u64> {
            None
        }
    }

    struct NeverFresh;
    impl CacheFreshnessGate for NeverFresh {
        fn has_fresh_entry(&self, _url: &ImUrl) -> bool {
            false
        }
    }

    fn manager() -> QueueManager {
        QueueManager::new(PriorityConfig::default(), QueueManagerConfig::default())
    }

    #[test]
    fn duplicate_enqueue_is_rejected() {
        let q = manager();
        let meta = ItemMeta::default();
        assert!(matches!(
            q.enqueue("https://a.com/1", 0, ItemKind::Article, meta.clone(), None),
            EnqueueOutcome::Enqueued { .. }
        ));
        assert_eq!(
            q.enqueue("https://a.com/1", 0, ItemKind::Article, meta, None),
            EnqueueOutcome::Rejected {
                reason: RejectReason::Duplicate
            }
        );
    }

    #[test]
    fn queue_full_rejects_overflow() {
        let q = QueueManager::new(
            PriorityConfig::default(),
            QueueManagerConfig {
                max_queue: 2,
                ..Default::default()
            },
        );
        let meta = ItemMeta::default();
        assert!(matches!(
            q.enqueue("https://a.com/1", 0, ItemKind::Article, meta.clone(), Some(10)),
            EnqueueOutcome::Enqueued { .. }
        ));
        assert!(matches!(
            q.enqueue("https://a.com/2", 0, ItemKind::Article, meta.clone(), Some(5)),
            EnqueueOutcome::Enqueued { .. }
        ));
        assert_eq!(
            q.enqueue("https://a.com/3", 0, ItemKind::Article, meta, Some(1)),
            EnqueueOutcome::Rejected {
                reason: RejectReason::QueueFull
            }
        );
        assert_eq!(q.size(), 2);
    }

    #[test]
    fn pull_next_returns_lowest_priority_first() {
        let q = manager();
        let meta = ItemMeta::default();
        q.enqueue("https://a.com/a", 0, ItemKind::Article, meta.clone(), Some(10));
        q.enqueue("https://a.com/b", 0, ItemKind::Article, meta.clone(), Some(5));
        q.enqueue("https://a.com/c", 0, ItemKind::Article, meta, Some(1));

        let gate = NeverGated;
        let cache = NeverFresh;
        let first = q.pull_next(&gate, &cache);
        let PullOutcome::Item(item) = first else {
            panic!("expected item");
        };
        assert_eq!(item.priority, 1);
    }

    #[test]
    fn equal_priority_preserves_enqueue_order() {
        let q = manager();
        let meta = ItemMeta::default();
        q.enqueue("https://a.com/a", 0, ItemKind::Article, meta.clone(), Some(5));
        q.enqueue("https://a.com/b", 0, ItemKind::Article, meta, Some(5));

        let gate = NeverGated;
        let cache = NeverFresh;
        let PullOutcome::Item(first) = q.pull_next(&gate, &cache) else {
            panic!("expected item");
        };
        assert_eq!(first.url.as_str(), "https://a.com/a");
    }

    #[test]
    fn host_locked_item_is_returned_and_dropped() {
        struct Locked;
        impl HostGate for Locked {
            fn deferred_until(&self, _host: &str) -> Option<u64> {
                None
            }
            fn is_rate_limited(&self, _host: &str) -> bool {
                false
            }
            fn host_lock_retry_after_ms(&self, _host: &str) -> Option<u64> {
                Some(30_000)
            }
        }
        let q = manager();
        q.enqueue(
            "https://a.com/a",
            0,
            ItemKind::Article,
            ItemMeta::default(),
            Some(1),
        );
        let gate = Locked;
        let cache = NeverFresh;
        let outcome = q.pull_next(&gate, &cache);
        assert!(matches!(outcome, PullOutcome::HostLocked { .. }));
        assert_eq!(q.size(), 0);
    }

    #[test]
    fn max_depth_rejected_unless_bypassed() {
        let q = QueueManager::new(
            PriorityConfig::default(),
            QueueManagerConfig {
                max_depth: 1,
                ..Default::default()
            },
        );
        assert_eq!(
            q.enqueue(
                "https://a.com/a",
                5,
                ItemKind::Article,
                ItemMeta::default(),
                None
            ),
            EnqueueOutcome::Rejected {
                reason: RejectReason::MaxDepth
            }
        );
    }
}
