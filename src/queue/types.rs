//! Queue item types and the priority scoring contract.

use crate::url::ImUrl;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

/// What an item represents, driving which logical queue it lives in and its base weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemKind {
    Article,
    HubSeed,
    History,
    Nav,
    Refresh,
    Hub,
    Default,
}

impl ItemKind {
    /// Which logical queue (discovery vs acquisition) this kind belongs to.
    #[must_use]
    pub fn queue(self) -> QueueName {
        match self {
            Self::Article | Self::Refresh | Self::History => QueueName::Acquisition,
            Self::Hub | Self::Nav | Self::Default | Self::HubSeed => QueueName::Discovery,
        }
    }

    #[must_use]
    pub fn as_config_key(self) -> &'static str {
        match self {
            Self::Article => "article",
            Self::HubSeed => "hub-seed",
            Self::History => "history",
            Self::Nav => "nav",
            Self::Refresh => "refresh",
            Self::Hub => "hub",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueName {
    Discovery,
    Acquisition,
}

/// Where this item's priority discount (if any) came from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemMeta {
    pub discovery_method: Option<String>,
    pub estimated_cost_ms: Option<u64>,
    pub knowledge_reuse: bool,
    /// Token classifying this item for "total prioritisation" mode (country/etc).
    pub classification_tokens: Vec<String>,
}

/// A pending unit of work. At most one live `QueueItem` exists per URL (enforced by the
/// queue's dedup set, not by this type).
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub url: ImUrl,
    pub depth: u32,
    pub kind: ItemKind,
    pub discovered_at: u64,
    pub meta: ItemMeta,
    pub priority: i64,
    pub priority_source: &'static str,
    pub enqueued_at: u64,
    pub deferred_until: Option<u64>,
    /// Set by `pull_next` when the host is 429-limited and a fresh cache entry exists.
    pub force_cache: bool,
    /// Monotonic sequence number, used as the final tie-break after `enqueued_at`.
    pub(crate) seq: u64,
}

#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Heap entry ordering: lower `priority` first, then earlier `enqueued_at`, then lower `seq`.
/// `BinaryHeap` is a max-heap, so `Ord` is reversed to make the heap behave as a min-heap.
#[derive(Debug, Clone)]
pub(crate) struct HeapEntry(pub QueueItem);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority
            && self.0.enqueued_at == other.0.enqueued_at
            && self.0.seq == other.0.seq
    }
}
impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .priority
            .cmp(&self.0.priority)
            .then_with(|| other.0.enqueued_at.cmp(&self.0.enqueued_at))
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

/// Outcome of an `enqueue` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued { priority: i64 },
    Rejected { reason: RejectReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    InvalidUrl,
    QueueFull,
    MaxDepth,
    Ineligible,
    Duplicate,
}

impl RejectReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUrl => "invalid-url",
            Self::QueueFull => "queue-full",
            Self::MaxDepth => "max-depth",
            Self::Ineligible => "ineligible",
            Self::Duplicate => "duplicate",
        }
    }
}

/// Outcome of a `pull_next` call.
#[derive(Debug, Clone)]
pub enum PullOutcome {
    Item(QueueItem),
    HostLocked { item: QueueItem, retry_after_ms: u64 },
    Empty { wake_at: Option<u64> },
}
