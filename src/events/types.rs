//! Event envelope and type taxonomy for the telemetry bridge.

use serde::{Deserialize, Serialize};

/// One engine event type: lifecycle, phase, progress, url-level, rate/stall, checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CrawlStarted,
    CrawlPaused,
    CrawlResumed,
    CrawlStopped,
    CrawlCompleted,
    CrawlFailed,
    PhaseChanged,
    Progress,
    UrlVisited,
    UrlQueued,
    UrlError,
    UrlSkipped,
    UrlBatch,
    RateLimited,
    Stalled,
    CheckpointSaved,
    CheckpointRestored,
}

impl EventType {
    /// The wire topic string.
    #[must_use]
    pub fn topic(self) -> &'static str {
        match self {
            Self::CrawlStarted => "crawl:started",
            Self::CrawlPaused => "crawl:paused",
            Self::CrawlResumed => "crawl:resumed",
            Self::CrawlStopped => "crawl:stopped",
            Self::CrawlCompleted => "crawl:completed",
            Self::CrawlFailed => "crawl:failed",
            Self::PhaseChanged => "crawl:phase:changed",
            Self::Progress => "crawl:progress",
            Self::UrlVisited => "crawl:url:visited",
            Self::UrlQueued => "crawl:url:queued",
            Self::UrlError => "crawl:url:error",
            Self::UrlSkipped => "crawl:url:skipped",
            Self::UrlBatch => "crawl:url:batch",
            Self::RateLimited => "crawl:rate:limited",
            Self::Stalled => "crawl:stalled",
            Self::CheckpointSaved => "crawl:checkpoint:saved",
            Self::CheckpointRestored => "crawl:checkpoint:restored",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

/// `crawl:phase:changed` phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlPhase {
    Idle,
    Initializing,
    Planning,
    Discovering,
    Crawling,
    Processing,
    Finalizing,
    Completed,
    Failed,
    Paused,
    Stopped,
}

/// All events, all shapes: `{schemaVersion, id, type, topic, tags, timestampMs,
/// jobId, crawlType, severity, message, source, data}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub schema_version: u32,
    pub id: u64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub topic: String,
    pub tags: Vec<String>,
    pub timestamp_ms: i64,
    pub job_id: String,
    pub crawl_type: String,
    pub severity: Severity,
    pub message: String,
    pub source: String,
    pub data: serde_json::Value,
}

pub const SCHEMA_VERSION: u32 = 1;

/// Builds an envelope; `id` and `timestampMs` are filled by the bus at publish time since
/// they depend on bus-held sequence/clock state, not on the event's own content.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub event_type: EventType,
    pub tags: Vec<String>,
    pub job_id: String,
    pub crawl_type: String,
    pub severity: Severity,
    pub message: String,
    pub source: &'static str,
    pub data: serde_json::Value,
}

impl EventDraft {
    #[must_use]
    pub fn new(
        event_type: EventType,
        job_id: impl Into<String>,
        crawl_type: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            tags: Vec::new(),
            job_id: job_id.into(),
            crawl_type: crawl_type.into(),
            severity: Severity::Info,
            message: String::new(),
            source: "engine",
            data: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}
