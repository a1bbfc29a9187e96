//! Core configuration types for the fetch-and-schedule engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Which crawl strategy drives discovery and scoring. Replaces the deep-inheritance
/// `Crawler -> NewsCrawler -> ...` hierarchy with a single engine plus a mode tag that
/// pluggable strategies (scorer, classifier, fetch transport) read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CrawlMode {
    Basic,
    Intelligent,
    Gazetteer,
    StructureOnly,
}

impl Default for CrawlMode {
    fn default() -> Self {
        Self::Basic
    }
}

/// Retry policy: exponential backoff with `Retry-After` override and jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_ratio: 0.2,
        }
    }
}

/// Host failure circuit: rolling window of failures, lockout on threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostBudgetConfig {
    pub max_errors: u32,
    pub window_ms: u64,
    pub lockout_ms: u64,
    /// Maximum simultaneously in-flight fetches to any one host. Defaults to 1, matching
    /// article-kind crawling's politeness expectation; raise it for hosts where more
    /// parallelism is acceptable.
    pub per_host_concurrency: u32,
}

impl Default for HostBudgetConfig {
    fn default() -> Self {
        Self {
            max_errors: 6,
            window_ms: 5 * 60_000,
            lockout_ms: 2 * 60_000,
            per_host_concurrency: 1,
        }
    }
}

/// Headless fallback pool sizing and lifecycle policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadlessConfig {
    pub enabled: bool,
    pub max_browsers: usize,
    pub max_pages_per_browser: usize,
    pub max_session_age_ms: u64,
    pub health_check_interval_ms: u64,
    pub max_consecutive_errors: u32,
    pub fallback_on_connection_reset: bool,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_browsers: 2,
            max_pages_per_browser: 5,
            max_session_age_ms: 10 * 60_000,
            health_check_interval_ms: 30_000,
            max_consecutive_errors: 3,
            fallback_on_connection_reset: true,
        }
    }
}

/// Priority scoring knobs: type weights, discovery bonuses, feature flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityConfig {
    pub type_weights: HashMap<String, i64>,
    pub discovery_bonuses: HashMap<String, i64>,
    pub gap_driven_prioritization: bool,
    pub problem_clustering: bool,
    pub knowledge_reuse: bool,
    pub cost_aware_priority: bool,
    /// "Total prioritisation" mode: non-matching kinds get a large floor added.
    pub total_prioritization: bool,
    pub total_prioritization_floor: i64,
}

impl Default for PriorityConfig {
    fn default() -> Self {
        let mut type_weights = HashMap::new();
        type_weights.insert("article".to_string(), 0);
        type_weights.insert("hub-seed".to_string(), 4);
        type_weights.insert("history".to_string(), 6);
        type_weights.insert("nav".to_string(), 10);
        type_weights.insert("refresh".to_string(), 25);
        type_weights.insert("default".to_string(), 12);

        let mut discovery_bonuses = HashMap::new();
        discovery_bonuses.insert("adaptive-seed".to_string(), 20);
        discovery_bonuses.insert("gap-prediction".to_string(), 15);
        discovery_bonuses.insert("sitemap".to_string(), 10);
        discovery_bonuses.insert("hub-validated".to_string(), 8);

        Self {
            type_weights,
            discovery_bonuses,
            gap_driven_prioritization: false,
            problem_clustering: false,
            knowledge_reuse: false,
            cost_aware_priority: false,
            total_prioritization: false,
            total_prioritization_floor: 5_000_000,
        }
    }
}

/// Thresholds used by classifier stage 2 (content signals).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage2Thresholds {
    pub min_article_word_count: usize,
    pub high_word_count: usize,
    pub min_article_paragraphs: usize,
    pub max_article_link_density: f64,
    pub min_nav_link_density: f64,
}

impl Default for Stage2Thresholds {
    fn default() -> Self {
        Self {
            min_article_word_count: 150,
            high_word_count: 600,
            min_article_paragraphs: 3,
            max_article_link_density: 0.15,
            min_nav_link_density: 0.4,
        }
    }
}

/// Classifier cascade configuration: stage 2 thresholds, aggregator weights, decision tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    pub stage2_thresholds: Stage2Thresholds,
    pub weight_url: f64,
    pub weight_content: f64,
    pub weight_headless: f64,
    pub high_confidence_threshold: f64,
    pub headless_invoke_threshold: f64,
    pub decision_tree_path: Option<PathBuf>,
    /// Soft-failure (anti-bot/JS-required) body signatures, compiled once at load.
    pub soft_failure_signatures: Vec<String>,
    /// Hard-failure (access-denied) body signatures.
    pub hard_failure_signatures: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            stage2_thresholds: Stage2Thresholds::default(),
            weight_url: 1.0,
            weight_content: 1.2,
            weight_headless: 1.5,
            high_confidence_threshold: 0.9,
            headless_invoke_threshold: 0.7,
            decision_tree_path: None,
            soft_failure_signatures: vec![
                "checking your browser".to_string(),
                "enable javascript".to_string(),
                "verifying you are human".to_string(),
                "cf-browser-verification".to_string(),
            ],
            hard_failure_signatures: vec![
                "access denied".to_string(),
                "you have been blocked".to_string(),
                "request blocked".to_string(),
            ],
        }
    }
}

/// Top-level engine configuration. Every field here is named in the external interfaces;
/// unrecognised keys in a loaded config document are rejected by the document loader (see
/// `config::handle::load_document`), not by this type, since `CrawlConfig` is also
/// constructed directly by the builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlConfig {
    pub(crate) start_url: String,
    pub(crate) crawl_type: CrawlMode,
    pub(crate) data_dir: PathBuf,
    pub(crate) db_path: Option<PathBuf>,

    pub(crate) concurrency: usize,
    pub(crate) max_queue: usize,
    pub(crate) max_depth: u32,
    pub(crate) max_downloads: Option<usize>,

    /// `(discovery, acquisition)` pull-alternation weights; default `(1, 1)`.
    pub(crate) discovery_acquisition_ratio: (u32, u32),
    /// Ceiling on consecutive pulls from either queue regardless of its ratio weight.
    pub(crate) queue_burst_cap: u32,

    /// Global minimum interval between requests across all hosts; 0 disables the limiter.
    pub(crate) rate_limit_ms: u64,

    pub(crate) prefer_cache: bool,
    pub(crate) max_age_ms: i64,
    pub(crate) max_age_article_ms: i64,
    pub(crate) max_age_hub_ms: i64,

    pub(crate) request_timeout_ms: u64,
    pub(crate) shutdown_grace_ms: u64,
    pub(crate) stall_threshold_ms: u64,

    pub(crate) retry: RetryConfig,
    pub(crate) host_budget: HostBudgetConfig,
    pub(crate) headless: HeadlessConfig,
    pub(crate) priority: PriorityConfig,
    pub(crate) classifier: ClassifierConfig,

    pub(crate) https_upgrade_hosts: Vec<String>,
    pub(crate) store_error_response_bodies: bool,
    pub(crate) verbose: u8,

    #[serde(skip)]
    pub(crate) event_bus: Option<Arc<crate::events::EventBus>>,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            start_url: String::new(),
            crawl_type: CrawlMode::Basic,
            data_dir: PathBuf::from("./data"),
            db_path: None,
            concurrency: 16,
            max_queue: 100_000,
            max_depth: 10,
            max_downloads: None,
            discovery_acquisition_ratio: (1, 1),
            queue_burst_cap: 4,
            rate_limit_ms: 0,
            prefer_cache: false,
            max_age_ms: -1,
            max_age_article_ms: -1,
            max_age_hub_ms: -1,
            request_timeout_ms: 15_000,
            shutdown_grace_ms: 10_000,
            stall_threshold_ms: 60_000,
            retry: RetryConfig::default(),
            host_budget: HostBudgetConfig::default(),
            headless: HeadlessConfig::default(),
            priority: PriorityConfig::default(),
            classifier: ClassifierConfig::default(),
            https_upgrade_hosts: Vec::new(),
            store_error_response_bodies: false,
            verbose: 0,
            event_bus: None,
        }
    }
}

impl CrawlConfig {
    #[must_use]
    pub fn builder() -> super::builder::CrawlConfigBuilder {
        super::builder::CrawlConfigBuilder::new()
    }

    #[must_use]
    pub fn with_event_bus(mut self, bus: Arc<crate::events::EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    #[must_use]
    pub fn event_bus(&self) -> Option<&Arc<crate::events::EventBus>> {
        self.event_bus.as_ref()
    }
}
