//! Shared types for the classifier cascade (`ClassificationSignals`/`ClassificationResult`).

use serde::{Deserialize, Serialize};

/// `ClassificationResult.label`. Ordered for tie-breaking: `Article > Hub > Nav > Unknown`
/// — derive order on the enum encodes the aggregator's tie-break priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Label {
    Unknown,
    Nav,
    Hub,
    Article,
}

impl Label {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Article => "article",
            Self::Hub => "hub",
            Self::Nav => "nav",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// URL-level signals (stage 1), pure-string facts about the URL only.
#[derive(Debug, Clone, Default)]
pub struct UrlSignals {
    pub path_depth: u32,
    pub slug_length: u32,
    pub has_date_path: bool,
    pub has_query: bool,
    pub has_numeric_id: bool,
    pub extension: Option<String>,
}

/// HTML-only signals (stage 2), and their re-derivation on rendered DOM (stage 3).
#[derive(Debug, Clone, Default)]
pub struct ContentSignals {
    pub word_count: usize,
    pub paragraph_count: usize,
    pub link_count: usize,
    pub nav_link_count: usize,
    pub heading_count: usize,
    pub link_density: f64,
    pub nav_link_ratio: f64,
    pub has_schema_article: bool,
    pub has_article_body_property: bool,
}

/// Stage-3-only additions: rendered-DOM-specific facts not observable from raw HTML.
#[derive(Debug, Clone, Default)]
pub struct RenderedSignals {
    pub content: ContentSignals,
    pub article_visible: bool,
    pub lazy_image_count: usize,
}

/// Derived, immutable signals for a single URL+HTML pair.
#[derive(Debug, Clone, Default)]
pub struct ClassificationSignals {
    pub url_level: UrlSignals,
    pub content_level: Option<ContentSignals>,
    pub rendered_level: Option<RenderedSignals>,
}

/// One stage's contribution to the final result.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub stage: &'static str,
    pub label: Label,
    pub confidence: f64,
    pub reason: String,
}

/// Final cascade output. Deterministic: identical `(url, html, high_value)` inputs always
/// produce an identical result.
#[derive(Debug, Clone)]
pub struct ClassificationResult {
    pub label: Label,
    pub confidence: f64,
    pub provenance: String,
    pub stage_results: Vec<StageResult>,
    pub has_disagreement: bool,
    /// The raw per-stage facts that produced `stage_results`, kept for callers that want
    /// to inspect (or log) what was actually observed rather than just the verdict.
    pub signals: ClassificationSignals,
}
