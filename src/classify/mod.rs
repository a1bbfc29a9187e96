//! Classifier cascade: three stages feeding a weighted aggregator, used both to
//! guide discovery (what links to enqueue) and to decide which fetches to process as articles
//! vs hubs.

pub mod stage1;
pub mod stage2;
pub mod stage3;
pub mod tree;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use crate::config::ClassifierConfig;
use crate::fetch::HeadlessFetcher;
use crate::url::ImUrl;

pub use tree::DecisionTree;
pub use types::{
    ClassificationResult, ClassificationSignals, ContentSignals, Label, RenderedSignals, StageResult,
    UrlSignals,
};

/// Ties the three classification stages to a single weighted-aggregator entry point.
/// Holds the compiled decision tree and an optional headless fetcher used for stage 3;
/// a cascade built without one simply never invokes stage 3.
pub struct ClassifierCascade {
    tree: DecisionTree,
    config: ClassifierConfig,
    headless: Option<Arc<dyn HeadlessFetcher>>,
}

impl ClassifierCascade {
    #[must_use]
    pub fn new(config: ClassifierConfig, headless: Option<Arc<dyn HeadlessFetcher>>) -> Self {
        let tree = match &config.decision_tree_path {
            Some(path) => DecisionTree::load_from_path(path).unwrap_or_else(|_| DecisionTree::default_tree()),
            None => DecisionTree::default_tree(),
        };
        Self { tree, config, headless }
    }

    #[must_use]
    pub fn with_tree(config: ClassifierConfig, tree: DecisionTree, headless: Option<Arc<dyn HeadlessFetcher>>) -> Self {
        Self { tree, config, headless }
    }

    /// Runs stage 1 always, stage 2 when `html` is present, and stage 3 only when the
    /// cheaper stages leave `max(stage1.confidence, stage2.confidence)` below
    /// `headless_invoke_threshold`. `high_value` lets the caller force stage 3 for URLs it
    /// already knows matter (e.g. the crawl's start URL) regardless of confidence.
    pub async fn classify(&self, url: &ImUrl, html: Option<&str>, high_value: bool) -> ClassificationResult {
        let mut stage_results = Vec::with_capacity(3);
        let mut signals = ClassificationSignals {
            url_level: tree::compute_url_signals(url.as_str()),
            ..Default::default()
        };

        let stage1 = stage1::evaluate(url.as_str(), &self.tree);
        if let Some(result) = high_confidence(&stage1, self.config.high_confidence_threshold) {
            stage_results.push(stage1);
            return finish(result, stage_results, signals);
        }
        stage_results.push(stage1.clone());

        let raw_signals = html.map(stage2::compute_content_signals);
        signals.content_level = raw_signals.clone();
        let stage2 = raw_signals
            .as_ref()
            .map(|s| stage2::evaluate_signals(s, &self.config.stage2_thresholds));
        if let Some(ref s2) = stage2 {
            if let Some(result) = high_confidence(s2, self.config.high_confidence_threshold) {
                stage_results.push(s2.clone());
                return finish(result, stage_results, signals);
            }
        }
        if let Some(ref s2) = stage2 {
            stage_results.push(s2.clone());
        }

        let max_conf = stage_results.iter().map(|r| r.confidence).fold(0.0_f64, f64::max);
        let needs_stage3 = max_conf < self.config.headless_invoke_threshold || high_value;

        if needs_stage3 {
            if let Some(headless) = &self.headless {
                let stage3_result = stage3::evaluate(
                    url,
                    headless,
                    &self.config.stage2_thresholds,
                    Duration::from_millis(30_000),
                    raw_signals.as_ref(),
                )
                .await;
                if let Some((s3, rendered)) = stage3_result {
                    signals.rendered_level = Some(rendered);
                    if let Some(result) = high_confidence(&s3, self.config.high_confidence_threshold) {
                        stage_results.push(s3);
                        return finish(result, stage_results, signals);
                    }
                    stage_results.push(s3);
                }
            }
        }

        aggregate(stage_results, &self.config, signals)
    }
}

fn high_confidence(result: &StageResult, threshold: f64) -> Option<(Label, f64, String)> {
    if result.confidence >= threshold {
        Some((result.label, result.confidence, format!("{}-high-confidence", result.stage)))
    } else {
        None
    }
}

fn finish(
    result: (Label, f64, String),
    stage_results: Vec<StageResult>,
    signals: ClassificationSignals,
) -> ClassificationResult {
    let (label, confidence, provenance) = result;
    ClassificationResult { label, confidence, provenance, stage_results, has_disagreement: false, signals }
}

/// Weighted-sum aggregation: `confidence = weightedSum / sumOfRunWeights`, argmax over
/// per-label weighted sums, ties broken by `Label`'s derive order
/// (`Article > Hub > Nav > Unknown`).
fn aggregate(
    stage_results: Vec<StageResult>,
    config: &ClassifierConfig,
    signals: ClassificationSignals,
) -> ClassificationResult {
    let weight_for = |stage: &str| -> f64 {
        match stage {
            "url" => config.weight_url,
            "content" => config.weight_content,
            "headless" => config.weight_headless,
            _ => 1.0,
        }
    };

    let mut sums: [f64; 4] = [0.0; 4];
    let mut total_weight = 0.0;
    for r in &stage_results {
        let w = weight_for(r.stage);
        sums[r.label as usize] += w * r.confidence;
        total_weight += w;
    }

    let labels = [Label::Unknown, Label::Nav, Label::Hub, Label::Article];
    let (winner, winning_sum) = labels
        .iter()
        .rev()
        .map(|&l| (l, sums[l as usize]))
        .fold((Label::Unknown, -1.0_f64), |best, cur| if cur.1 > best.1 { cur } else { best });

    let confidence = if total_weight > 0.0 { (winning_sum / total_weight).clamp(0.0, 1.0) } else { 0.0 };

    let distinct_labels: std::collections::HashSet<Label> =
        stage_results.iter().map(|r| r.label).collect();
    let has_disagreement = distinct_labels.len() > 1;

    let provenance = format!(
        "weighted[{}]",
        stage_results
            .iter()
            .map(|r| format!("{}:{:.2}", r.stage, r.confidence))
            .collect::<Vec<_>>()
            .join(",")
    );

    ClassificationResult { label: winner, confidence, provenance, stage_results, has_disagreement, signals }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClassifierConfig;

    fn cascade() -> ClassifierCascade {
        ClassifierCascade::new(ClassifierConfig::default(), None)
    }

    #[tokio::test]
    async fn high_confidence_url_stage_short_circuits() {
        let cascade = cascade();
        let url = ImUrl::parse("https://example.com/world/2024/jan/15/story-alpha").unwrap();
        let result = cascade.classify(&url, None, false).await;
        assert_eq!(result.label, Label::Article);
        assert!(result.provenance.contains("high-confidence"));
        assert_eq!(result.stage_results.len(), 1);
    }

    #[tokio::test]
    async fn aggregates_when_no_stage_is_high_confidence() {
        let cascade = cascade();
        let url = ImUrl::parse("https://example.com/section/tag").unwrap();
        let html = r#"<html><body><nav><a href="/a">a</a><a href="/b">b</a></nav>
            <p>short text</p></body></html>"#;
        let result = cascade.classify(&url, Some(html), false).await;
        assert!(result.stage_results.len() >= 2);
        assert!(result.confidence <= 1.0);
    }

    #[tokio::test]
    async fn determinism_same_inputs_same_output() {
        let cascade = cascade();
        let url = ImUrl::parse("https://example.com/blog/post-title").unwrap();
        let html = "<html><body><p>one</p><p>two</p></body></html>";
        let a = cascade.classify(&url, Some(html), false).await;
        let b = cascade.classify(&url, Some(html), false).await;
        assert_eq!(a.label, b.label);
        assert!((a.confidence - b.confidence).abs() < 1e-9);
    }

    struct FakeHeadless;

    #[async_trait::async_trait]
    impl crate::fetch::HeadlessFetcher for FakeHeadless {
        async fn fetch(&self, _url: &ImUrl, _timeout: Duration) -> crate::fetch::HeadlessFetchOutcome {
            crate::fetch::HeadlessFetchOutcome {
                success: true,
                html: Some(
                    r#"<html><body><article><p>a fully rendered article body with plenty of padding words to clear the threshold easily now</p></article>
                    <img data-src="lazy.jpg"></body></html>"#.to_string(),
                ),
                error: None,
                render_time_ms: 42,
            }
        }
    }

    #[tokio::test]
    async fn low_confidence_page_triggers_stage3_and_records_rendered_signals() {
        let headless: Arc<dyn crate::fetch::HeadlessFetcher> = Arc::new(FakeHeadless);
        let cascade = ClassifierCascade::new(ClassifierConfig::default(), Some(headless));
        let url = ImUrl::parse("https://example.com/section/tag").unwrap();
        let html = r#"<html><body><nav><a href="/a">a</a></nav><p>short</p></body></html>"#;
        let result = cascade.classify(&url, Some(html), false).await;
        assert!(result.signals.rendered_level.is_some());
        let rendered = result.signals.rendered_level.unwrap();
        assert_eq!(rendered.lazy_image_count, 1);
    }
}
