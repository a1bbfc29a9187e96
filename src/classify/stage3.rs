//! Stage 3: headless re-render. Only invoked when
//! `max(stage1.conf, stage2.conf) < headlessInvokeThreshold` or for high-value URL
//! verification; computes rendered-DOM-only facts (article visibility, lazy-loaded image
//! count) that raw HTML cannot reveal, then re-runs the stage 2 rule table against them and
//! adds a confidence bonus when the article becomes visible only after rendering.

use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use scraper::{ElementRef, Html, Selector};

use crate::config::Stage2Thresholds;
use crate::fetch::HeadlessFetcher;
use crate::url::ImUrl;

use super::stage2;
use super::types::{ContentSignals, Label, RenderedSignals, StageResult};

/// An article is considered "visible" post-render if rendering surfaced schema/article-body
/// signals (or pushed paragraph count past the threshold) that raw HTML lacked.
const VISIBILITY_BONUS: f64 = 0.1;

static ARTICLE_CONTAINER: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("article, [itemprop='articleBody'], [role='main']")
        .expect("BUG: hardcoded CSS selector for article container is invalid")
});
static LAZY_IMAGE: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("img[loading='lazy'], img[data-src], img[data-lazy-src]")
        .expect("BUG: hardcoded CSS selector for lazy images is invalid")
});

fn is_hidden(el: &ElementRef<'_>) -> bool {
    let style = el.value().attr("style").unwrap_or("").replace(' ', "");
    el.value().attr("hidden").is_some()
        || el.value().attr("aria-hidden") == Some("true")
        || style.contains("display:none")
}

/// Rendered-DOM facts that only exist once a headless browser has executed the page's
/// JavaScript: whether an article container is both present and not hidden behind a
/// loading/consent gate, and how many images were still lazy-load placeholders.
#[must_use]
pub fn compute_rendered_signals(html: &str, thresholds: &Stage2Thresholds) -> RenderedSignals {
    let content = stage2::compute_content_signals(html);
    let doc = Html::parse_document(html);

    let lazy_image_count = doc.select(&LAZY_IMAGE).count();

    let article_visible = doc.select(&ARTICLE_CONTAINER).any(|el| {
        !is_hidden(&el)
            && el.text().collect::<String>().split_whitespace().count()
                >= thresholds.min_article_word_count
    });

    RenderedSignals { content, article_visible, lazy_image_count }
}

pub async fn evaluate(
    url: &ImUrl,
    headless: &Arc<dyn HeadlessFetcher>,
    thresholds: &Stage2Thresholds,
    timeout: Duration,
    prior_raw_signals: Option<&ContentSignals>,
) -> Option<(StageResult, RenderedSignals)> {
    let outcome = headless.fetch(url, timeout).await;
    if !outcome.success {
        return None;
    }
    let html = outcome.html?;
    let rendered = compute_rendered_signals(&html, thresholds);
    let (mut label, mut confidence, mut reason) =
        stage2::classify_signals(&rendered.content, thresholds);

    let became_visible = rendered.article_visible
        && prior_raw_signals
            .map(|prior| !prior.has_article_body_property && rendered.content.has_article_body_property)
            .unwrap_or(true);

    if label == Label::Article && became_visible {
        confidence = (confidence + VISIBILITY_BONUS).min(0.97);
        reason = format!("{reason}; article became visible only after headless render");
    }
    if rendered.lazy_image_count > 0 {
        reason = format!("{reason}; {} lazy-loaded image(s) resolved on render", rendered.lazy_image_count);
    }

    Some((StageResult { stage: "headless", label, confidence, reason }, rendered))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_lazy_images_and_detects_visible_article() {
        let html = r#"<html><body>
            <article><p>this article has enough rendered words to count as visible content here now</p></article>
            <img src="a.jpg" loading="lazy"><img data-src="b.jpg">
        </body></html>"#;
        let thresholds = Stage2Thresholds { min_article_word_count: 5, ..Stage2Thresholds::default() };
        let rendered = compute_rendered_signals(html, &thresholds);
        assert_eq!(rendered.lazy_image_count, 2);
        assert!(rendered.article_visible);
    }

    #[test]
    fn hidden_article_container_is_not_visible() {
        let html = r#"<html><body>
            <article style="display: none;"><p>plenty of words here to pass the threshold easily yes</p></article>
        </body></html>"#;
        let thresholds = Stage2Thresholds { min_article_word_count: 5, ..Stage2Thresholds::default() };
        let rendered = compute_rendered_signals(html, &thresholds);
        assert!(!rendered.article_visible);
    }
}
