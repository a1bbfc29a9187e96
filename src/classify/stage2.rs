//! Stage 2: HTML-only content signals. Parses with `scraper`, using
//! `LazyLock<Selector>` statics the same way `content_saver/markdown_converter/
//! html_preprocessing/main_content_extraction.rs` pre-parses its selectors once rather than
//! re-compiling them per document.

use std::sync::LazyLock;

use scraper::{Html, Selector};

use crate::config::Stage2Thresholds;

use super::types::{ContentSignals, Label, StageResult};

static PARAGRAPH: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("p").expect("BUG: hardcoded CSS selector 'p' is invalid"));
static ANCHOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("BUG: hardcoded CSS selector 'a[href]' is invalid"));
static NAV_ANCHOR: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("nav a[href], header a[href], footer a[href], [role='navigation'] a[href]")
        .expect("BUG: hardcoded CSS selector for nav anchors is invalid")
});
static HEADING: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("h1, h2, h3, h4, h5, h6").expect("BUG: hardcoded CSS selector for headings is invalid")
});
static LD_JSON: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"script[type="application/ld+json"]"#)
        .expect("BUG: hardcoded CSS selector for ld+json is invalid")
});
static ITEMTYPE_ARTICLE: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(
        "[itemtype$='Article'], [itemtype$='NewsArticle'], [itemtype$='BlogPosting'], article",
    )
    .expect("BUG: hardcoded CSS selector for itemtype article is invalid")
});
static ARTICLE_BODY_PROPERTY: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("[itemprop='articleBody']")
        .expect("BUG: hardcoded CSS selector for articleBody is invalid")
});

fn text_word_count(el: scraper::ElementRef<'_>) -> usize {
    el.text().collect::<String>().split_whitespace().count()
}

fn has_schema_article_jsonld(doc: &Html) -> bool {
    doc.select(&LD_JSON).any(|el| {
        let text = el.text().collect::<String>();
        text.contains("\"Article\"") || text.contains("\"NewsArticle\"") || text.contains("\"BlogPosting\"")
    })
}

/// Compute `ContentSignals` from a raw (or rendered) HTML document.
#[must_use]
pub fn compute_content_signals(html: &str) -> ContentSignals {
    let doc = Html::parse_document(html);

    let word_count = text_word_count(doc.root_element());
    let paragraph_count = doc.select(&PARAGRAPH).count();
    let link_count = doc.select(&ANCHOR).count();
    let nav_link_count = doc.select(&NAV_ANCHOR).count();
    let heading_count = doc.select(&HEADING).count();

    let linked_words: usize = doc.select(&ANCHOR).map(text_word_count).sum();
    let link_density = if word_count == 0 { 0.0 } else { linked_words as f64 / word_count as f64 };
    let nav_link_ratio = if link_count == 0 { 0.0 } else { nav_link_count as f64 / link_count as f64 };

    let has_schema_article =
        has_schema_article_jsonld(&doc) || doc.select(&ITEMTYPE_ARTICLE).next().is_some();
    let has_article_body_property = doc.select(&ARTICLE_BODY_PROPERTY).next().is_some();

    ContentSignals {
        word_count,
        paragraph_count,
        link_count,
        nav_link_count,
        heading_count,
        link_density,
        nav_link_ratio,
        has_schema_article,
        has_article_body_property,
    }
}

/// Rule-based thresholds producing a label + base confidence, with boosts for schema
/// presence.
#[must_use]
pub fn classify_signals(signals: &ContentSignals, thresholds: &Stage2Thresholds) -> (Label, f64, String) {
    if signals.has_schema_article || signals.has_article_body_property {
        let bonus = if signals.word_count >= thresholds.high_word_count { 0.1 } else { 0.0 };
        return (
            Label::Article,
            (0.85_f64 + bonus).min(0.97),
            "schema.org article / articleBody property present".to_string(),
        );
    }

    if signals.word_count >= thresholds.min_article_word_count
        && signals.paragraph_count >= thresholds.min_article_paragraphs
        && signals.link_density <= thresholds.max_article_link_density
    {
        let over_high = signals.word_count >= thresholds.high_word_count;
        let confidence = if over_high { 0.82 } else { 0.68 };
        return (Label::Article, confidence, "word count and paragraph count above article thresholds".to_string());
    }

    if signals.nav_link_ratio >= thresholds.min_nav_link_density || signals.link_density >= 0.5 {
        return (Label::Nav, 0.65, "link density dominated by navigational anchors".to_string());
    }

    if signals.paragraph_count == 0 && signals.link_count > 0 {
        return (Label::Hub, 0.55, "no paragraph text but links present".to_string());
    }

    (Label::Unknown, 0.3, "no content signal crossed a classification threshold".to_string())
}

#[must_use]
pub fn evaluate(html: &str, thresholds: &Stage2Thresholds) -> StageResult {
    evaluate_signals(&compute_content_signals(html), thresholds)
}

/// Same as `evaluate`, for callers that already computed `ContentSignals` (e.g. the
/// cascade, which reuses them as the prior-signals baseline for stage 3).
#[must_use]
pub fn evaluate_signals(signals: &ContentSignals, thresholds: &Stage2Thresholds) -> StageResult {
    let (label, confidence, reason) = classify_signals(signals, thresholds);
    StageResult { stage: "content", label, confidence, reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article_html(word_count: usize) -> String {
        let body: String = std::iter::repeat("word ").take(word_count).collect();
        format!(
            r#"<html><head><script type="application/ld+json">{{"@type":"NewsArticle"}}</script></head>
            <body><article><p>{body}</p><p>more text here to pad paragraphs out nicely</p><p>third paragraph</p></article></body></html>"#
        )
    }

    #[test]
    fn schema_article_scores_high_confidence() {
        let html = article_html(800);
        let thresholds = Stage2Thresholds::default();
        let result = evaluate(&html, &thresholds);
        assert_eq!(result.label, Label::Article);
        assert!(result.confidence >= 0.9);
    }

    #[test]
    fn nav_heavy_page_scores_nav() {
        let html = r#"<html><body><nav>
            <a href="/a">A</a><a href="/b">B</a><a href="/c">C</a><a href="/d">D</a>
            </nav></body></html>"#;
        let thresholds = Stage2Thresholds::default();
        let result = evaluate(html, &thresholds);
        assert_eq!(result.label, Label::Nav);
    }

    #[test]
    fn empty_page_is_unknown() {
        let thresholds = Stage2Thresholds::default();
        let result = evaluate("<html><body></body></html>", &thresholds);
        assert_eq!(result.label, Label::Unknown);
    }
}
