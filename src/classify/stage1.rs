//! Stage 1: pure-string URL signals evaluated against the decision tree.
//! Cheap — no I/O, no allocation beyond the signal struct and reason string.

use super::tree::{compute_url_signals, DecisionTree};
use super::types::StageResult;

#[must_use]
pub fn evaluate(url: &str, tree: &DecisionTree) -> StageResult {
    let signals = compute_url_signals(url);
    let (label, confidence, reason) = tree.evaluate(url, &signals);
    StageResult { stage: "url", label, confidence, reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dated_article_path_scores_high() {
        let tree = DecisionTree::default_tree();
        let result = evaluate("https://example.com/world/2024/jan/15/story-alpha", &tree);
        assert_eq!(result.stage, "url");
        assert_eq!(result.label, super::super::types::Label::Article);
    }
}
