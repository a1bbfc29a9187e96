//! Priority scoring contract.
//!
//! `base = typeWeight[kind] + depth + bias + discoveredAt * 1e-9`, then discounted by
//! discovery-method/gap/cluster/knowledge-reuse bonuses and optionally adjusted for
//! estimated cost, clamped to a bounded range to keep tie-breaking numerically stable.

use super::types::{ItemKind, ItemMeta};
use crate::config::PriorityConfig;

/// Priorities are clamped to this range after all bonuses/floors are applied.
const PRIORITY_CLAMP: i64 = 1_000_000_000;

/// Pluggable scoring hooks for optional external collaborators (gap-prediction, cluster
/// boost). The engine supplies a no-op implementation by default; `crawl_type =
/// intelligent`/`gazetteer` wires in real scorers.
pub trait ScorerHooks: Send + Sync {
    fn gap_prediction_bonus(&self, _url: &crate::url::ImUrl) -> i64 {
        0
    }
    fn cluster_boost(&self, _url: &crate::url::ImUrl) -> i64 {
        0
    }
}

/// No-op scorer hooks, used for `CrawlMode::Basic` and `StructureOnly`.
pub struct NullScorerHooks;
impl ScorerHooks for NullScorerHooks {}

/// Classify an item's tokens for "total prioritisation" mode: anything carrying a token in
/// `focus_tokens` is `other` unless the token matches, in which case it is exempt from the
/// floor. `focus_tokens` empty means the mode is effectively a no-op (nothing exempted).
fn is_focus_match(meta: &ItemMeta, focus_tokens: &[String]) -> bool {
    if focus_tokens.is_empty() {
        return true;
    }
    meta.classification_tokens
        .iter()
        .any(|t| focus_tokens.iter().any(|f| f.eq_ignore_ascii_case(t)))
}

/// Compute the final priority for an item about to be enqueued. `url` is needed only for
/// the optional scorer hooks.
#[must_use]
pub fn compute_priority(
    kind: ItemKind,
    depth: u32,
    discovered_at: u64,
    meta: &ItemMeta,
    config: &PriorityConfig,
    hooks: &dyn ScorerHooks,
    url: &crate::url::ImUrl,
    focus_tokens: &[String],
) -> i64 {
    let type_weight = config
        .type_weights
        .get(kind.as_config_key())
        .copied()
        .unwrap_or(12);

    let mut score = type_weight + i64::from(depth);
    // discoveredAt * 1e-9 is a sub-millisecond tie-break nudge in the contract; at i64
    // precision this term is effectively zero for any realistic timestamp magnitude, so it
    // is folded into the enqueued-at/seq tie-break instead of carried as a fractional term.
    let _ = discovered_at;

    if let Some(method) = &meta.discovery_method {
        score -= config
            .discovery_bonuses
            .get(method.as_str())
            .copied()
            .unwrap_or(0);
    }

    score -= hooks.gap_prediction_bonus(url);
    score -= hooks.cluster_boost(url);

    if meta.knowledge_reuse {
        score -= 5;
    }

    if config.cost_aware_priority {
        if let Some(cost_ms) = meta.estimated_cost_ms {
            // Cheap items sort earlier: nudge priority down for below-average cost.
            score += (cost_ms as i64) / 100;
        }
    }

    if config.total_prioritization && !is_focus_match(meta, focus_tokens) {
        score += config.total_prioritization_floor;
    }

    score.clamp(-PRIORITY_CLAMP, PRIORITY_CLAMP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url::ImUrl;

    fn url() -> ImUrl {
        ImUrl::parse("https://example.com/a").unwrap()
    }

    #[test]
    fn article_outranks_default_kind() {
        let config = PriorityConfig::default();
        let meta = ItemMeta::default();
        let article = compute_priority(
            ItemKind::Article,
            1,
            0,
            &meta,
            &config,
            &NullScorerHooks,
            &url(),
            &[],
        );
        let default = compute_priority(
            ItemKind::Default,
            1,
            0,
            &meta,
            &config,
            &NullScorerHooks,
            &url(),
            &[],
        );
        assert!(article < default, "lower priority value dequeues first");
    }

    #[test]
    fn discovery_bonus_lowers_priority() {
        let config = PriorityConfig::default();
        let mut meta = ItemMeta::default();
        meta.discovery_method = Some("adaptive-seed".to_string());
        let with_bonus = compute_priority(
            ItemKind::Nav,
            1,
            0,
            &meta,
            &config,
            &NullScorerHooks,
            &url(),
            &[],
        );
        let without_bonus = compute_priority(
            ItemKind::Nav,
            1,
            0,
            &ItemMeta::default(),
            &config,
            &NullScorerHooks,
            &url(),
            &[],
        );
        assert!(with_bonus < without_bonus);
    }

    #[test]
    fn total_prioritization_floor_excludes_non_matching() {
        let mut config = PriorityConfig::default();
        config.total_prioritization = true;
        let meta = ItemMeta::default();
        let focus = vec!["uk".to_string()];
        let excluded = compute_priority(
            ItemKind::Article,
            0,
            0,
            &meta,
            &config,
            &NullScorerHooks,
            &url(),
            &focus,
        );
        assert!(excluded >= config.total_prioritization_floor);
    }

    #[test]
    fn priority_is_clamped() {
        let mut config = PriorityConfig::default();
        config
            .type_weights
            .insert("article".to_string(), i64::MAX / 2);
        let meta = ItemMeta::default();
        let score = compute_priority(
            ItemKind::Article,
            0,
            0,
            &meta,
            &config,
            &NullScorerHooks,
            &url(),
            &[],
        );
        assert_eq!(score, PRIORITY_CLAMP);
    }

    #[test]
    fn is_idempotent_given_identical_inputs() {
        let config = PriorityConfig::default();
        let meta = ItemMeta::default();
        let a = compute_priority(
            ItemKind::Hub,
            3,
            10,
            &meta,
            &config,
            &NullScorerHooks,
            &url(),
            &[],
        );
        let b = compute_priority(
            ItemKind::Hub,
            3,
            10,
            &meta,
            &config,
            &NullScorerHooks,
            &url(),
            &[],
        );
        assert_eq!(a, b);
    }
}
