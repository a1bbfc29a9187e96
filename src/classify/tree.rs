//! Stage 1's decision tree: rules live as versioned JSON, validated against a schema
//! (required fields per node, valid operator set, confidence in `[0,1]`), and compiled
//! once into this interpretable form rather than recompiled per evaluation. Mirrors
//! `config/builder.rs`'s `compile_signature`: fallible construction up front, cheap
//! evaluation after.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::types::UrlSignals;

/// On-disk shape. Deserialized directly from the configured JSON document, then compiled
/// into `DecisionTree` (which holds real `Regex` values instead of pattern strings).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionTreeSpec {
    pub schema_version: u32,
    pub root: String,
    pub nodes: HashMap<String, NodeSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeSpec {
    Branch {
        condition: ConditionSpec,
        if_true: String,
        if_false: String,
    },
    Result {
        label: String,
        confidence: f64,
        reason: String,
    },
    Ref {
        target: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ConditionSpec {
    UrlMatches { pattern: String },
    TextContains { value: String },
    Compare { field: String, cmp: CompareOp, value: f64 },
    Flag { name: String },
    And { conditions: Vec<ConditionSpec> },
    Or { conditions: Vec<ConditionSpec> },
    Not { condition: Box<ConditionSpec> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

/// Compiled condition: patterns are pre-built `Regex`es, numeric field names are resolved
/// to an accessor over `UrlSignals` at compile time so evaluation never touches strings.
enum Condition {
    UrlMatches(Regex),
    TextContains(String),
    Compare { field: Field, cmp: CompareOp, value: f64 },
    Flag(Flag),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

#[derive(Clone, Copy)]
enum Field {
    PathDepth,
    SlugLength,
}

#[derive(Clone, Copy)]
enum Flag {
    HasDatePath,
    HasQuery,
    HasNumericId,
    ExtensionIsHtml,
}

fn compile_field(name: &str) -> Result<Field> {
    match name {
        "path_depth" => Ok(Field::PathDepth),
        "slug_length" => Ok(Field::SlugLength),
        other => bail!("unknown compare field '{other}'"),
    }
}

fn compile_flag(name: &str) -> Result<Flag> {
    match name {
        "has_date_path" => Ok(Flag::HasDatePath),
        "has_query" => Ok(Flag::HasQuery),
        "has_numeric_id" => Ok(Flag::HasNumericId),
        "extension_is_html" => Ok(Flag::ExtensionIsHtml),
        other => bail!("unknown flag '{other}'"),
    }
}

fn compile_condition(spec: &ConditionSpec) -> Result<Condition> {
    Ok(match spec {
        ConditionSpec::UrlMatches { pattern } => Condition::UrlMatches(
            Regex::new(pattern).with_context(|| format!("invalid url_matches pattern '{pattern}'"))?,
        ),
        ConditionSpec::TextContains { value } => Condition::TextContains(value.to_lowercase()),
        ConditionSpec::Compare { field, cmp, value } => Condition::Compare {
            field: compile_field(field)?,
            cmp: *cmp,
            value: *value,
        },
        ConditionSpec::Flag { name } => Condition::Flag(compile_flag(name)?),
        ConditionSpec::And { conditions } => {
            Condition::And(conditions.iter().map(compile_condition).collect::<Result<_>>()?)
        }
        ConditionSpec::Or { conditions } => {
            Condition::Or(conditions.iter().map(compile_condition).collect::<Result<_>>()?)
        }
        ConditionSpec::Not { condition } => Condition::Not(Box::new(compile_condition(condition)?)),
    })
}

fn eval_condition(cond: &Condition, url: &str, signals: &UrlSignals) -> bool {
    match cond {
        Condition::UrlMatches(re) => re.is_match(url),
        Condition::TextContains(needle) => url.to_lowercase().contains(needle.as_str()),
        Condition::Compare { field, cmp, value } => {
            let actual = match field {
                Field::PathDepth => f64::from(signals.path_depth),
                Field::SlugLength => f64::from(signals.slug_length),
            };
            match cmp {
                CompareOp::Gt => actual > *value,
                CompareOp::Gte => actual >= *value,
                CompareOp::Lt => actual < *value,
                CompareOp::Lte => actual <= *value,
                CompareOp::Eq => (actual - *value).abs() < f64::EPSILON,
            }
        }
        Condition::Flag(flag) => match flag {
            Flag::HasDatePath => signals.has_date_path,
            Flag::HasQuery => signals.has_query,
            Flag::HasNumericId => signals.has_numeric_id,
            Flag::ExtensionIsHtml => signals
                .extension
                .as_deref()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("html") || ext.eq_ignore_ascii_case("htm")),
        },
        Condition::And(parts) => parts.iter().all(|c| eval_condition(c, url, signals)),
        Condition::Or(parts) => parts.iter().any(|c| eval_condition(c, url, signals)),
        Condition::Not(inner) => !eval_condition(inner, url, signals),
    }
}

enum Node {
    Branch { condition: Condition, if_true: String, if_false: String },
    Result { label: super::types::Label, confidence: f64, reason: String },
    Ref(String),
}

/// A compiled, ready-to-evaluate decision tree.
pub struct DecisionTree {
    nodes: HashMap<String, Node>,
    root: String,
}

/// At most this many hops before evaluation gives up (guards against a cyclic `ref` chain
/// that slipped past `validate_spec`'s static check — defence at the interpreter boundary).
const MAX_HOPS: usize = 64;

impl DecisionTree {
    /// Compile and validate a spec. Rejects: unknown operators, out-of-range confidence,
    /// references to node ids that don't exist, and a missing root.
    pub fn compile(spec: &DecisionTreeSpec) -> Result<Self> {
        if !spec.nodes.contains_key(&spec.root) {
            bail!("decision tree root '{}' is not a defined node", spec.root);
        }

        let mut nodes = HashMap::with_capacity(spec.nodes.len());
        for (id, node_spec) in &spec.nodes {
            let node = match node_spec {
                NodeSpec::Branch { condition, if_true, if_false } => {
                    if !spec.nodes.contains_key(if_true) {
                        bail!("branch '{id}' references undefined if_true node '{if_true}'");
                    }
                    if !spec.nodes.contains_key(if_false) {
                        bail!("branch '{id}' references undefined if_false node '{if_false}'");
                    }
                    Node::Branch {
                        condition: compile_condition(condition)?,
                        if_true: if_true.clone(),
                        if_false: if_false.clone(),
                    }
                }
                NodeSpec::Result { label, confidence, reason } => {
                    if !(0.0..=1.0).contains(confidence) {
                        bail!("result node '{id}' has confidence {confidence} outside [0,1]");
                    }
                    let label = match label.as_str() {
                        "article" => super::types::Label::Article,
                        "hub" => super::types::Label::Hub,
                        "nav" => super::types::Label::Nav,
                        "unknown" => super::types::Label::Unknown,
                        other => bail!("result node '{id}' has unknown label '{other}'"),
                    };
                    Node::Result { label, confidence: *confidence, reason: reason.clone() }
                }
                NodeSpec::Ref { target } => {
                    if !spec.nodes.contains_key(target) {
                        bail!("ref node '{id}' targets undefined node '{target}'");
                    }
                    Node::Ref(target.clone())
                }
            };
            nodes.insert(id.clone(), node);
        }

        Ok(Self { nodes, root: spec.root.clone() })
    }

    pub fn load_from_path(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading decision tree at {}", path.display()))?;
        let spec: DecisionTreeSpec = serde_json::from_str(&raw)
            .with_context(|| format!("parsing decision tree at {}", path.display()))?;
        Self::compile(&spec)
    }

    /// Evaluate the tree against a URL, returning `(label, confidence, reason)`.
    pub fn evaluate(&self, url: &str, signals: &UrlSignals) -> (super::types::Label, f64, String) {
        let mut current = self.root.as_str();
        for _ in 0..MAX_HOPS {
            match self.nodes.get(current) {
                Some(Node::Result { label, confidence, reason }) => {
                    return (*label, *confidence, reason.clone());
                }
                Some(Node::Ref(target)) => current = target,
                Some(Node::Branch { condition, if_true, if_false }) => {
                    current = if eval_condition(condition, url, signals) { if_true } else { if_false };
                }
                None => {
                    return (super::types::Label::Unknown, 0.0, format!("dangling node '{current}'"));
                }
            }
        }
        (super::types::Label::Unknown, 0.0, "decision tree exceeded max hops".to_string())
    }

    /// Built-in default tree used when no `decision_tree_path` is configured. Encodes the
    /// obvious URL heuristics: dated article paths score high confidence, short undated
    /// paths read as navigation/hub.
    #[must_use]
    pub fn default_tree() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            "root".to_string(),
            Node::Branch {
                condition: Condition::Flag(Flag::HasDatePath),
                if_true: "dated_depth_check".to_string(),
                if_false: "undated_depth_check".to_string(),
            },
        );
        nodes.insert(
            "dated_depth_check".to_string(),
            Node::Branch {
                condition: Condition::Compare { field: Field::PathDepth, cmp: CompareOp::Gte, value: 3.0 },
                if_true: "article_high".to_string(),
                if_false: "article_medium".to_string(),
            },
        );
        nodes.insert(
            "article_high".to_string(),
            Node::Result {
                label: super::types::Label::Article,
                confidence: 0.85,
                reason: "dated path with depth >= 3".to_string(),
            },
        );
        nodes.insert(
            "article_medium".to_string(),
            Node::Result {
                label: super::types::Label::Article,
                confidence: 0.6,
                reason: "dated path, shallow depth".to_string(),
            },
        );
        nodes.insert(
            "undated_depth_check".to_string(),
            Node::Branch {
                condition: Condition::Compare { field: Field::PathDepth, cmp: CompareOp::Lte, value: 1.0 },
                if_true: "hub_guess".to_string(),
                if_false: "slug_check".to_string(),
            },
        );
        nodes.insert(
            "hub_guess".to_string(),
            Node::Result {
                label: super::types::Label::Hub,
                confidence: 0.55,
                reason: "undated, shallow path".to_string(),
            },
        );
        nodes.insert(
            "slug_check".to_string(),
            Node::Branch {
                condition: Condition::And(vec![
                    Condition::Flag(Flag::HasNumericId),
                    Condition::Compare { field: Field::SlugLength, cmp: CompareOp::Gte, value: 20.0 },
                ]),
                if_true: "article_medium".to_string(),
                if_false: "unknown_guess".to_string(),
            },
        );
        nodes.insert(
            "unknown_guess".to_string(),
            Node::Result { label: super::types::Label::Unknown, confidence: 0.3, reason: "no strong url signal".to_string() },
        );

        Self { nodes, root: "root".to_string() }
    }
}

/// Compute `UrlSignals` from a normalized URL string.
#[must_use]
pub fn compute_url_signals(url: &str) -> UrlSignals {
    let date_path_re: &Regex = {
        static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
        RE.get_or_init(|| {
            Regex::new(r"/(19|20)\d{2}/([01]?\d|[a-zA-Z]{3})/([0-3]?\d)(/|$)")
                .expect("BUG: hardcoded date-path regex is invalid")
        })
    };
    let numeric_id_re: &Regex = {
        static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
        RE.get_or_init(|| Regex::new(r"\d{4,}").expect("BUG: hardcoded numeric-id regex is invalid"))
    };

    let parsed = url::Url::parse(url).ok();
    let path = parsed.as_ref().map(|u| u.path().to_string()).unwrap_or_default();
    let has_query = parsed.as_ref().is_some_and(|u| u.query().is_some());

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let path_depth = segments.len() as u32;
    let last_segment = segments.last().copied().unwrap_or("");
    let (stem, extension) = match last_segment.rsplit_once('.') {
        Some((stem, ext)) if !ext.is_empty() && ext.len() <= 5 => (stem, Some(ext.to_string())),
        _ => (last_segment, None),
    };

    UrlSignals {
        path_depth,
        slug_length: stem.len() as u32,
        has_date_path: date_path_re.is_match(&path),
        has_query,
        has_numeric_id: numeric_id_re.is_match(last_segment),
        extension,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_tree_scores_dated_deep_article_high() {
        let tree = DecisionTree::default_tree();
        let url = "https://example.com/world/2024/jan/15/story-alpha";
        let signals = compute_url_signals(url);
        assert!(signals.has_date_path);
        let (label, confidence, _) = tree.evaluate(url, &signals);
        assert_eq!(label, super::super::types::Label::Article);
        assert!(confidence >= 0.8);
    }

    #[test]
    fn default_tree_scores_shallow_undated_as_hub() {
        let tree = DecisionTree::default_tree();
        let url = "https://example.com/world";
        let signals = compute_url_signals(url);
        let (label, _, _) = tree.evaluate(url, &signals);
        assert_eq!(label, super::super::types::Label::Hub);
    }

    #[test]
    fn compile_rejects_dangling_branch_target() {
        let mut nodes = HashMap::new();
        nodes.insert(
            "root".to_string(),
            NodeSpec::Branch {
                condition: ConditionSpec::Flag { name: "has_date_path".to_string() },
                if_true: "missing".to_string(),
                if_false: "missing".to_string(),
            },
        );
        let spec = DecisionTreeSpec { schema_version: 1, root: "root".to_string(), nodes };
        assert!(DecisionTree::compile(&spec).is_err());
    }

    #[test]
    fn compile_rejects_out_of_range_confidence() {
        let mut nodes = HashMap::new();
        nodes.insert(
            "root".to_string(),
            NodeSpec::Result { label: "article".to_string(), confidence: 1.5, reason: "bad".to_string() },
        );
        let spec = DecisionTreeSpec { schema_version: 1, root: "root".to_string(), nodes };
        assert!(DecisionTree::compile(&spec).is_err());
    }

    #[test]
    fn evaluate_is_deterministic_for_same_url() {
        let tree = DecisionTree::default_tree();
        let url = "https://example.com/world/2024/jan/15/story-alpha";
        let signals = compute_url_signals(url);
        let first = tree.evaluate(url, &signals);
        let second = tree.evaluate(url, &signals);
        assert_eq!(first.0, second.0);
        assert!((first.1 - second.1).abs() < f64::EPSILON);
    }
}
