//! Readiness evaluation for work items (issues, pull requests, meetings).
//!
//! Items are loosely-shaped JSON. Checks run in a fixed order and the first
//! failing check decides the reason.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub labels: LabelRules,
    pub fields: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LabelRules {
    pub required: Vec<String>,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    pub ready: bool,
    pub reason: Option<String>,
}

impl Readiness {
    fn ready() -> Self {
        Self {
            ready: true,
            reason: None,
        }
    }

    fn blocked(reason: String) -> Self {
        Self {
            ready: false,
            reason: Some(reason),
        }
    }
}

pub fn evaluate_readiness(item: &Value, config: &ReadinessConfig) -> Readiness {
    let checks: [fn(&Value, &ReadinessConfig) -> Readiness; 3] =
        [check_labels, check_bot_comments, check_fields];
    for check in checks {
        let result = check(item, config);
        if !result.ready {
            return result;
        }
    }
    Readiness::ready()
}

pub fn check_labels(item: &Value, config: &ReadinessConfig) -> Readiness {
    let labels = item_labels(item);
    let has = |wanted: &str| labels.iter().any(|label| label.eq_ignore_ascii_case(wanted));

    if let Some(blocking) = config.labels.exclude.iter().find(|label| has(label.as_str())) {
        return Readiness::blocked(format!("has blocking label: {blocking}"));
    }
    let missing: Vec<&str> = config
        .labels
        .required
        .iter()
        .filter(|label| !has(label.as_str()))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Readiness::blocked(format!("missing required labels: {}", missing.join(", ")));
    }
    Readiness::ready()
}

/// Skipped unless the item carries a non-empty `_comments` array.
pub fn check_bot_comments(item: &Value, _config: &ReadinessConfig) -> Readiness {
    let Some(comments) = item.get("_comments").and_then(Value::as_array) else {
        return Readiness::ready();
    };
    if comments.is_empty() {
        return Readiness::ready();
    }
    let author = item
        .pointer("/user/login")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let has_human_feedback = comments.iter().any(|comment| {
        let login = comment
            .pointer("/user/login")
            .and_then(Value::as_str)
            .unwrap_or_default();
        !is_bot(comment) && !login.is_empty() && login != author
    });
    if has_human_feedback {
        Readiness::ready()
    } else {
        Readiness::blocked("only bot or author comments, no human feedback yet".to_string())
    }
}

pub fn check_fields(item: &Value, config: &ReadinessConfig) -> Readiness {
    for (field, expected) in &config.fields {
        match item.get(field) {
            Some(actual) if actual == expected => {}
            Some(actual) => {
                return Readiness::blocked(format!(
                    "field {field} is {actual}, expected {expected}"
                ));
            }
            None => {
                return Readiness::blocked(format!("field {field} is missing, expected {expected}"));
            }
        }
    }
    Readiness::ready()
}

fn item_labels(item: &Value) -> Vec<&str> {
    item.get("labels")
        .and_then(Value::as_array)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|label| match label {
                    Value::String(name) => Some(name.as_str()),
                    Value::Object(obj) => obj.get("name").and_then(Value::as_str),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn is_bot(comment: &Value) -> bool {
    let kind = comment.pointer("/user/type").and_then(Value::as_str);
    let login = comment
        .pointer("/user/login")
        .and_then(Value::as_str)
        .unwrap_or_default();
    kind == Some("Bot") || login.ends_with("[bot]")
}
