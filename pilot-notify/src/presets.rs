//! Built-in polling source presets.
//!
//! A source in config may name a `preset` (`"github/my-issues"`) or use the
//! `github = "<search query>"` shorthand instead of spelling out the MCP tool,
//! its arguments and the item id template. User keys always win over preset
//! keys; `args` is merged key by key.

use crate::error::{NotifyError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRef {
    pub mcp: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemTemplate {
    /// Id template with `{field}` placeholders filled from each item.
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    /// GitHub search query shorthand.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolRef>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub args: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item: Option<ItemTemplate>,
    /// Keys the presets do not know about, carried through untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

struct Preset {
    key: &'static str,
    name: &'static str,
    mcp: &'static str,
    tool: &'static str,
    query: Option<&'static str>,
    item_id: &'static str,
}

const GITHUB_ITEM_ID: &str = "{html_url}";

const PRESETS: [Preset; 4] = [
    Preset {
        key: "github/my-issues",
        name: "my-issues",
        mcp: "github",
        tool: "search_issues",
        query: Some("is:issue assignee:@me state:open"),
        item_id: GITHUB_ITEM_ID,
    },
    Preset {
        key: "github/review-requests",
        name: "review-requests",
        mcp: "github",
        tool: "search_issues",
        query: Some("is:pr review-requested:@me state:open"),
        item_id: GITHUB_ITEM_ID,
    },
    Preset {
        key: "github/my-prs-feedback",
        name: "my-prs-feedback",
        mcp: "github",
        tool: "search_issues",
        query: Some("is:pr author:@me state:open review:changes_requested"),
        item_id: GITHUB_ITEM_ID,
    },
    // teamId and assigneeId have no sensible default and come from the user.
    Preset {
        key: "linear/my-issues",
        name: "my-issues",
        mcp: "linear",
        tool: "list_issues",
        query: None,
        item_id: "linear:{id}",
    },
];

impl Preset {
    fn to_source(&self) -> SourceConfig {
        let mut args = Map::new();
        if let Some(query) = self.query {
            args.insert("q".to_string(), Value::String(query.to_string()));
        }
        SourceConfig {
            name: Some(self.name.to_string()),
            tool: Some(ToolRef {
                mcp: self.mcp.to_string(),
                name: self.tool.to_string(),
            }),
            args,
            item: Some(ItemTemplate {
                id: self.item_id.to_string(),
            }),
            ..SourceConfig::default()
        }
    }
}

pub fn get_preset(key: &str) -> Option<SourceConfig> {
    PRESETS
        .iter()
        .find(|preset| preset.key == key)
        .map(Preset::to_source)
}

pub fn list_presets() -> Vec<&'static str> {
    PRESETS.iter().map(|preset| preset.key).collect()
}

/// Merge `user` over the named preset. The `preset` key is dropped.
pub fn expand_preset(key: &str, user: &SourceConfig) -> Result<SourceConfig> {
    let base = get_preset(key).ok_or_else(|| NotifyError::UnknownPreset(key.to_string()))?;
    let mut args = base.args;
    args.extend(user.args.clone());
    Ok(SourceConfig {
        name: user.name.clone().or(base.name),
        preset: None,
        github: user.github.clone(),
        tool: user.tool.clone().or(base.tool),
        args,
        item: user.item.clone().or(base.item),
        extra: user.extra.clone(),
    })
}

/// Turn `github = "<query>"` into a full `search_issues` source. The
/// shorthand replaces any `tool`, `args` or `item` the user also set.
pub fn expand_github_shorthand(query: &str, user: &SourceConfig) -> SourceConfig {
    let mut args = Map::new();
    args.insert("q".to_string(), Value::String(query.to_string()));
    SourceConfig {
        github: None,
        tool: Some(ToolRef {
            mcp: "github".to_string(),
            name: "search_issues".to_string(),
        }),
        args,
        item: Some(ItemTemplate {
            id: GITHUB_ITEM_ID.to_string(),
        }),
        ..user.clone()
    }
}

/// Expand whichever shorthand a source uses; a preset takes precedence
/// over the `github` shorthand, and plain sources pass through.
pub fn resolve_source(source: &SourceConfig) -> Result<SourceConfig> {
    match (source.preset.as_deref(), source.github.as_deref()) {
        (Some(key), _) => expand_preset(key, source),
        (None, Some(query)) => Ok(expand_github_shorthand(query, source)),
        (None, None) => Ok(source.clone()),
    }
}
