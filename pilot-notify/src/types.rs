use crate::error::{NotifyError, Result};
use pilot_auth::Decision;
use reqwest::Url;
use serde::{Deserialize, Serialize};

/// ntfy priority scale is 1 (min) to 5 (max).
pub const DEFAULT_PRIORITY: u8 = 3;
const PERMISSION_PRIORITY: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<NotificationAction>,
}

impl Notification {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            priority: DEFAULT_PRIORITY,
            tags: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 5);
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// An ntfy `http` action button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub label: String,
    pub url: String,
    pub method: String,
    pub clear: bool,
}

impl NotificationAction {
    pub fn http_post(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            action: "http".to_string(),
            label: label.into(),
            url: url.into(),
            method: "POST".to_string(),
            clear: true,
        }
    }
}

/// Credential embedded in callback links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackCredential {
    Nonce(String),
    Token(String),
}

impl CallbackCredential {
    fn query_key(&self) -> &'static str {
        match self {
            Self::Nonce(_) => "nonce",
            Self::Token(_) => "token",
        }
    }

    fn value(&self) -> &str {
        match self {
            Self::Nonce(value) | Self::Token(value) => value,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PermissionPrompt<'a> {
    pub callback_url: &'a str,
    pub credential: &'a CallbackCredential,
    pub tool: &'a str,
    pub description: &'a str,
}

/// Build the three-button approval notification. Each button POSTs to the
/// callback URL with the credential and its decision in the query string.
pub fn permission_notification(prompt: &PermissionPrompt<'_>) -> Result<Notification> {
    let base = Url::parse(prompt.callback_url.trim())
        .map_err(|e| NotifyError::InvalidNotification(format!("invalid callback url: {e}")))?;
    if !matches!(base.scheme(), "http" | "https") {
        return Err(NotifyError::InvalidNotification(format!(
            "invalid callback url scheme: {}",
            base.scheme()
        )));
    }
    if prompt.credential.value().is_empty() {
        return Err(NotifyError::InvalidNotification(
            "callback credential is empty".to_string(),
        ));
    }

    let actions = Decision::ALL
        .iter()
        .map(|decision| {
            let mut url = base.clone();
            url.query_pairs_mut()
                .append_pair(prompt.credential.query_key(), prompt.credential.value())
                .append_pair("response", decision.as_str());
            NotificationAction::http_post(decision.label(), url.to_string())
        })
        .collect();

    let tool = prompt.tool.trim();
    let title = if tool.is_empty() {
        "Permission requested".to_string()
    } else {
        format!("Permission requested: {tool}")
    };
    Ok(Notification {
        title,
        message: prompt.description.trim().to_string(),
        priority: PERMISSION_PRIORITY,
        tags: vec!["lock".to_string()],
        actions,
    })
}
