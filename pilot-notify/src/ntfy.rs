use crate::error::{NotifyError, Result};
use crate::traits::Notifier;
use crate::types::Notification;
use reqwest::Url;
use std::time::Duration;

pub const DEFAULT_NTFY_SERVER: &str = "https://ntfy.sh";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_TOPIC_LEN: usize = 64;

/// Publishes to an ntfy server using the JSON publish API (`POST /` with the
/// topic in the body).
#[derive(Clone)]
pub struct NtfyNotifier {
    http: reqwest::Client,
    server: Url,
    topic: String,
    auth_token: Option<String>,
}

impl std::fmt::Debug for NtfyNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NtfyNotifier")
            .field("server", &self.server.as_str())
            .field("topic", &self.topic)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl NtfyNotifier {
    pub fn new(server: &str, topic: &str) -> Result<Self> {
        let server = normalize_server_url(server)?;
        let topic = normalize_topic(topic)?;
        let http = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            http,
            server,
            topic,
            auth_token: None,
        })
    }

    pub fn with_auth_token(mut self, auth_token: Option<String>) -> Self {
        self.auth_token = auth_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(ToOwned::to_owned);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    fn payload(&self, notification: &Notification) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "topic": self.topic,
            "title": notification.title,
            "message": notification.message,
            "priority": notification.priority,
        });
        if !notification.tags.is_empty() {
            payload["tags"] = serde_json::json!(notification.tags);
        }
        if !notification.actions.is_empty() {
            payload["actions"] = serde_json::json!(notification.actions);
        }
        payload
    }

    fn authorized_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth_token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait::async_trait]
impl Notifier for NtfyNotifier {
    fn name(&self) -> &str {
        "ntfy"
    }

    #[tracing::instrument(level = "debug", skip_all, fields(topic = %self.topic))]
    async fn send(&self, notification: Notification) -> Result<()> {
        if notification.message.trim().is_empty() && notification.title.trim().is_empty() {
            return Err(NotifyError::InvalidNotification(
                "title and message are both empty".to_string(),
            ));
        }
        let response = self
            .authorized_request(self.http.post(self.server.clone()))
            .json(&self.payload(&notification))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                provider: "ntfy",
                status: status.as_u16(),
                body,
            });
        }
        tracing::debug!(
            actions = notification.actions.len(),
            "ntfy notification published"
        );
        Ok(())
    }
}

fn normalize_server_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(NotifyError::InvalidConfig("ntfy server is required".to_string()));
    }
    let parsed = Url::parse(trimmed)
        .map_err(|e| NotifyError::InvalidConfig(format!("invalid ntfy server: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(NotifyError::InvalidConfig(format!(
            "invalid ntfy server scheme: {other}"
        ))),
    }
}

fn normalize_topic(raw: &str) -> Result<String> {
    let topic = raw.trim();
    if topic.is_empty() {
        return Err(NotifyError::InvalidConfig("ntfy topic is required".to_string()));
    }
    if topic.len() > MAX_TOPIC_LEN
        || !topic
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(NotifyError::InvalidConfig(format!(
            "invalid ntfy topic: {topic}"
        )));
    }
    Ok(topic.to_string())
}
