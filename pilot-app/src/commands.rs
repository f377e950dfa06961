//! One-shot CLI actions that run against a live broker or the notifier.

use crate::config::PilotConfig;
use anyhow::{Result, anyhow};
use pilot_auth::TokenAuthority;
use pilot_ipc::{ClientOptions, ConnectionState, PermissionResponse, SessionClient};
use pilot_notify::{
    CallbackCredential, Notification, Notifier, NtfyNotifier, PermissionPrompt, evaluate_readiness,
    list_presets, permission_notification,
};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Sleep;

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);
const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_millis(250);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct AskRequest {
    pub session_id: Option<String>,
    pub permission_id: Option<String>,
    pub tool: String,
    pub description: String,
    pub use_token: bool,
    pub wait: Duration,
}

fn notifier_from_config(cfg: &PilotConfig) -> Result<NtfyNotifier> {
    Ok(NtfyNotifier::new(&cfg.ntfy.server, cfg.ntfy_topic()?)?
        .with_auth_token(cfg.ntfy.token.clone())
        .with_timeout(Duration::from_secs(cfg.runtime.http_timeout_seconds))?)
}

/// Act as an agent session: register with the broker, push an approval
/// notification and wait for the routed decision.
pub async fn ask(config_path: Option<PathBuf>, request: AskRequest) -> Result<()> {
    let cfg = PilotConfig::load(config_path).await?;
    let notifier = notifier_from_config(&cfg)?;
    let session_id = request
        .session_id
        .unwrap_or_else(|| format!("cli-{}", uuid::Uuid::new_v4()));
    let permission_id = request
        .permission_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let (client, mut responses) = SessionClient::new(
        ClientOptions::new(&cfg.broker.socket_path).with_connect_retry(Some(CONNECT_RETRY_DELAY)),
    );
    client
        .connect(&session_id)
        .await
        .map_err(|e| anyhow!("connect to broker at {}: {e}", cfg.broker.socket_path.display()))?;

    let credential = if request.use_token {
        let secret = cfg.callback.secret.as_deref().ok_or_else(|| {
            anyhow!("--token requires NTFY_CALLBACK_SECRET to be shared with the server")
        })?;
        let tokens = TokenAuthority::new(secret)?.with_ttl(cfg.token_ttl());
        CallbackCredential::Token(tokens.issue(&session_id, &permission_id)?)
    } else {
        CallbackCredential::Nonce(client.request_nonce(&permission_id).await?)
    };

    let callback_url = cfg.callback_base_url();
    let notification = permission_notification(&PermissionPrompt {
        callback_url: &callback_url,
        credential: &credential,
        tool: &request.tool,
        description: &request.description,
    })?;
    notifier.send(notification).await?;
    tracing::info!(session_id, permission_id, notifier = notifier.name(), "approval requested");
    println!("waiting for decision on {permission_id} (session {session_id})");

    let decision = wait_for_decision(&client, &mut responses, &permission_id, request.wait).await?;
    println!("{}", decision.response);
    client.disconnect();
    Ok(())
}

/// Keep the session registered while waiting. Reconnects are triggered by
/// the client's state dropping to `Disconnected` and retried with
/// exponential backoff until one succeeds.
async fn wait_for_decision(
    client: &SessionClient,
    responses: &mut mpsc::UnboundedReceiver<PermissionResponse>,
    permission_id: &str,
    wait: Duration,
) -> Result<PermissionResponse> {
    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);
    let mut state = client.watch_state();
    let mut backoff = RECONNECT_BACKOFF_INITIAL;
    let mut retry: Option<Pin<Box<Sleep>>> = (*state.borrow_and_update()
        == ConnectionState::Disconnected
        && client.session_id().is_some())
    .then(|| Box::pin(tokio::time::sleep(Duration::ZERO)));

    loop {
        tokio::select! {
            _ = &mut deadline => {
                return Err(anyhow!("no decision for {permission_id} within {}s", wait.as_secs()));
            }
            response = responses.recv() => match response {
                Some(response) if response.permission_id == permission_id => return Ok(response),
                Some(other) => {
                    tracing::debug!(permission_id = %other.permission_id, "ignoring decision for another request");
                }
                None => return Err(anyhow!("session client closed")),
            },
            changed = state.changed(), if retry.is_none() => {
                if changed.is_err() {
                    return Err(anyhow!("session client closed"));
                }
                if *state.borrow_and_update() == ConnectionState::Disconnected {
                    tracing::warn!(retry_in_ms = backoff.as_millis() as u64, "broker connection lost; reconnecting");
                    retry = Some(Box::pin(tokio::time::sleep(backoff)));
                }
            }
            _ = async {
                match retry.as_mut() {
                    Some(sleep) => sleep.await,
                    None => std::future::pending().await,
                }
            }, if retry.is_some() => {
                if client.try_reconnect().await {
                    tracing::info!("broker connection restored");
                    backoff = RECONNECT_BACKOFF_INITIAL;
                    retry = None;
                } else {
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
                    tracing::warn!(retry_in_ms = backoff.as_millis() as u64, "broker reconnect failed");
                    retry = Some(Box::pin(tokio::time::sleep(backoff)));
                }
            }
        }
    }
}

pub async fn notify(
    config_path: Option<PathBuf>,
    title: &str,
    message: &str,
    priority: Option<u8>,
    tags: Vec<String>,
) -> Result<()> {
    let cfg = PilotConfig::load(config_path).await?;
    let notifier = notifier_from_config(&cfg)?;
    let mut notification = Notification::new(title, message).with_tags(tags);
    if let Some(priority) = priority {
        notification = notification.with_priority(priority);
    }
    notifier.send(notification).await?;
    println!("sent");
    Ok(())
}

/// Evaluate readiness for a JSON item file against the configured rules.
pub async fn check_ready(config_path: Option<PathBuf>, item_path: &Path) -> Result<()> {
    let cfg = PilotConfig::load(config_path).await?;
    let contents = tokio::fs::read_to_string(item_path)
        .await
        .map_err(|e| anyhow!("read item {}: {e}", item_path.display()))?;
    let item: serde_json::Value = serde_json::from_str(&contents)
        .map_err(|e| anyhow!("parse item {}: {e}", item_path.display()))?;
    let readiness = evaluate_readiness(&item, &cfg.readiness);
    println!(
        "{}",
        serde_json::json!({ "ready": readiness.ready, "reason": readiness.reason })
    );
    Ok(())
}

/// Print the built-in presets and the configured sources, expanded.
pub async fn sources(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = PilotConfig::load(config_path).await?;
    let resolved = cfg.resolved_sources()?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "presets": list_presets(),
            "sources": resolved,
        }))?
    );
    Ok(())
}
