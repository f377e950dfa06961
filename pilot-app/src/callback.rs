//! Public callback endpoint.
//!
//! `POST /callback?nonce=<v>&response=<once|always|reject>` (or `token=<t>`).
//! The credential is checked without consuming it, then the decision is
//! validated, and only then is the credential consumed and the decision
//! delivered. A request rejected for a bad decision therefore leaves the
//! credential usable, while a delivery failure after consumption does not
//! revive it.

use crate::broker::RoutingError;
use axum::extract::Query;
use axum::extract::rejection::QueryRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json, Router};
use pilot_auth::{CredentialClaims, Decision, NonceAuthority, TokenAuthority, redact};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

/// Receives decisions whose credential has been consumed.
#[async_trait::async_trait]
pub trait DecisionHandler: Send + Sync {
    async fn deliver(
        &self,
        claims: &CredentialClaims,
        decision: Decision,
    ) -> Result<(), RoutingError>;
}

pub struct CallbackState {
    pub nonces: Arc<NonceAuthority>,
    pub tokens: Arc<TokenAuthority>,
    pub handler: Arc<dyn DecisionHandler>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub nonce: Option<String>,
    pub token: Option<String>,
    pub response: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Credential<'a> {
    Nonce(&'a str),
    Token(&'a str),
}

impl<'a> Credential<'a> {
    /// A nonce wins when both are supplied.
    fn from_params(params: &'a CallbackParams) -> Option<Self> {
        let present = |value: &'a Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };
        present(&params.nonce)
            .map(Self::Nonce)
            .or_else(|| present(&params.token).map(Self::Token))
    }

    fn kind(self) -> &'static str {
        match self {
            Self::Nonce(_) => "nonce",
            Self::Token(_) => "token",
        }
    }

    fn value(self) -> &'a str {
        match self {
            Self::Nonce(value) | Self::Token(value) => value,
        }
    }

    fn check(self, state: &CallbackState) -> pilot_auth::Result<CredentialClaims> {
        match self {
            Self::Nonce(value) => state.nonces.peek(value),
            Self::Token(value) => state.tokens.peek(value),
        }
    }

    fn consume(self, state: &CallbackState) -> pilot_auth::Result<CredentialClaims> {
        match self {
            Self::Nonce(value) => state.nonces.consume(value),
            Self::Token(value) => state.tokens.consume(value),
        }
    }
}

#[derive(Debug)]
pub enum CallbackError {
    MissingCredential,
    InvalidCredential,
    InvalidDecision(String),
    Delivery(RoutingError),
}

impl CallbackError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            Self::MissingCredential => (
                StatusCode::UNAUTHORIZED,
                "missing_credential",
                "missing nonce or token".to_string(),
            ),
            Self::InvalidCredential => (
                StatusCode::UNAUTHORIZED,
                "invalid_credential",
                "invalid or expired credential".to_string(),
            ),
            Self::InvalidDecision(message) => (
                StatusCode::BAD_REQUEST,
                "invalid_response",
                message.clone(),
            ),
            Self::Delivery(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "delivery_failed",
                "decision could not be delivered to the session".to_string(),
            ),
        }
    }
}

impl IntoResponse for CallbackError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        match &self {
            Self::Delivery(error) => {
                tracing::error!(error_code = code, error = %error, "callback delivery failed")
            }
            _ => tracing::warn!(error_code = code, error = %message, "callback rejected"),
        }
        (
            status,
            Json(json!({
                "status": "error",
                "error": message,
                "error_code": code,
            })),
        )
            .into_response()
    }
}

pub fn router(state: Arc<CallbackState>) -> Router {
    Router::new()
        .route(
            "/callback",
            post(submit_decision).fallback(crate::routes::not_found),
        )
        .layer(Extension(state))
}

#[tracing::instrument(level = "info", skip_all, fields(credential_kind, session_id, permission_id))]
async fn submit_decision(
    Extension(state): Extension<Arc<CallbackState>>,
    params: Result<Query<CallbackParams>, QueryRejection>,
) -> Result<Json<serde_json::Value>, CallbackError> {
    let params = match params {
        Ok(Query(params)) => params,
        Err(rejection) => {
            tracing::debug!(error = %rejection, "callback query could not be parsed");
            CallbackParams::default()
        }
    };

    let credential = Credential::from_params(&params).ok_or(CallbackError::MissingCredential)?;
    let span = tracing::Span::current();
    span.record("credential_kind", credential.kind());

    let claims = credential.check(&state).map_err(|_| {
        tracing::debug!(
            credential_prefix = %redact(credential.value()),
            "credential rejected before consumption"
        );
        CallbackError::InvalidCredential
    })?;
    span.record("session_id", claims.session_id.as_str());
    span.record("permission_id", claims.permission_id.as_str());

    let raw_decision = params.response.as_deref().map(str::trim).unwrap_or_default();
    let decision: Decision = raw_decision.parse().map_err(|_| {
        CallbackError::InvalidDecision(format!(
            "response must be one of once, always, reject (got {raw_decision:?})"
        ))
    })?;

    // Another request may have consumed it since the check above.
    let claims = credential
        .consume(&state)
        .map_err(|_| CallbackError::InvalidCredential)?;

    state
        .handler
        .deliver(&claims, decision)
        .await
        .map_err(CallbackError::Delivery)?;

    tracing::info!(%decision, "permission decision accepted");
    Ok(Json(json!({
        "status": "ok",
        "response": decision,
    })))
}
