//! Stateless HMAC-signed callback tokens.
//!
//! Wire format: `base64url(payload) "." base64url(hmac_sha256(key, base64url(payload)))`
//! where `payload` is the compact JSON `{"sid":..,"pid":..,"exp":..}` in exactly
//! that field order. Verification re-encodes the decoded payload and rejects
//! anything that is not byte-identical, so there is one valid encoding per claim set.

use crate::error::{AuthError, Result};
use crate::nonce::redact;
use crate::types::CredentialClaims;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Mutex;

type HmacSha256 = Hmac<Sha256>;

const EPHEMERAL_KEY_BYTES: usize = 32;
const MAX_TOKEN_LEN: usize = 2048;
const DEFAULT_TOKEN_TTL: std::time::Duration = std::time::Duration::from_secs(60 * 60);

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct TokenPayload {
    sid: String,
    pid: String,
    exp: i64,
}

pub struct TokenAuthority {
    key: Vec<u8>,
    ttl: std::time::Duration,
    /// Signature -> exp, only populated when single-use tokens are enabled.
    consumed: Option<Mutex<HashMap<String, i64>>>,
}

impl std::fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthority")
            .field("key", &"<redacted>")
            .field("ttl", &self.ttl)
            .field("single_use", &self.consumed.is_some())
            .finish()
    }
}

impl TokenAuthority {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self> {
        let key = secret.as_ref();
        if key.is_empty() {
            return Err(AuthError::InvalidInput(
                "token signing secret must not be empty".to_string(),
            ));
        }
        Ok(Self {
            key: key.to_vec(),
            ttl: DEFAULT_TOKEN_TTL,
            consumed: None,
        })
    }

    /// Random process-lifetime key. Tokens do not survive a restart.
    pub fn ephemeral() -> Result<Self> {
        let mut key = [0_u8; EPHEMERAL_KEY_BYTES];
        OsRng.try_fill_bytes(&mut key)?;
        Self::new(key)
    }

    pub fn from_optional_secret(secret: Option<&str>) -> Result<Self> {
        match secret.map(str::trim).filter(|s| !s.is_empty()) {
            Some(secret) => Self::new(secret.as_bytes()),
            None => {
                tracing::warn!(
                    "no callback signing secret configured; using an ephemeral key (tokens will not survive a restart)"
                );
                Self::ephemeral()
            }
        }
    }

    pub fn with_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Track consumed signatures until they expire so each token works once.
    pub fn with_single_use(mut self, single_use: bool) -> Self {
        self.consumed = single_use.then(|| Mutex::new(HashMap::new()));
        self
    }

    pub fn is_single_use(&self) -> bool {
        self.consumed.is_some()
    }

    pub fn ttl(&self) -> std::time::Duration {
        self.ttl
    }

    /// Sign a token that expires `ttl` from now.
    pub fn issue(&self, session_id: &str, permission_id: &str) -> Result<String> {
        self.issue_at(session_id, permission_id, Utc::now())
    }

    pub fn issue_at(
        &self,
        session_id: &str,
        permission_id: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let exp = Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| AuthError::InvalidInput("token ttl out of range".to_string()))?;
        self.sign(session_id, permission_id, exp)
    }

    pub fn sign(
        &self,
        session_id: &str,
        permission_id: &str,
        exp: DateTime<Utc>,
    ) -> Result<String> {
        let payload = TokenPayload {
            sid: require_id(session_id, "session_id")?,
            pid: require_id(permission_id, "permission_id")?,
            exp: exp.timestamp(),
        };
        let json = serde_json::to_vec(&payload)
            .map_err(|e| AuthError::InvalidInput(format!("encode token payload: {e}")))?;
        let encoded = URL_SAFE_NO_PAD.encode(json);
        let signature =
            URL_SAFE_NO_PAD.encode(self.mac(encoded.as_bytes())?.finalize().into_bytes());
        Ok(format!("{encoded}.{signature}"))
    }

    pub fn verify(&self, token: &str) -> Result<CredentialClaims> {
        self.verify_at(token, Utc::now())
    }

    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<CredentialClaims> {
        self.decode_verified(token, now).map(|(claims, _, _)| claims)
    }

    /// Like `verify`, but a single-use token that was already consumed is
    /// rejected too. Nothing is recorded.
    pub fn peek(&self, token: &str) -> Result<CredentialClaims> {
        self.peek_at(token, Utc::now())
    }

    pub fn peek_at(&self, token: &str, now: DateTime<Utc>) -> Result<CredentialClaims> {
        let (claims, signature, _) = self.decode_verified(token, now)?;
        if let Some(consumed) = &self.consumed {
            let consumed = consumed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if consumed.contains_key(signature) {
                return Err(AuthError::InvalidCredential);
            }
        }
        Ok(claims)
    }

    /// Verify and, when single-use is enabled, mark the token as spent.
    pub fn consume(&self, token: &str) -> Result<CredentialClaims> {
        self.consume_at(token, Utc::now())
    }

    pub fn consume_at(&self, token: &str, now: DateTime<Utc>) -> Result<CredentialClaims> {
        let (claims, signature, exp) = self.decode_verified(token, now)?;
        if let Some(consumed) = &self.consumed {
            let mut consumed = consumed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let now_ts = now.timestamp();
            consumed.retain(|_, exp| *exp > now_ts);
            if consumed.insert(signature.to_string(), exp).is_some() {
                return Err(AuthError::InvalidCredential);
            }
        }
        tracing::debug!(
            token_prefix = %redact(token),
            session_id = %claims.session_id,
            permission_id = %claims.permission_id,
            "token accepted"
        );
        Ok(claims)
    }

    fn mac(&self, data: &[u8]) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|_| AuthError::InvalidInput("invalid signing key".to_string()))?;
        mac.update(data);
        Ok(mac)
    }

    fn decode_verified<'a>(
        &self,
        token: &'a str,
        now: DateTime<Utc>,
    ) -> Result<(CredentialClaims, &'a str, i64)> {
        if token.is_empty() || token.len() > MAX_TOKEN_LEN {
            return Err(AuthError::InvalidCredential);
        }
        let (encoded, signature) = token
            .split_once('.')
            .ok_or(AuthError::InvalidCredential)?;
        let signature_bytes = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::InvalidCredential)?;
        self.mac(encoded.as_bytes())?
            .verify_slice(&signature_bytes)
            .map_err(|_| AuthError::InvalidCredential)?;

        let json = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| AuthError::InvalidCredential)?;
        let payload: TokenPayload =
            serde_json::from_slice(&json).map_err(|_| AuthError::InvalidCredential)?;
        let canonical = serde_json::to_vec(&payload).map_err(|_| AuthError::InvalidCredential)?;
        if canonical != json {
            return Err(AuthError::InvalidCredential);
        }
        if payload.exp <= now.timestamp() {
            return Err(AuthError::InvalidCredential);
        }
        if payload.sid.is_empty() || payload.pid.is_empty() {
            return Err(AuthError::InvalidCredential);
        }

        Ok((
            CredentialClaims {
                session_id: payload.sid,
                permission_id: payload.pid,
            },
            signature,
            payload.exp,
        ))
    }
}

fn require_id(value: &str, field: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AuthError::InvalidInput(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}
