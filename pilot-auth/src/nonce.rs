//! Single-use callback nonces.
//!
//! A nonce authorizes exactly one decision for one `(session_id, permission_id)`
//! pair. Consumption happens under the store lock, so of any number of
//! concurrent `consume` calls for the same value exactly one observes the claims.

use crate::error::{AuthError, Result};
use crate::types::CredentialClaims;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use std::collections::HashMap;
use std::sync::Mutex;

/// 256 bits; the encoded value is 43 base64url characters.
const NONCE_BYTES: usize = 32;
const MAX_NONCE_LEN: usize = 128;
const MAX_ID_LEN: usize = 256;
/// Issue-time purge only kicks in above this many records; the periodic
/// sweep handles the common case.
const LAZY_PURGE_THRESHOLD: usize = 1024;

pub const DEFAULT_NONCE_TTL: std::time::Duration = std::time::Duration::from_secs(60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
struct NonceRecord {
    claims: CredentialClaims,
    expires_at: DateTime<Utc>,
    consumed: bool,
}

impl NonceRecord {
    fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        !self.consumed && now < self.expires_at
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NonceStats {
    pub stored: usize,
    pub issued_total: u64,
    pub consumed_total: u64,
    pub purged_total: u64,
}

#[derive(Debug, Default)]
struct NonceStore {
    records: HashMap<String, NonceRecord>,
    stats: NonceStats,
}

impl NonceStore {
    fn issue(
        &mut self,
        value: String,
        claims: CredentialClaims,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<String> {
        if self.records.len() >= LAZY_PURGE_THRESHOLD {
            self.purge(now);
        }
        // A collision at 256 bits means the entropy source is broken.
        if self.records.contains_key(&value) {
            return Err(AuthError::Entropy("nonce collision".to_string()));
        }
        self.records.insert(
            value.clone(),
            NonceRecord {
                claims,
                expires_at,
                consumed: false,
            },
        );
        self.stats.issued_total += 1;
        Ok(value)
    }

    fn peek(&self, value: &str, now: DateTime<Utc>) -> Option<CredentialClaims> {
        self.records
            .get(value)
            .filter(|record| record.is_live_at(now))
            .map(|record| record.claims.clone())
    }

    fn consume(&mut self, value: &str, now: DateTime<Utc>) -> Option<CredentialClaims> {
        let record = self.records.get_mut(value)?;
        if !record.is_live_at(now) {
            return None;
        }
        record.consumed = true;
        self.stats.consumed_total += 1;
        Some(record.claims.clone())
    }

    fn purge(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, record| record.is_live_at(now));
        let purged = before - self.records.len();
        self.stats.purged_total += purged as u64;
        purged
    }

    fn stats(&self) -> NonceStats {
        NonceStats {
            stored: self.records.len(),
            ..self.stats
        }
    }
}

/// In-memory nonce issuer shared by the broker and the callback endpoint.
#[derive(Debug)]
pub struct NonceAuthority {
    store: Mutex<NonceStore>,
    default_ttl: std::time::Duration,
}

impl Default for NonceAuthority {
    fn default() -> Self {
        Self::new(DEFAULT_NONCE_TTL)
    }
}

impl NonceAuthority {
    pub fn new(default_ttl: std::time::Duration) -> Self {
        Self {
            store: Mutex::new(NonceStore::default()),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> std::time::Duration {
        self.default_ttl
    }

    fn with_store<R>(&self, f: impl FnOnce(&mut NonceStore) -> R) -> R {
        let mut guard = self
            .store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Issue a nonce valid for the authority's default TTL.
    pub fn issue(&self, session_id: &str, permission_id: &str) -> Result<String> {
        self.issue_with_ttl(session_id, permission_id, self.default_ttl)
    }

    pub fn issue_with_ttl(
        &self,
        session_id: &str,
        permission_id: &str,
        ttl: std::time::Duration,
    ) -> Result<String> {
        self.issue_at(session_id, permission_id, ttl, Utc::now())
    }

    pub fn issue_at(
        &self,
        session_id: &str,
        permission_id: &str,
        ttl: std::time::Duration,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let claims = CredentialClaims {
            session_id: normalize_id(session_id, "session_id")?,
            permission_id: normalize_id(permission_id, "permission_id")?,
        };
        let ttl = Duration::from_std(ttl)
            .map_err(|_| AuthError::InvalidInput("nonce ttl out of range".to_string()))?;
        if ttl <= Duration::zero() {
            return Err(AuthError::InvalidInput("nonce ttl must be > 0".to_string()));
        }
        let expires_at = now
            .checked_add_signed(ttl)
            .ok_or_else(|| AuthError::InvalidInput("nonce ttl out of range".to_string()))?;
        let value = generate_nonce()?;
        let value = self.with_store(|store| store.issue(value, claims, expires_at, now))?;
        tracing::debug!(
            nonce_prefix = %redact(&value),
            session_id,
            permission_id,
            "nonce issued"
        );
        Ok(value)
    }

    /// Check a nonce without consuming it.
    pub fn peek(&self, value: &str) -> Result<CredentialClaims> {
        self.peek_at(value, Utc::now())
    }

    pub fn peek_at(&self, value: &str, now: DateTime<Utc>) -> Result<CredentialClaims> {
        let value = normalize_nonce(value)?;
        self.with_store(|store| store.peek(value, now))
            .ok_or(AuthError::InvalidCredential)
    }

    /// Consume a nonce. Unknown, expired and already consumed values all
    /// yield `InvalidCredential`.
    pub fn consume(&self, value: &str) -> Result<CredentialClaims> {
        self.consume_at(value, Utc::now())
    }

    pub fn consume_at(&self, value: &str, now: DateTime<Utc>) -> Result<CredentialClaims> {
        let value = normalize_nonce(value)?;
        let claims = self
            .with_store(|store| store.consume(value, now))
            .ok_or(AuthError::InvalidCredential)?;
        tracing::debug!(
            nonce_prefix = %redact(value),
            session_id = %claims.session_id,
            permission_id = %claims.permission_id,
            "nonce consumed"
        );
        Ok(claims)
    }

    /// Drop expired and consumed records. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        self.with_store(|store| store.purge(now))
    }

    pub fn stats(&self) -> NonceStats {
        self.with_store(|store| store.stats())
    }
}

fn generate_nonce() -> Result<String> {
    let mut bytes = [0_u8; NONCE_BYTES];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

fn normalize_id(value: &str, field: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_ID_LEN {
        return Err(AuthError::InvalidInput(format!("invalid {field}")));
    }
    Ok(trimmed.to_string())
}

fn normalize_nonce(value: &str) -> Result<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_NONCE_LEN {
        return Err(AuthError::InvalidCredential);
    }
    Ok(trimmed)
}

/// Loggable prefix of a credential value.
pub fn redact(value: &str) -> String {
    let prefix: String = value.chars().take(6).collect();
    format!("{prefix}…")
}
