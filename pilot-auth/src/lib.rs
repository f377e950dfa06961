//! Callback credentials for opencode-pilot.
//!
//! Two interchangeable ways to bind an approval link to exactly one pending
//! permission request: single-use random nonces held in memory, and
//! stateless HMAC-signed tokens.

mod error;
mod nonce;
mod token;
mod types;

pub use error::{AuthError, Result};
pub use nonce::{DEFAULT_NONCE_TTL, NonceAuthority, NonceStats, redact};
pub use token::TokenAuthority;
pub use types::{CredentialClaims, Decision};
