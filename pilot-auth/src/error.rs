use thiserror::Error;

pub type Result<T> = std::result::Result<T, AuthError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Covers unknown, expired, consumed and forged credentials alike.
    #[error("invalid credential")]
    InvalidCredential,

    #[error("invalid decision: {0}")]
    InvalidDecision(String),

    #[error("entropy source failure: {0}")]
    Entropy(String),
}

impl From<rand::Error> for AuthError {
    fn from(e: rand::Error) -> Self {
        Self::Entropy(e.to_string())
    }
}
