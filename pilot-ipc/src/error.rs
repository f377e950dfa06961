use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not connected to broker")]
    NotConnected,

    #[error("broker unreachable at {path}: {reason}")]
    Unreachable { path: String, reason: String },

    #[error("broker connection closed")]
    ConnectionClosed,

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("nonce request already pending for permission {0}")]
    DuplicateRequest(String),

    #[error("encode error: {0}")]
    Encode(String),
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        Self::Encode(e.to_string())
    }
}
