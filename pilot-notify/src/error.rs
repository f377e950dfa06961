use thiserror::Error;

pub type Result<T> = std::result::Result<T, NotifyError>;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid notifier config: {0}")]
    InvalidConfig(String),

    #[error("invalid notification: {0}")]
    InvalidNotification(String),

    #[error("unknown preset: {0}")]
    UnknownPreset(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{provider} rejected notification: status={status} body={body}")]
    Rejected {
        provider: &'static str,
        status: u16,
        body: String,
    },
}
