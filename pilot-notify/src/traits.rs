use crate::error::Result;
use crate::types::Notification;
use async_trait::async_trait;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Short provider name used in logs: "ntfy".
    fn name(&self) -> &str;

    /// Deliver one notification. Implementations must not retry internally.
    async fn send(&self, notification: Notification) -> Result<()>;
}
