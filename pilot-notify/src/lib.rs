//! Outbound notifications for opencode-pilot.
//!
//! Notifiers are pure I/O: they turn a [`Notification`] into a provider
//! request. Payload construction for permission prompts, readiness
//! evaluation and source presets live here too so the app crate only wires
//! them together.

mod error;
mod ntfy;
mod presets;
mod readiness;
mod traits;
mod types;

pub use error::{NotifyError, Result};
pub use ntfy::{DEFAULT_NTFY_SERVER, NtfyNotifier};
pub use presets::{
    ItemTemplate, SourceConfig, ToolRef, expand_github_shorthand, expand_preset, get_preset,
    list_presets, resolve_source,
};
pub use readiness::{
    LabelRules, Readiness, ReadinessConfig, check_bot_comments, check_fields, check_labels,
    evaluate_readiness,
};
pub use traits::Notifier;
pub use types::{
    CallbackCredential, DEFAULT_PRIORITY, Notification, NotificationAction, PermissionPrompt,
    permission_notification,
};
