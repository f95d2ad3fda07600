// # Notification Plugin Trait
//
// Delivery of expiry warnings and rotation outcomes (mail, chat, webhooks).

use async_trait::async_trait;

use crate::model::NotificationEvent;

/// Trait for notification plugins
///
/// Delivery is best-effort. An error is logged and reported by the
/// `NotificationAdapter`; it never rolls back the work that triggered it.
#[async_trait]
pub trait NotificationPlugin: Send + Sync {
    /// Deliver `event` to `recipients`
    async fn send(
        &self,
        options: &serde_json::Value,
        recipients: &[String],
        event: &NotificationEvent,
    ) -> Result<(), crate::Error>;
}
