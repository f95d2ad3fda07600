//! Notification Adapter: best-effort event delivery
//!
//! Delivery failures are logged and returned as a [`NotifyResult`], never
//! raised, so they cannot roll back the work that triggered them.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Error;
use crate::model::{Notification, NotificationEvent};
use crate::registry::PluginRegistry;
use crate::traits::CertificateStore;

/// Outcome of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyResult {
    /// The plugin accepted the event
    Delivered,
    /// The notification is inactive or its trigger does not match the event
    Skipped,
    /// Lookup, delivery or timeout failure
    Failed {
        /// Rendered error
        cause: String,
    },
}

impl NotifyResult {
    /// Whether the event was handed off
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Drives notification plugins through the registry
#[derive(Clone)]
pub struct NotificationAdapter {
    registry: Arc<PluginRegistry>,
    timeout: Duration,
}

impl NotificationAdapter {
    /// Create an adapter with a per-delivery timeout
    pub fn new(registry: Arc<PluginRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// Deliver `event` through `notification` if its trigger matches
    pub async fn notify(&self, notification: &Notification, event: &NotificationEvent) -> NotifyResult {
        if !notification.accepts(event) {
            debug!(
                notification = %notification.name,
                event = event.kind(),
                "Trigger does not match, skipping"
            );
            return NotifyResult::Skipped;
        }

        let result = match self.registry.notification(&notification.plugin) {
            Ok(plugin) => {
                let call = plugin.send(&notification.options, &notification.recipients, event);
                match tokio::time::timeout(self.timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(self.timeout)),
                }
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                debug!(
                    notification = %notification.name,
                    event = event.kind(),
                    recipients = notification.recipients.len(),
                    "Notification delivered"
                );
                NotifyResult::Delivered
            }
            Err(e) => {
                let err = Error::notify(&notification.name, &notification.plugin, e);
                warn!(event = event.kind(), "{}", err);
                NotifyResult::Failed {
                    cause: err.to_string(),
                }
            }
        }
    }

    /// Deliver `event` through every named Notification record concurrently
    ///
    /// Names with no record report [`NotifyResult::Failed`].
    pub async fn notify_all(
        &self,
        store: &dyn CertificateStore,
        names: &[String],
        event: &NotificationEvent,
    ) -> Vec<(String, NotifyResult)> {
        let deliveries = names.iter().map(|name| async move {
            let result = match store.get_notification(name).await {
                Ok(Some(notification)) => self.notify(&notification, event).await,
                Ok(None) => {
                    warn!(notification = %name, "Notification record not found");
                    NotifyResult::Failed {
                        cause: format!("Notification record '{}' not found", name),
                    }
                }
                Err(e) => {
                    warn!(notification = %name, "Failed to load notification: {}", e);
                    NotifyResult::Failed { cause: e.to_string() }
                }
            };
            (name.clone(), result)
        });
        join_all(deliveries).await
    }
}
