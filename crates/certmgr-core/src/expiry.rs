//! Expiry notifications
//!
//! Sends `UpcomingExpiry` when a certificate's whole days remaining equals
//! one of the thresholds configured on an attached Notification. Each
//! (certificate, notification, days) triple is delivered at most once per
//! process, so the pass can run more often than daily. Certificates with
//! rotation turned off are warned about too.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use crate::adapters::{NotificationAdapter, NotifyResult};
use crate::config::CertmgrConfig;
use crate::error::Result;
use crate::model::NotificationEvent;
use crate::registry::PluginRegistry;
use crate::traits::CertificateStore;

/// One expiry warning sent (or attempted)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiryDelivery {
    /// Certificate fingerprint
    pub certificate: String,
    /// Notification record name
    pub notification: String,
    /// Whole days remaining at the time of the pass
    pub days_remaining: i64,
    /// Delivery result
    pub result: NotifyResult,
}

/// Emits expiry warnings
pub struct ExpiryNotifier {
    store: Arc<dyn CertificateStore>,
    notifications: NotificationAdapter,
    delivered: Mutex<HashSet<(String, String, i64)>>,
}

impl ExpiryNotifier {
    /// Create a notifier over `registry` and `store`
    pub fn new(
        registry: Arc<PluginRegistry>,
        store: Arc<dyn CertificateStore>,
        config: &CertmgrConfig,
    ) -> Self {
        Self {
            store,
            notifications: NotificationAdapter::new(registry, config.notifications.timeout()),
            delivered: Mutex::new(HashSet::new()),
        }
    }

    /// Send every expiry warning due at `now`
    pub async fn run_pass(&self, now: DateTime<Utc>) -> Result<Vec<ExpiryDelivery>> {
        let horizon = self
            .store
            .list_notifications()
            .await?
            .iter()
            .filter(|notification| notification.active)
            .flat_map(|notification| notification.expiry_days.iter().copied())
            .max();
        let Some(horizon) = horizon else {
            debug!("No expiry thresholds configured");
            return Ok(Vec::new());
        };

        // Whole days truncate, so anything under horizon + 1 days can match.
        let window = Duration::days(i64::from(horizon) + 1);
        let mut deliveries = Vec::new();

        for certificate in self.store.find_expiring(now, window).await? {
            if certificate.is_expired(now) {
                continue;
            }
            let days_remaining = certificate.days_remaining(now);
            let event = NotificationEvent::UpcomingExpiry {
                certificate: certificate.summary(),
                days_remaining,
            };

            for name in &certificate.notifications {
                let Some(notification) = self.store.get_notification(name).await? else {
                    continue;
                };
                if !notification.accepts(&event) {
                    continue;
                }

                let key = (certificate.fingerprint.clone(), name.clone(), days_remaining);
                if self.delivered().contains(&key) {
                    continue;
                }

                let result = self.notifications.notify(&notification, &event).await;
                if result.is_delivered() {
                    self.delivered().insert(key);
                }
                deliveries.push(ExpiryDelivery {
                    certificate: certificate.fingerprint.clone(),
                    notification: name.clone(),
                    days_remaining,
                    result,
                });
            }
        }

        if !deliveries.is_empty() {
            info!(warnings = deliveries.len(), "Expiry notifications sent");
        }
        Ok(deliveries)
    }

    fn delivered(&self) -> std::sync::MutexGuard<'_, HashSet<(String, String, i64)>> {
        self.delivered.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
