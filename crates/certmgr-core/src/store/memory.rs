// # Memory Store
//
// In-memory implementation of CertificateStore.
//
// ## Purpose
//
// Holds the system of record in process memory: certificates keyed by
// fingerprint, endpoints keyed by (source, external id), and the
// Authority/Destination/Source/Notification records. Useful for testing
// and for the daemon when seeded from an inventory file.
//
// ## Crash Behavior
//
// - All state is lost on restart/crash
// - Rotation progress (superseded markers, pending deployments) is lost with it
//
// ## Write Accounting
//
// Every upsert reports a `WriteOutcome`. Only `Created` and `Updated`
// increment `write_count()`, which is how idempotence is observed.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::Error;
use crate::config::Inventory;
use crate::model::{
    Authority, Certificate, Destination, Endpoint, Notification, RotationStatus, Source,
    WriteOutcome,
};
use crate::traits::CertificateStore;

#[derive(Debug, Default)]
struct Records {
    certificates: HashMap<String, Certificate>,
    endpoints: BTreeMap<(String, String), Endpoint>,
    authorities: HashMap<String, Authority>,
    destinations: HashMap<String, Destination>,
    sources: BTreeMap<String, Source>,
    notifications: HashMap<String, Notification>,
}

/// In-memory certificate store
///
/// Cloning is cheap and every clone shares the same records.
///
/// # Example
///
/// ```rust,no_run
/// use certmgr_core::store::MemoryStore;
/// use certmgr_core::traits::CertificateStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryStore::new();
///     let sources = store.list_sources().await?;
///     assert!(sources.is_empty());
///     assert_eq!(store.write_count(), 0);
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Records>>,
    writes: Arc<AtomicUsize>,
}

impl MemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding every record of `inventory`
    ///
    /// Seeding does not count as a write.
    pub fn from_inventory(inventory: Inventory) -> Self {
        let mut records = Records::default();
        for authority in inventory.authorities {
            records.authorities.insert(authority.name.clone(), authority);
        }
        for destination in inventory.destinations {
            records.destinations.insert(destination.name.clone(), destination);
        }
        for source in inventory.sources {
            records.sources.insert(source.name.clone(), source);
        }
        for notification in inventory.notifications {
            records
                .notifications
                .insert(notification.name.clone(), notification);
        }
        for certificate in inventory.certificates {
            records
                .certificates
                .insert(certificate.fingerprint.clone(), certificate);
        }
        Self {
            inner: Arc::new(RwLock::new(records)),
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of upserts that changed something
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Add or replace an Authority record
    pub async fn put_authority(&self, authority: Authority) {
        let mut guard = self.inner.write().await;
        guard.authorities.insert(authority.name.clone(), authority);
    }

    /// Add or replace a Destination record
    pub async fn put_destination(&self, destination: Destination) {
        let mut guard = self.inner.write().await;
        guard.destinations.insert(destination.name.clone(), destination);
    }

    /// Add or replace a Source record
    pub async fn put_source(&self, source: Source) {
        let mut guard = self.inner.write().await;
        guard.sources.insert(source.name.clone(), source);
    }

    /// Add or replace a Notification record
    pub async fn put_notification(&self, notification: Notification) {
        let mut guard = self.inner.write().await;
        guard
            .notifications
            .insert(notification.name.clone(), notification);
    }

    /// Seed a certificate without counting a write
    pub async fn put_certificate(&self, certificate: Certificate) {
        let mut guard = self.inner.write().await;
        guard
            .certificates
            .insert(certificate.fingerprint.clone(), certificate);
    }

    /// All certificates, ordered by name then fingerprint
    pub async fn certificates(&self) -> Vec<Certificate> {
        let guard = self.inner.read().await;
        let mut certificates: Vec<Certificate> = guard.certificates.values().cloned().collect();
        certificates.sort_by(|a, b| (&a.name, &a.fingerprint).cmp(&(&b.name, &b.fingerprint)));
        certificates
    }

    fn record(&self, outcome: WriteOutcome) -> WriteOutcome {
        if outcome.wrote() {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        outcome
    }
}

#[async_trait]
impl CertificateStore for MemoryStore {
    async fn find_eligible_for_rotation(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<Certificate>, Error> {
        let guard = self.inner.read().await;
        let mut eligible: Vec<Certificate> = guard
            .certificates
            .values()
            .filter(|cert| cert.rotation && !cert.is_superseded())
            .filter(|cert| cert.within_window(now, window))
            .cloned()
            .collect();
        eligible.sort_by(|a, b| a.not_after.cmp(&b.not_after).then_with(|| a.name.cmp(&b.name)));
        Ok(eligible)
    }

    async fn find_expiring(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<Certificate>, Error> {
        let guard = self.inner.read().await;
        let mut expiring: Vec<Certificate> = guard
            .certificates
            .values()
            .filter(|cert| !cert.is_superseded() && cert.within_window(now, window))
            .cloned()
            .collect();
        expiring.sort_by(|a, b| a.not_after.cmp(&b.not_after).then_with(|| a.name.cmp(&b.name)));
        Ok(expiring)
    }

    async fn find_pending_deployments(&self) -> Result<Vec<Certificate>, Error> {
        let guard = self.inner.read().await;
        let mut pending: Vec<Certificate> = guard
            .certificates
            .values()
            .filter(|cert| matches!(cert.status, RotationStatus::DeployPartial { .. }))
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(pending)
    }

    async fn get_certificate(&self, fingerprint: &str) -> Result<Option<Certificate>, Error> {
        let guard = self.inner.read().await;
        Ok(guard.certificates.get(fingerprint).cloned())
    }

    async fn upsert_certificate(&self, certificate: &Certificate) -> Result<WriteOutcome, Error> {
        let mut guard = self.inner.write().await;
        let outcome = match guard.certificates.entry(certificate.fingerprint.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(certificate.clone());
                WriteOutcome::Created
            }
            Entry::Occupied(mut slot) => {
                // Identity fields are fixed; only status fields move.
                let existing = slot.get_mut();
                if existing.destinations == certificate.destinations
                    && existing.status == certificate.status
                {
                    WriteOutcome::Unchanged
                } else {
                    existing.destinations = certificate.destinations.clone();
                    existing.status = certificate.status.clone();
                    WriteOutcome::Updated
                }
            }
        };
        Ok(self.record(outcome))
    }

    async fn mark_superseded(&self, fingerprint: &str, by: &str) -> Result<WriteOutcome, Error> {
        let mut guard = self.inner.write().await;
        let existing = guard
            .certificates
            .get_mut(fingerprint)
            .ok_or_else(|| Error::store(format!("Unknown certificate {}", fingerprint)))?;

        let superseded = RotationStatus::Superseded { by: by.to_string() };
        let outcome = if existing.status == superseded {
            WriteOutcome::Unchanged
        } else {
            existing.status = superseded;
            WriteOutcome::Updated
        };
        Ok(self.record(outcome))
    }

    async fn upsert_endpoint(&self, endpoint: &Endpoint) -> Result<WriteOutcome, Error> {
        let mut guard = self.inner.write().await;
        let outcome = match guard.endpoints.insert(endpoint.key(), endpoint.clone()) {
            None => WriteOutcome::Created,
            Some(previous) if previous == *endpoint => WriteOutcome::Unchanged,
            Some(_) => WriteOutcome::Updated,
        };
        Ok(self.record(outcome))
    }

    async fn mark_stale(&self, source: &str, external_id: &str) -> Result<WriteOutcome, Error> {
        let mut guard = self.inner.write().await;
        let endpoint = guard
            .endpoints
            .get_mut(&(source.to_string(), external_id.to_string()))
            .ok_or_else(|| {
                Error::store(format!("Unknown endpoint {} in source {}", external_id, source))
            })?;

        let outcome = if endpoint.stale {
            WriteOutcome::Unchanged
        } else {
            endpoint.stale = true;
            WriteOutcome::Updated
        };
        Ok(self.record(outcome))
    }

    async fn list_endpoints(&self, source: &str) -> Result<Vec<Endpoint>, Error> {
        let guard = self.inner.read().await;
        Ok(guard
            .endpoints
            .values()
            .filter(|endpoint| endpoint.source == source)
            .cloned()
            .collect())
    }

    async fn get_authority(&self, name: &str) -> Result<Option<Authority>, Error> {
        let guard = self.inner.read().await;
        Ok(guard.authorities.get(name).cloned())
    }

    async fn get_destination(&self, name: &str) -> Result<Option<Destination>, Error> {
        let guard = self.inner.read().await;
        Ok(guard.destinations.get(name).cloned())
    }

    async fn get_notification(&self, name: &str) -> Result<Option<Notification>, Error> {
        let guard = self.inner.read().await;
        Ok(guard.notifications.get(name).cloned())
    }

    async fn list_notifications(&self) -> Result<Vec<Notification>, Error> {
        let guard = self.inner.read().await;
        let mut notifications: Vec<Notification> = guard.notifications.values().cloned().collect();
        notifications.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(notifications)
    }

    async fn list_sources(&self) -> Result<Vec<Source>, Error> {
        let guard = self.inner.read().await;
        Ok(guard.sources.values().cloned().collect())
    }
}
