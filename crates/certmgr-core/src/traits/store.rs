// # Certificate Store Trait
//
// The persisted system of record, owned by an external collaborator.
//
// ## Purpose
//
// The orchestrators only ever address records by canonical identifiers:
// certificate fingerprint, record name, or (source, external id) for
// endpoints. No row handles cross this boundary, so the core stays
// storage-agnostic and survives restarts.
//
// ## Implementations
//
// - In-memory: `MemoryStore` (tests, daemon seeded from an inventory file)
// - Relational backends live outside this crate

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::model::{
    Authority, Certificate, Destination, Endpoint, Notification, Source, WriteOutcome,
};

/// Trait for certificate store implementations
///
/// # Thread Safety
///
/// All methods must be safe to call concurrently from many orchestration
/// workers: concurrent writers for different certificates, and retried
/// writes for the same certificate.
///
/// # Write Semantics
///
/// - Status fields (`destinations`, `status`, endpoint `missed_passes` and
///   `stale`) are last-writer-wins.
/// - Identity fields (serial, fingerprint, body, validity) are written once
///   and never rewritten by an upsert.
/// - A write that changes nothing must report [`WriteOutcome::Unchanged`]
///   and must not count as a write.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Current, rotation-enabled certificates with `not_after - now <= window`
    ///
    /// Superseded certificates are never returned.
    async fn find_eligible_for_rotation(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<Certificate>, crate::Error>;

    /// Current certificates with `not_after - now <= window`, whatever their
    /// rotation flag
    ///
    /// Superseded certificates are never returned.
    async fn find_expiring(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<Certificate>, crate::Error>;

    /// Certificates in `DeployPartial` status
    async fn find_pending_deployments(&self) -> Result<Vec<Certificate>, crate::Error>;

    /// Look up a certificate by fingerprint
    async fn get_certificate(&self, fingerprint: &str) -> Result<Option<Certificate>, crate::Error>;

    /// Insert a certificate, or update the status fields of an existing one
    async fn upsert_certificate(&self, certificate: &Certificate) -> Result<WriteOutcome, crate::Error>;

    /// Mark `fingerprint` as replaced by `by`
    async fn mark_superseded(&self, fingerprint: &str, by: &str) -> Result<WriteOutcome, crate::Error>;

    /// Insert or update an endpoint keyed by (source, external id)
    async fn upsert_endpoint(&self, endpoint: &Endpoint) -> Result<WriteOutcome, crate::Error>;

    /// Flag an endpoint as stale
    async fn mark_stale(&self, source: &str, external_id: &str) -> Result<WriteOutcome, crate::Error>;

    /// All endpoints previously recorded for a source
    async fn list_endpoints(&self, source: &str) -> Result<Vec<Endpoint>, crate::Error>;

    /// Look up an Authority record
    async fn get_authority(&self, name: &str) -> Result<Option<Authority>, crate::Error>;

    /// Look up a Destination record
    async fn get_destination(&self, name: &str) -> Result<Option<Destination>, crate::Error>;

    /// Look up a Notification record
    async fn get_notification(&self, name: &str) -> Result<Option<Notification>, crate::Error>;

    /// All Notification records
    async fn list_notifications(&self) -> Result<Vec<Notification>, crate::Error>;

    /// All Source records
    async fn list_sources(&self) -> Result<Vec<Source>, crate::Error>;
}
