// # Destination Plugin Trait
//
// Defines the interface for pushing certificate bundles to the systems that
// serve them (load balancers, CDNs, key stores, directories).

use async_trait::async_trait;

use crate::model::CertificateBundle;

/// Trait for destination plugins
///
/// # Trust Level: Untrusted
///
/// ## Idempotency
///
/// `upload` of the same bundle under the same name must be a no-op or an
/// overwrite, never a duplicate. The orchestrator may resend a bundle to a
/// destination that timed out on a previous pass.
///
/// ## Forbidden Capabilities
/// - ❌ Retry or sleep (timeouts are owned by `DestinationAdapter`)
/// - ❌ Touch the certificate store
#[async_trait]
pub trait DestinationPlugin: Send + Sync {
    /// Upload a bundle
    ///
    /// # Parameters
    ///
    /// - `name`: deploy name for the bundle at the destination
    /// - `options`: opaque configuration from the Destination record
    /// - `bundle`: certificate, chain and optional key
    async fn upload(
        &self,
        name: &str,
        options: &serde_json::Value,
        bundle: &CertificateBundle,
    ) -> Result<(), crate::Error>;

    /// List identifiers of the certificates the destination currently holds
    async fn get_certificates(
        &self,
        name: &str,
        options: &serde_json::Value,
    ) -> Result<Vec<String>, crate::Error>;
}
