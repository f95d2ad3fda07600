// # Source Plugin Trait
//
// Defines the interface for external inventories (cloud accounts, load
// balancer fleets, directories) that certificates and endpoints are
// discovered from. Sources are read-only: discovery never implies ownership.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A certificate as reported by an external inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalCertificate {
    /// Provider-native identifier (ARN, resource id, file name)
    pub external_id: String,
    /// Display name, if the provider has one
    #[serde(default)]
    pub name: Option<String>,
    /// PEM body, if the provider exposes it
    #[serde(default)]
    pub body: Option<String>,
    /// PEM chain, if the provider exposes it
    #[serde(default)]
    pub chain: Option<String>,
    /// SHA-256 fingerprint in any common textual form, if reported
    #[serde(default)]
    pub fingerprint: Option<String>,
}

/// A service instance as reported by an external inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalEndpoint {
    /// Provider-native identifier
    pub external_id: String,
    /// Host name or address
    pub host: String,
    /// Port
    pub port: u16,
    /// Endpoint type
    #[serde(default = "default_kind")]
    pub kind: String,
    /// `external_id` of the certificate it serves, if any
    #[serde(default)]
    pub certificate_id: Option<String>,
}

fn default_kind() -> String {
    "https".to_string()
}

/// Trait for source plugins
///
/// # Trust Level: Untrusted
///
/// Each call returns a complete snapshot. The engine pairs endpoints with
/// certificates and derives fingerprints, so plugins report what the
/// provider says and nothing more.
#[async_trait]
pub trait SourcePlugin: Send + Sync {
    /// Enumerate certificates known to the inventory
    async fn get_certificates(
        &self,
        options: &serde_json::Value,
    ) -> Result<Vec<ExternalCertificate>, crate::Error>;

    /// Enumerate endpoints known to the inventory
    async fn get_endpoints(
        &self,
        options: &serde_json::Value,
    ) -> Result<Vec<ExternalEndpoint>, crate::Error>;

    /// Enumerate certificates and endpoints as one consistent snapshot
    ///
    /// The default calls [`get_certificates`](Self::get_certificates) then
    /// [`get_endpoints`](Self::get_endpoints). Plugins that read both from a
    /// single provider response override this so the halves agree.
    async fn snapshot(
        &self,
        options: &serde_json::Value,
    ) -> Result<(Vec<ExternalCertificate>, Vec<ExternalEndpoint>), crate::Error> {
        let certificates = self.get_certificates(options).await?;
        let endpoints = self.get_endpoints(options).await?;
        Ok((certificates, endpoints))
    }
}
