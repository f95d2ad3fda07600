// # Issuer Plugin Trait
//
// Defines the interface certificate authorities are driven through.
//
// ## Usage
//
// ```rust,ignore
// use certmgr_core::traits::{IssuerPlugin, IssuanceOptions};
//
// let response = issuer
//     .issue(&csr_der, &IssuanceOptions::new("example.com", 90), &authority.options)
//     .await?;
// println!("{}", response.certificate_pem);
// ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Key usage requested for the issued certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsage {
    /// digitalSignature
    DigitalSignature,
    /// keyEncipherment
    KeyEncipherment,
    /// id-kp-serverAuth
    ServerAuth,
    /// id-kp-clientAuth
    ClientAuth,
}

/// Issuance parameters handed to the issuer alongside the CSR
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuanceOptions {
    /// Subject common name
    pub common_name: String,
    /// DNS subject alternative names
    #[serde(default)]
    pub sans: Vec<String>,
    /// Requested validity period in days
    pub validity_days: u32,
    /// Requested key usages
    #[serde(default = "default_key_usage")]
    pub key_usage: Vec<KeyUsage>,
}

impl IssuanceOptions {
    /// Server-certificate defaults for `common_name`
    pub fn new(common_name: impl Into<String>, validity_days: u32) -> Self {
        Self {
            common_name: common_name.into(),
            sans: Vec::new(),
            validity_days,
            key_usage: default_key_usage(),
        }
    }

    /// Set the SAN list
    pub fn with_sans(mut self, sans: Vec<String>) -> Self {
        self.sans = sans;
        self
    }

    /// Validate before any external call is made
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.validity_days == 0 {
            return Err(crate::Error::invalid_request("Validity period must be at least one day"));
        }
        if self.common_name.trim().is_empty() && self.sans.is_empty() {
            return Err(crate::Error::invalid_request(
                "Either a common name or at least one SAN is required",
            ));
        }
        if self.sans.iter().any(|san| san.trim().is_empty()) {
            return Err(crate::Error::invalid_request("SAN entries cannot be empty"));
        }
        Ok(())
    }
}

fn default_key_usage() -> Vec<KeyUsage> {
    vec![
        KeyUsage::DigitalSignature,
        KeyUsage::KeyEncipherment,
        KeyUsage::ServerAuth,
    ]
}

/// Raw issuer output, before normalization
#[derive(Clone, PartialEq, Eq)]
pub struct IssuerResponse {
    /// PEM leaf certificate
    pub certificate_pem: String,
    /// PEM chain (may be empty)
    pub chain_pem: String,
    /// PEM private key, for issuers that generate the key themselves
    pub private_key_pem: Option<String>,
}

impl std::fmt::Debug for IssuerResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuerResponse")
            .field("certificate_pem", &self.certificate_pem)
            .field("chain_pem", &self.chain_pem)
            .field(
                "private_key_pem",
                &self.private_key_pem.as_ref().map(|_| "<REDACTED>"),
            )
            .finish()
    }
}

/// Trait for certificate authority plugins
///
/// # Trust Level: Untrusted
///
/// ## Allowed Capabilities
/// - ✅ Call the authority's API
/// - ✅ Return a certificate, a chain and optionally a generated key
///
/// ## Forbidden Capabilities
/// - ❌ Retry (a blind retry against a CA can double-bill an issuance)
/// - ❌ Touch the certificate store
/// - ❌ Decide whether a certificate needs rotation
///
/// Failures are returned as errors; the rotation scheduler decides when to
/// try again on a later pass.
#[async_trait]
pub trait IssuerPlugin: Send + Sync {
    /// Issue a certificate for a DER-encoded PKCS#10 request
    ///
    /// # Parameters
    ///
    /// - `csr`: DER-encoded, already-verified PKCS#10 request
    /// - `options`: validity, key usage and SANs
    /// - `authority_options`: opaque configuration from the Authority record
    async fn issue(
        &self,
        csr: &[u8],
        options: &IssuanceOptions,
        authority_options: &serde_json::Value,
    ) -> Result<IssuerResponse, crate::Error>;

    /// Whether certificates from this issuer can be rotated automatically
    fn supports_rotation(&self) -> bool {
        true
    }
}
