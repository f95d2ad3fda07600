//! Authority Adapter: CSR in, normalized certificate out
//!
//! The CSR is verified locally before the registry is even consulted, so a
//! malformed request never costs an external (possibly billable) call.
//! There is no retry here.

use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{Authority, Certificate, PrivateKey, RotationStatus};
use crate::registry::PluginRegistry;
use crate::traits::IssuanceOptions;
use crate::x509::{self, CertificateInfo};

/// A certificate returned by an issuer, parsed and normalized
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// Fields parsed from the leaf
    pub info: CertificateInfo,
    /// Canonical PEM leaf
    pub body: String,
    /// Canonical PEM chain (may be empty)
    pub chain: String,
    /// Key generated by the issuer, if it generated one
    pub private_key: Option<PrivateKey>,
    /// Authority record that issued it
    pub authority: String,
}

impl IssuedCertificate {
    /// Default record name: common name (or first SAN) plus serial prefix
    pub fn default_name(&self) -> String {
        let subject = if self.info.common_name.is_empty() {
            self.info.sans.first().map(String::as_str).unwrap_or("certificate")
        } else {
            self.info.common_name.as_str()
        };
        let serial: String = self.info.serial.chars().take(8).collect();
        format!("{}-{}", subject.replace('*', "star"), serial)
    }

    /// Build the new, fully-populated Certificate record
    ///
    /// Destinations start empty; they are filled in as deployments succeed.
    pub fn into_certificate(self, name: impl Into<String>) -> Certificate {
        Certificate {
            name: name.into(),
            serial: self.info.serial,
            fingerprint: self.info.fingerprint,
            subject: self.info.subject,
            issuer: self.info.issuer,
            common_name: self.info.common_name,
            sans: self.info.sans,
            not_before: self.info.not_before,
            not_after: self.info.not_after,
            body: self.body,
            chain: self.chain,
            private_key: self.private_key,
            authority: Some(self.authority),
            destinations: Default::default(),
            notifications: Vec::new(),
            rotation: true,
            status: RotationStatus::Active,
        }
    }
}

/// Drives issuer plugins through the registry
#[derive(Clone)]
pub struct AuthorityAdapter {
    registry: Arc<PluginRegistry>,
}

impl AuthorityAdapter {
    /// Create an adapter over `registry`
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    /// Issue a certificate from `csr` through `authority`
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] for a malformed CSR, invalid options or an
    ///   inactive authority; the plugin is not called
    /// - [`Error::NotFound`] / [`Error::CapabilityMismatch`] if the
    ///   authority's plugin is misconfigured
    /// - [`Error::Issuance`] wrapping the plugin's error, or when the plugin
    ///   returns something that is not a usable certificate
    pub async fn issue(
        &self,
        authority: &Authority,
        csr: &[u8],
        options: &IssuanceOptions,
    ) -> Result<IssuedCertificate> {
        let requested = x509::inspect_csr(csr)?;
        options.validate()?;
        if !authority.active {
            return Err(Error::invalid_request(format!(
                "Authority '{}' is not active",
                authority.name
            )));
        }

        let issuer = self.registry.issuer(&authority.plugin)?;
        debug!(
            authority = %authority.name,
            plugin = %authority.plugin,
            subject = %requested.subject,
            "Requesting issuance"
        );

        let plugin = authority.plugin.as_str();
        let response = issuer
            .issue(&requested.der, options, &authority.options)
            .await
            .map_err(|e| Error::issuance(plugin, e))?;

        let info = x509::parse_certificate_pem(&response.certificate_pem)
            .map_err(|e| Error::issuance(plugin, e))?;
        let body = x509::normalize_chain(&response.certificate_pem)
            .map_err(|e| Error::issuance(plugin, e))?;
        let chain =
            x509::normalize_chain(&response.chain_pem).map_err(|e| Error::issuance(plugin, e))?;

        info!(
            authority = %authority.name,
            fingerprint = %info.fingerprint,
            serial = %info.serial,
            not_after = %info.not_after,
            "Certificate issued"
        );

        Ok(IssuedCertificate {
            info,
            body,
            chain,
            private_key: response.private_key_pem.map(PrivateKey::new),
            authority: authority.name.clone(),
        })
    }

    /// Whether the authority's issuer can be driven by automatic rotation
    pub fn supports_rotation(&self, authority: &Authority) -> Result<bool> {
        Ok(self.registry.issuer(&authority.plugin)?.supports_rotation())
    }
}
