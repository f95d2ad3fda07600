//! Source Adapter: lazy discovery snapshots
//!
//! `discover` returns a stream that does nothing until polled. Each stream
//! is one fresh snapshot of the inventory: endpoints come first, each paired
//! with the certificate it serves, followed by certificates no endpoint
//! references. A provider error ends the stream with an `Err` item.

use futures::Stream;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{CertificateMatch, Source};
use crate::registry::PluginRegistry;
use crate::traits::{ExternalCertificate, ExternalEndpoint};
use crate::x509::{self, CertificateInfo};

/// A reported certificate with whatever identity could be derived
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCertificate {
    /// What the provider reported
    pub external: ExternalCertificate,
    /// `Matched` with a fingerprint, or `Unmatched` with the provider id
    pub identity: CertificateMatch,
    /// Parsed body, when the provider exposed a usable PEM
    pub info: Option<CertificateInfo>,
}

impl DiscoveredCertificate {
    fn identify(external: ExternalCertificate) -> Self {
        let info = external
            .body
            .as_deref()
            .and_then(|body| x509::parse_certificate_pem(body).ok());

        let fingerprint = info
            .as_ref()
            .map(|info| info.fingerprint.clone())
            .or_else(|| {
                external
                    .fingerprint
                    .as_deref()
                    .and_then(x509::normalize_fingerprint)
            });

        let identity = match fingerprint {
            Some(fingerprint) => CertificateMatch::Matched { fingerprint },
            None => CertificateMatch::Unmatched {
                external_id: external.external_id.clone(),
            },
        };

        Self {
            external,
            identity,
            info,
        }
    }

    // Endpoint names a certificate id the inventory did not list.
    fn unknown(external_id: &str) -> Self {
        Self {
            external: ExternalCertificate {
                external_id: external_id.to_string(),
                name: None,
                body: None,
                chain: None,
                fingerprint: None,
            },
            identity: CertificateMatch::Unmatched {
                external_id: external_id.to_string(),
            },
            info: None,
        }
    }
}

/// One element of a discovery snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredItem {
    /// The certificate, if any
    pub certificate: Option<DiscoveredCertificate>,
    /// The endpoint serving it, if any
    pub endpoint: Option<ExternalEndpoint>,
}

impl DiscoveredItem {
    /// How the endpoint of this item is tied to a certificate
    pub fn certificate_match(&self) -> CertificateMatch {
        self.certificate
            .as_ref()
            .map(|c| c.identity.clone())
            .unwrap_or(CertificateMatch::None)
    }
}

/// Lazy, finite, single-use discovery snapshot
pub type DiscoveryStream = Pin<Box<dyn Stream<Item = Result<DiscoveredItem>> + Send>>;

/// Drives source plugins through the registry
#[derive(Clone)]
pub struct SourceAdapter {
    registry: Arc<PluginRegistry>,
}

impl SourceAdapter {
    /// Create an adapter over `registry`
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    /// Start a discovery snapshot of `source`
    ///
    /// Plugin lookup and the provider snapshot happen on first poll. Provider
    /// failures surface as [`Error::Discovery`].
    pub fn discover(&self, source: &Source) -> DiscoveryStream {
        let registry = self.registry.clone();
        let source = source.clone();

        Box::pin(async_stream::try_stream! {
            let plugin = registry.source(&source.plugin)?;

            let (certificates, endpoints) = plugin
                .snapshot(&source.options)
                .await
                .map_err(|e| Error::discovery(&source.name, &source.plugin, e))?;

            debug!(
                source = %source.name,
                certificates = certificates.len(),
                endpoints = endpoints.len(),
                "Discovery snapshot fetched"
            );

            let certificates: Vec<DiscoveredCertificate> = certificates
                .into_iter()
                .map(DiscoveredCertificate::identify)
                .collect();
            let index: HashMap<&str, usize> = certificates
                .iter()
                .enumerate()
                .map(|(i, c)| (c.external.external_id.as_str(), i))
                .collect();

            let mut served = HashSet::new();
            let mut items = Vec::with_capacity(endpoints.len() + certificates.len());
            for endpoint in endpoints {
                let certificate = endpoint.certificate_id.as_deref().map(|id| {
                    match index.get(id) {
                        Some(&i) => {
                            served.insert(i);
                            certificates[i].clone()
                        }
                        None => DiscoveredCertificate::unknown(id),
                    }
                });
                items.push(DiscoveredItem {
                    certificate,
                    endpoint: Some(endpoint),
                });
            }
            for (i, certificate) in certificates.iter().enumerate() {
                if !served.contains(&i) {
                    items.push(DiscoveredItem {
                        certificate: Some(certificate.clone()),
                        endpoint: None,
                    });
                }
            }

            for item in items {
                yield item;
            }
        })
    }
}
