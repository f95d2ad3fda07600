//! Reconciliation Engine
//!
//! Aligns stored endpoint and certificate records with each active source's
//! current snapshot:
//!
//! - certificates with a derivable fingerprint and a readable body are
//!   inserted when unknown (a source never rewrites an existing record)
//! - reported endpoints are upserted by (source, external id)
//! - stored endpoints missing from the snapshot accumulate missed passes
//!   and are marked stale once the threshold is reached; they are never
//!   deleted
//!
//! A snapshot that fails part-way is discarded for staleness purposes: an
//! endpoint is only counted as absent after a complete snapshot.

use futures::StreamExt;
use futures::stream;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapters::{DiscoveredCertificate, SourceAdapter};
use crate::config::{CertmgrConfig, ReconciliationConfig};
use crate::error::Result;
use crate::model::{Certificate, CertificateMatch, Endpoint, RotationStatus, Source};
use crate::registry::PluginRegistry;
use crate::traits::CertificateStore;
use crate::x509;

/// Result of reconciling one source
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceReport {
    /// Source record name
    pub source: String,
    /// Certificate records created
    pub certificates_written: usize,
    /// Endpoint records created or updated (including missed-pass counters)
    pub endpoints_written: usize,
    /// Endpoints newly marked stale
    pub marked_stale: Vec<String>,
    /// Provider certificate ids with no derivable fingerprint
    pub unmatched: Vec<String>,
    /// Set when the snapshot could not be read to the end
    pub error: Option<String>,
}

impl SourceReport {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Self::default()
        }
    }

    /// Writes made for this source
    pub fn writes(&self) -> usize {
        self.certificates_written + self.endpoints_written + self.marked_stale.len()
    }
}

/// Result of one reconciliation pass
#[derive(Debug, Clone, Default)]
pub struct ReconcilePassReport {
    /// One entry per source that was started
    pub sources: Vec<SourceReport>,
    /// Sources not started because the pass was cancelled
    pub cancelled: Vec<String>,
}

impl ReconcilePassReport {
    /// Total writes across all sources
    pub fn writes(&self) -> usize {
        self.sources.iter().map(SourceReport::writes).sum()
    }
}

/// Drives reconciliation passes
pub struct ReconciliationEngine {
    store: Arc<dyn CertificateStore>,
    sources: SourceAdapter,
    config: ReconciliationConfig,
}

impl ReconciliationEngine {
    /// Create an engine over `registry` and `store`
    pub fn new(
        registry: Arc<PluginRegistry>,
        store: Arc<dyn CertificateStore>,
        config: &CertmgrConfig,
    ) -> Self {
        Self {
            store,
            sources: SourceAdapter::new(registry),
            config: config.reconciliation.clone(),
        }
    }

    /// Reconcile every active source, up to `max_concurrency` at once
    ///
    /// # Errors
    ///
    /// Store failures abort the pass. Provider failures are recorded on the
    /// affected source's report.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> Result<ReconcilePassReport> {
        let sources: Vec<Source> = self
            .store
            .list_sources()
            .await?
            .into_iter()
            .filter(|source| source.active)
            .collect();

        let results: Vec<std::result::Result<Result<SourceReport>, String>> = stream::iter(sources)
            .map(|source| async move {
                if cancel.is_cancelled() {
                    return Err(source.name);
                }
                Ok(self.reconcile_source(&source, cancel).await)
            })
            .buffer_unordered(self.config.max_concurrency)
            .collect()
            .await;

        let mut report = ReconcilePassReport::default();
        for result in results {
            match result {
                Ok(source) => report.sources.push(source?),
                Err(name) => report.cancelled.push(name),
            }
        }
        report.sources.sort_by(|a, b| a.source.cmp(&b.source));

        info!(
            sources = report.sources.len(),
            writes = report.writes(),
            cancelled = report.cancelled.len(),
            "Reconciliation pass complete"
        );
        Ok(report)
    }

    /// Reconcile one source against its stored endpoints
    pub async fn reconcile_source(
        &self,
        source: &Source,
        cancel: &CancellationToken,
    ) -> Result<SourceReport> {
        let mut report = SourceReport::new(&source.name);
        let previous: HashMap<String, Endpoint> = self
            .store
            .list_endpoints(&source.name)
            .await?
            .into_iter()
            .map(|endpoint| (endpoint.external_id.clone(), endpoint))
            .collect();

        let mut seen = HashSet::new();
        let mut unmatched = BTreeSet::new();
        let mut snapshot = self.sources.discover(source);

        while let Some(item) = snapshot.next().await {
            if cancel.is_cancelled() {
                report.error = Some("Cancelled before the snapshot was complete".to_string());
                break;
            }

            let item = match item {
                Ok(item) => item,
                Err(e) => {
                    warn!(source = %source.name, "Discovery aborted: {}", e);
                    report.error = Some(e.to_string());
                    break;
                }
            };

            if let Some(certificate) = &item.certificate {
                match &certificate.identity {
                    CertificateMatch::Unmatched { external_id } => {
                        unmatched.insert(external_id.clone());
                    }
                    CertificateMatch::Matched { .. } => {
                        if self.store_discovered(source, certificate).await? {
                            report.certificates_written += 1;
                        }
                    }
                    CertificateMatch::None => {}
                }
            }

            if let Some(reported) = &item.endpoint {
                seen.insert(reported.external_id.clone());
                let endpoint = Endpoint {
                    source: source.name.clone(),
                    external_id: reported.external_id.clone(),
                    host: reported.host.clone(),
                    port: reported.port,
                    kind: reported.kind.clone(),
                    certificate: item.certificate_match(),
                    missed_passes: 0,
                    stale: false,
                };
                if self.store.upsert_endpoint(&endpoint).await?.wrote() {
                    report.endpoints_written += 1;
                }
            }
        }
        report.unmatched = unmatched.into_iter().collect();

        if report.error.is_some() {
            return Ok(report);
        }

        for (external_id, mut endpoint) in previous {
            if seen.contains(&external_id) || endpoint.stale {
                continue;
            }
            endpoint.missed_passes = endpoint.missed_passes.saturating_add(1);
            if self.store.upsert_endpoint(&endpoint).await?.wrote() {
                report.endpoints_written += 1;
            }
            if endpoint.missed_passes >= self.config.stale_after_passes
                && self
                    .store
                    .mark_stale(&source.name, &external_id)
                    .await?
                    .wrote()
            {
                info!(
                    source = %source.name,
                    endpoint = %external_id,
                    missed_passes = endpoint.missed_passes,
                    "Endpoint marked stale"
                );
                report.marked_stale.push(external_id);
            }
        }
        report.marked_stale.sort();

        if !report.unmatched.is_empty() {
            warn!(
                source = %source.name,
                unmatched = ?report.unmatched,
                "Certificates without a derivable fingerprint need review"
            );
        }
        debug!(source = %source.name, writes = report.writes(), "Source reconciled");
        Ok(report)
    }

    // Inserts an unknown discovered certificate. Returns whether it wrote.
    async fn store_discovered(
        &self,
        source: &Source,
        discovered: &DiscoveredCertificate,
    ) -> Result<bool> {
        let (Some(info), Some(body)) = (&discovered.info, &discovered.external.body) else {
            return Ok(false);
        };
        if self.store.get_certificate(&info.fingerprint).await?.is_some() {
            return Ok(false);
        }

        let chain = match discovered.external.chain.as_deref() {
            Some(chain) => x509::normalize_chain(chain).unwrap_or_else(|e| {
                warn!(
                    source = %source.name,
                    certificate = %discovered.external.external_id,
                    "Ignoring unreadable chain: {}", e
                );
                String::new()
            }),
            None => String::new(),
        };

        let certificate = Certificate {
            name: discovered
                .external
                .name
                .clone()
                .unwrap_or_else(|| discovered.external.external_id.clone()),
            serial: info.serial.clone(),
            fingerprint: info.fingerprint.clone(),
            subject: info.subject.clone(),
            issuer: info.issuer.clone(),
            common_name: info.common_name.clone(),
            sans: info.sans.clone(),
            not_before: info.not_before,
            not_after: info.not_after,
            body: x509::normalize_chain(body).unwrap_or_else(|_| body.clone()),
            chain,
            private_key: None,
            authority: None,
            destinations: Default::default(),
            notifications: Vec::new(),
            rotation: false,
            status: RotationStatus::Active,
        };

        let written = self.store.upsert_certificate(&certificate).await?.wrote();
        if written {
            debug!(
                source = %source.name,
                fingerprint = %certificate.fingerprint,
                "Discovered certificate recorded"
            );
        }
        Ok(written)
    }
}
