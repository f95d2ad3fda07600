//! Rotation Orchestrator
//!
//! Each certificate that is eligible for rotation moves through:
//!
//! ```text
//! Eligible ──▶ Reissuing ──┬──▶ Deployed ───────┐
//!                          ├──▶ DeployPartial ──┤
//!                          ├──▶ RecordFailed ───┼──▶ Notified
//!                          └──▶ ReissueFailed ──┘
//! ```
//!
//! The state reached before notification is reported as a
//! [`RotationOutcome`].
//!
//! - **Eligible**: `not_after - now <= window`, rotation enabled, the
//!   authority is active and its issuer supports rotation, and the retry
//!   policy allows another attempt.
//! - **Reissuing**: a fresh key and CSR are built from the old subject/SANs
//!   and sent through the [`AuthorityAdapter`]. A failure is terminal for
//!   this pass; the next scheduled pass is the retry.
//! - **Deployed / DeployPartial**: the new bundle goes to every destination
//!   that held the old certificate or was still pending for it,
//!   concurrently. Failed destinations are recorded on the new certificate
//!   so [`RotationOrchestrator::retry_pending`] can retry exactly those.
//! - **RecordFailed**: the store rejected the new record. The replacement's
//!   fingerprint is logged and reported; the old certificate stays current.
//! - **Notified**: one event per outcome, delivered to every Notification
//!   attached to the old certificate.
//!
//! The old certificate is never modified beyond being marked superseded.

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::{
    AuthorityAdapter, DeployOutcome, DeployResult, DestinationAdapter, NotificationAdapter,
    NotifyResult,
};
use crate::config::{CertmgrConfig, RetryPolicy, RotationConfig};
use crate::error::{Error, Result};
use crate::model::{
    Authority, Certificate, CertificateBundle, Destination, NotificationEvent, RotationStatus,
};
use crate::registry::PluginRegistry;
use crate::traits::{CertificateStore, IssuanceOptions};
use crate::x509;

/// Terminal outcome of one certificate's rotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// Reissued and deployed everywhere
    Deployed {
        /// Fingerprint of the replacement
        new: String,
    },
    /// Reissued, some destinations did not accept the bundle
    DeployPartial {
        /// Fingerprint of the replacement
        new: String,
        /// Destination names still holding the old certificate
        failed: Vec<String>,
    },
    /// Reissue failed; nothing was written
    ReissueFailed {
        /// Rendered cause
        cause: String,
    },
    /// Reissued and deployed, but the store rejected the result
    ///
    /// The old certificate is still current in the store, so a later pass
    /// will rotate it again.
    RecordFailed {
        /// Fingerprint of the unrecorded replacement
        new: String,
        /// Rendered store error
        cause: String,
    },
}

impl RotationOutcome {
    /// Fingerprint of the replacement, if one was issued
    pub fn new_fingerprint(&self) -> Option<&str> {
        match self {
            Self::Deployed { new }
            | Self::DeployPartial { new, .. }
            | Self::RecordFailed { new, .. } => Some(new),
            Self::ReissueFailed { .. } => None,
        }
    }
}

/// Full record of one certificate's rotation
#[derive(Debug, Clone)]
pub struct RotationReport {
    /// Fingerprint of the rotated (old) certificate
    pub certificate: String,
    /// Terminal outcome
    pub outcome: RotationOutcome,
    /// Per-destination results (empty on reissue failure)
    pub deployments: Vec<DeployResult>,
    /// Per-notification delivery results
    pub notifications: Vec<(String, NotifyResult)>,
}

/// Why an expiring certificate was not rotated this pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Discovered certificate with no issuing authority
    NoAuthority,
    /// Authority record does not exist
    UnknownAuthority(String),
    /// Authority record is inactive
    AuthorityInactive(String),
    /// Issuer cannot be driven by automatic rotation
    RotationUnsupported(String),
    /// Authority's plugin is missing or has the wrong capability
    Misconfigured(String),
    /// Waiting out the retry backoff
    Backoff {
        /// Earliest next attempt
        until: DateTime<Utc>,
    },
    /// Retry policy exhausted
    RetriesExhausted {
        /// Consecutive failures so far
        failures: u32,
    },
    /// The authority record could not be read
    StoreUnavailable(String),
}

/// Summary of one rotation pass
#[derive(Debug, Clone, Default)]
pub struct RotationPassReport {
    /// Rotations that ran
    pub rotated: Vec<RotationReport>,
    /// Expiring certificates that were left alone, by fingerprint
    pub skipped: Vec<(String, SkipReason)>,
    /// Selected certificates not started because the pass was cancelled
    pub cancelled: Vec<String>,
}

/// Summary of a redeploy attempt for a partially deployed certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReport {
    /// Certificate fingerprint
    pub certificate: String,
    /// Destinations that accepted the bundle on this attempt
    pub deployed: Vec<String>,
    /// Destinations still pending
    pub pending: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct RetryState {
    failures: u32,
    next_attempt: DateTime<Utc>,
}

/// Drives rotation passes
pub struct RotationOrchestrator {
    store: Arc<dyn CertificateStore>,
    authorities: AuthorityAdapter,
    destinations: DestinationAdapter,
    notifications: NotificationAdapter,
    config: RotationConfig,
    retry: RetryPolicy,
    attempts: Mutex<HashMap<String, RetryState>>,
}

impl RotationOrchestrator {
    /// Create an orchestrator over `registry` and `store`
    pub fn new(
        registry: Arc<PluginRegistry>,
        store: Arc<dyn CertificateStore>,
        config: &CertmgrConfig,
    ) -> Self {
        Self {
            store,
            authorities: AuthorityAdapter::new(registry.clone()),
            destinations: DestinationAdapter::new(registry.clone(), config.rotation.deploy_timeout()),
            notifications: NotificationAdapter::new(registry, config.notifications.timeout()),
            config: config.rotation.clone(),
            retry: config.retry.clone(),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Rotate every eligible certificate
    ///
    /// Certificates are processed concurrently up to `max_concurrency`.
    /// After `cancel` fires no further certificate is started; rotations
    /// already under way finish.
    ///
    /// # Errors
    ///
    /// Only a failure to list the candidates aborts the pass. Everything
    /// that goes wrong for a single certificate, store errors included, is
    /// recorded in the report.
    pub async fn run_pass(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<RotationPassReport> {
        let candidates = self
            .store
            .find_eligible_for_rotation(now, self.config.window())
            .await?;

        let mut report = RotationPassReport::default();
        let mut selected = Vec::new();
        for certificate in candidates {
            let selection = match self.select(&certificate, now, true).await {
                Ok(selection) => selection,
                Err(e) => {
                    error!(
                        fingerprint = %certificate.fingerprint,
                        "Failed to read authority for rotation: {}", e
                    );
                    Err(SkipReason::StoreUnavailable(e.to_string()))
                }
            };
            match selection {
                Ok(authority) => selected.push((certificate, authority)),
                Err(reason) => {
                    debug!(
                        fingerprint = %certificate.fingerprint,
                        reason = ?reason,
                        "Certificate not eligible for rotation"
                    );
                    report.skipped.push((certificate.fingerprint, reason));
                }
            }
        }

        info!(
            selected = selected.len(),
            skipped = report.skipped.len(),
            "Starting rotation pass"
        );

        let results: Vec<std::result::Result<RotationReport, String>> =
            stream::iter(selected)
                .map(|(certificate, authority)| async move {
                    if cancel.is_cancelled() {
                        return Err(certificate.fingerprint);
                    }
                    Ok(self.rotate_selected(certificate, authority, now, cancel).await)
                })
                .buffer_unordered(self.config.max_concurrency)
                .collect()
                .await;

        for result in results {
            match result {
                Ok(rotation) => report.rotated.push(rotation),
                Err(fingerprint) => report.cancelled.push(fingerprint),
            }
        }

        if !report.cancelled.is_empty() {
            info!(
                cancelled = report.cancelled.len(),
                "Rotation pass cancelled before all certificates started"
            );
        }
        Ok(report)
    }

    /// Rotate one certificate on request, regardless of the window and backoff
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] if the certificate is unknown, superseded,
    ///   opted out, or its authority cannot rotate
    /// - Store failures
    pub async fn rotate(
        &self,
        fingerprint: &str,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<RotationReport> {
        let certificate = self
            .store
            .get_certificate(fingerprint)
            .await?
            .ok_or_else(|| Error::invalid_request(format!("Unknown certificate {}", fingerprint)))?;
        if certificate.is_superseded() {
            return Err(Error::invalid_request(format!(
                "Certificate {} is already superseded",
                fingerprint
            )));
        }
        if !certificate.rotation {
            return Err(Error::invalid_request(format!(
                "Certificate {} has rotation disabled",
                fingerprint
            )));
        }

        match self.select(&certificate, now, false).await? {
            Ok(authority) => Ok(self.rotate_selected(certificate, authority, now, cancel).await),
            Err(reason) => Err(Error::invalid_request(format!(
                "Certificate {} cannot be rotated: {:?}",
                fingerprint, reason
            ))),
        }
    }

    /// Redeploy partially deployed certificates to their pending destinations
    ///
    /// Certificates that expired in the meantime are left alone. A store
    /// failure for one certificate is logged and the rest still run.
    pub async fn retry_pending(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PendingReport>> {
        let mut reports = Vec::new();
        for certificate in self.store.find_pending_deployments().await? {
            if cancel.is_cancelled() {
                break;
            }
            if certificate.is_expired(now) {
                warn!(
                    fingerprint = %certificate.fingerprint,
                    "Pending deployment skipped, certificate has expired"
                );
                continue;
            }
            let fingerprint = certificate.fingerprint.clone();
            match self.redeploy(certificate, cancel).await {
                Ok(report) => reports.push(report),
                Err(e) => error!(
                    fingerprint = %fingerprint,
                    "Failed to record pending deployments: {}", e
                ),
            }
        }
        Ok(reports)
    }

    /// Forget recorded reissue failures for a certificate
    pub fn reset_retry(&self, fingerprint: &str) {
        self.attempts().remove(fingerprint);
    }

    /// Consecutive reissue failures recorded for a certificate
    pub fn failures(&self, fingerprint: &str) -> u32 {
        self.attempts().get(fingerprint).map_or(0, |state| state.failures)
    }

    // Outer Result: store failure. Inner: authority to use, or why not.
    async fn select(
        &self,
        certificate: &Certificate,
        now: DateTime<Utc>,
        honour_backoff: bool,
    ) -> Result<std::result::Result<Authority, SkipReason>> {
        let Some(name) = &certificate.authority else {
            return Ok(Err(SkipReason::NoAuthority));
        };
        let Some(authority) = self.store.get_authority(name).await? else {
            return Ok(Err(SkipReason::UnknownAuthority(name.clone())));
        };
        if !authority.active {
            return Ok(Err(SkipReason::AuthorityInactive(name.clone())));
        }
        match self.authorities.supports_rotation(&authority) {
            Ok(true) => {}
            Ok(false) => return Ok(Err(SkipReason::RotationUnsupported(name.clone()))),
            Err(e) => {
                error!(
                    authority = %name,
                    plugin = %authority.plugin,
                    "Authority is misconfigured: {}", e
                );
                return Ok(Err(SkipReason::Misconfigured(e.to_string())));
            }
        }

        let recorded = self.attempts().get(&certificate.fingerprint).copied();
        if honour_backoff {
            if let Some(state) = recorded {
                if self.retry.exhausted(state.failures) {
                    return Ok(Err(SkipReason::RetriesExhausted {
                        failures: state.failures,
                    }));
                }
                if now < state.next_attempt {
                    return Ok(Err(SkipReason::Backoff {
                        until: state.next_attempt,
                    }));
                }
            }
        }
        Ok(Ok(authority))
    }

    async fn rotate_selected(
        &self,
        old: Certificate,
        authority: Authority,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> RotationReport {
        let fingerprint = old.fingerprint.clone();
        debug!(fingerprint = %fingerprint, authority = %authority.name, "Reissuing certificate");

        let issued = match self.reissue(&old, &authority).await {
            Ok(new) => new,
            Err(e) => {
                let cause = e.to_string();
                self.record_failure(&fingerprint, now);
                warn!(
                    fingerprint = %fingerprint,
                    authority = %authority.name,
                    failures = self.failures(&fingerprint),
                    "Reissue failed: {}", cause
                );
                let event = NotificationEvent::RotationFailed {
                    certificate: old.summary(),
                    cause: cause.clone(),
                };
                let notifications = self.announce(&old, &event).await;
                return RotationReport {
                    certificate: fingerprint,
                    outcome: RotationOutcome::ReissueFailed { cause },
                    deployments: Vec::new(),
                    notifications,
                };
            }
        };
        self.reset_retry(&fingerprint);

        // Destinations still waiting for the old certificate get the new one.
        let mut targets = old.destinations.clone();
        if let RotationStatus::DeployPartial { pending } = &old.status {
            targets.extend(pending.iter().cloned());
        }

        let mut new = issued;
        let bundle = new.bundle();
        let deployments = self.deploy_to(&targets, &bundle, cancel).await;

        let (deployed, failed) = partition(&deployments);
        new.destinations = deployed;
        new.status = if failed.is_empty() {
            RotationStatus::Active
        } else {
            RotationStatus::DeployPartial {
                pending: failed.clone(),
            }
        };

        if let Err(e) = self.record(&old, &new).await {
            let cause = e.to_string();
            // Counts against the retry policy like a failed reissue.
            self.record_failure(&fingerprint, now);
            error!(
                old = %old.fingerprint,
                new = %new.fingerprint,
                deployed = new.destinations.len(),
                "Rotated certificate could not be recorded: {}", cause
            );
            let event = NotificationEvent::RotationFailed {
                certificate: old.summary(),
                cause: format!(
                    "replacement {} was issued but could not be recorded: {}",
                    new.fingerprint, cause
                ),
            };
            let notifications = self.announce(&old, &event).await;
            return RotationReport {
                certificate: fingerprint,
                outcome: RotationOutcome::RecordFailed {
                    new: new.fingerprint,
                    cause,
                },
                deployments,
                notifications,
            };
        }

        let (outcome, event) = if failed.is_empty() {
            info!(
                old = %old.fingerprint,
                new = %new.fingerprint,
                destinations = new.destinations.len(),
                "Certificate rotated"
            );
            (
                RotationOutcome::Deployed {
                    new: new.fingerprint.clone(),
                },
                NotificationEvent::RotationSucceeded {
                    old: old.summary(),
                    new: new.summary(),
                },
            )
        } else {
            warn!(
                old = %old.fingerprint,
                new = %new.fingerprint,
                failed = ?failed,
                "Certificate rotated, deployment incomplete"
            );
            (
                RotationOutcome::DeployPartial {
                    new: new.fingerprint.clone(),
                    failed: failed.clone(),
                },
                NotificationEvent::RotationPartial {
                    old: old.summary(),
                    new: new.summary(),
                    failed_destinations: failed,
                },
            )
        };

        let notifications = self.announce(&old, &event).await;
        RotationReport {
            certificate: fingerprint,
            outcome,
            deployments,
            notifications,
        }
    }

    async fn record(&self, old: &Certificate, new: &Certificate) -> Result<()> {
        self.store.upsert_certificate(new).await?;
        self.store
            .mark_superseded(&old.fingerprint, &new.fingerprint)
            .await?;
        Ok(())
    }

    // New certificate record for `old`, not yet stored.
    async fn reissue(&self, old: &Certificate, authority: &Authority) -> Result<Certificate> {
        let csr = x509::build_csr(&old.common_name, &old.sans)?;

        let seconds = old.validity().num_seconds().max(1);
        let days = u32::try_from((seconds + 86_399) / 86_400).unwrap_or(u32::MAX);
        let options = IssuanceOptions::new(old.common_name.clone(), days).with_sans(old.sans.clone());

        let issued = self.authorities.issue(authority, &csr.der, &options).await?;
        let issuer_key = issued.private_key.is_some();

        let mut new = issued.into_certificate(old.name.clone());
        if !issuer_key {
            new.private_key = Some(csr.private_key);
        }
        new.notifications = old.notifications.clone();
        new.rotation = old.rotation;
        Ok(new)
    }

    async fn deploy_to(
        &self,
        names: &BTreeSet<String>,
        bundle: &CertificateBundle,
        cancel: &CancellationToken,
    ) -> Vec<DeployResult> {
        let mut records: Vec<Destination> = Vec::with_capacity(names.len());
        let mut missing = Vec::new();
        for name in names {
            let cause = match self.store.get_destination(name).await {
                Ok(Some(destination)) => {
                    records.push(destination);
                    continue;
                }
                Ok(None) => format!("Destination record '{}' not found", name),
                Err(e) => format!("Destination record '{}' could not be read: {}", name, e),
            };
            warn!(destination = %name, "{}", cause);
            missing.push(DeployResult {
                destination: name.clone(),
                outcome: DeployOutcome::Failed { cause },
            });
        }

        let mut results = self.destinations.deploy_all(&records, bundle, cancel).await;
        results.extend(missing);
        results
    }

    async fn redeploy(
        &self,
        mut certificate: Certificate,
        cancel: &CancellationToken,
    ) -> Result<PendingReport> {
        let RotationStatus::DeployPartial { pending } = &certificate.status else {
            return Err(Error::store(format!(
                "Certificate {} has no pending deployments",
                certificate.fingerprint
            )));
        };
        let pending: BTreeSet<String> = pending.iter().cloned().collect();

        let bundle = certificate.bundle();
        let results = self.deploy_to(&pending, &bundle, cancel).await;
        let (deployed, still_pending) = partition(&results);

        certificate.destinations.extend(deployed.iter().cloned());
        certificate.status = if still_pending.is_empty() {
            RotationStatus::Active
        } else {
            RotationStatus::DeployPartial {
                pending: still_pending.clone(),
            }
        };
        self.store.upsert_certificate(&certificate).await?;

        if still_pending.is_empty() {
            info!(fingerprint = %certificate.fingerprint, "Pending deployments completed");
        } else {
            debug!(
                fingerprint = %certificate.fingerprint,
                pending = ?still_pending,
                "Deployments still pending"
            );
        }

        Ok(PendingReport {
            certificate: certificate.fingerprint,
            deployed: deployed.into_iter().collect(),
            pending: still_pending,
        })
    }

    async fn announce(
        &self,
        certificate: &Certificate,
        event: &NotificationEvent,
    ) -> Vec<(String, NotifyResult)> {
        self.notifications
            .notify_all(self.store.as_ref(), &certificate.notifications, event)
            .await
    }

    fn record_failure(&self, fingerprint: &str, now: DateTime<Utc>) {
        let mut attempts = self.attempts();
        let state = attempts.entry(fingerprint.to_string()).or_insert(RetryState {
            failures: 0,
            next_attempt: now,
        });
        state.failures = state.failures.saturating_add(1);
        state.next_attempt = now + self.retry.backoff(state.failures);
    }

    fn attempts(&self) -> std::sync::MutexGuard<'_, HashMap<String, RetryState>> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// Successful destination names, and the sorted names of the rest.
fn partition(results: &[DeployResult]) -> (BTreeSet<String>, Vec<String>) {
    let mut deployed = BTreeSet::new();
    let mut failed = Vec::new();
    for result in results {
        if result.is_success() {
            deployed.insert(result.destination.clone());
        } else {
            failed.push(result.destination.clone());
        }
    }
    failed.sort();
    (deployed, failed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str, outcome: DeployOutcome) -> DeployResult {
        DeployResult {
            destination: name.to_string(),
            outcome,
        }
    }

    #[test]
    fn partition_separates_failures() {
        let results = vec![
            result("lb-b", DeployOutcome::TimedOut),
            result("cdn", DeployOutcome::Deployed),
            result("lb-a", DeployOutcome::Failed { cause: "403".into() }),
            result("vault", DeployOutcome::Cancelled),
        ];
        let (deployed, failed) = partition(&results);
        assert_eq!(deployed.into_iter().collect::<Vec<_>>(), vec!["cdn"]);
        assert_eq!(failed, vec!["lb-a", "lb-b", "vault"]);
    }

    #[test]
    fn outcome_exposes_new_fingerprint() {
        let deployed = RotationOutcome::Deployed { new: "ab".into() };
        assert_eq!(deployed.new_fingerprint(), Some("ab"));

        let unrecorded = RotationOutcome::RecordFailed {
            new: "cd".into(),
            cause: "disk full".into(),
        };
        assert_eq!(unrecorded.new_fingerprint(), Some("cd"));

        let failed = RotationOutcome::ReissueFailed { cause: "down".into() };
        assert_eq!(failed.new_fingerprint(), None);
    }
}
