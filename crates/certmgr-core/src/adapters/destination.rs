//! Destination Adapter: push bundles, list holdings
//!
//! `deploy` never returns an error. Lookup failures, provider errors and
//! timeouts all become a [`DeployResult`] so one destination cannot abort a
//! fan-out to the others.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::model::{CertificateBundle, Destination};
use crate::registry::PluginRegistry;

/// How one deployment ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    /// The destination accepted the bundle
    Deployed,
    /// The call exceeded the per-destination timeout
    TimedOut,
    /// The destination (or its configuration) rejected the call
    Failed {
        /// Rendered error
        cause: String,
    },
    /// Cancellation was observed before the call was dispatched
    Cancelled,
}

/// Outcome of deploying one bundle to one destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployResult {
    /// Destination record name
    pub destination: String,
    /// What happened
    pub outcome: DeployOutcome,
}

impl DeployResult {
    /// Whether the destination now holds the bundle
    pub fn is_success(&self) -> bool {
        self.outcome == DeployOutcome::Deployed
    }

    fn failed(destination: &Destination, err: Error) -> Self {
        Self {
            destination: destination.name.clone(),
            outcome: DeployOutcome::Failed {
                cause: err.to_string(),
            },
        }
    }
}

/// Drives destination plugins through the registry
#[derive(Clone)]
pub struct DestinationAdapter {
    registry: Arc<PluginRegistry>,
    timeout: Duration,
}

impl DestinationAdapter {
    /// Create an adapter with a per-call timeout
    pub fn new(registry: Arc<PluginRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// Deploy `bundle` to `destination`
    pub async fn deploy(&self, destination: &Destination, bundle: &CertificateBundle) -> DeployResult {
        if !destination.active {
            return DeployResult::failed(
                destination,
                Error::invalid_request(format!("Destination '{}' is not active", destination.name)),
            );
        }

        let plugin = match self.registry.destination(&destination.plugin) {
            Ok(plugin) => plugin,
            Err(e) => {
                error!(
                    destination = %destination.name,
                    plugin = %destination.plugin,
                    "Destination plugin unavailable: {}", e
                );
                return DeployResult::failed(destination, e);
            }
        };

        let call = plugin.upload(&bundle.name, &destination.options, bundle);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(())) => {
                debug!(
                    destination = %destination.name,
                    fingerprint = %bundle.fingerprint,
                    "Bundle deployed"
                );
                DeployResult {
                    destination: destination.name.clone(),
                    outcome: DeployOutcome::Deployed,
                }
            }
            Ok(Err(e)) => {
                let err = Error::deploy(&destination.name, &destination.plugin, e);
                warn!(fingerprint = %bundle.fingerprint, "{}", err);
                DeployResult::failed(destination, err)
            }
            Err(_) => {
                warn!(
                    destination = %destination.name,
                    fingerprint = %bundle.fingerprint,
                    "Deploy timed out after {:?}", self.timeout
                );
                DeployResult {
                    destination: destination.name.clone(),
                    outcome: DeployOutcome::TimedOut,
                }
            }
        }
    }

    /// Deploy `bundle` to every destination concurrently
    ///
    /// Waits for every outcome. A destination whose call had not been
    /// dispatched when `cancel` fired reports [`DeployOutcome::Cancelled`];
    /// calls already in flight run to completion (or timeout).
    pub async fn deploy_all(
        &self,
        destinations: &[Destination],
        bundle: &CertificateBundle,
        cancel: &CancellationToken,
    ) -> Vec<DeployResult> {
        let calls = destinations.iter().map(|destination| async move {
            if cancel.is_cancelled() {
                return DeployResult {
                    destination: destination.name.clone(),
                    outcome: DeployOutcome::Cancelled,
                };
            }
            self.deploy(destination, bundle).await
        });
        join_all(calls).await
    }

    /// Identifiers of the certificates `destination` currently holds
    pub async fn list(&self, destination: &Destination) -> Result<Vec<String>> {
        let plugin = self.registry.destination(&destination.plugin)?;
        match tokio::time::timeout(
            self.timeout,
            plugin.get_certificates(&destination.name, &destination.options),
        )
        .await
        {
            Ok(result) => {
                result.map_err(|e| Error::deploy(&destination.name, &destination.plugin, e))
            }
            Err(_) => Err(Error::deploy(
                &destination.name,
                &destination.plugin,
                Error::Timeout(self.timeout),
            )),
        }
    }
}
