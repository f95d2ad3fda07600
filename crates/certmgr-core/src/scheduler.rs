//! Periodic pass scheduler
//!
//! Runs the four kinds of pass on independent intervals until cancelled:
//!
//! ```text
//!               ┌──────────────────────┐
//!   interval ──▶│ RotationOrchestrator │── run_pass / retry_pending
//!               └──────────────────────┘
//!               ┌──────────────────────┐
//!   interval ──▶│    ExpiryNotifier    │── run_pass
//!               └──────────────────────┘
//!               ┌──────────────────────┐
//!   interval ──▶│ ReconciliationEngine │── run_pass
//!               └──────────────────────┘
//!                          │
//!                          ▼
//!                 SchedulerEvent (bounded channel)
//! ```
//!
//! The next scheduled pass is the only retry mechanism: a failed pass is
//! reported and the loop carries on. Passes run one at a time on the
//! scheduler task; cancellation is observed between passes and inside the
//! rotation and reconciliation fan-outs.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{CertmgrConfig, SchedulerConfig};
use crate::error::Result;
use crate::expiry::ExpiryNotifier;
use crate::reconcile::ReconciliationEngine;
use crate::registry::PluginRegistry;
use crate::rotation::{RotationOrchestrator, RotationOutcome};
use crate::traits::CertificateStore;

/// Kind of scheduled pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    /// Rotate eligible certificates
    Rotation,
    /// Redeploy partially deployed certificates
    PendingDeployments,
    /// Send expiry warnings
    Expiry,
    /// Reconcile sources
    Reconciliation,
}

/// Events emitted by the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    /// Scheduler loop started
    Started,

    /// A rotation pass finished
    RotationCompleted {
        deployed: usize,
        partial: usize,
        failed: usize,
        skipped: usize,
    },

    /// A partial-deployment retry pass finished
    PendingDeploymentsCompleted {
        attempted: usize,
        completed: usize,
    },

    /// An expiry pass finished
    ExpiryCompleted {
        sent: usize,
    },

    /// A reconciliation pass finished
    ReconciliationCompleted {
        sources: usize,
        writes: usize,
        unmatched: usize,
    },

    /// A pass aborted (store failure)
    PassFailed {
        pass: PassKind,
        error: String,
    },

    /// Scheduler loop stopped
    Stopped {
        reason: String,
    },
}

/// Runs rotation, expiry and reconciliation passes on a timer
pub struct Scheduler {
    rotation: Arc<RotationOrchestrator>,
    expiry: Arc<ExpiryNotifier>,
    reconciliation: Arc<ReconciliationEngine>,
    config: SchedulerConfig,
    event_tx: mpsc::Sender<SchedulerEvent>,
}

impl Scheduler {
    /// Create a scheduler
    ///
    /// # Returns
    ///
    /// A tuple of (scheduler, event_receiver) where event_receiver yields
    /// scheduler events
    pub fn new(
        registry: Arc<PluginRegistry>,
        store: Arc<dyn CertificateStore>,
        config: &CertmgrConfig,
    ) -> Result<(Self, mpsc::Receiver<SchedulerEvent>)> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.scheduler.event_channel_capacity);
        let scheduler = Self {
            rotation: Arc::new(RotationOrchestrator::new(
                registry.clone(),
                store.clone(),
                config,
            )),
            expiry: Arc::new(ExpiryNotifier::new(registry.clone(), store.clone(), config)),
            reconciliation: Arc::new(ReconciliationEngine::new(registry, store, config)),
            config: config.scheduler.clone(),
            event_tx: tx,
        };
        Ok((scheduler, rx))
    }

    /// The orchestrator, for manual rotation requests
    pub fn rotation(&self) -> &RotationOrchestrator {
        &self.rotation
    }

    /// Run until `cancel` fires
    ///
    /// Every pass runs once immediately, then on its own interval.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.emit_event(SchedulerEvent::Started);

        let mut rotation = ticker(self.config.rotation_interval_secs);
        let mut pending = ticker(self.config.pending_interval_secs);
        let mut expiry = ticker(self.config.expiry_interval_secs);
        let mut reconcile = ticker(self.config.reconcile_interval_secs);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Shutdown signal received");
                    self.emit_event(SchedulerEvent::Stopped {
                        reason: "Cancelled".to_string(),
                    });
                    break;
                }
                _ = reconcile.tick() => self.run_once(PassKind::Reconciliation, &cancel).await,
                _ = rotation.tick() => self.run_once(PassKind::Rotation, &cancel).await,
                _ = pending.tick() => self.run_once(PassKind::PendingDeployments, &cancel).await,
                _ = expiry.tick() => self.run_once(PassKind::Expiry, &cancel).await,
            }
        }

        info!("Scheduler stopped");
        Ok(())
    }

    /// Run a single pass now and report it on the event channel
    pub async fn run_once(&self, pass: PassKind, cancel: &CancellationToken) {
        let now = Utc::now();
        let result = match pass {
            PassKind::Rotation => self.rotation.run_pass(now, cancel).await.map(|report| {
                let count = |is: fn(&RotationOutcome) -> bool| {
                    report.rotated.iter().filter(|r| is(&r.outcome)).count()
                };
                SchedulerEvent::RotationCompleted {
                    deployed: count(|o| matches!(o, RotationOutcome::Deployed { .. })),
                    partial: count(|o| matches!(o, RotationOutcome::DeployPartial { .. })),
                    failed: count(|o| {
                        matches!(
                            o,
                            RotationOutcome::ReissueFailed { .. } | RotationOutcome::RecordFailed { .. }
                        )
                    }),
                    skipped: report.skipped.len(),
                }
            }),
            PassKind::PendingDeployments => {
                self.rotation
                    .retry_pending(now, cancel)
                    .await
                    .map(|reports| SchedulerEvent::PendingDeploymentsCompleted {
                        attempted: reports.len(),
                        completed: reports.iter().filter(|r| r.pending.is_empty()).count(),
                    })
            }
            PassKind::Expiry => self.expiry.run_pass(now).await.map(|deliveries| {
                SchedulerEvent::ExpiryCompleted {
                    sent: deliveries.iter().filter(|d| d.result.is_delivered()).count(),
                }
            }),
            PassKind::Reconciliation => self.reconciliation.run_pass(cancel).await.map(|report| {
                SchedulerEvent::ReconciliationCompleted {
                    sources: report.sources.len(),
                    writes: report.writes(),
                    unmatched: report.sources.iter().map(|s| s.unmatched.len()).sum(),
                }
            }),
        };

        match result {
            Ok(event) => self.emit_event(event),
            Err(e) => {
                error!(pass = ?pass, "Pass failed: {}", e);
                self.emit_event(SchedulerEvent::PassFailed {
                    pass,
                    error: e.to_string(),
                });
            }
        }
    }

    fn emit_event(&self, event: SchedulerEvent) {
        // Never block a pass on a slow consumer
        if self.event_tx.try_send(event).is_err() {
            warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
        }
    }
}

fn ticker(secs: u64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_secs(secs));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}
