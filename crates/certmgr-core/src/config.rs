//! Configuration types for the certificate manager
//!
//! All durations are plain integers (seconds or days) so the same structs
//! can be filled from JSON or from environment variables.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::model::{Authority, Certificate, Destination, Notification, Source};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CertmgrConfig {
    /// Rotation pass settings
    #[serde(default)]
    pub rotation: RotationConfig,

    /// Reconciliation pass settings
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,

    /// Notification delivery settings
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Retry policy for failed reissues across passes
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Pass intervals
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl CertmgrConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.rotation.validate()?;
        self.reconciliation.validate()?;
        self.notifications.validate()?;
        self.retry.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}

/// Rotation Orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationConfig {
    /// Lead time before expiry during which a certificate is eligible
    #[serde(default = "default_window_days")]
    pub window_days: u32,

    /// Certificates rotated concurrently within one pass
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,

    /// Per-destination deploy timeout
    #[serde(default = "default_deploy_timeout_secs")]
    pub deploy_timeout_secs: u64,
}

impl RotationConfig {
    /// Rotation window as a duration
    pub fn window(&self) -> Duration {
        Duration::days(i64::from(self.window_days))
    }

    /// Deploy timeout as a std duration
    pub fn deploy_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.deploy_timeout_secs)
    }

    /// Validate rotation settings
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.window_days == 0 {
            return Err(crate::Error::config("Rotation window must be at least one day"));
        }
        if self.max_concurrency == 0 {
            return Err(crate::Error::config("Rotation concurrency must be > 0"));
        }
        if self.deploy_timeout_secs == 0 {
            return Err(crate::Error::config("Deploy timeout must be > 0"));
        }
        Ok(())
    }
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            window_days: default_window_days(),
            max_concurrency: default_concurrency(),
            deploy_timeout_secs: default_deploy_timeout_secs(),
        }
    }
}

/// Reconciliation Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Consecutive absent passes before an endpoint is marked stale
    #[serde(default = "default_stale_after_passes")]
    pub stale_after_passes: u32,

    /// Sources reconciled concurrently within one pass
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,
}

impl ReconciliationConfig {
    /// Validate reconciliation settings
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.stale_after_passes == 0 {
            return Err(crate::Error::config("Stale threshold must be at least one pass"));
        }
        if self.max_concurrency == 0 {
            return Err(crate::Error::config("Reconciliation concurrency must be > 0"));
        }
        Ok(())
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            stale_after_passes: default_stale_after_passes(),
            max_concurrency: default_concurrency(),
        }
    }
}

/// Notification delivery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Per-delivery timeout
    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
}

impl NotificationConfig {
    /// Delivery timeout as a std duration
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }

    /// Validate notification settings
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.timeout_secs == 0 {
            return Err(crate::Error::config("Notification timeout must be > 0"));
        }
        Ok(())
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_notify_timeout_secs(),
        }
    }
}

/// Retry policy for certificates whose reissue failed
///
/// Retries only ever happen on a later scheduled pass. After the n-th
/// consecutive failure the certificate is skipped for
/// `initial_backoff_secs * 2^(n-1)`, capped at `max_backoff_secs`. Once
/// `max_attempts` failures accumulate the certificate is left alone until
/// the retry record is reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Consecutive failures before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff after the first failure
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,

    /// Upper bound on the backoff
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl RetryPolicy {
    /// Backoff to wait after `failures` consecutive failures
    pub fn backoff(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(63);
        let secs = self
            .initial_backoff_secs
            .checked_mul(1u64 << shift)
            .unwrap_or(u64::MAX)
            .min(self.max_backoff_secs);
        Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
    }

    /// Whether `failures` consecutive failures exhaust the policy
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.max_attempts == 0 {
            return Err(crate::Error::config("Retry max attempts must be > 0"));
        }
        if self.initial_backoff_secs > self.max_backoff_secs {
            return Err(crate::Error::config(
                "Initial retry backoff cannot exceed the maximum backoff",
            ));
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_secs: default_initial_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

/// How often each kind of pass runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Rotation pass interval
    #[serde(default = "default_rotation_interval_secs")]
    pub rotation_interval_secs: u64,

    /// Partial-deployment retry interval
    #[serde(default = "default_pending_interval_secs")]
    pub pending_interval_secs: u64,

    /// Expiry notification interval
    #[serde(default = "default_expiry_interval_secs")]
    pub expiry_interval_secs: u64,

    /// Reconciliation interval
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Capacity of the scheduler event channel
    ///
    /// When full, new events are dropped (with a warning log).
    ///
    /// Default: 1000 events
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl SchedulerConfig {
    /// Validate intervals
    pub fn validate(&self) -> Result<(), crate::Error> {
        let intervals = [
            ("rotation", self.rotation_interval_secs),
            ("pending deployment", self.pending_interval_secs),
            ("expiry", self.expiry_interval_secs),
            ("reconciliation", self.reconcile_interval_secs),
        ];
        for (pass, secs) in intervals {
            if secs == 0 {
                return Err(crate::Error::config(format!("{} interval must be > 0", pass)));
            }
        }
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rotation_interval_secs: default_rotation_interval_secs(),
            pending_interval_secs: default_pending_interval_secs(),
            expiry_interval_secs: default_expiry_interval_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

/// Records loaded into a store at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    /// Authority records
    #[serde(default)]
    pub authorities: Vec<Authority>,
    /// Destination records
    #[serde(default)]
    pub destinations: Vec<Destination>,
    /// Source records
    #[serde(default)]
    pub sources: Vec<Source>,
    /// Notification records
    #[serde(default)]
    pub notifications: Vec<Notification>,
    /// Certificates already under management
    #[serde(default)]
    pub certificates: Vec<Certificate>,
}

impl Inventory {
    /// Parse an inventory from JSON text and validate it
    pub fn from_json(json: &str) -> Result<Self, crate::Error> {
        let inventory: Inventory = serde_json::from_str(json)?;
        inventory.validate()?;
        Ok(inventory)
    }

    /// Check record names are unique and every reference resolves
    pub fn validate(&self) -> Result<(), crate::Error> {
        let authorities = unique_names("authority", self.authorities.iter().map(|a| &a.name))?;
        let destinations =
            unique_names("destination", self.destinations.iter().map(|d| &d.name))?;
        unique_names("source", self.sources.iter().map(|s| &s.name))?;
        let notifications =
            unique_names("notification", self.notifications.iter().map(|n| &n.name))?;

        let mut fingerprints = HashSet::new();
        for cert in &self.certificates {
            if !fingerprints.insert(cert.fingerprint.as_str()) {
                return Err(crate::Error::config(format!(
                    "Duplicate certificate fingerprint {}",
                    cert.fingerprint
                )));
            }
            if cert.not_after <= cert.not_before {
                return Err(crate::Error::config(format!(
                    "Certificate '{}' expires before it becomes valid",
                    cert.name
                )));
            }
            if let Some(authority) = &cert.authority {
                if !authorities.contains(authority.as_str()) {
                    return Err(dangling(&cert.name, "authority", authority));
                }
            }
            if let Some(missing) = cert
                .destinations
                .iter()
                .find(|d| !destinations.contains(d.as_str()))
            {
                return Err(dangling(&cert.name, "destination", missing));
            }
            if let Some(missing) = cert
                .notifications
                .iter()
                .find(|n| !notifications.contains(n.as_str()))
            {
                return Err(dangling(&cert.name, "notification", missing));
            }
        }
        Ok(())
    }
}

fn unique_names<'a>(
    kind: &str,
    names: impl Iterator<Item = &'a String>,
) -> Result<HashSet<&'a str>, crate::Error> {
    let mut seen = HashSet::new();
    for name in names {
        if name.trim().is_empty() {
            return Err(crate::Error::config(format!("Empty {} name", kind)));
        }
        if !seen.insert(name.as_str()) {
            return Err(crate::Error::config(format!("Duplicate {} name '{}'", kind, name)));
        }
    }
    Ok(seen)
}

fn dangling(certificate: &str, kind: &str, name: &str) -> crate::Error {
    crate::Error::config(format!(
        "Certificate '{}' references unknown {} '{}'",
        certificate, kind, name
    ))
}

fn default_window_days() -> u32 {
    14
}

fn default_concurrency() -> usize {
    4
}

fn default_deploy_timeout_secs() -> u64 {
    30
}

fn default_stale_after_passes() -> u32 {
    3
}

fn default_notify_timeout_secs() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_secs() -> u64 {
    3600
}

fn default_max_backoff_secs() -> u64 {
    86_400
}

fn default_rotation_interval_secs() -> u64 {
    3600
}

fn default_pending_interval_secs() -> u64 {
    900
}

fn default_expiry_interval_secs() -> u64 {
    86_400
}

fn default_reconcile_interval_secs() -> u64 {
    1800
}

fn default_event_channel_capacity() -> usize {
    1000
}
