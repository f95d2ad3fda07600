// # certmgrd - Certificate Lifecycle Daemon
//
// A thin integration layer over certmgr-core. It:
// 1. Reads configuration from environment variables
// 2. Initializes tracing and the runtime
// 3. Registers the built-in plugins
// 4. Loads the record inventory into an in-memory store
// 5. Runs scheduled rotation, expiry and reconciliation passes until
//    SIGTERM/SIGINT
//
// Rotation, deployment and retry logic all live in certmgr-core.
//
// ## Configuration
//
// ### Inventory
// - `CERTMGR_INVENTORY_PATH`: JSON file of authorities, destinations,
//   sources, notifications and certificates (required)
//
// ### Built-in plugins
// - `CERTMGR_FILESYSTEM_ROOT`: Directory every `filesystem` path must live under
// - `CERTMGR_WEBHOOK_URL`: URL for `webhook` records that name none
//
// ### Rotation
// - `CERTMGR_ROTATION_WINDOW_DAYS`: Lead time before expiry (1-365)
// - `CERTMGR_ROTATION_CONCURRENCY`: Certificates rotated at once (1-64)
// - `CERTMGR_DEPLOY_TIMEOUT_SECS`: Per-destination deploy timeout (1-3600)
//
// ### Retry
// - `CERTMGR_RETRY_MAX_ATTEMPTS`: Failed reissues before giving up (1-20)
// - `CERTMGR_RETRY_INITIAL_BACKOFF_SECS`: Backoff after the first failure
// - `CERTMGR_RETRY_MAX_BACKOFF_SECS`: Backoff ceiling (up to 7 days)
//
// ### Reconciliation and notifications
// - `CERTMGR_STALE_AFTER_PASSES`: Missed passes before an endpoint is stale (1-100)
// - `CERTMGR_RECONCILE_CONCURRENCY`: Sources read at once (1-64)
// - `CERTMGR_NOTIFY_TIMEOUT_SECS`: Per-delivery timeout (1-300)
//
// ### Intervals (10-86400 seconds)
// - `CERTMGR_ROTATION_INTERVAL_SECS`
// - `CERTMGR_PENDING_INTERVAL_SECS`
// - `CERTMGR_EXPIRY_INTERVAL_SECS`
// - `CERTMGR_RECONCILE_INTERVAL_SECS`
//
// ### Logging
// - `CERTMGR_LOG_LEVEL`: trace, debug, info, warn, error (default info)
//
// ## Example
//
// ```bash
// export CERTMGR_INVENTORY_PATH=/etc/certmgr/inventory.json
// export CERTMGR_FILESYSTEM_ROOT=/etc/ssl/managed
// export CERTMGR_ROTATION_WINDOW_DAYS=21
//
// certmgrd
// ```

use anyhow::{Context, Result};
use certmgr_core::registry::Capability;
use certmgr_core::scheduler::{Scheduler, SchedulerEvent};
use certmgr_core::{CertificateStore, CertmgrConfig, Inventory, MemoryStore, PluginRegistry};
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// How long a running pass may take to wind down after a shutdown signal
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CertmgrExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<CertmgrExitCode> for ExitCode {
    fn from(code: CertmgrExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Daemon configuration
#[derive(Debug)]
struct Config {
    inventory_path: Option<PathBuf>,
    filesystem_root: Option<PathBuf>,
    webhook_url: Option<String>,
    log_level: String,
    core: CertmgrConfig,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from any variable lookup
    ///
    /// Unset and blank variables keep their defaults; malformed numbers
    /// are an error.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let mut core = CertmgrConfig::default();
        set(&mut core.rotation.window_days, &var, "CERTMGR_ROTATION_WINDOW_DAYS")?;
        set(&mut core.rotation.max_concurrency, &var, "CERTMGR_ROTATION_CONCURRENCY")?;
        set(&mut core.rotation.deploy_timeout_secs, &var, "CERTMGR_DEPLOY_TIMEOUT_SECS")?;
        set(&mut core.retry.max_attempts, &var, "CERTMGR_RETRY_MAX_ATTEMPTS")?;
        set(&mut core.retry.initial_backoff_secs, &var, "CERTMGR_RETRY_INITIAL_BACKOFF_SECS")?;
        set(&mut core.retry.max_backoff_secs, &var, "CERTMGR_RETRY_MAX_BACKOFF_SECS")?;
        set(&mut core.reconciliation.stale_after_passes, &var, "CERTMGR_STALE_AFTER_PASSES")?;
        set(&mut core.reconciliation.max_concurrency, &var, "CERTMGR_RECONCILE_CONCURRENCY")?;
        set(&mut core.notifications.timeout_secs, &var, "CERTMGR_NOTIFY_TIMEOUT_SECS")?;
        set(&mut core.scheduler.rotation_interval_secs, &var, "CERTMGR_ROTATION_INTERVAL_SECS")?;
        set(&mut core.scheduler.pending_interval_secs, &var, "CERTMGR_PENDING_INTERVAL_SECS")?;
        set(&mut core.scheduler.expiry_interval_secs, &var, "CERTMGR_EXPIRY_INTERVAL_SECS")?;
        set(&mut core.scheduler.reconcile_interval_secs, &var, "CERTMGR_RECONCILE_INTERVAL_SECS")?;

        Ok(Self {
            inventory_path: var("CERTMGR_INVENTORY_PATH").map(PathBuf::from),
            filesystem_root: var("CERTMGR_FILESYSTEM_ROOT").map(PathBuf::from),
            webhook_url: var("CERTMGR_WEBHOOK_URL"),
            log_level: var("CERTMGR_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            core,
        })
    }

    /// Validate the configuration
    ///
    /// Checks required values, numeric ranges and URL schemes, then the
    /// core configuration's own invariants.
    fn validate(&self) -> Result<()> {
        match &self.inventory_path {
            None => anyhow::bail!(
                "CERTMGR_INVENTORY_PATH is required. \
                Set it via: export CERTMGR_INVENTORY_PATH=/etc/certmgr/inventory.json"
            ),
            Some(path) if !path.is_file() => anyhow::bail!(
                "CERTMGR_INVENTORY_PATH does not name a file: {}",
                path.display()
            ),
            Some(_) => {}
        }

        if let Some(root) = &self.filesystem_root
            && !root.is_absolute()
        {
            anyhow::bail!(
                "CERTMGR_FILESYSTEM_ROOT must be an absolute path. Got: {}",
                root.display()
            );
        }

        if let Some(url) = &self.webhook_url {
            if !url.starts_with("https://") && !url.starts_with("http://") {
                anyhow::bail!("CERTMGR_WEBHOOK_URL must use HTTP or HTTPS scheme. Got: {}", url);
            }
            if url.starts_with("http://") {
                eprintln!(
                    "WARNING: CERTMGR_WEBHOOK_URL uses HTTP (not HTTPS). \
                    Event payloads will travel in clear text."
                );
            }
        }

        let core = &self.core;
        check_range("CERTMGR_ROTATION_WINDOW_DAYS", core.rotation.window_days, 1, 365)?;
        check_range("CERTMGR_ROTATION_CONCURRENCY", core.rotation.max_concurrency, 1, 64)?;
        check_range("CERTMGR_DEPLOY_TIMEOUT_SECS", core.rotation.deploy_timeout_secs, 1, 3600)?;
        check_range("CERTMGR_RETRY_MAX_ATTEMPTS", core.retry.max_attempts, 1, 20)?;
        check_range("CERTMGR_RETRY_INITIAL_BACKOFF_SECS", core.retry.initial_backoff_secs, 1, 604_800)?;
        check_range("CERTMGR_RETRY_MAX_BACKOFF_SECS", core.retry.max_backoff_secs, 1, 604_800)?;
        check_range("CERTMGR_STALE_AFTER_PASSES", core.reconciliation.stale_after_passes, 1, 100)?;
        check_range("CERTMGR_RECONCILE_CONCURRENCY", core.reconciliation.max_concurrency, 1, 64)?;
        check_range("CERTMGR_NOTIFY_TIMEOUT_SECS", core.notifications.timeout_secs, 1, 300)?;
        check_range("CERTMGR_ROTATION_INTERVAL_SECS", core.scheduler.rotation_interval_secs, 10, 86_400)?;
        check_range("CERTMGR_PENDING_INTERVAL_SECS", core.scheduler.pending_interval_secs, 10, 86_400)?;
        check_range("CERTMGR_EXPIRY_INTERVAL_SECS", core.scheduler.expiry_interval_secs, 10, 86_400)?;
        check_range("CERTMGR_RECONCILE_INTERVAL_SECS", core.scheduler.reconcile_interval_secs, 10, 86_400)?;

        core.validate().context("Invalid certificate manager configuration")?;

        if parse_level(&self.log_level).is_none() {
            anyhow::bail!(
                "CERTMGR_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            );
        }

        Ok(())
    }
}

fn set<T>(field: &mut T, var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<()>
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(raw) = var(name) {
        *field = raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} must be a number. Got '{}': {}", name, raw, e))?;
    }
    Ok(())
}

fn check_range<T>(name: &str, value: T, min: T, max: T) -> Result<()>
where
    T: PartialOrd + Display,
{
    if value < min || value > max {
        anyhow::bail!("{} must be between {} and {}. Got: {}", name, min, max, value);
    }
    Ok(())
}

fn parse_level(level: &str) -> Option<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

fn main() -> ExitCode {
    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return CertmgrExitCode::ConfigError.into();
        }
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {:#}", e);
        return CertmgrExitCode::ConfigError.into();
    }

    // Initialize tracing
    let log_level = parse_level(&config.log_level).unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return CertmgrExitCode::ConfigError.into();
    }

    info!("Starting certmgrd daemon");

    // Enter tokio runtime
    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return CertmgrExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        let daemon = match Daemon::start(config).await {
            Ok(daemon) => daemon,
            Err(e) => {
                error!("Startup failed: {:#}", e);
                return CertmgrExitCode::ConfigError;
            }
        };

        if let Err(e) = daemon.run().await {
            error!("Daemon error: {:#}", e);
            CertmgrExitCode::RuntimeError
        } else {
            CertmgrExitCode::CleanShutdown
        }
    });

    result.into()
}

/// A configured daemon, ready to run
struct Daemon {
    scheduler: Scheduler,
    events: mpsc::Receiver<SchedulerEvent>,
}

impl Daemon {
    /// Register plugins, load the inventory and build the scheduler
    ///
    /// Every failure here is a configuration failure.
    async fn start(config: Config) -> Result<Self> {
        let registry = Arc::new(PluginRegistry::new());
        register_builtins(&registry, &config)?;
        info!(plugins = ?registry.names(), "Plugins registered");

        let path = config
            .inventory_path
            .as_ref()
            .context("CERTMGR_INVENTORY_PATH is required")?;
        let inventory = load_inventory(path).await?;
        verify_plugins(&registry, &inventory)?;

        info!(
            authorities = inventory.authorities.len(),
            destinations = inventory.destinations.len(),
            sources = inventory.sources.len(),
            notifications = inventory.notifications.len(),
            certificates = inventory.certificates.len(),
            "Inventory loaded"
        );

        let store: Arc<dyn CertificateStore> = Arc::new(MemoryStore::from_inventory(inventory));
        let (scheduler, events) = Scheduler::new(registry, store, &config.core)?;
        Ok(Self { scheduler, events })
    }

    /// Run scheduled passes until a shutdown signal arrives
    async fn run(self) -> Result<()> {
        let Daemon {
            scheduler,
            mut events,
        } = self;

        let logger = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                log_event(&event);
            }
        });

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let signals = tokio::spawn(async move {
            let received = wait_for_shutdown().await;
            shutdown.cancel();
            received
        });

        scheduler.run(cancel).await?;

        // The scheduler only returns once cancelled.
        let signal = tokio::time::timeout(SHUTDOWN_TIMEOUT, signals)
            .await
            .map_err(|_| anyhow::anyhow!("Shutdown timeout after {:?}", SHUTDOWN_TIMEOUT))?
            .context("Signal handler task failed")??;
        info!("Received shutdown signal: {}", signal);

        drop(scheduler);
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, logger).await.is_err() {
            warn!("Event logger did not drain before shutdown");
        }

        info!("Shutting down daemon");
        Ok(())
    }
}

/// Register the built-in plugins enabled at compile time
fn register_builtins(registry: &PluginRegistry, config: &Config) -> Result<()> {
    #[cfg(feature = "filesystem")]
    {
        use certmgr_plugin_filesystem::FilesystemPlugin;

        let plugin = match &config.filesystem_root {
            Some(root) => FilesystemPlugin::with_root(root),
            None => FilesystemPlugin::new(),
        };
        certmgr_plugin_filesystem::register_plugin(registry, plugin)
            .context("Failed to register the filesystem plugin")?;
    }

    #[cfg(feature = "http")]
    {
        use certmgr_plugin_http::WebhookNotifier;

        let mut webhook = WebhookNotifier::new()?;
        if let Some(url) = &config.webhook_url {
            webhook = webhook.with_default_url(url.clone());
        }
        certmgr_plugin_http::register_with(registry, webhook)
            .context("Failed to register the HTTP plugins")?;
    }

    #[cfg(not(all(feature = "filesystem", feature = "http")))]
    let _ = (registry, config);

    Ok(())
}

async fn load_inventory(path: &std::path::Path) -> Result<Inventory> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read inventory {}", path.display()))?;
    Inventory::from_json(&text).with_context(|| format!("Invalid inventory {}", path.display()))
}

/// Check every record names a registered plugin with the right capability
///
/// Inactive records are checked too.
fn verify_plugins(registry: &PluginRegistry, inventory: &Inventory) -> Result<()> {
    let references = inventory
        .authorities
        .iter()
        .map(|r| ("authority", &r.name, &r.plugin, Capability::Issuer))
        .chain(
            inventory
                .destinations
                .iter()
                .map(|r| ("destination", &r.name, &r.plugin, Capability::Destination)),
        )
        .chain(
            inventory
                .sources
                .iter()
                .map(|r| ("source", &r.name, &r.plugin, Capability::Source)),
        )
        .chain(
            inventory
                .notifications
                .iter()
                .map(|r| ("notification", &r.name, &r.plugin, Capability::Notification)),
        );

    for (kind, name, plugin, capability) in references {
        registry
            .get(plugin, capability)
            .with_context(|| format!("{} '{}' cannot use plugin '{}'", kind, name, plugin))?;
    }
    Ok(())
}

fn log_event(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::Started => info!("Scheduler started"),
        SchedulerEvent::RotationCompleted {
            deployed,
            partial,
            failed,
            skipped,
        } => {
            if *partial > 0 || *failed > 0 {
                warn!(deployed, partial, failed, skipped, "Rotation pass completed with failures");
            } else {
                info!(deployed, skipped, "Rotation pass completed");
            }
        }
        SchedulerEvent::PendingDeploymentsCompleted {
            attempted,
            completed,
        } => info!(attempted, completed, "Pending deployment pass completed"),
        SchedulerEvent::ExpiryCompleted { sent } => info!(sent, "Expiry pass completed"),
        SchedulerEvent::ReconciliationCompleted {
            sources,
            writes,
            unmatched,
        } => info!(sources, writes, unmatched, "Reconciliation pass completed"),
        SchedulerEvent::PassFailed { pass, error } => {
            error!(pass = ?pass, "Pass failed: {}", error)
        }
        SchedulerEvent::Stopped { reason } => info!("Scheduler stopped: {}", reason),
    }
}

/// Wait for a shutdown signal (SIGTERM, SIGINT)
///
/// # Returns
///
/// The name of the signal received.
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    let received = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(received)
}

/// Wait for a shutdown signal (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}
