//! Capability-typed plugin registry
//!
//! The registry maps a plugin name to a live provider instance. A plugin is
//! registered once with the set of capabilities it implements; records
//! (Authority, Destination, Source, Notification) refer to it by name.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use certmgr_core::registry::{Capability, Plugin, PluginRegistry};
//! use std::sync::Arc;
//!
//! let registry = PluginRegistry::new();
//!
//! // One instance may serve more than one capability
//! let fs = Arc::new(FilesystemPlugin::new());
//! registry.register(
//!     Plugin::new("filesystem")
//!         .with_destination(fs.clone())
//!         .with_source(fs),
//! )?;
//!
//! let destination = registry.destination("filesystem")?;
//! ```
//!
//! ## Registration
//!
//! Plugin crates expose a `register()` function called once at startup:
//!
//! ```rust,ignore
//! pub fn register(registry: &PluginRegistry) -> certmgr_core::Result<()> {
//!     registry.register(Plugin::new("webhook").with_notification(Arc::new(Webhook::new())))
//! }
//! ```
//!
//! Registration is expected only at startup or test setup; lookups are
//! read-locked and safe from many workers at once. The registry does not
//! know which records reference a plugin, so "is this plugin still in use"
//! is answered at lookup time by the caller.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::traits::{DestinationPlugin, IssuerPlugin, NotificationPlugin, SourcePlugin};

/// The closed set of plugin contracts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Issues certificates
    Issuer,
    /// Receives certificate bundles
    Destination,
    /// Enumerates external inventories
    Source,
    /// Delivers events
    Notification,
}

impl Capability {
    /// Every capability, in declaration order
    pub const ALL: [Capability; 4] = [
        Capability::Issuer,
        Capability::Destination,
        Capability::Source,
        Capability::Notification,
    ];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Capability::Issuer => "issuer",
            Capability::Destination => "destination",
            Capability::Source => "source",
            Capability::Notification => "notification",
        };
        f.write_str(label)
    }
}

/// A live provider instance, tagged with the contract it is used through
#[derive(Clone)]
pub enum Provider {
    /// Issuer implementation
    Issuer(Arc<dyn IssuerPlugin>),
    /// Destination implementation
    Destination(Arc<dyn DestinationPlugin>),
    /// Source implementation
    Source(Arc<dyn SourcePlugin>),
    /// Notification implementation
    Notification(Arc<dyn NotificationPlugin>),
}

impl Provider {
    /// The capability this provider serves
    pub fn capability(&self) -> Capability {
        match self {
            Provider::Issuer(_) => Capability::Issuer,
            Provider::Destination(_) => Capability::Destination,
            Provider::Source(_) => Capability::Source,
            Provider::Notification(_) => Capability::Notification,
        }
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Provider::{}", self.capability())
    }
}

/// A named plugin and the providers it registers
#[derive(Debug, Clone)]
pub struct Plugin {
    name: String,
    providers: Vec<Provider>,
}

impl Plugin {
    /// Start a plugin registration with no capabilities
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            providers: Vec::new(),
        }
    }

    /// Add the issuer capability
    pub fn with_issuer(self, issuer: Arc<dyn IssuerPlugin>) -> Self {
        self.with(Provider::Issuer(issuer))
    }

    /// Add the destination capability
    pub fn with_destination(self, destination: Arc<dyn DestinationPlugin>) -> Self {
        self.with(Provider::Destination(destination))
    }

    /// Add the source capability
    pub fn with_source(self, source: Arc<dyn SourcePlugin>) -> Self {
        self.with(Provider::Source(source))
    }

    /// Add the notification capability
    pub fn with_notification(self, notification: Arc<dyn NotificationPlugin>) -> Self {
        self.with(Provider::Notification(notification))
    }

    // A later provider for the same capability replaces the earlier one.
    fn with(mut self, provider: Provider) -> Self {
        let capability = provider.capability();
        self.providers.retain(|p| p.capability() != capability);
        self.providers.push(provider);
        self
    }

    /// Plugin name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capabilities this plugin implements
    pub fn capabilities(&self) -> Vec<Capability> {
        self.providers.iter().map(Provider::capability).collect()
    }

    /// Whether this plugin implements `capability`
    pub fn implements(&self, capability: Capability) -> bool {
        self.provider(capability).is_some()
    }

    /// The provider registered for `capability`
    pub fn provider(&self, capability: Capability) -> Option<&Provider> {
        self.providers.iter().find(|p| p.capability() == capability)
    }
}

#[derive(Default)]
struct RegistryInner {
    /// Registration order
    ordered: Vec<Arc<Plugin>>,
    /// Name index into `ordered`
    by_name: HashMap<String, Arc<Plugin>>,
}

/// Plugin registry
///
/// ## Thread Safety
///
/// Uses interior mutability with `RwLock`: lookups take a shared lock and
/// hand out `Arc` clones, so the same instance is returned on every lookup
/// for the life of the process.
#[derive(Default)]
pub struct PluginRegistry {
    inner: RwLock<RegistryInner>,
}

static GLOBAL: OnceLock<Arc<PluginRegistry>> = OnceLock::new();

impl PluginRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry, created empty on first use
    pub fn global() -> Arc<PluginRegistry> {
        GLOBAL.get_or_init(|| Arc::new(PluginRegistry::new())).clone()
    }

    /// Clear the process-wide registry (test isolation)
    pub fn reset() {
        if let Some(registry) = GLOBAL.get() {
            registry.clear();
        }
    }

    /// Register a plugin
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateName`] if the name is taken
    /// - [`Error::Config`] if the name is empty or no capability was added
    pub fn register(&self, plugin: Plugin) -> Result<()> {
        if plugin.name.trim().is_empty() {
            return Err(Error::config("Plugin name cannot be empty"));
        }
        if plugin.providers.is_empty() {
            return Err(Error::config(format!(
                "Plugin '{}' implements no capability",
                plugin.name
            )));
        }

        let mut inner = self.write();
        if inner.by_name.contains_key(&plugin.name) {
            return Err(Error::DuplicateName(plugin.name));
        }

        tracing::debug!(
            plugin = %plugin.name,
            capabilities = ?plugin.capabilities(),
            "Registered plugin"
        );

        let plugin = Arc::new(plugin);
        inner.by_name.insert(plugin.name.clone(), plugin.clone());
        inner.ordered.push(plugin);
        Ok(())
    }

    /// Look up `name` and return its provider for `capability`
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if no plugin has this name
    /// - [`Error::CapabilityMismatch`] if it does not implement `capability`
    pub fn get(&self, name: &str, capability: Capability) -> Result<Provider> {
        let inner = self.read();
        let plugin = inner
            .by_name
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;

        plugin
            .provider(capability)
            .cloned()
            .ok_or_else(|| Error::CapabilityMismatch {
                name: name.to_string(),
                capability,
            })
    }

    /// Typed lookup for the issuer capability
    pub fn issuer(&self, name: &str) -> Result<Arc<dyn IssuerPlugin>> {
        match self.get(name, Capability::Issuer)? {
            Provider::Issuer(issuer) => Ok(issuer),
            other => Err(mismatch(name, other)),
        }
    }

    /// Typed lookup for the destination capability
    pub fn destination(&self, name: &str) -> Result<Arc<dyn DestinationPlugin>> {
        match self.get(name, Capability::Destination)? {
            Provider::Destination(destination) => Ok(destination),
            other => Err(mismatch(name, other)),
        }
    }

    /// Typed lookup for the source capability
    pub fn source(&self, name: &str) -> Result<Arc<dyn SourcePlugin>> {
        match self.get(name, Capability::Source)? {
            Provider::Source(source) => Ok(source),
            other => Err(mismatch(name, other)),
        }
    }

    /// Typed lookup for the notification capability
    pub fn notification(&self, name: &str) -> Result<Arc<dyn NotificationPlugin>> {
        match self.get(name, Capability::Notification)? {
            Provider::Notification(notification) => Ok(notification),
            other => Err(mismatch(name, other)),
        }
    }

    /// All plugins implementing `capability`, in registration order
    pub fn list_by_capability(&self, capability: Capability) -> Vec<Arc<Plugin>> {
        self.read()
            .ordered
            .iter()
            .filter(|plugin| plugin.implements(capability))
            .cloned()
            .collect()
    }

    /// Whether a plugin with this name is registered
    pub fn contains(&self, name: &str) -> bool {
        self.read().by_name.contains_key(name)
    }

    /// All plugin names, in registration order
    pub fn names(&self) -> Vec<String> {
        self.read()
            .ordered
            .iter()
            .map(|plugin| plugin.name.clone())
            .collect()
    }

    /// Capabilities of a registered plugin
    pub fn capabilities(&self, name: &str) -> Option<Vec<Capability>> {
        self.read().by_name.get(name).map(|plugin| plugin.capabilities())
    }

    /// Remove every registration
    pub fn clear(&self) {
        let mut inner = self.write();
        inner.ordered.clear();
        inner.by_name.clear();
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

// `get` already checked the tag; this only fires if the two ever disagree.
fn mismatch(name: &str, provider: Provider) -> Error {
    Error::config(format!(
        "Plugin '{}' returned a {} provider for a typed lookup",
        name,
        provider.capability()
    ))
}
