//! Uniform adapters over the plugin contracts
//!
//! Each adapter resolves a record's plugin through the [`PluginRegistry`],
//! delegates the call, and turns the provider's answer into a typed
//! outcome. Raw provider payloads never leave this module.
//!
//! | Adapter | Capability | Failure shape |
//! |---------|------------|---------------|
//! | [`AuthorityAdapter`] | Issuer | `Err(Error::Issuance)` |
//! | [`DestinationAdapter`] | Destination | [`DeployResult`] value |
//! | [`SourceAdapter`] | Source | `Err(Error::Discovery)` items in the stream |
//! | [`NotificationAdapter`] | Notification | [`NotifyResult`] value |
//!
//! [`PluginRegistry`]: crate::registry::PluginRegistry

pub mod authority;
pub mod destination;
pub mod notification;
pub mod source;

pub use authority::{AuthorityAdapter, IssuedCertificate};
pub use destination::{DeployOutcome, DeployResult, DestinationAdapter};
pub use notification::{NotificationAdapter, NotifyResult};
pub use source::{DiscoveredCertificate, DiscoveredItem, DiscoveryStream, SourceAdapter};
