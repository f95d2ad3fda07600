// # certmgr-core
//
// Core library for the pluggable certificate lifecycle manager.
//
// ## Architecture Overview
//
// - **PluginRegistry**: Capability-typed registry of live plugin instances
// - **Adapters**: Uniform Authority/Destination/Source/Notification calls
//   through the registry, returning typed outcomes
// - **RotationOrchestrator**: Reissue, deploy and notify for certificates
//   approaching expiry
// - **ReconciliationEngine**: Align stored endpoints/certificates with
//   external inventories
// - **ExpiryNotifier**: Threshold-based expiry warnings
// - **Scheduler**: Periodic passes with cooperative cancellation
// - **CertificateStore**: Persisted-store contract (MemoryStore included)
//
// ## Design Principles
//
// 1. **Plugin-Based**: Providers are looked up by name and capability, never hard-coded
// 2. **Identity by Fingerprint**: Records are addressed by canonical identifiers only
// 3. **Partial Failure is a Value**: Fan-outs return per-item outcomes instead of aborting
// 4. **Library-First**: The daemon is a thin shell over this crate

pub mod adapters;
pub mod config;
pub mod error;
pub mod expiry;
pub mod model;
pub mod reconcile;
pub mod registry;
pub mod rotation;
pub mod scheduler;
pub mod store;
pub mod traits;
pub mod x509;

// Re-export core types for convenience
pub use adapters::{AuthorityAdapter, DestinationAdapter, NotificationAdapter, SourceAdapter};
pub use config::{CertmgrConfig, Inventory, RetryPolicy};
pub use error::{Error, Result};
pub use expiry::ExpiryNotifier;
pub use model::{
    Authority, Certificate, CertificateBundle, Destination, Endpoint, Notification,
    NotificationEvent, RotationStatus, Source,
};
pub use reconcile::ReconciliationEngine;
pub use registry::{Capability, Plugin, PluginRegistry};
pub use rotation::RotationOrchestrator;
pub use scheduler::{Scheduler, SchedulerEvent};
pub use store::MemoryStore;
pub use traits::{
    CertificateStore, DestinationPlugin, IssuerPlugin, NotificationPlugin, SourcePlugin,
};
