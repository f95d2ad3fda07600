//! Plugin contracts and the persisted-store contract
//!
//! - [`IssuerPlugin`]: Issue certificates from a CSR
//! - [`DestinationPlugin`]: Push bundles to consumers, list what they hold
//! - [`SourcePlugin`]: Enumerate certificates and endpoints in an inventory
//! - [`NotificationPlugin`]: Deliver expiry and rotation events
//! - [`CertificateStore`]: System of record, addressed by canonical identifiers

pub mod destination;
pub mod issuer;
pub mod notification;
pub mod source;
pub mod store;

pub use destination::DestinationPlugin;
pub use issuer::{IssuanceOptions, IssuerPlugin, IssuerResponse, KeyUsage};
pub use notification::NotificationPlugin;
pub use source::{ExternalCertificate, ExternalEndpoint, SourcePlugin};
pub use store::CertificateStore;
