//! Error types for the certificate manager
//!
//! Three classes of failure flow through this crate:
//!
//! - **Caller input** ([`Error::InvalidRequest`]): malformed CSR, bad options.
//!   Never retried.
//! - **Configuration** ([`Error::NotFound`], [`Error::CapabilityMismatch`],
//!   [`Error::DuplicateName`], [`Error::Config`]): the registry or the
//!   records referencing it are wrong. Surfaced immediately, never retried.
//! - **Provider** ([`Error::Issuance`], [`Error::Deploy`], [`Error::Discovery`],
//!   [`Error::Notify`]): an external system failed. Each carries the plugin's
//!   own error as its source. Retried only by the scheduler on a later pass.

use std::time::Duration;
use thiserror::Error;

use crate::registry::Capability;

/// Result type alias for certificate manager operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the certificate manager
#[derive(Error, Debug)]
pub enum Error {
    /// Caller supplied malformed input (e.g. a CSR that does not parse)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No plugin registered under this name
    #[error("Plugin not found: {0}")]
    NotFound(String),

    /// Plugin exists but does not implement the requested capability
    #[error("Plugin '{name}' does not implement the {capability} capability")]
    CapabilityMismatch {
        /// Plugin name
        name: String,
        /// Capability that was requested
        capability: Capability,
    },

    /// A plugin with this name is already registered
    #[error("Plugin already registered: {0}")]
    DuplicateName(String),

    /// Issuer plugin failed to produce a certificate
    #[error("Issuance failed via '{plugin}': {source}")]
    Issuance {
        /// Issuer plugin name
        plugin: String,
        /// Underlying provider error
        #[source]
        source: Box<Error>,
    },

    /// Destination plugin failed to accept or list certificates
    #[error("Deploy to '{destination}' via '{plugin}' failed: {source}")]
    Deploy {
        /// Destination record name
        destination: String,
        /// Destination plugin name
        plugin: String,
        /// Underlying provider error
        #[source]
        source: Box<Error>,
    },

    /// Source plugin failed to enumerate its inventory
    #[error("Discovery from '{source_name}' via '{plugin}' failed: {source}")]
    Discovery {
        /// Source record name
        source_name: String,
        /// Source plugin name
        plugin: String,
        /// Underlying provider error
        #[source]
        source: Box<Error>,
    },

    /// Notification plugin failed to deliver
    #[error("Notification '{notification}' via '{plugin}' failed: {source}")]
    Notify {
        /// Notification record name
        notification: String,
        /// Notification plugin name
        plugin: String,
        /// Underlying provider error
        #[source]
        source: Box<Error>,
    },

    /// A provider call exceeded its deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The surrounding pass was cancelled before this call was dispatched
    #[error("Cancelled before dispatch")]
    Cancelled,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persisted store errors
    #[error("Store error: {0}")]
    Store(String),

    /// Provider-specific error raised from inside a plugin
    #[error("Provider error ({provider}): {message}")]
    Provider {
        /// Provider name
        provider: String,
        /// Error message
        message: String,
    },

    /// HTTP client errors (from provider APIs)
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create an HTTP error
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }

    /// Create a provider-specific error
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Wrap a provider failure raised during issuance
    pub fn issuance(plugin: impl Into<String>, source: Error) -> Self {
        Self::Issuance {
            plugin: plugin.into(),
            source: Box::new(source),
        }
    }

    /// Wrap a provider failure raised during deployment
    pub fn deploy(destination: impl Into<String>, plugin: impl Into<String>, source: Error) -> Self {
        Self::Deploy {
            destination: destination.into(),
            plugin: plugin.into(),
            source: Box::new(source),
        }
    }

    /// Wrap a provider failure raised during discovery
    pub fn discovery(source_name: impl Into<String>, plugin: impl Into<String>, source: Error) -> Self {
        Self::Discovery {
            source_name: source_name.into(),
            plugin: plugin.into(),
            source: Box::new(source),
        }
    }

    /// Wrap a provider failure raised during notification delivery
    pub fn notify(notification: impl Into<String>, plugin: impl Into<String>, source: Error) -> Self {
        Self::Notify {
            notification: notification.into(),
            plugin: plugin.into(),
            source: Box::new(source),
        }
    }

    /// Whether this error stems from registry or record misconfiguration.
    ///
    /// These are the only failures the daemon treats as fatal.
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::NotFound(_)
            | Self::CapabilityMismatch { .. }
            | Self::DuplicateName(_)
            | Self::Config(_) => true,
            Self::Issuance { source, .. }
            | Self::Deploy { source, .. }
            | Self::Discovery { source, .. }
            | Self::Notify { source, .. } => source.is_configuration(),
            _ => false,
        }
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_errors_keep_their_cause() {
        let err = Error::issuance("internal-ca", Error::http("connection refused"));
        assert!(err.to_string().contains("internal-ca"));

        let source = std::error::Error::source(&err).expect("source is attached");
        assert_eq!(source.to_string(), "HTTP error: connection refused");
    }

    #[test]
    fn configuration_class() {
        assert!(Error::NotFound("x".into()).is_configuration());
        assert!(
            Error::CapabilityMismatch {
                name: "x".into(),
                capability: Capability::Issuer,
            }
            .is_configuration()
        );
        assert!(!Error::Timeout(Duration::from_secs(1)).is_configuration());
        assert!(Error::deploy("lb", "aws", Error::NotFound("aws".into())).is_configuration());
    }
}
