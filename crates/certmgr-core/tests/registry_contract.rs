//! Contract Test: Plugin Registry
//!
//! Constraints verified:
//! - Lookups return the same live instance for the life of the registry
//! - Unknown names and missing capabilities are distinct configuration errors
//! - Concurrent lookups from many workers are safe
//! - Capability enumeration follows registration order

mod common;

use certmgr_core::error::Error;
use certmgr_core::registry::{Capability, Plugin, PluginRegistry};
use common::*;
use std::sync::Arc;

#[tokio::test]
async fn repeated_lookups_return_the_same_instance() {
    let registry = Arc::new(PluginRegistry::new());
    let ca = Arc::new(TestCa::new("Registry CA"));
    registry
        .register(Plugin::new("test-ca").with_issuer(Arc::new(TestIssuer::new(ca))))
        .unwrap();

    let first = registry.issuer("test-ca").unwrap();
    for _ in 0..10 {
        let again = registry.issuer("test-ca").unwrap();
        assert!(Arc::ptr_eq(&first, &again));
    }
}

#[tokio::test]
async fn concurrent_lookups_are_safe() {
    let registry = Arc::new(PluginRegistry::new());
    let destination = Arc::new(TestDestination::new(DestinationBehavior::Accept));
    registry
        .register(Plugin::new("lb").with_destination(destination))
        .unwrap();

    let mut workers = Vec::new();
    for _ in 0..32 {
        let registry = registry.clone();
        workers.push(tokio::spawn(async move {
            for _ in 0..100 {
                registry.get("lb", Capability::Destination).unwrap();
                assert_eq!(registry.list_by_capability(Capability::Destination).len(), 1);
            }
        }));
    }
    for worker in workers {
        worker.await.unwrap();
    }
}

#[tokio::test]
async fn configuration_errors_are_fatal_class() {
    let registry = PluginRegistry::new();
    registry
        .register(Plugin::new("recorder").with_notification(Arc::new(RecordingNotifier::new())))
        .unwrap();

    let missing = registry.get("nope", Capability::Issuer).unwrap_err();
    assert!(matches!(missing, Error::NotFound(_)));
    assert!(missing.is_configuration());

    let mismatch = registry.source("recorder").err().unwrap();
    assert!(matches!(
        mismatch,
        Error::CapabilityMismatch { ref name, capability: Capability::Source } if name == "recorder"
    ));
    assert!(mismatch.is_configuration());

    let duplicate = registry
        .register(Plugin::new("recorder").with_notification(Arc::new(RecordingNotifier::new())))
        .unwrap_err();
    assert!(matches!(duplicate, Error::DuplicateName(_)));
}

#[tokio::test]
async fn one_plugin_serves_several_capabilities() {
    let registry = PluginRegistry::new();
    let notifier = Arc::new(RecordingNotifier::new());
    let source = Arc::new(TestSource::new());
    registry
        .register(
            Plugin::new("combo")
                .with_source(source)
                .with_notification(notifier),
        )
        .unwrap();
    registry
        .register(Plugin::new("later").with_source(Arc::new(TestSource::new())))
        .unwrap();

    let sources: Vec<String> = registry
        .list_by_capability(Capability::Source)
        .iter()
        .map(|plugin| plugin.name().to_string())
        .collect();
    assert_eq!(sources, vec!["combo", "later"]);
    assert_eq!(
        registry.capabilities("combo"),
        Some(vec![Capability::Source, Capability::Notification])
    );
}
