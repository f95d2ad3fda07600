//! Contract Test: Destination Fan-Out
//!
//! Constraints verified:
//! - One failing or hanging destination never delays or aborts the others
//! - Every destination gets exactly one outcome, success or not
//! - Cancellation before dispatch yields Cancelled without calling the plugin
//! - Misconfigured destinations are reported per-destination, not raised

mod common;

use certmgr_core::adapters::{DeployOutcome, DestinationAdapter};
use certmgr_core::registry::{Plugin, PluginRegistry};
use common::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const TIMEOUT: Duration = Duration::from_millis(100);

struct Fleet {
    adapter: DestinationAdapter,
    plugins: Vec<Arc<TestDestination>>,
    records: Vec<certmgr_core::model::Destination>,
}

fn fleet(behaviors: Vec<(&str, DestinationBehavior)>) -> Fleet {
    let registry = Arc::new(PluginRegistry::new());
    let mut plugins = Vec::new();
    let mut records = Vec::new();
    for (name, behavior) in behaviors {
        let plugin = Arc::new(TestDestination::new(behavior));
        registry
            .register(Plugin::new(name).with_destination(plugin.clone()))
            .unwrap();
        plugins.push(plugin);
        records.push(destination(name, name));
    }
    Fleet {
        adapter: DestinationAdapter::new(registry, TIMEOUT),
        plugins,
        records,
    }
}

fn bundle() -> certmgr_core::model::CertificateBundle {
    let ca = TestCa::new("Deploy CA");
    managed_certificate(&ca, "shop.example.com", t0(), 90).bundle()
}

#[tokio::test]
async fn partial_failure_is_reported_per_destination() {
    let fleet = fleet(vec![
        ("lb-east", DestinationBehavior::Accept),
        ("lb-west", DestinationBehavior::Reject("403 Forbidden".to_string())),
        ("cdn", DestinationBehavior::Hang),
        ("vault", DestinationBehavior::Accept),
    ]);
    let bundle = bundle();

    let started = Instant::now();
    let results = fleet
        .adapter
        .deploy_all(&fleet.records, &bundle, &CancellationToken::new())
        .await;

    // The hanging destination is bounded by the timeout, not by its own pace
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(results.len(), 4);

    assert_eq!(results[0].destination, "lb-east");
    assert_eq!(results[0].outcome, DeployOutcome::Deployed);
    assert!(matches!(
        &results[1].outcome,
        DeployOutcome::Failed { cause } if cause.contains("403 Forbidden")
    ));
    assert_eq!(results[2].outcome, DeployOutcome::TimedOut);
    assert_eq!(results[3].outcome, DeployOutcome::Deployed);

    assert_eq!(
        fleet.plugins[0].held(),
        vec![("shop.example.com".to_string(), bundle.fingerprint.clone())]
    );
    assert_eq!(fleet.plugins[3].held().len(), 1);
    for plugin in &fleet.plugins {
        assert_eq!(plugin.upload_calls(), 1, "exactly one attempt per destination");
    }
}

#[tokio::test]
async fn successes_are_not_held_back_by_a_hanging_peer() {
    let fleet = fleet(vec![
        ("fast", DestinationBehavior::Accept),
        ("stuck", DestinationBehavior::Hang),
    ]);
    let bundle = bundle();

    let fast = fleet.adapter.clone();
    let fast_record = fleet.records[0].clone();
    let fast_bundle = bundle.clone();
    let started = Instant::now();
    let solo = tokio::spawn(async move { fast.deploy(&fast_record, &fast_bundle).await });
    let all = fleet
        .adapter
        .deploy_all(&fleet.records, &bundle, &CancellationToken::new())
        .await;

    let solo = solo.await.unwrap();
    assert!(solo.is_success());
    assert!(all[0].is_success());
    assert_eq!(all[1].outcome, DeployOutcome::TimedOut);
    assert!(started.elapsed() >= TIMEOUT);
}

#[tokio::test]
async fn cancelled_before_dispatch_calls_nothing() {
    let fleet = fleet(vec![
        ("lb-east", DestinationBehavior::Accept),
        ("lb-west", DestinationBehavior::Accept),
    ]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let results = fleet
        .adapter
        .deploy_all(&fleet.records, &bundle(), &cancel)
        .await;

    assert!(results.iter().all(|r| r.outcome == DeployOutcome::Cancelled));
    assert!(fleet.plugins.iter().all(|p| p.upload_calls() == 0));
}

#[tokio::test]
async fn unknown_destination_plugin_fails_only_that_destination() {
    let fleet = fleet(vec![("lb-east", DestinationBehavior::Accept)]);
    let mut records = fleet.records.clone();
    records.push(destination("orphan", "no-such-plugin"));
    let mut inactive = destination("retired", "lb-east");
    inactive.active = false;
    records.push(inactive);

    let results = fleet
        .adapter
        .deploy_all(&records, &bundle(), &CancellationToken::new())
        .await;

    assert!(results[0].is_success());
    assert!(matches!(
        &results[1].outcome,
        DeployOutcome::Failed { cause } if cause.contains("no-such-plugin")
    ));
    assert!(matches!(&results[2].outcome, DeployOutcome::Failed { .. }));
    assert_eq!(fleet.plugins[0].upload_calls(), 1);
}

#[tokio::test]
async fn listing_reports_held_certificates() {
    let fleet = fleet(vec![("lb-east", DestinationBehavior::Accept)]);
    let bundle = bundle();

    assert!(fleet.adapter.list(&fleet.records[0]).await.unwrap().is_empty());
    fleet.adapter.deploy(&fleet.records[0], &bundle).await;
    let held = fleet.adapter.list(&fleet.records[0]).await.unwrap();
    assert_eq!(held, vec![bundle.fingerprint]);
}
