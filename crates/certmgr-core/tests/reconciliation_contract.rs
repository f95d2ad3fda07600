//! Contract Test: Reconciliation
//!
//! Constraints verified:
//! - Reconciling an unchanged snapshot twice writes nothing the second time
//! - Endpoints absent for N consecutive passes are marked stale, never deleted
//! - Certificates without a derivable fingerprint are surfaced as unmatched
//! - A snapshot that fails part-way never counts endpoints as absent
//! - Discovered certificates never overwrite managed ones

mod common;

use certmgr_core::config::CertmgrConfig;
use certmgr_core::model::CertificateMatch;
use certmgr_core::reconcile::ReconciliationEngine;
use certmgr_core::registry::Plugin;
use certmgr_core::traits::{CertificateStore, ExternalCertificate, ExternalEndpoint};
use certmgr_core::x509;
use chrono::Duration;
use common::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct Inventory {
    harness: Harness,
    plugin: Arc<TestSource>,
    engine: ReconciliationEngine,
}

async fn inventory() -> Inventory {
    let harness = Harness::new().await;
    let plugin = Arc::new(TestSource::new());
    harness
        .registry
        .register(Plugin::new("cloud-inventory").with_source(plugin.clone()))
        .unwrap();
    harness
        .store
        .put_source(source("aws-prod", "cloud-inventory"))
        .await;
    let engine = ReconciliationEngine::new(
        harness.registry.clone(),
        harness.store(),
        &CertmgrConfig::default(),
    );
    Inventory {
        harness,
        plugin,
        engine,
    }
}

fn leaf(ca: &TestCa, common_name: &str) -> String {
    ca.issue_leaf(
        common_name,
        &[common_name.to_string()],
        t0(),
        t0() + Duration::days(365),
    )
    .0
}

fn external(id: &str, body: Option<String>, fingerprint: Option<String>) -> ExternalCertificate {
    ExternalCertificate {
        external_id: id.to_string(),
        name: None,
        body,
        chain: None,
        fingerprint,
    }
}

fn endpoint(id: &str, certificate_id: Option<&str>) -> ExternalEndpoint {
    ExternalEndpoint {
        external_id: id.to_string(),
        host: format!("{id}.example.com"),
        port: 443,
        kind: "elb".to_string(),
        certificate_id: certificate_id.map(str::to_string),
    }
}

#[tokio::test]
async fn unchanged_snapshot_is_idempotent() {
    let inv = inventory().await;
    let ca = &inv.harness.ca;

    let with_body = leaf(ca, "api.example.com");
    let with_body_fp = x509::parse_certificate_pem(&with_body).unwrap().fingerprint;
    let reported_only = x509::parse_certificate_pem(&leaf(ca, "www.example.com"))
        .unwrap()
        .fingerprint;
    // Upper-case, colon-separated as some providers report it
    let reported_display = reported_only
        .as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap().to_ascii_uppercase())
        .collect::<Vec<_>>()
        .join(":");

    inv.plugin.set_snapshot(
        vec![
            external("arn:api", Some(with_body), None),
            external("arn:www", None, Some(reported_display)),
            external("arn:opaque", None, None),
        ],
        vec![
            endpoint("lb-api", Some("arn:api")),
            endpoint("lb-www", Some("arn:www")),
            endpoint("lb-legacy", Some("arn:opaque")),
            endpoint("lb-plain", None),
        ],
    );

    let first = inv.engine.run_pass(&CancellationToken::new()).await.unwrap();
    let report = &first.sources[0];
    assert_eq!(report.source, "aws-prod");
    assert_eq!(report.error, None);
    assert_eq!(report.certificates_written, 1, "only the certificate with a body is stored");
    assert_eq!(report.endpoints_written, 4);
    assert_eq!(report.unmatched, vec!["arn:opaque"]);

    let endpoints = inv.harness.store.list_endpoints("aws-prod").await.unwrap();
    let by_id = |id: &str| endpoints.iter().find(|e| e.external_id == id).unwrap().clone();
    assert_eq!(
        by_id("lb-api").certificate,
        CertificateMatch::Matched {
            fingerprint: with_body_fp.clone()
        }
    );
    assert_eq!(
        by_id("lb-www").certificate,
        CertificateMatch::Matched {
            fingerprint: reported_only
        }
    );
    assert_eq!(
        by_id("lb-legacy").certificate,
        CertificateMatch::Unmatched {
            external_id: "arn:opaque".to_string()
        }
    );
    assert_eq!(by_id("lb-plain").certificate, CertificateMatch::None);

    let discovered = inv
        .harness
        .store
        .get_certificate(&with_body_fp)
        .await
        .unwrap()
        .unwrap();
    assert!(!discovered.rotation);
    assert_eq!(discovered.authority, None);
    assert_eq!(discovered.name, "arn:api");

    let writes_after_first = inv.harness.store.write_count();
    let second = inv.engine.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(second.writes(), 0);
    assert_eq!(inv.harness.store.write_count(), writes_after_first);
    assert_eq!(second.sources[0].unmatched, vec!["arn:opaque"]);
}

#[tokio::test]
async fn absent_endpoints_go_stale_after_threshold() {
    let inv = inventory().await;
    inv.plugin.set_snapshot(
        Vec::new(),
        vec![endpoint("lb-a", None), endpoint("lb-b", None)],
    );
    let cancel = CancellationToken::new();
    inv.engine.run_pass(&cancel).await.unwrap();

    inv.plugin.set_snapshot(Vec::new(), vec![endpoint("lb-a", None)]);
    let threshold = CertmgrConfig::default().reconciliation.stale_after_passes;
    for pass in 1..threshold {
        let report = inv.engine.run_pass(&cancel).await.unwrap();
        assert!(report.sources[0].marked_stale.is_empty(), "pass {pass}");
    }

    let report = inv.engine.run_pass(&cancel).await.unwrap();
    assert_eq!(report.sources[0].marked_stale, vec!["lb-b"]);

    let endpoints = inv.harness.store.list_endpoints("aws-prod").await.unwrap();
    assert_eq!(endpoints.len(), 2, "stale endpoints are kept");
    let stale = endpoints.iter().find(|e| e.external_id == "lb-b").unwrap();
    assert!(stale.stale);
    assert_eq!(stale.missed_passes, threshold);

    let settled = inv.engine.run_pass(&cancel).await.unwrap();
    assert_eq!(settled.writes(), 0);
}

#[tokio::test]
async fn failed_snapshot_does_not_count_as_absence() {
    let inv = inventory().await;
    inv.plugin.set_snapshot(
        Vec::new(),
        vec![endpoint("lb-a", None), endpoint("lb-b", None)],
    );
    let cancel = CancellationToken::new();
    inv.engine.run_pass(&cancel).await.unwrap();

    inv.plugin.set_failing(true);
    for _ in 0..5 {
        let report = inv.engine.run_pass(&cancel).await.unwrap();
        let source = &report.sources[0];
        assert!(source.error.as_deref().unwrap().contains("503"));
        assert_eq!(source.writes(), 0);
    }

    let endpoints = inv.harness.store.list_endpoints("aws-prod").await.unwrap();
    assert!(endpoints.iter().all(|e| e.missed_passes == 0 && !e.stale));
}

#[tokio::test]
async fn discovery_never_overwrites_a_managed_certificate() {
    let inv = inventory().await;
    let mut managed = managed_certificate(&inv.harness.ca, "pay.example.com", t0(), 90);
    managed.destinations.insert("lb-pay".to_string());
    inv.harness.store.put_certificate(managed.clone()).await;

    inv.plugin.set_snapshot(
        vec![ExternalCertificate {
            external_id: "arn:pay".to_string(),
            name: Some("imported-pay".to_string()),
            body: Some(managed.body.clone()),
            chain: None,
            fingerprint: None,
        }],
        vec![endpoint("lb-pay", Some("arn:pay"))],
    );

    let report = inv.engine.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.sources[0].certificates_written, 0);

    let stored = inv
        .harness
        .store
        .get_certificate(&managed.fingerprint)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored, managed);
}

#[tokio::test]
async fn inactive_sources_and_cancelled_passes_are_not_read() {
    let inv = inventory().await;
    let mut retired = source("aws-legacy", "cloud-inventory");
    retired.active = false;
    inv.harness.store.put_source(retired).await;

    let report = inv.engine.run_pass(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.sources.len(), 1);
    assert_eq!(inv.plugin.calls(), 1);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = inv.engine.run_pass(&cancel).await.unwrap();
    assert!(report.sources.is_empty());
    assert_eq!(report.cancelled, vec!["aws-prod"]);
    assert_eq!(inv.plugin.calls(), 1);
}
