//! Test doubles and common utilities for contract tests
//!
//! The doubles are real plugin implementations with call counters, backed
//! by a throwaway CA built with `rcgen`, so every certificate that flows
//! through the core is a genuine, parseable X.509 certificate.

#![allow(dead_code)]

use async_trait::async_trait;
use certmgr_core::error::{Error, Result};
use certmgr_core::model::{
    Authority, Certificate, CertificateBundle, Destination, Endpoint, Notification,
    NotificationEvent, Source, WriteOutcome,
};
use certmgr_core::registry::{Plugin, PluginRegistry};
use certmgr_core::store::MemoryStore;
use certmgr_core::traits::{
    CertificateStore, DestinationPlugin, ExternalCertificate, ExternalEndpoint, IssuanceOptions,
    IssuerPlugin, IssuerResponse, NotificationPlugin, SourcePlugin,
};
use certmgr_core::x509;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Fixed reference instant for deterministic tests
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

fn to_offset(at: DateTime<Utc>) -> time::OffsetDateTime {
    time::OffsetDateTime::from_unix_timestamp(at.timestamp()).unwrap()
}

/// A throwaway certificate authority
pub struct TestCa {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl TestCa {
    pub fn new(name: &str) -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, name);
        params.not_before = to_offset(t0() - Duration::days(3650));
        params.not_after = to_offset(t0() + Duration::days(3650));
        let cert = params.self_signed(&key).unwrap();
        Self { cert, key }
    }

    /// PEM of the CA certificate (used as the chain)
    pub fn pem(&self) -> String {
        self.cert.pem()
    }

    /// Issue a leaf with a fresh key. Returns (certificate PEM, key PEM).
    pub fn issue_leaf(
        &self,
        common_name: &str,
        sans: &[String],
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    ) -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(sans.to_vec()).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, common_name);
        params.not_before = to_offset(not_before);
        params.not_after = to_offset(not_after);
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        (cert.pem(), key.serialize_pem())
    }
}

/// Build a Certificate record from a freshly issued leaf
pub fn managed_certificate(
    ca: &TestCa,
    common_name: &str,
    not_before: DateTime<Utc>,
    validity_days: i64,
) -> Certificate {
    let sans = vec![common_name.to_string()];
    let (pem, key) = ca.issue_leaf(
        common_name,
        &sans,
        not_before,
        not_before + Duration::days(validity_days),
    );
    let info = x509::parse_certificate_pem(&pem).unwrap();
    Certificate {
        name: common_name.to_string(),
        serial: info.serial,
        fingerprint: info.fingerprint,
        subject: info.subject,
        issuer: info.issuer,
        common_name: info.common_name,
        sans: info.sans,
        not_before: info.not_before,
        not_after: info.not_after,
        body: pem,
        chain: ca.pem(),
        private_key: Some(certmgr_core::model::PrivateKey::new(key)),
        authority: Some("internal-ca".to_string()),
        destinations: BTreeSet::new(),
        notifications: Vec::new(),
        rotation: true,
        status: Default::default(),
    }
}

/// Issuer backed by [`TestCa`]
pub struct TestIssuer {
    ca: Arc<TestCa>,
    issued_at: Mutex<DateTime<Utc>>,
    unreachable: AtomicBool,
    rotation: bool,
    issue_calls: AtomicUsize,
    last_csr: Mutex<Option<Vec<u8>>>,
}

impl TestIssuer {
    pub fn new(ca: Arc<TestCa>) -> Self {
        Self {
            ca,
            issued_at: Mutex::new(t0()),
            unreachable: AtomicBool::new(false),
            rotation: true,
            issue_calls: AtomicUsize::new(0),
            last_csr: Mutex::new(None),
        }
    }

    /// Issuer that opts out of automatic rotation
    pub fn manual_only(ca: Arc<TestCa>) -> Self {
        Self {
            rotation: false,
            ..Self::new(ca)
        }
    }

    /// Start of validity for certificates issued from now on
    pub fn set_issued_at(&self, at: DateTime<Utc>) {
        *self.issued_at.lock().unwrap() = at;
    }

    /// Make every call fail as if the CA were down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn issue_calls(&self) -> usize {
        self.issue_calls.load(Ordering::SeqCst)
    }

    /// CSR bytes handed to the most recent issue call
    pub fn last_csr(&self) -> Option<Vec<u8>> {
        self.last_csr.lock().unwrap().clone()
    }
}

#[async_trait]
impl IssuerPlugin for TestIssuer {
    async fn issue(
        &self,
        csr: &[u8],
        options: &IssuanceOptions,
        _authority_options: &serde_json::Value,
    ) -> Result<IssuerResponse> {
        self.issue_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_csr.lock().unwrap() = Some(csr.to_vec());
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::http("connection refused"));
        }

        let requested = x509::inspect_csr(csr)?;
        let common_name = requested.common_name.unwrap_or(options.common_name.clone());
        let not_before = *self.issued_at.lock().unwrap();
        let not_after = not_before + Duration::days(i64::from(options.validity_days));
        let (certificate_pem, key_pem) =
            self.ca
                .issue_leaf(&common_name, &options.sans, not_before, not_after);

        Ok(IssuerResponse {
            certificate_pem,
            chain_pem: self.ca.pem(),
            private_key_pem: Some(key_pem),
        })
    }

    fn supports_rotation(&self) -> bool {
        self.rotation
    }
}

/// How a [`TestDestination`] answers uploads
#[derive(Debug, Clone)]
pub enum DestinationBehavior {
    Accept,
    Reject(String),
    /// Never answers within any sensible timeout
    Hang,
}

/// Destination that records what it receives
pub struct TestDestination {
    behavior: Mutex<DestinationBehavior>,
    upload_calls: AtomicUsize,
    held: Mutex<Vec<(String, String)>>,
}

impl TestDestination {
    pub fn new(behavior: DestinationBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            upload_calls: AtomicUsize::new(0),
            held: Mutex::new(Vec::new()),
        }
    }

    pub fn set_behavior(&self, behavior: DestinationBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn upload_calls(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    /// (deploy name, fingerprint) pairs accepted so far
    pub fn held(&self) -> Vec<(String, String)> {
        self.held.lock().unwrap().clone()
    }
}

#[async_trait]
impl DestinationPlugin for TestDestination {
    async fn upload(
        &self,
        name: &str,
        _options: &serde_json::Value,
        bundle: &CertificateBundle,
    ) -> Result<()> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().unwrap().clone();
        match behavior {
            DestinationBehavior::Accept => {
                self.held
                    .lock()
                    .unwrap()
                    .push((name.to_string(), bundle.fingerprint.clone()));
                Ok(())
            }
            DestinationBehavior::Reject(message) => Err(Error::provider("test-destination", message)),
            DestinationBehavior::Hang => {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Ok(())
            }
        }
    }

    async fn get_certificates(
        &self,
        _name: &str,
        _options: &serde_json::Value,
    ) -> Result<Vec<String>> {
        Ok(self.held().into_iter().map(|(_, fp)| fp).collect())
    }
}

/// Source whose snapshot the test controls
pub struct TestSource {
    snapshot: Mutex<(Vec<ExternalCertificate>, Vec<ExternalEndpoint>)>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl TestSource {
    pub fn new() -> Self {
        Self {
            snapshot: Mutex::new((Vec::new(), Vec::new())),
            failing: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_snapshot(&self, certificates: Vec<ExternalCertificate>, endpoints: Vec<ExternalEndpoint>) {
        *self.snapshot.lock().unwrap() = (certificates, endpoints);
    }

    /// Make get_endpoints fail after get_certificates succeeded
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of get_certificates calls
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourcePlugin for TestSource {
    async fn get_certificates(&self, _options: &serde_json::Value) -> Result<Vec<ExternalCertificate>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.snapshot.lock().unwrap().0.clone())
    }

    async fn get_endpoints(&self, _options: &serde_json::Value) -> Result<Vec<ExternalEndpoint>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::http("inventory API returned 503"));
        }
        Ok(self.snapshot.lock().unwrap().1.clone())
    }
}

/// Notification plugin that records every event
pub struct RecordingNotifier {
    events: Mutex<Vec<NotificationEvent>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Event kinds in delivery order
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(NotificationEvent::kind).collect()
    }
}

#[async_trait]
impl NotificationPlugin for RecordingNotifier {
    async fn send(
        &self,
        _options: &serde_json::Value,
        _recipients: &[String],
        event: &NotificationEvent,
    ) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::http("mail relay unavailable"));
        }
        Ok(())
    }
}

/// Store that refuses certificate writes for chosen certificate names
///
/// Everything else is delegated to a [`MemoryStore`].
pub struct RejectingStore {
    inner: MemoryStore,
    rejected: Mutex<HashSet<String>>,
}

impl RejectingStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            rejected: Mutex::new(HashSet::new()),
        }
    }

    /// Fail every upsert of a certificate called `name`
    pub fn reject(&self, name: &str) {
        self.rejected.lock().unwrap().insert(name.to_string());
    }
}

#[async_trait]
impl CertificateStore for RejectingStore {
    async fn find_eligible_for_rotation(
        &self,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<Certificate>> {
        self.inner.find_eligible_for_rotation(now, window).await
    }

    async fn find_expiring(&self, now: DateTime<Utc>, window: Duration) -> Result<Vec<Certificate>> {
        self.inner.find_expiring(now, window).await
    }

    async fn find_pending_deployments(&self) -> Result<Vec<Certificate>> {
        self.inner.find_pending_deployments().await
    }

    async fn get_certificate(&self, fingerprint: &str) -> Result<Option<Certificate>> {
        self.inner.get_certificate(fingerprint).await
    }

    async fn upsert_certificate(&self, certificate: &Certificate) -> Result<WriteOutcome> {
        if self.rejected.lock().unwrap().contains(&certificate.name) {
            return Err(Error::store("database is read-only"));
        }
        self.inner.upsert_certificate(certificate).await
    }

    async fn mark_superseded(&self, fingerprint: &str, by: &str) -> Result<WriteOutcome> {
        self.inner.mark_superseded(fingerprint, by).await
    }

    async fn upsert_endpoint(&self, endpoint: &Endpoint) -> Result<WriteOutcome> {
        self.inner.upsert_endpoint(endpoint).await
    }

    async fn mark_stale(&self, source: &str, external_id: &str) -> Result<WriteOutcome> {
        self.inner.mark_stale(source, external_id).await
    }

    async fn list_endpoints(&self, source: &str) -> Result<Vec<Endpoint>> {
        self.inner.list_endpoints(source).await
    }

    async fn get_authority(&self, name: &str) -> Result<Option<Authority>> {
        self.inner.get_authority(name).await
    }

    async fn get_destination(&self, name: &str) -> Result<Option<Destination>> {
        self.inner.get_destination(name).await
    }

    async fn get_notification(&self, name: &str) -> Result<Option<Notification>> {
        self.inner.get_notification(name).await
    }

    async fn list_notifications(&self) -> Result<Vec<Notification>> {
        self.inner.list_notifications().await
    }

    async fn list_sources(&self) -> Result<Vec<Source>> {
        self.inner.list_sources().await
    }
}

pub fn authority(name: &str, plugin: &str) -> Authority {
    Authority {
        name: name.to_string(),
        plugin: plugin.to_string(),
        options: serde_json::json!({}),
        active: true,
    }
}

pub fn destination(name: &str, plugin: &str) -> Destination {
    Destination {
        name: name.to_string(),
        plugin: plugin.to_string(),
        options: serde_json::json!({}),
        active: true,
    }
}

pub fn source(name: &str, plugin: &str) -> Source {
    Source {
        name: name.to_string(),
        plugin: plugin.to_string(),
        options: serde_json::json!({}),
        active: true,
    }
}

pub fn notification(name: &str, plugin: &str, expiry_days: Vec<u32>) -> Notification {
    Notification {
        name: name.to_string(),
        plugin: plugin.to_string(),
        options: serde_json::json!({}),
        recipients: vec!["ops@example.com".to_string()],
        expiry_days,
        on_rotation: true,
        active: true,
    }
}

/// Registry and store wired with an `internal-ca` authority and an `ops`
/// notification
pub struct Harness {
    pub registry: Arc<PluginRegistry>,
    pub store: MemoryStore,
    pub ca: Arc<TestCa>,
    pub issuer: Arc<TestIssuer>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub async fn new() -> Self {
        let registry = Arc::new(PluginRegistry::new());
        let ca = Arc::new(TestCa::new("Test Root CA"));
        let issuer = Arc::new(TestIssuer::new(ca.clone()));
        let notifier = Arc::new(RecordingNotifier::new());

        registry
            .register(Plugin::new("test-ca").with_issuer(issuer.clone()))
            .unwrap();
        registry
            .register(Plugin::new("recorder").with_notification(notifier.clone()))
            .unwrap();

        let store = MemoryStore::new();
        store.put_authority(authority("internal-ca", "test-ca")).await;
        store
            .put_notification(notification("ops", "recorder", vec![30, 14, 7]))
            .await;

        Self {
            registry,
            store,
            ca,
            issuer,
            notifier,
        }
    }

    /// Register a destination plugin and a Destination record of the same name
    pub async fn add_destination(&self, name: &str, behavior: DestinationBehavior) -> Arc<TestDestination> {
        let plugin = Arc::new(TestDestination::new(behavior));
        self.registry
            .register(Plugin::new(name).with_destination(plugin.clone()))
            .unwrap();
        self.store.put_destination(destination(name, name)).await;
        plugin
    }

    /// Store as the trait object the orchestrators take
    pub fn store(&self) -> Arc<dyn CertificateStore> {
        Arc::new(self.store.clone())
    }
}
