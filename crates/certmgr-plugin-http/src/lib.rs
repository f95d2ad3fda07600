// # HTTP Plugins
//
// Two plugins that talk plain HTTPS with JSON bodies:
//
// - `webhook` (Notification): POSTs `{ "recipients": [...], "event": {...} }`
//   to a configured URL, optionally with a bearer token. A notifier-wide
//   default URL covers records that name none.
// - `http-inventory` (Source): GETs a document of the form
//   `{ "certificates": [...], "endpoints": [...] }` from a configured URL.
//
// ## Trust Level: Untrusted
//
// **Allowed Capabilities**:
// - ✅ Perform HTTP/HTTPS calls to the configured URL only
// - ✅ Parse the response
//
// **Forbidden Capabilities**:
// - ❌ Retry or back off (owned by the scheduler)
// - ❌ Spawn tasks or cache responses between calls
// - ❌ Touch the certificate store
//
// ## Security Requirements
//
// - Bearer tokens NEVER appear in logs or Debug output
//
// ## Options
//
// ```json
// { "url": "https://hooks.example.com/certs", "token": "optional" }
// ```

use async_trait::async_trait;
use certmgr_core::model::NotificationEvent;
use certmgr_core::registry::{Plugin, PluginRegistry};
use certmgr_core::traits::{ExternalCertificate, ExternalEndpoint, NotificationPlugin, SourcePlugin};
use certmgr_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Registry name of the webhook notification plugin
pub const WEBHOOK: &str = "webhook";

/// Registry name of the HTTP inventory source plugin
pub const HTTP_INVENTORY: &str = "http-inventory";

/// Default HTTP timeout for requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Options shared by both plugins
#[derive(Clone, Deserialize)]
pub struct HttpOptions {
    /// Target URL
    pub url: String,
    /// Bearer token
    /// ⚠️ NEVER log this value
    #[serde(default)]
    pub token: Option<String>,
}

// Custom Debug implementation that hides the token
impl std::fmt::Debug for HttpOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpOptions")
            .field("url", &self.url)
            .field("token", &self.token.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

impl HttpOptions {
    /// Parse record options
    pub fn from_value(plugin: &str, options: &serde_json::Value) -> Result<Self> {
        Self::with_default_url(plugin, options, None)
    }

    /// Parse record options, using `default_url` when the record names none
    pub fn with_default_url(
        plugin: &str,
        options: &serde_json::Value,
        default_url: Option<&str>,
    ) -> Result<Self> {
        let mut options = match options {
            serde_json::Value::Null => serde_json::json!({}),
            other => other.clone(),
        };
        if let (Some(url), Some(map)) = (default_url, options.as_object_mut()) {
            map.entry("url").or_insert_with(|| url.into());
        }

        let parsed: Self = serde_json::from_value(options)
            .map_err(|e| Error::config(format!("Invalid {} options: {}", plugin, e)))?;
        let scheme_ok = parsed.url.starts_with("https://") || parsed.url.starts_with("http://");
        if !scheme_ok {
            return Err(Error::config(format!(
                "{} url must be http(s), got '{}'",
                plugin, parsed.url
            )));
        }
        Ok(parsed)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

fn build_client(plugin: &str) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(DEFAULT_HTTP_TIMEOUT)
        .build()
        .map_err(|e| Error::config(format!("Failed to build {} HTTP client: {}", plugin, e)))
}

// Map a non-2xx response to a provider error
async fn status_error(plugin: &str, response: reqwest::Response) -> Error {
    let status = response.status();
    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unable to read error response".to_string());

    let message = match status.as_u16() {
        401 | 403 => format!("Authentication failed. Status: {}", status),
        404 => format!("Endpoint not found. Status: {}", status),
        429 => format!("Rate limit exceeded. Status: {}", status),
        500..=599 => format!("Server error (transient): {} - {}", status, error_text),
        _ => format!("Request rejected: {} - {}", status, error_text),
    };
    Error::provider(plugin, message)
}

/// Body POSTed by the webhook plugin
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    recipients: &'a [String],
    event: &'a NotificationEvent,
}

/// Delivers events by POSTing them as JSON
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    default_url: Option<String>,
}

impl WebhookNotifier {
    /// Create a notifier with the default request timeout
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: build_client(WEBHOOK)?,
            default_url: None,
        })
    }

    /// URL used by records whose options carry none
    pub fn with_default_url(mut self, url: impl Into<String>) -> Self {
        self.default_url = Some(url.into());
        self
    }
}

#[async_trait]
impl NotificationPlugin for WebhookNotifier {
    async fn send(
        &self,
        options: &serde_json::Value,
        recipients: &[String],
        event: &NotificationEvent,
    ) -> Result<()> {
        let options = HttpOptions::with_default_url(WEBHOOK, options, self.default_url.as_deref())?;
        let payload = WebhookPayload { recipients, event };

        let response = options
            .authorize(self.client.post(&options.url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::http(format!("Webhook request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(status_error(WEBHOOK, response).await);
        }

        tracing::debug!(
            url = %options.url,
            event = event.kind(),
            recipients = recipients.len(),
            "Webhook delivered"
        );
        Ok(())
    }
}

/// Document served by an HTTP inventory
#[derive(Debug, Default, Deserialize)]
pub struct InventoryDocument {
    /// Certificates known to the inventory
    #[serde(default)]
    pub certificates: Vec<ExternalCertificate>,
    /// Endpoints known to the inventory
    #[serde(default)]
    pub endpoints: Vec<ExternalEndpoint>,
}

/// Source that reads a JSON inventory document over HTTP
///
/// Each call fetches a fresh copy of the document. A discovery snapshot
/// reads certificates and endpoints from the same fetch.
#[derive(Debug, Clone)]
pub struct HttpInventorySource {
    client: reqwest::Client,
}

impl HttpInventorySource {
    /// Create a source with the default request timeout
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: build_client(HTTP_INVENTORY)?,
        })
    }

    /// Fetch the inventory document
    pub async fn fetch(&self, options: &serde_json::Value) -> Result<InventoryDocument> {
        let options = HttpOptions::from_value(HTTP_INVENTORY, options)?;

        let response = options
            .authorize(self.client.get(&options.url))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| Error::http(format!("Inventory request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(status_error(HTTP_INVENTORY, response).await);
        }

        let document: InventoryDocument = response.json().await.map_err(|e| {
            Error::provider(HTTP_INVENTORY, format!("Failed to parse inventory: {}", e))
        })?;

        tracing::debug!(
            url = %options.url,
            certificates = document.certificates.len(),
            endpoints = document.endpoints.len(),
            "Inventory fetched"
        );
        Ok(document)
    }
}

#[async_trait]
impl SourcePlugin for HttpInventorySource {
    async fn get_certificates(&self, options: &serde_json::Value) -> Result<Vec<ExternalCertificate>> {
        Ok(self.fetch(options).await?.certificates)
    }

    async fn get_endpoints(&self, options: &serde_json::Value) -> Result<Vec<ExternalEndpoint>> {
        Ok(self.fetch(options).await?.endpoints)
    }

    async fn snapshot(
        &self,
        options: &serde_json::Value,
    ) -> Result<(Vec<ExternalCertificate>, Vec<ExternalEndpoint>)> {
        let document = self.fetch(options).await?;
        Ok((document.certificates, document.endpoints))
    }
}

/// Register the `webhook` and `http-inventory` plugins
///
/// # Example
///
/// ```rust
/// use certmgr_core::registry::PluginRegistry;
///
/// let registry = PluginRegistry::new();
/// certmgr_plugin_http::register(&registry).unwrap();
/// assert!(registry.notification("webhook").is_ok());
/// ```
pub fn register(registry: &PluginRegistry) -> Result<()> {
    register_with(registry, WebhookNotifier::new()?)
}

/// Register a configured webhook notifier alongside the inventory source
pub fn register_with(registry: &PluginRegistry, webhook: WebhookNotifier) -> Result<()> {
    registry.register(Plugin::new(WEBHOOK).with_notification(Arc::new(webhook)))?;
    registry.register(Plugin::new(HTTP_INVENTORY).with_source(Arc::new(HttpInventorySource::new()?)))
}
