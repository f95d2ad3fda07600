// # Filesystem Plugin
//
// Destination and source backed by a directory of PEM files.
//
// ## Layout
//
// A bundle deployed under `name` becomes:
//
// ```text
// <path>/<name>.crt         leaf certificate
// <path>/<name>.chain.crt   intermediate chain (omitted when empty)
// <path>/<name>.key         private key, mode 0600 (omitted when absent)
// ```
//
// Every file is written to a temporary sibling and renamed into place, so a
// reader never sees a half-written certificate.
//
// ## Options
//
// ```json
// { "path": "/etc/ssl/managed" }
// ```
//
// ## Trust Level: Untrusted
//
// - ✅ Read and write files under the configured directory only
// - ❌ Retry, sleep or spawn tasks
// - ❌ Touch the certificate store

use async_trait::async_trait;
use certmgr_core::model::CertificateBundle;
use certmgr_core::registry::{Plugin, PluginRegistry};
use certmgr_core::traits::{DestinationPlugin, ExternalCertificate, ExternalEndpoint, SourcePlugin};
use certmgr_core::{Error, Result, x509};
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Registry name of this plugin
pub const PLUGIN_NAME: &str = "filesystem";

const CERT_SUFFIX: &str = ".crt";
const CHAIN_SUFFIX: &str = ".chain.crt";
const KEY_SUFFIX: &str = ".key";

/// Options carried on Destination and Source records
#[derive(Debug, Clone, Deserialize)]
pub struct FilesystemOptions {
    /// Directory holding the PEM files
    pub path: PathBuf,
}

impl FilesystemOptions {
    /// Parse record options
    pub fn from_value(options: &serde_json::Value) -> Result<Self> {
        let parsed: Self = serde_json::from_value(options.clone())
            .map_err(|e| Error::config(format!("Invalid filesystem options: {}", e)))?;
        if parsed.path.as_os_str().is_empty() {
            return Err(Error::config("Filesystem option 'path' cannot be empty"));
        }
        Ok(parsed)
    }
}

/// Filesystem destination and source
///
/// The directory comes from each record's options, so one instance serves
/// any number of records. With a root set, relative paths resolve against
/// it and paths outside it are refused.
#[derive(Debug, Default, Clone)]
pub struct FilesystemPlugin {
    root: Option<PathBuf>,
}

impl FilesystemPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Confine every record's directory to `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    /// Directory named by `options`
    pub fn directory(&self, options: &serde_json::Value) -> Result<PathBuf> {
        let path = FilesystemOptions::from_value(options)?.path;
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(Error::config(format!(
                "Filesystem path {} may not contain '..'",
                path.display()
            )));
        }

        let Some(root) = &self.root else {
            return Ok(path);
        };
        let resolved = root.join(&path);
        if !resolved.starts_with(root) {
            return Err(Error::config(format!(
                "Filesystem path {} is outside {}",
                path.display(),
                root.display()
            )));
        }
        Ok(resolved)
    }
}

#[async_trait]
impl DestinationPlugin for FilesystemPlugin {
    async fn upload(
        &self,
        name: &str,
        options: &serde_json::Value,
        bundle: &CertificateBundle,
    ) -> Result<()> {
        let dir = self.directory(options)?;
        validate_name(name)?;

        fs::create_dir_all(&dir).await.map_err(|e| {
            io_error(format!("Failed to create directory {}: {}", dir.display(), e))
        })?;

        let dir = dir.as_path();
        write_atomic(&dir.join(format!("{name}{CERT_SUFFIX}")), &bundle.certificate_pem, false).await?;

        let chain_path = dir.join(format!("{name}{CHAIN_SUFFIX}"));
        if bundle.chain_pem.is_empty() {
            remove_if_present(&chain_path).await?;
        } else {
            write_atomic(&chain_path, &bundle.chain_pem, false).await?;
        }

        if let Some(key) = &bundle.private_key {
            write_atomic(&dir.join(format!("{name}{KEY_SUFFIX}")), key.expose_pem(), true).await?;
        }

        tracing::info!(
            path = %dir.display(),
            name = %name,
            fingerprint = %bundle.fingerprint,
            "Certificate written"
        );
        Ok(())
    }

    /// Fingerprints of the leaf certificates in the directory
    async fn get_certificates(
        &self,
        _name: &str,
        options: &serde_json::Value,
    ) -> Result<Vec<String>> {
        let mut fingerprints: Vec<String> = scan(&self.directory(options)?)
            .await?
            .into_iter()
            .filter_map(|found| found.body)
            .filter_map(|body| x509::parse_certificate_pem(&body).ok())
            .map(|info| info.fingerprint)
            .collect();
        fingerprints.sort();
        fingerprints.dedup();
        Ok(fingerprints)
    }
}

#[async_trait]
impl SourcePlugin for FilesystemPlugin {
    async fn get_certificates(&self, options: &serde_json::Value) -> Result<Vec<ExternalCertificate>> {
        scan(&self.directory(options)?).await
    }

    async fn get_endpoints(&self, options: &serde_json::Value) -> Result<Vec<ExternalEndpoint>> {
        // A directory has no endpoints, only files.
        self.directory(options)?;
        Ok(Vec::new())
    }
}

/// Register the `filesystem` plugin (destination and source)
///
/// # Example
///
/// ```rust
/// use certmgr_core::registry::{Capability, PluginRegistry};
///
/// let registry = PluginRegistry::new();
/// certmgr_plugin_filesystem::register(&registry).unwrap();
/// assert!(registry.get("filesystem", Capability::Source).is_ok());
/// ```
pub fn register(registry: &PluginRegistry) -> Result<()> {
    register_plugin(registry, FilesystemPlugin::new())
}

/// Register a configured instance as the `filesystem` plugin
pub fn register_plugin(registry: &PluginRegistry, plugin: FilesystemPlugin) -> Result<()> {
    let plugin = Arc::new(plugin);
    registry.register(
        Plugin::new(PLUGIN_NAME)
            .with_destination(plugin.clone())
            .with_source(plugin),
    )
}

// Deploy names become file names; keep them inside the directory.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\'])
        || name.contains('\0')
    {
        return Err(Error::invalid_request(format!(
            "'{}' cannot be used as a file name",
            name
        )));
    }
    Ok(())
}

async fn write_atomic(path: &Path, contents: &str, private: bool) -> Result<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    {
        let mut open = fs::OpenOptions::new();
        open.write(true).create(true).truncate(true);
        #[cfg(unix)]
        if private {
            open.mode(0o600);
        }
        #[cfg(not(unix))]
        let _ = private;

        let mut file = open.open(&temp).await.map_err(|e| {
            io_error(format!("Failed to create temp file {}: {}", temp.display(), e))
        })?;
        file.write_all(contents.as_bytes()).await.map_err(|e| {
            io_error(format!("Failed to write temp file {}: {}", temp.display(), e))
        })?;
        file.sync_all().await.map_err(|e| {
            io_error(format!("Failed to flush temp file {}: {}", temp.display(), e))
        })?;
    }

    fs::rename(&temp, path).await.map_err(|e| {
        io_error(format!(
            "Failed to rename {} to {}: {}",
            temp.display(),
            path.display(),
            e
        ))
    })
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error(format!("Failed to remove {}: {}", path.display(), e))),
    }
}

// Leaf certificates in `dir`, each with its chain when one sits beside it.
async fn scan(dir: &Path) -> Result<Vec<ExternalCertificate>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %dir.display(), "Directory does not exist yet");
            return Ok(Vec::new());
        }
        Err(e) => {
            return Err(io_error(format!(
                "Failed to read directory {}: {}",
                dir.display(),
                e
            )));
        }
    };

    let mut found = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| io_error(format!("Failed to read directory {}: {}", dir.display(), e)))?
    {
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let Some(stem) = leaf_stem(&file_name) else {
            continue;
        };

        let body = match fs::read_to_string(entry.path()).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(file = %file_name, "Skipping unreadable file: {}", e);
                continue;
            }
        };
        let chain = fs::read_to_string(dir.join(format!("{stem}{CHAIN_SUFFIX}")))
            .await
            .ok();

        found.push(ExternalCertificate {
            external_id: file_name.clone(),
            name: Some(stem.to_string()),
            body: Some(body),
            chain,
            fingerprint: None,
        });
    }

    found.sort_by(|a, b| a.external_id.cmp(&b.external_id));
    tracing::debug!(path = %dir.display(), certificates = found.len(), "Directory scanned");
    Ok(found)
}

// "<stem>.crt" or "<stem>.pem", excluding chains and temporaries.
fn leaf_stem(file_name: &str) -> Option<&str> {
    if file_name.ends_with(CHAIN_SUFFIX) {
        return None;
    }
    file_name
        .strip_suffix(CERT_SUFFIX)
        .or_else(|| file_name.strip_suffix(".pem"))
        .filter(|stem| !stem.is_empty())
}

fn io_error(message: String) -> Error {
    Error::provider(PLUGIN_NAME, message)
}
