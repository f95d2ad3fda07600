//! X.509 helpers: fingerprints, PEM parsing, CSR inspection and generation
//!
//! Parsing is done with `x509-parser`; CSR generation with `rcgen`.
//! Nothing here talks to an external system.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use x509_parser::pem::{Pem, parse_x509_pem};
use x509_parser::prelude::*;

use crate::error::{Error, Result};
use crate::model::PrivateKey;

/// Fields extracted from a parsed certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Hex serial number
    pub serial: String,
    /// Lowercase hex SHA-256 of the DER encoding
    pub fingerprint: String,
    /// Subject distinguished name
    pub subject: String,
    /// Issuer distinguished name
    pub issuer: String,
    /// Subject common name, empty when absent
    pub common_name: String,
    /// DNS subject alternative names
    pub sans: Vec<String>,
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
}

/// Fields extracted from a verified PKCS#10 request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrInfo {
    /// Subject distinguished name
    pub subject: String,
    /// Subject common name, if present
    pub common_name: Option<String>,
    /// Requested DNS subject alternative names
    pub sans: Vec<String>,
    /// The request as DER, whatever encoding it arrived in
    pub der: Vec<u8>,
}

/// A freshly generated key and the request signed with it
pub struct GeneratedCsr {
    /// DER-encoded PKCS#10 request
    pub der: Vec<u8>,
    /// PEM-encoded PKCS#10 request
    pub pem: String,
    /// Private key matching the request
    pub private_key: PrivateKey,
}

/// Lowercase hex SHA-256 over DER bytes
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Canonicalise a provider-reported SHA-256 fingerprint.
///
/// Accepts colon- or space-separated and upper-case forms. Returns `None`
/// unless the result is exactly 64 hex digits.
pub fn normalize_fingerprint(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect::<String>()
        .to_ascii_lowercase();

    if cleaned.len() == 64 && cleaned.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(cleaned)
    } else {
        None
    }
}

/// Parse the first PEM certificate in `pem`
pub fn parse_certificate_pem(pem: &str) -> Result<CertificateInfo> {
    let (_, block) = parse_x509_pem(pem.as_bytes())
        .map_err(|e| Error::invalid_request(format!("Not a PEM document: {}", e)))?;

    if block.label != "CERTIFICATE" {
        return Err(Error::invalid_request(format!(
            "Expected a CERTIFICATE PEM block, got '{}'",
            block.label
        )));
    }

    certificate_info(&block.contents)
}

/// Parse a DER certificate
pub fn certificate_info(der: &[u8]) -> Result<CertificateInfo> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::invalid_request(format!("Malformed certificate: {}", e)))?;

    let not_before = to_utc(cert.validity().not_before.timestamp())?;
    let not_after = to_utc(cert.validity().not_after.timestamp())?;
    if not_after <= not_before {
        return Err(Error::invalid_request(format!(
            "Certificate validity is empty: not_after {} <= not_before {}",
            not_after, not_before
        )));
    }

    let sans = match cert.subject_alternative_name() {
        Ok(Some(ext)) => dns_names(&ext.value.general_names),
        _ => Vec::new(),
    };

    Ok(CertificateInfo {
        serial: format!("{:x}", cert.serial),
        fingerprint: fingerprint(der),
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        common_name: common_name(cert.subject()).unwrap_or_default(),
        sans,
        not_before,
        not_after,
    })
}

/// Split a PEM chain into its certificate blocks, checking each one parses.
///
/// Blocks are re-encoded with LF line endings and 64-column lines, so
/// equivalent chains from different providers compare equal.
pub fn normalize_chain(chain: &str) -> Result<String> {
    let mut blocks = Vec::new();
    for (index, pem) in Pem::iter_from_buffer(chain.as_bytes()).enumerate() {
        let pem =
            pem.map_err(|e| Error::invalid_request(format!("Chain block {} unreadable: {}", index, e)))?;
        if pem.label != "CERTIFICATE" {
            return Err(Error::invalid_request(format!(
                "Chain block {} is '{}', not a certificate",
                index, pem.label
            )));
        }
        certificate_info(&pem.contents)?;
        blocks.push(to_pem("CERTIFICATE", &pem.contents));
    }
    Ok(blocks.join(""))
}

/// Verify a PKCS#10 request (DER or PEM) and extract its subject and SANs
pub fn inspect_csr(bytes: &[u8]) -> Result<CsrInfo> {
    if bytes.is_empty() {
        return Err(Error::invalid_request("CSR is empty"));
    }

    let der = if bytes.starts_with(b"-----BEGIN") {
        let (_, block) = parse_x509_pem(bytes)
            .map_err(|e| Error::invalid_request(format!("CSR is not valid PEM: {}", e)))?;
        if block.label != "CERTIFICATE REQUEST" && block.label != "NEW CERTIFICATE REQUEST" {
            return Err(Error::invalid_request(format!(
                "Expected a CERTIFICATE REQUEST PEM block, got '{}'",
                block.label
            )));
        }
        block.contents
    } else {
        bytes.to_vec()
    };

    let (rest, csr) = X509CertificationRequest::from_der(&der)
        .map_err(|e| Error::invalid_request(format!("Malformed PKCS#10 request: {}", e)))?;
    if !rest.is_empty() {
        return Err(Error::invalid_request("Trailing bytes after PKCS#10 request"));
    }

    csr.verify_signature()
        .map_err(|e| Error::invalid_request(format!("CSR signature does not verify: {}", e)))?;

    let info = &csr.certification_request_info;
    let mut sans = Vec::new();
    if let Some(extensions) = csr.requested_extensions() {
        for ext in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = ext {
                sans.extend(dns_names(&san.general_names));
            }
        }
    }

    let subject = info.subject.to_string();
    let common_name = common_name(&info.subject);
    Ok(CsrInfo {
        subject,
        common_name,
        sans,
        der,
    })
}

/// Generate a P-256 key and a PKCS#10 request for `common_name` and `sans`
pub fn build_csr(common_name: &str, sans: &[String]) -> Result<GeneratedCsr> {
    let key = rcgen::KeyPair::generate()
        .map_err(|e| Error::Other(format!("Key generation failed: {}", e)))?;

    let mut params = rcgen::CertificateParams::new(sans.to_vec())
        .map_err(|e| Error::invalid_request(format!("Invalid subject alternative name: {}", e)))?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, common_name);

    let csr = params
        .serialize_request(&key)
        .map_err(|e| Error::Other(format!("CSR serialization failed: {}", e)))?;
    let pem = csr
        .pem()
        .map_err(|e| Error::Other(format!("CSR PEM encoding failed: {}", e)))?;

    Ok(GeneratedCsr {
        der: csr.der().to_vec(),
        pem,
        private_key: PrivateKey::new(key.serialize_pem()),
    })
}

fn common_name(name: &X509Name<'_>) -> Option<String> {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
}

fn dns_names(names: &[GeneralName<'_>]) -> Vec<String> {
    names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some(dns.to_string()),
            _ => None,
        })
        .collect()
}

fn to_utc(timestamp: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| Error::invalid_request(format!("Timestamp out of range: {}", timestamp)))
}

fn to_pem(label: &str, der: &[u8]) -> String {
    let encoded = BASE64.encode(der);
    let mut pem = format!("-----BEGIN {}-----\n", label);
    for line in encoded.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {}-----\n", label));
    pem
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed(cn: &str, sans: &[&str]) -> (String, Vec<u8>) {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params =
            rcgen::CertificateParams::new(sans.iter().map(|s| s.to_string()).collect::<Vec<_>>())
                .unwrap();
        params.distinguished_name.push(rcgen::DnType::CommonName, cn);
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), cert.der().to_vec())
    }

    #[test]
    fn parses_certificate_fields() {
        let (pem, der) = self_signed("example.com", &["example.com", "www.example.com"]);
        let info = parse_certificate_pem(&pem).unwrap();

        assert_eq!(info.common_name, "example.com");
        assert_eq!(info.sans, vec!["example.com", "www.example.com"]);
        assert_eq!(info.fingerprint, fingerprint(&der));
        assert_eq!(info.fingerprint.len(), 64);
        assert!(info.not_after > info.not_before);
        assert!(info.subject.contains("example.com"));
    }

    #[test]
    fn rejects_non_certificate_pem() {
        let csr = build_csr("example.com", &[]).unwrap();
        let err = parse_certificate_pem(&csr.pem).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn csr_round_trips_subject_and_sans() {
        let sans = vec!["example.com".to_string(), "api.example.com".to_string()];
        let csr = build_csr("example.com", &sans).unwrap();

        let from_der = inspect_csr(&csr.der).unwrap();
        assert_eq!(from_der.common_name.as_deref(), Some("example.com"));
        assert_eq!(from_der.sans, sans);

        assert_eq!(from_der.der, csr.der);

        let from_pem = inspect_csr(csr.pem.as_bytes()).unwrap();
        assert_eq!(from_pem, from_der);
        assert!(csr.private_key.expose_pem().contains("PRIVATE KEY"));
    }

    #[test]
    fn malformed_csr_is_invalid_request() {
        assert!(matches!(inspect_csr(b""), Err(Error::InvalidRequest(_))));
        assert!(matches!(inspect_csr(b"not a csr"), Err(Error::InvalidRequest(_))));

        let mut der = build_csr("example.com", &[]).unwrap().der;
        let last = der.len() - 1;
        der[last] ^= 0xff;
        assert!(matches!(inspect_csr(&der), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn fingerprint_normalization() {
        let canonical = "ab".repeat(32);
        let colons = vec!["AB"; 32].join(":");

        assert_eq!(normalize_fingerprint(&colons), Some(canonical.clone()));
        assert_eq!(normalize_fingerprint(&canonical), Some(canonical));
        assert_eq!(normalize_fingerprint("abcd"), None);
        assert_eq!(normalize_fingerprint(&"zz".repeat(32)), None);
    }

    #[test]
    fn chain_normalization_rejects_garbage() {
        let (a, _) = self_signed("intermediate-a", &[]);
        let (b, _) = self_signed("intermediate-b", &[]);
        let chain = format!("{}{}", a, b);

        let normalized = normalize_chain(&chain).unwrap();
        assert_eq!(normalized.matches("BEGIN CERTIFICATE").count(), 2);
        assert_eq!(normalize_chain(&normalized).unwrap(), normalized);
        assert_eq!(normalize_chain("").unwrap(), "");

        let key = build_csr("x", &[]).unwrap().private_key;
        assert!(normalize_chain(key.expose_pem()).is_err());
    }
}
