//! Certificate manager for the listening side
//! Generates and reuses a self-signed certificate for local development hosts

use crate::error::ProxyError;
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, SanType};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::info;

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";

/// Names every generated certificate covers
pub const DEFAULT_DOMAINS: &[&str] = &["localhost", "127.0.0.1", "*.local", "*.localhost"];

/// Certificate manager for handling the self-signed pair
#[derive(Debug, Clone)]
pub struct CertificateManager {
    certs_dir: PathBuf,
}

impl CertificateManager {
    /// Create a new certificate manager
    pub fn new<P: AsRef<Path>>(certs_dir: P) -> Result<Self, ProxyError> {
        let certs_dir = certs_dir.as_ref().to_path_buf();
        fs::create_dir_all(&certs_dir).map_err(|e| {
            ProxyError::Certificate(format!("cannot create {}: {}", certs_dir.display(), e))
        })?;
        Ok(Self { certs_dir })
    }

    pub fn cert_path(&self) -> PathBuf {
        self.certs_dir.join(CERT_FILE)
    }

    pub fn key_path(&self) -> PathBuf {
        self.certs_dir.join(KEY_FILE)
    }

    /// Check if both halves of the pair exist
    pub fn cert_exists(&self) -> bool {
        self.cert_path().exists() && self.key_path().exists()
    }

    /// Return the existing pair, generating one on first use
    pub fn ensure<S: AsRef<str>>(&self, extra_domains: &[S]) -> Result<(PathBuf, PathBuf), ProxyError> {
        if self.cert_exists() {
            info!("Using existing certificate: {}", self.cert_path().display());
            return Ok((self.cert_path(), self.key_path()));
        }

        let mut domains: Vec<&str> = DEFAULT_DOMAINS.to_vec();
        for domain in extra_domains {
            let domain = domain.as_ref();
            if !domains.contains(&domain) {
                domains.push(domain);
            }
        }
        self.generate(&domains)
    }

    /// Generate a self-signed certificate, overwriting any existing pair
    pub fn generate(&self, domains: &[&str]) -> Result<(PathBuf, PathBuf), ProxyError> {
        let primary = domains.first().copied().unwrap_or("localhost");

        let mut params = CertificateParams::new(Vec::<String>::new());
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, primary);
        name.push(DnType::OrganizationName, "devproxy");
        params.distinguished_name = name;
        params.subject_alt_names = domains
            .iter()
            .map(|domain| match domain.parse::<IpAddr>() {
                Ok(ip) => SanType::IpAddress(ip),
                Err(_) => SanType::DnsName(domain.to_string()),
            })
            .collect();

        let cert = Certificate::from_params(params)
            .map_err(|e| ProxyError::Certificate(e.to_string()))?;
        let cert_pem = cert
            .serialize_pem()
            .map_err(|e| ProxyError::Certificate(e.to_string()))?;
        let key_pem = cert.serialize_private_key_pem();

        let cert_path = self.cert_path();
        let key_path = self.key_path();
        fs::write(&cert_path, cert_pem)
            .and_then(|_| fs::write(&key_path, key_pem))
            .map_err(|e| ProxyError::Certificate(format!("cannot write certificate: {}", e)))?;

        info!("Generated self-signed certificate for: {}", domains.join(", "));

        Ok((cert_path, key_path))
    }
}
