//! TLS termination for the listening socket

use crate::config::HttpsConfig;
use crate::error::ProxyError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, ClientConnection, Connection, DigitallySignedStruct, ServerConfig, ServerConnection,
    SignatureScheme,
};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

/// Flights needed for a full handshake, with room to spare
const SELF_CHECK_ROUNDS: usize = 8;

/// Loaded certificate/key pair ready to accept TLS connections
#[derive(Clone)]
pub struct TlsTerminator {
    acceptor: TlsAcceptor,
}

impl TlsTerminator {
    /// Build from the `https` section. Unreadable or invalid PEM material
    /// is a `TlsConfig` error.
    pub fn from_config(https: &HttpsConfig) -> Result<Self, ProxyError> {
        let cert_path = https
            .cert_path
            .as_deref()
            .ok_or_else(|| ProxyError::TlsConfig("cert_path is not set".into()))?;
        let key_path = https
            .key_path
            .as_deref()
            .ok_or_else(|| ProxyError::TlsConfig("key_path is not set".into()))?;
        Self::from_pem_files(cert_path, key_path)
    }

    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, ProxyError> {
        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ProxyError::TlsConfig(format!("certificate/key rejected: {}", e)))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        let config = Arc::new(config);
        check_key_matches(config.clone())?;

        info!("Loaded TLS certificate from {}", cert_path.display());

        Ok(Self {
            acceptor: TlsAcceptor::from(config),
        })
    }

    /// Complete the server-side handshake
    pub async fn accept(&self, stream: TcpStream) -> std::io::Result<TlsStream<TcpStream>> {
        let peer = stream.peer_addr().ok();
        let tls = self.acceptor.accept(stream).await?;
        debug!("TLS handshake completed from {:?}", peer);
        Ok(tls)
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let file = File::open(path)
        .map_err(|e| ProxyError::TlsConfig(format!("cannot open certificate {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::TlsConfig(format!("invalid certificate PEM {}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(ProxyError::TlsConfig(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let file = File::open(path)
        .map_err(|e| ProxyError::TlsConfig(format!("cannot open private key {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ProxyError::TlsConfig(format!("invalid private key PEM {}: {}", path.display(), e)))?
        .ok_or_else(|| ProxyError::TlsConfig(format!("no private key found in {}", path.display())))
}

/// Accepts any certificate but still checks every handshake signature
/// against the certificate's public key.
#[derive(Debug)]
struct SignatureOnly {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for SignatureOnly {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// rustls does not tie the private key to the certificate when building a
/// `ServerConfig`, so run one handshake against it in memory. A key that
/// does not belong to the leaf certificate fails the signature check.
fn check_key_matches(config: Arc<ServerConfig>) -> Result<(), ProxyError> {
    let mismatch = |e: rustls::Error| ProxyError::TlsConfig(format!("certificate does not match private key: {}", e));

    let verifier = SignatureOnly {
        algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
    };
    let client_config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    let name = ServerName::try_from("localhost").map_err(|e| ProxyError::TlsConfig(e.to_string()))?;

    let mut client = Connection::from(ClientConnection::new(Arc::new(client_config), name).map_err(mismatch)?);
    let mut server = Connection::from(ServerConnection::new(config).map_err(mismatch)?);

    for _ in 0..SELF_CHECK_ROUNDS {
        if !client.is_handshaking() && !server.is_handshaking() {
            return Ok(());
        }
        transfer(&mut client, &mut server).map_err(mismatch)?;
        transfer(&mut server, &mut client).map_err(mismatch)?;
    }
    Err(ProxyError::TlsConfig("certificate self-check handshake did not complete".into()))
}

/// Move every pending TLS record from one side to the other
fn transfer(from: &mut Connection, to: &mut Connection) -> Result<(), rustls::Error> {
    let mut records = Vec::new();
    while from.wants_write() {
        from.write_tls(&mut records)
            .map_err(|e| rustls::Error::General(e.to_string()))?;
    }

    let mut pending = records.as_slice();
    while !pending.is_empty() {
        to.read_tls(&mut pending)
            .map_err(|e| rustls::Error::General(e.to_string()))?;
        to.process_new_packets()?;
    }
    Ok(())
}
