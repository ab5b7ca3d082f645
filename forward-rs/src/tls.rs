//! TLS configuration and per-SNI certificate selection
//!
//! Every handshake goes through [`CertificateResolver`]. The diagnostic name
//! `localhost` always gets a fixed self-signed certificate; any other name is
//! handed to the certificate authority collaborator.

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pemfile::{certs, read_all, Item};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::acme::CertificateAuthority;
use crate::config::TlsConfig;
use crate::error::{ForwardError, Result};

/// SNI value served with the built-in self-signed certificate.
///
/// Used when a terminator in front of this proxy (e.g. a CDN) does not pass
/// the original SNI through. Never routed through the authority.
pub const DIAGNOSTIC_SERVER_NAME: &str = "localhost";

/// Picks the certificate to present for each TLS handshake
pub struct CertificateResolver {
    diagnostic: Arc<CertifiedKey>,
    authority: Arc<dyn CertificateAuthority>,
}

impl CertificateResolver {
    pub fn new(diagnostic: Arc<CertifiedKey>, authority: Arc<dyn CertificateAuthority>) -> Self {
        Self {
            diagnostic,
            authority,
        }
    }

    /// Resolve a certificate for a server name; authority errors pass through unchanged
    pub fn resolve_server_name(&self, server_name: &str) -> Result<Arc<CertifiedKey>> {
        if server_name == DIAGNOSTIC_SERVER_NAME {
            return Ok(self.diagnostic.clone());
        }
        self.authority.resolve_certificate(server_name)
    }
}

impl std::fmt::Debug for CertificateResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for CertificateResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let Some(server_name) = client_hello.server_name() else {
            debug!("ClientHello without SNI, no certificate");
            return None;
        };
        let server_name = server_name.to_ascii_lowercase();

        match self.resolve_server_name(&server_name) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(server_name = %server_name, "No certificate: {}", e);
                None
            }
        }
    }
}

/// TLS manager for building the acceptor
pub struct TlsManager {
    config: TlsConfig,
}

impl TlsManager {
    /// Create a new TLS manager
    pub fn new(config: TlsConfig) -> Self {
        Self { config }
    }

    /// Build a TLS acceptor whose certificates come from `authority`
    pub fn build_acceptor(&self, authority: Arc<dyn CertificateAuthority>) -> Result<TlsAcceptor> {
        let resolver = CertificateResolver::new(self.diagnostic_certificate()?, authority);

        let mut server_config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(resolver));
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(TlsAcceptor::from(Arc::new(server_config)))
    }

    /// Certificate presented for [`DIAGNOSTIC_SERVER_NAME`]
    pub fn diagnostic_certificate(&self) -> Result<Arc<CertifiedKey>> {
        if let (Some(cert_path), Some(key_path)) = (
            &self.config.localhost_cert_path,
            &self.config.localhost_key_path,
        ) {
            info!(
                "Loading diagnostic certificate from {} and {}",
                cert_path.display(),
                key_path.display()
            );
            return load_certified_key(cert_path, key_path);
        }

        info!("Generating self-signed certificate for {}", DIAGNOSTIC_SERVER_NAME);
        let (cert_pem, key_pem) = generate_self_signed(vec![DIAGNOSTIC_SERVER_NAME.to_string()])?;
        certified_key_from_pem(cert_pem.as_bytes(), key_pem.as_bytes())
    }
}

/// Load a certificate chain and private key from PEM files
pub fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<Arc<CertifiedKey>> {
    let cert_pem = std::fs::read(cert_path)
        .map_err(|e| ForwardError::Tls(format!("Failed to open certificate file: {}", e)))?;
    let key_pem = std::fs::read(key_path)
        .map_err(|e| ForwardError::Tls(format!("Failed to open key file: {}", e)))?;
    certified_key_from_pem(&cert_pem, &key_pem)
}

/// Build a signing key pair from PEM text (PKCS8, RSA or SEC1 key)
pub fn certified_key_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<CertifiedKey>> {
    let mut cert_reader = cert_pem;
    let certs_der = certs(&mut cert_reader)
        .map_err(|e| ForwardError::Tls(format!("Failed to read certificates: {}", e)))?;
    if certs_der.is_empty() {
        return Err(ForwardError::Tls("No certificates found".to_string()));
    }

    let mut key_reader = key_pem;
    let key_der = read_all(&mut key_reader)
        .map_err(|e| ForwardError::Tls(format!("Failed to read private key: {}", e)))?
        .into_iter()
        .find_map(|item| match item {
            Item::PKCS8Key(key) | Item::RSAKey(key) | Item::ECKey(key) => Some(key),
            _ => None,
        })
        .ok_or_else(|| ForwardError::Tls("No private key found".to_string()))?;

    let signing_key = rustls::sign::any_supported_type(&rustls::PrivateKey(key_der))
        .map_err(|e| ForwardError::Tls(format!("Unsupported private key: {}", e)))?;
    let chain = certs_der.into_iter().map(rustls::Certificate).collect();

    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}

/// Generate a self-signed certificate, returned as (cert PEM, key PEM)
pub fn generate_self_signed(subject_alt_names: Vec<String>) -> Result<(String, String)> {
    let cert = rcgen::generate_simple_self_signed(subject_alt_names)
        .map_err(|e| ForwardError::Tls(format!("Failed to generate self-signed cert: {}", e)))?;
    Ok((cert.cert.pem(), cert.key_pair.serialize_pem()))
}
