//! Certificate authority collaborator
//!
//! Certificate issuance lives behind [`CertificateAuthority`]. The proxy
//! only asks it for a key pair per server name and supplies a
//! [`HostPolicy`] so certificates are never requested for unrouted names.
//!
//! [`DirCacheAuthority`] persists certificates under a cache directory and
//! issues a self-signed stand-in when none is cached. An ACME client plugs
//! in by implementing [`CertificateAuthority`].

use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

use crate::error::{ForwardError, Result};
use crate::tls::{certified_key_from_pem, generate_self_signed, load_certified_key};

/// Decides whether a certificate may be obtained for a hostname
pub trait HostPolicy: Send + Sync {
    fn authorize_host(&self, host: &str) -> Result<()>;
}

/// Source of certificates for non-diagnostic server names
pub trait CertificateAuthority: Send + Sync {
    fn resolve_certificate(&self, server_name: &str) -> Result<Arc<CertifiedKey>>;
}

/// Certificate storage paths
#[derive(Debug, Clone)]
pub struct CertificatePaths {
    /// Directory to store certificates
    pub cert_dir: PathBuf,
    /// Certificate file path
    pub cert_path: PathBuf,
    /// Private key file path
    pub key_path: PathBuf,
}

impl CertificatePaths {
    /// Create certificate paths for a domain
    pub fn for_domain(base_dir: &Path, domain: &str) -> Self {
        let cert_dir = base_dir.join("certs").join(domain);
        Self {
            cert_path: cert_dir.join("cert.pem"),
            key_path: cert_dir.join("key.pem"),
            cert_dir,
        }
    }

    /// Check if certificate files exist
    pub fn exists(&self) -> bool {
        self.cert_path.exists() && self.key_path.exists()
    }

    /// Ensure certificate directory exists
    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.cert_dir)
            .map_err(|e| ForwardError::Tls(format!("Failed to create cert directory: {}", e)))?;
        Ok(())
    }
}

/// Certificate authority backed by an on-disk cache.
///
/// At most `cache_limit` certificates are kept in memory and at most
/// `cache_limit` are persisted under `storage_dir`. Glob rules let clients
/// pick arbitrary names, so past either cap a certificate is still issued
/// but no longer retained.
pub struct DirCacheAuthority {
    storage_dir: PathBuf,
    policy: Arc<dyn HostPolicy>,
    cache_limit: usize,
    loaded: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    /// Held across load-or-issue; counts certificates on disk
    persisted: Mutex<usize>,
}

impl DirCacheAuthority {
    pub fn new(storage_dir: PathBuf, policy: Arc<dyn HostPolicy>, cache_limit: usize) -> Self {
        let persisted = fs::read_dir(storage_dir.join("certs"))
            .map(|entries| entries.count())
            .unwrap_or(0);
        Self {
            storage_dir,
            policy,
            cache_limit,
            loaded: RwLock::new(HashMap::new()),
            persisted: Mutex::new(persisted),
        }
    }

    /// Get certificate paths for a server name
    pub fn cert_paths(&self, server_name: &str) -> CertificatePaths {
        CertificatePaths::for_domain(&self.storage_dir, server_name)
    }

    /// Number of certificates held in memory
    pub fn cached_len(&self) -> usize {
        self.read_loaded().len()
    }

    fn read_loaded(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<CertifiedKey>>> {
        self.loaded.read().unwrap_or_else(|e| e.into_inner())
    }

    fn load_or_issue(&self, server_name: &str, persisted: &mut usize) -> Result<Arc<CertifiedKey>> {
        let paths = self.cert_paths(server_name);
        if paths.exists() {
            debug!(server_name, "Loading cached certificate");
            return load_certified_key(&paths.cert_path, &paths.key_path);
        }

        warn!(server_name, "No cached certificate, issuing self-signed");
        let (cert_pem, key_pem) = generate_self_signed(vec![server_name.to_string()])?;
        let key = certified_key_from_pem(cert_pem.as_bytes(), key_pem.as_bytes())?;

        if *persisted >= self.cache_limit {
            debug!(server_name, "Certificate cache full, not persisting");
            return Ok(key);
        }

        paths.ensure_dir()?;
        // key first: `exists` only turns true once the cert lands too
        write_atomic(&paths.key_path, &key_pem)?;
        write_atomic(&paths.cert_path, &cert_pem)?;
        *persisted += 1;
        info!("Certificate written to {:?}", paths.cert_path);

        Ok(key)
    }
}

/// Write to a sibling temp file, then rename over `path`
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp = path.with_extension("pem.tmp");
    fs::write(&tmp, contents)
        .and_then(|()| fs::rename(&tmp, path))
        .map_err(|e| ForwardError::Tls(format!("Failed to write {}: {}", path.display(), e)))
}

impl CertificateAuthority for DirCacheAuthority {
    fn resolve_certificate(&self, server_name: &str) -> Result<Arc<CertifiedKey>> {
        self.policy.authorize_host(server_name)?;

        // names become directory components
        if server_name.split('.').any(str::is_empty) || server_name.contains('/') {
            return Err(ForwardError::Tls(format!(
                "Refusing to cache certificate for {:?}",
                server_name
            )));
        }

        if let Some(key) = self.read_loaded().get(server_name) {
            return Ok(key.clone());
        }

        let mut persisted = self.persisted.lock().unwrap_or_else(|e| e.into_inner());
        // another handshake may have issued it while we waited
        if let Some(key) = self.read_loaded().get(server_name) {
            return Ok(key.clone());
        }

        let key = self.load_or_issue(server_name, &mut persisted)?;
        let mut loaded = self.loaded.write().unwrap_or_else(|e| e.into_inner());
        if loaded.len() < self.cache_limit {
            loaded.insert(server_name.to_string(), key.clone());
        }
        Ok(key)
    }
}
