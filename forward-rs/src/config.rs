//! Process settings for forward-rs
//!
//! These are separate from the hosts file: they say where to listen, where
//! the hosts file lives and how TLS and logging are set up. Sources, later
//! ones winning: built-in defaults, an optional TOML file, then `FORWARD_`
//! environment variables (`FORWARD_SERVER__LISTEN_ADDR=0.0.0.0:8443`).

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ForwardError, Result};
use crate::matcher::{is_glob, is_valid_domain};
use crate::store::DEFAULT_MEMO_LIMIT;

/// Main proxy configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Server configuration
    pub server: ServerConfig,
    /// Hosts file configuration
    pub hosts: HostsConfig,
    /// TLS configuration
    pub tls: TlsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for HTTPS (e.g., "0.0.0.0:443")
    pub listen_addr: String,
    /// Plain HTTP port answering with redirects to HTTPS
    pub http_redirect_port: Option<u16>,
    /// `Strict-Transport-Security` max-age in seconds
    pub hsts_max_age_secs: u64,
    /// How long to wait for backend response headers
    pub response_header_timeout_secs: u64,
    /// Idle backend connections are closed after this long
    pub pool_idle_timeout_secs: u64,
}

/// Hosts file configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HostsConfig {
    /// Path to the hosts file
    pub file: PathBuf,
    /// Hosts served with the built-in placeholder page
    pub placeholder_hosts: Vec<String>,
    /// Cap on glob-resolved hostnames memoized per reload
    pub memo_limit: usize,
}

/// TLS configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Certificate cache directory
    pub cache_dir: PathBuf,
    /// PEM certificate presented for `localhost`
    pub localhost_cert_path: Option<PathBuf>,
    /// PEM private key for `localhost`
    pub localhost_key_path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:443".to_string(),
            http_redirect_port: None,
            hsts_max_age_secs: 86400,
            response_header_timeout_secs: 30,
            pool_idle_timeout_secs: 30,
        }
    }
}

impl Default for HostsConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("/etc/https-forward"),
            placeholder_hosts: Vec::new(),
            memo_limit: DEFAULT_MEMO_LIMIT,
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/tmp/autocert"),
            localhost_cert_path: None,
            localhost_key_path: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "forward_rs=info,tower_http=info".to_string(),
            json: false,
        }
    }
}

impl ServerConfig {
    pub fn response_header_timeout(&self) -> Duration {
        Duration::from_secs(self.response_header_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl ProxyConfig {
    /// Load settings from defaults, an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("FORWARD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: ProxyConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| ForwardError::Config(format!("Failed to load settings: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.server.listen_addr.parse::<SocketAddr>().map_err(|e| {
            ForwardError::Config(format!(
                "Invalid listen address '{}': {}",
                self.server.listen_addr, e
            ))
        })?;

        if self.hosts.memo_limit == 0 {
            return Err(ForwardError::Config("hosts.memo_limit must be positive".to_string()));
        }

        for host in &self.hosts.placeholder_hosts {
            if !is_valid_domain(host) || is_glob(host) {
                return Err(ForwardError::Config(format!("Invalid placeholder host '{}'", host)));
            }
        }

        if self.tls.localhost_cert_path.is_some() != self.tls.localhost_key_path.is_some() {
            return Err(ForwardError::Config(
                "tls.localhost_cert_path and tls.localhost_key_path must be set together".to_string(),
            ));
        }

        Ok(())
    }
}
