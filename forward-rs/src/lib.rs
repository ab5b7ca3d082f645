//! forward-rs: TLS-terminating forwarder for many hostnames
//!
//! Accepts HTTPS on one port, picks a certificate per SNI name and forwards
//! each request to the plain-HTTP backend configured for its `Host`.
//!
//! # Hosts file
//!
//! ```text
//! # comments run to the end of the line
//! .example.com              # suffix for the names that follow
//! www        127.0.0.1:8080
//! admin      127.0.0.1:9000 alice:secret
//! *.preview  127.0.0.1:7000
//! .                         # clears the suffix
//! other.org  10.0.0.2:80
//! ```
//!
//! The file is re-read on SIGHUP. Process settings (listen address, cache
//! directory, logging) come from an optional TOML file and `FORWARD_*`
//! environment variables, see [`config`].

pub mod acme;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod hosts;
pub mod matcher;
pub mod proxy;
pub mod reload;
pub mod store;
pub mod tls;

pub use config::ProxyConfig;
pub use dispatch::DispatchEngine;
pub use error::{ForwardError, Result};
pub use proxy::ProxyServer;
pub use store::ConfigStore;
