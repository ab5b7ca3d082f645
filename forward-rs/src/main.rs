//! forward-rs: HTTPS forwarder
//!
//! Usage: `forward-rs [settings.toml]`

use forward_rs::{ConfigStore, ProxyConfig, ProxyServer};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_path = std::env::args().nth(1).map(PathBuf::from);
    let config = ProxyConfig::load(settings_path.as_deref())?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    info!("Starting forward-rs v{}", env!("CARGO_PKG_VERSION"));
    match &settings_path {
        Some(path) => info!("Loaded settings from {:?}", path),
        None => info!("No settings file given, using defaults and environment"),
    }

    let store = Arc::new(ConfigStore::open(
        config.hosts.file.clone(),
        config.hosts.placeholder_hosts.clone(),
        config.hosts.memo_limit,
    )?);

    #[cfg(unix)]
    forward_rs::reload::spawn_reload_on_hangup(store.clone())?;

    let server = Arc::new(ProxyServer::new(config.clone(), store)?);

    if let Some(port) = config.server.http_redirect_port {
        let http_addr = format!("0.0.0.0:{}", port);
        let redirect_server = server.clone();

        tokio::spawn(async move {
            if let Err(e) = redirect_server.run_http_redirect(&http_addr).await {
                error!("HTTP redirect server error: {}", e);
            }
        });
    }

    server.run().await?;

    Ok(())
}
