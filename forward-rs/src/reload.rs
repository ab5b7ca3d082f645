//! Hosts file reloads triggered by SIGHUP

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::store::ConfigStore;

/// Reload the hosts file, logging the outcome.
///
/// Returns false when the file could not be read; the previous table is
/// still being served in that case.
pub fn reload_hosts(store: &ConfigStore) -> bool {
    match store.reload() {
        Ok(()) => {
            info!(exact_hosts = store.exact_len(), "Reloaded hosts file");
            true
        }
        Err(e) => {
            error!("Hosts file reload failed, keeping previous table: {}", e);
            false
        }
    }
}

/// Reload `store` every time the process receives SIGHUP
#[cfg(unix)]
pub fn spawn_reload_on_hangup(store: Arc<ConfigStore>) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = signal(SignalKind::hangup())?;
    Ok(tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            info!("SIGHUP received");
            reload_hosts(&store);
        }
    }))
}
