//! HTTPS front door: TLS accept loop feeding the dispatch engine

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, Request, Response, StatusCode},
    response::IntoResponse,
    Router,
};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::acme::{CertificateAuthority, DirCacheAuthority};
use crate::config::ProxyConfig;
use crate::dispatch::{strip_port, DispatchEngine};
use crate::error::{ForwardError, Result};
use crate::store::ConfigStore;
use crate::tls::TlsManager;

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    store: Arc<ConfigStore>,
    engine: Arc<DispatchEngine>,
    tls_acceptor: TlsAcceptor,
}

impl ProxyServer {
    /// Create a server whose certificates come from the on-disk cache
    pub fn new(config: ProxyConfig, store: Arc<ConfigStore>) -> Result<Self> {
        let authority = Arc::new(DirCacheAuthority::new(
            config.tls.cache_dir.clone(),
            store.clone(),
            config.hosts.memo_limit,
        ));
        Self::with_authority(config, store, authority)
    }

    /// Create a server backed by any certificate authority
    pub fn with_authority(
        config: ProxyConfig,
        store: Arc<ConfigStore>,
        authority: Arc<dyn CertificateAuthority>,
    ) -> Result<Self> {
        config.validate()?;

        let engine = Arc::new(DispatchEngine::new(store.clone(), &config.server)?);
        let tls_acceptor = TlsManager::new(config.tls.clone()).build_acceptor(authority)?;

        Ok(Self {
            config,
            store,
            engine,
            tls_acceptor,
        })
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// Re-read the hosts file; the old table stays on failure
    pub fn reload(&self) -> Result<()> {
        self.store.reload()
    }

    /// Build the Axum router
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(dispatch_handler)
            .layer(TraceLayer::new_for_http())
            .with_state(self.engine.clone())
    }

    /// Bind the configured address and serve until the listener fails
    pub async fn run(&self) -> Result<()> {
        let addr = &self.config.server.listen_addr;
        info!("Starting HTTPS server on {}", addr);
        info!(
            "Hosts file: {:?} ({} exact entries)",
            self.config.hosts.file,
            self.store.exact_len()
        );

        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accept TLS connections on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let router = self.router();

        loop {
            let (stream, remote) = accept_retrying(|| listener.accept()).await;
            let acceptor = self.tls_acceptor.clone();
            let router = router.clone();

            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(stream).await {
                    Ok(s) => s,
                    Err(e) => {
                        // unknown names end up here, the resolver already logged why
                        debug!("TLS handshake failed from {}: {}", remote, e);
                        return;
                    }
                };
                let io = TokioIo::new(tls_stream);

                let service = service_fn(move |mut req: Request<hyper::body::Incoming>| {
                    req.extensions_mut().insert(ConnectInfo(remote));
                    router.clone().oneshot(req)
                });

                if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await
                {
                    debug!("Error serving connection from {}: {}", remote, e);
                }
            });
        }
    }

    /// Run HTTP to HTTPS redirect server
    pub async fn run_http_redirect(&self, http_addr: &str) -> Result<()> {
        let https_port = self
            .config
            .server
            .listen_addr
            .parse::<SocketAddr>()
            .map(|a| a.port())
            .map_err(|e| ForwardError::Config(format!("Invalid listen address: {}", e)))?;

        info!("Starting HTTP redirect server on {}", http_addr);
        let listener = TcpListener::bind(http_addr).await?;
        axum::serve(listener, redirect_router(self.store.clone(), https_port))
            .await
            .map_err(ForwardError::Io)?;

        Ok(())
    }
}

/// Pause after a failed accept, so fd exhaustion does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Keep calling `accept` until it yields a connection.
///
/// Accept errors (EMFILE, ECONNABORTED, ...) are per-attempt; the listener
/// itself stays usable.
async fn accept_retrying<F, Fut, T>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(conn) => return conn,
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

async fn dispatch_handler(
    State(engine): State<Arc<DispatchEngine>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response<Body> {
    engine.dispatch(req, remote).await
}

/// Plain HTTP router sending routed hosts to their HTTPS equivalent
pub fn redirect_router(store: Arc<ConfigStore>, https_port: u16) -> Router {
    Router::new()
        .fallback(redirect_handler)
        .layer(TraceLayer::new_for_http())
        .with_state((store, https_port))
}

async fn redirect_handler(
    State((store, https_port)): State<(Arc<ConfigStore>, u16)>,
    req: Request<Body>,
) -> Response<Body> {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| strip_port(h).to_ascii_lowercase())
        .unwrap_or_default();

    if store.lookup(&host).is_none() {
        return (StatusCode::NOT_FOUND, "Not Found").into_response();
    }

    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let location = if https_port == 443 {
        format!("https://{}{}", host, path)
    } else {
        format!("https://{}:{}{}", host, https_port, path)
    };

    match Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(header::LOCATION, location)
        .body(Body::empty())
    {
        Ok(response) => response,
        Err(e) => {
            error!(host = %host, "Failed to build redirect: {}", e);
            (StatusCode::BAD_REQUEST, "Bad Request").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(cache_dir: &std::path::Path) -> ProxyConfig {
        let mut config = ProxyConfig::default();
        config.server.listen_addr = "127.0.0.1:0".to_string();
        config.tls.cache_dir = cache_dir.to_path_buf();
        config
    }

    fn test_store() -> Arc<ConfigStore> {
        let store = Arc::new(ConfigStore::new(Vec::new(), 100));
        store.load_str("svc.example.com 127.0.0.1:8080\n");
        store
    }

    #[test]
    fn test_proxy_server_creation() {
        let dir = tempdir().unwrap();
        let server = ProxyServer::new(test_config(dir.path()), test_store());
        assert!(server.is_ok());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.server.listen_addr = "nowhere".to_string();
        assert!(ProxyServer::new(config, test_store()).is_err());
    }

    #[tokio::test]
    async fn test_accept_errors_do_not_stop_the_loop() {
        let mut attempts = 0;
        let conn = accept_retrying(|| {
            attempts += 1;
            let result = if attempts < 3 {
                Err(std::io::Error::from_raw_os_error(24))
            } else {
                Ok(attempts)
            };
            async move { result }
        })
        .await;
        assert_eq!(conn, 3);
    }

    #[tokio::test]
    async fn test_redirect_routed_host() {
        let router = redirect_router(test_store(), 443);
        let req = Request::builder()
            .uri("/a?b=c")
            .header("host", "SVC.example.com:80")
            .body(Body::empty())
            .unwrap();

        let response = router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://svc.example.com/a?b=c"
        );
    }

    #[tokio::test]
    async fn test_redirect_keeps_nonstandard_port() {
        let router = redirect_router(test_store(), 8443);
        let req = Request::builder()
            .uri("/")
            .header("host", "svc.example.com")
            .body(Body::empty())
            .unwrap();

        let response = router.oneshot(req).await.unwrap();
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://svc.example.com:8443/"
        );
    }

    #[tokio::test]
    async fn test_redirect_unknown_host() {
        let router = redirect_router(test_store(), 443);
        let req = Request::builder()
            .uri("/")
            .header("host", "evil.example.com")
            .body(Body::empty())
            .unwrap();

        let response = router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
