//! Per-request dispatch
//!
//! ```text
//! Host header → strip port → ConfigStore lookup ──miss──▶ 500
//!                                  │
//!                          HSTS on every answer
//!                                  │
//!                              auth gate ──▶ 401 / 403
//!                                  │
//!                  target? ──yes──▶ rewrite + forward (502 / 504 on failure)
//!                     │
//!                     no ──▶ placeholder page for "/" to HTML clients, 404 otherwise
//! ```

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode},
    response::{Html, IntoResponse},
};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::ServerConfig;
use crate::error::{ForwardError, Result};
use crate::hosts::{strip_hop_by_hop, AuthDecision, Director};
use crate::store::ConfigStore;

/// HTTP client type for forwarding requests
type HttpClient = Client<HttpConnector, Body>;

const PLACEHOLDER_HTML: &str =
    "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>¯\\_(ツ)_/¯</title></head><body><p>¯\\_(ツ)_/¯</p></body></html>";

/// Routes each request to its backend using the current host table
pub struct DispatchEngine {
    store: Arc<ConfigStore>,
    client: HttpClient,
    hsts: HeaderValue,
    response_header_timeout: Duration,
}

impl DispatchEngine {
    pub fn new(store: Arc<ConfigStore>, server: &ServerConfig) -> Result<Self> {
        let client: HttpClient = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(server.pool_idle_timeout())
            .build_http();

        let hsts = HeaderValue::from_str(&format!(
            "max-age={}; includeSubDomains",
            server.hsts_max_age_secs
        ))
        .map_err(|e| ForwardError::Config(format!("Invalid HSTS header: {}", e)))?;

        Ok(Self {
            store,
            client,
            hsts,
            response_header_timeout: server.response_header_timeout(),
        })
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    /// Handle one inbound request from `remote`
    pub async fn dispatch(&self, req: Request<Body>, remote: SocketAddr) -> Response<Body> {
        let original_host = request_host(&req).unwrap_or_default().to_string();
        let host = strip_port(&original_host).to_ascii_lowercase();

        debug!(
            host = %host,
            method = %req.method(),
            path = %req.uri().path(),
            remote = %remote,
            "Dispatching request"
        );

        let Some(config) = self.store.lookup(&host) else {
            // TLS only completes for routed names, so this means the two disagree
            error!(host = %host, "No host config for an established connection");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
        };

        let mut response = match config.authorize(req.headers()) {
            AuthDecision::Granted => match config.director() {
                Some(director) => self.forward(director, req, &original_host, remote).await,
                None => placeholder(&req),
            },
            AuthDecision::Challenge => {
                debug!(host = %host, "Missing credentials");
                challenge(&host)
            }
            AuthDecision::Forbidden => {
                warn!(host = %host, remote = %remote, "Rejected credentials");
                (StatusCode::FORBIDDEN, "Forbidden").into_response()
            }
        };

        response
            .headers_mut()
            .insert(header::STRICT_TRANSPORT_SECURITY, self.hsts.clone());
        response
    }

    /// Rewrite and send the request, streaming the backend response back.
    ///
    /// Dropping the returned future (client went away) drops the backend
    /// request with it.
    async fn forward(
        &self,
        director: &Director,
        req: Request<Body>,
        original_host: &str,
        remote: SocketAddr,
    ) -> Response<Body> {
        let (mut parts, body) = req.into_parts();
        if let Err(e) = director.rewrite(&mut parts, original_host, remote) {
            error!(target = %director.target(), "Failed to rewrite request: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response();
        }
        let forward_req = Request::from_parts(parts, body);

        match tokio::time::timeout(self.response_header_timeout, self.client.request(forward_req)).await {
            Ok(Ok(response)) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, Body::new(body))
            }
            Ok(Err(e)) => {
                error!(target = %director.target(), "Backend error: {}", e);
                (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
            }
            Err(_) => {
                warn!(
                    target = %director.target(),
                    timeout_secs = self.response_header_timeout.as_secs(),
                    "Backend response header timeout"
                );
                (StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout").into_response()
            }
        }
    }
}

/// Host as sent by the client: the `Host` header, else the URI authority
fn request_host(req: &Request<Body>) -> Option<&str> {
    req.headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()))
}

/// Drop a trailing `:port`, and the brackets around an IPv6 literal
pub fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

fn challenge(host: &str) -> Response<Body> {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, format!("Basic realm=\"{}\"", host))],
        "Unauthorized",
    )
        .into_response()
}

fn accepts_html(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("text/html"))
}

/// Built-in page for hosts without a backend
fn placeholder(req: &Request<Body>) -> Response<Body> {
    if req.uri().path() == "/" && accepts_html(req.headers()) {
        Html(PLACEHOLDER_HTML).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderName;
    use axum::Router;
    use base64::Engine;
    use http_body_util::BodyExt;
    use tokio::net::TcpListener;

    const SEEN: [&str; 6] = [
        "host",
        "forwarded",
        "x-forwarded-host",
        "x-forwarded-for",
        "user-agent",
        "authorization",
    ];

    /// Backend that reports what it received
    async fn echo(req: Request<Body>) -> Response<Body> {
        if req.uri().path() == "/slow" {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        let mut response = Response::new(Body::from(format!("{} {}", req.method(), req.uri())));
        *response.status_mut() = StatusCode::CREATED;
        for name in SEEN {
            if let Some(value) = req.headers().get(name) {
                let seen = HeaderName::from_bytes(format!("x-seen-{}", name).as_bytes()).unwrap();
                response.headers_mut().insert(seen, value.clone());
            }
        }
        response
    }

    async fn spawn_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().fallback(echo)).await.unwrap();
        });
        addr
    }

    fn engine(hosts: &str, server: ServerConfig) -> DispatchEngine {
        let store = Arc::new(ConfigStore::new(vec!["top.example.com".to_string()], 100));
        store.load_str(hosts);
        DispatchEngine::new(store, &server).unwrap()
    }

    fn request(host: &str, path: &str) -> axum::http::request::Builder {
        Request::builder().uri(path).header("host", host)
    }

    fn remote() -> SocketAddr {
        "10.0.0.5:443".parse().unwrap()
    }

    async fn body_text(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn basic(user_pass: &str) -> String {
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(user_pass)
        )
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("svc.example.com:443"), "svc.example.com");
        assert_eq!(strip_port("svc.example.com"), "svc.example.com");
        assert_eq!(strip_port("[::1]:443"), "::1");
        assert_eq!(strip_port("[::1]"), "::1");
        assert_eq!(strip_port("host:abc"), "host:abc");
    }

    #[tokio::test]
    async fn test_unrouted_host_is_internal_error() {
        let engine = engine("svc.example.com 127.0.0.1:1\n", ServerConfig::default());
        let req = request("other.example.com", "/").body(Body::empty()).unwrap();

        let response = engine.dispatch(req, remote()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!response.headers().contains_key(header::STRICT_TRANSPORT_SECURITY));
    }

    #[tokio::test]
    async fn test_forward_end_to_end() {
        let backend = spawn_backend().await;
        let engine = engine(
            &format!(".example.com\nsvc {}\n", backend),
            ServerConfig::default(),
        );
        let req = request("svc.example.com:443", "/ping?x=1")
            .body(Body::empty())
            .unwrap();

        let response = engine.dispatch(req, remote()).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let headers = response.headers().clone();
        assert_eq!(
            headers[header::STRICT_TRANSPORT_SECURITY],
            "max-age=86400; includeSubDomains"
        );
        assert_eq!(headers["x-seen-host"], backend.to_string().as_str());
        assert_eq!(headers["x-seen-x-forwarded-host"], "svc.example.com:443");
        assert_eq!(
            headers["x-seen-forwarded"],
            "proto=https;host=svc.example.com:443;for=10.0.0.5:443"
        );
        assert_eq!(headers["x-seen-x-forwarded-for"], "10.0.0.5");
        assert_eq!(headers["x-seen-user-agent"], "");
        assert_eq!(body_text(response).await, "GET /ping?x=1");
    }

    #[tokio::test]
    async fn test_glob_host_forwards() {
        let backend = spawn_backend().await;
        let engine = engine(&format!("*.ops {}\n", backend), ServerConfig::default());
        let req = request("alpha.ops", "/").body(Body::empty()).unwrap();

        let response = engine.dispatch(req, remote()).await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_auth_challenge_names_host() {
        let engine = engine("secure.example.com 127.0.0.1:1 u:p\n", ServerConfig::default());
        let req = request("secure.example.com:443", "/").body(Body::empty()).unwrap();

        let response = engine.dispatch(req, remote()).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers()[header::WWW_AUTHENTICATE],
            "Basic realm=\"secure.example.com\""
        );
        assert!(response.headers().contains_key(header::STRICT_TRANSPORT_SECURITY));
    }

    #[tokio::test]
    async fn test_auth_wrong_user_forbidden() {
        let engine = engine("secure.example.com 127.0.0.1:1 u\n", ServerConfig::default());
        let req = request("secure.example.com", "/")
            .header(header::AUTHORIZATION, basic("v:anything"))
            .body(Body::empty())
            .unwrap();

        let response = engine.dispatch(req, remote()).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_auth_success_strips_authorization() {
        let backend = spawn_backend().await;
        let engine = engine(
            &format!("secure.example.com {} u\n", backend),
            ServerConfig::default(),
        );
        let req = request("secure.example.com", "/")
            .header(header::AUTHORIZATION, basic("u:any-password"))
            .body(Body::empty())
            .unwrap();

        let response = engine.dispatch(req, remote()).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(!response.headers().contains_key("x-seen-authorization"));
    }

    #[tokio::test]
    async fn test_open_host_passes_authorization_through() {
        let backend = spawn_backend().await;
        let engine = engine(&format!("open.example.com {}\n", backend), ServerConfig::default());
        let req = request("open.example.com", "/")
            .header(header::AUTHORIZATION, "Bearer token")
            .header(header::USER_AGENT, "curl/8.0")
            .body(Body::empty())
            .unwrap();

        let response = engine.dispatch(req, remote()).await;
        assert_eq!(response.headers()["x-seen-authorization"], "Bearer token");
        assert_eq!(response.headers()["x-seen-user-agent"], "curl/8.0");
    }

    #[tokio::test]
    async fn test_ipv6_remote_is_quoted() {
        let backend = spawn_backend().await;
        let engine = engine(&format!("svc.example.com {}\n", backend), ServerConfig::default());
        let req = request("svc.example.com", "/").body(Body::empty()).unwrap();

        let response = engine
            .dispatch(req, "[2001:db8::1]:443".parse().unwrap())
            .await;
        assert_eq!(
            response.headers()["x-seen-forwarded"],
            "proto=https;host=svc.example.com;for=\"[2001:db8::1]:443\""
        );
    }

    #[tokio::test]
    async fn test_placeholder_host() {
        let engine = engine("", ServerConfig::default());

        let req = request("top.example.com", "/")
            .header(header::ACCEPT, "text/html,application/xhtml+xml")
            .body(Body::empty())
            .unwrap();
        let response = engine.dispatch(req, remote()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/html"));
        assert!(body_text(response).await.contains("¯\\_(ツ)_/¯"));

        let req = request("top.example.com", "/")
            .header(header::ACCEPT, "application/json")
            .body(Body::empty())
            .unwrap();
        let response = engine.dispatch(req, remote()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let req = request("top.example.com", "/").body(Body::empty()).unwrap();
        let response = engine.dispatch(req, remote()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let req = request("top.example.com", "/favicon.ico").body(Body::empty()).unwrap();
        let response = engine.dispatch(req, remote()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().contains_key(header::STRICT_TRANSPORT_SECURITY));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_bad_gateway() {
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let engine = engine(&format!("svc.example.com {}\n", closed), ServerConfig::default());
        let req = request("svc.example.com", "/").body(Body::empty()).unwrap();

        let response = engine.dispatch(req, remote()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let backend = spawn_backend().await;
        let server = ServerConfig {
            response_header_timeout_secs: 1,
            ..ServerConfig::default()
        };
        let engine = engine(&format!("svc.example.com {}\n", backend), server);
        let req = request("svc.example.com", "/slow").body(Body::empty()).unwrap();

        let response = engine.dispatch(req, remote()).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_custom_hsts_max_age() {
        let server = ServerConfig {
            hsts_max_age_secs: 600,
            ..ServerConfig::default()
        };
        let engine = engine("", server);
        let req = request("top.example.com", "/").body(Body::empty()).unwrap();

        let response = engine.dispatch(req, remote()).await;
        assert_eq!(
            response.headers()[header::STRICT_TRANSPORT_SECURITY],
            "max-age=600; includeSubDomains"
        );
    }
}
