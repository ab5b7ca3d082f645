//! Per-host routing entries
//!
//! A [`HostConfig`] is built once per hosts-file line and never mutated.
//! It carries the backend target, the optional basic-auth rule and the
//! [`Director`] that rewrites inbound requests for that backend.

use axum::http::{
    header, request::Parts, uri::Authority, uri::PathAndQuery, uri::Scheme, HeaderMap,
    HeaderName, HeaderValue, Uri,
};
use base64::Engine;
use std::net::SocketAddr;

use crate::error::{ForwardError, Result};

/// Headers that only make sense for a single hop
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Outcome of the basic-auth gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    /// No auth required, or the credentials pass the rule
    Granted,
    /// Credentials missing or unparsable (401)
    Challenge,
    /// Credentials present but rejected (403)
    Forbidden,
}

/// Routing, auth and rewrite descriptor for one configured host
#[derive(Debug, Clone)]
pub struct HostConfig {
    director: Option<Director>,
    requires_auth: bool,
    username: String,
    password: String,
}

impl HostConfig {
    /// Build a host entry forwarding to `target` (`host:port`).
    ///
    /// `credentials` is the optional `user[:pass]` field. Auth is only
    /// required when at least one of the two parts is non-empty.
    pub fn new(target: &str, credentials: Option<&str>) -> Result<Self> {
        let (username, password) = match credentials {
            Some(field) => match field.split_once(':') {
                Some((user, pass)) => (user.to_string(), pass.to_string()),
                None => (field.to_string(), String::new()),
            },
            None => (String::new(), String::new()),
        };
        let requires_auth = !username.is_empty() || !password.is_empty();

        let target: Authority = target
            .parse()
            .map_err(|e| ForwardError::Config(format!("Invalid target '{}': {}", target, e)))?;

        Ok(Self {
            director: Some(Director::new(target, requires_auth)),
            requires_auth,
            username,
            password,
        })
    }

    /// Host entry without a backend; dispatch serves the built-in placeholder
    pub fn placeholder() -> Self {
        Self {
            director: None,
            requires_auth: false,
            username: String::new(),
            password: String::new(),
        }
    }

    /// Backend address, empty for placeholder hosts
    pub fn target(&self) -> &str {
        self.director.as_ref().map(|d| d.target.as_str()).unwrap_or("")
    }

    /// Request rewriter bound to this entry's target
    pub fn director(&self) -> Option<&Director> {
        self.director.as_ref()
    }

    pub fn requires_auth(&self) -> bool {
        self.requires_auth
    }

    /// Check a username/password pair. Empty configured fields accept anything.
    pub fn allow(&self, username: &str, password: &str) -> bool {
        if !self.username.is_empty() && self.username != username {
            return false;
        }
        if !self.password.is_empty() && self.password != password {
            return false;
        }
        true
    }

    /// Run the auth gate against the request headers
    pub fn authorize(&self, headers: &HeaderMap) -> AuthDecision {
        if !self.requires_auth {
            return AuthDecision::Granted;
        }
        match basic_credentials(headers) {
            None => AuthDecision::Challenge,
            Some((user, pass)) if self.allow(&user, &pass) => AuthDecision::Granted,
            Some(_) => AuthDecision::Forbidden,
        }
    }
}

/// Extract HTTP Basic credentials from the `Authorization` header
pub fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// Value of the `Forwarded` header added to outbound requests.
///
/// Addresses without a `.` are taken as IPv6 and quoted, since `[`, `]`
/// and `:` are not valid in an unquoted token.
pub fn forwarded_value(original_host: &str, remote: SocketAddr) -> String {
    let remote = remote.to_string();
    let node = if remote.contains('.') {
        remote
    } else {
        format!("\"{}\"", remote)
    };
    format!("proto=https;host={};for={}", original_host, node)
}

/// Rewrites an inbound request into the plaintext request sent to a backend.
///
/// Pure given its inputs: the same parts, host and remote address always
/// produce the same outbound request.
#[derive(Debug, Clone)]
pub struct Director {
    target: Authority,
    strip_authorization: bool,
}

impl Director {
    pub fn new(target: Authority, strip_authorization: bool) -> Self {
        Self {
            target,
            strip_authorization,
        }
    }

    pub fn target(&self) -> &Authority {
        &self.target
    }

    /// Rewrite request parts in place for forwarding to the target
    pub fn rewrite(&self, parts: &mut Parts, original_host: &str, remote: SocketAddr) -> Result<()> {
        let path_and_query = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));

        parts.uri = Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(self.target.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| ForwardError::Http(format!("Failed to build backend URI: {}", e)))?;

        let headers = &mut parts.headers;
        strip_hop_by_hop(headers);

        let original = header_value(original_host)?;
        headers.insert(HeaderName::from_static("x-forwarded-host"), original);
        headers.append(header::FORWARDED, header_value(&forwarded_value(original_host, remote))?);
        append_forwarded_for(headers, remote)?;

        if self.strip_authorization {
            headers.remove(header::AUTHORIZATION);
        }
        if !headers.contains_key(header::USER_AGENT) {
            headers.insert(header::USER_AGENT, HeaderValue::from_static(""));
        }
        headers.insert(header::HOST, header_value(self.target.as_str())?);

        Ok(())
    }
}

/// Remove headers that must not be forwarded across the proxy
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // `Connection` may name further per-hop headers
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| ForwardError::Http(format!("Invalid header value '{}': {}", value, e)))
}

/// Append the client IP to any `X-Forwarded-For` chain the client sent
fn append_forwarded_for(headers: &mut HeaderMap, remote: SocketAddr) -> Result<()> {
    let name = HeaderName::from_static("x-forwarded-for");
    let mut chain: Vec<String> = headers
        .get_all(&name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::to_string)
        .collect();
    chain.push(remote.ip().to_string());
    headers.insert(name, header_value(&chain.join(", "))?);
    Ok(())
}
