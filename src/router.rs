//! Host-based routing of requests to registered backends
//!
//! A request for `<label>.<domain>` is forwarded to the backend stored under
//! `label`. Requests whose host carries no label go to the fallback handler.

use crate::error::{json_error_response, ProxyBody, ProxyErrorCode};
use crate::pool::ConnectionPool;
use crate::store::{SharedStore, StoreError};
use futures::future::BoxFuture;
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response};
use regex::Regex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};
use url::Url;
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Peer address of the connection a request arrived on
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

/// Handles requests whose host carries no subdomain label
pub trait FallbackHandler: Send + Sync {
    fn handle(
        &self,
        req: Request<ProxyBody>,
        store: SharedStore,
    ) -> BoxFuture<'static, Response<ProxyBody>>;
}

impl<F, Fut> FallbackHandler for F
where
    F: Fn(Request<ProxyBody>, SharedStore) -> Fut + Send + Sync,
    Fut: Future<Output = Response<ProxyBody>> + Send + 'static,
{
    fn handle(
        &self,
        req: Request<ProxyBody>,
        store: SharedStore,
    ) -> BoxFuture<'static, Response<ProxyBody>> {
        Box::pin((self)(req, store))
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid root domain '{0}'")]
    InvalidDomain(String),
    #[error("failed to compile host matcher: {0}")]
    Matcher(#[from] regex::Error),
}

/// A backend value that is not usable as a forwarding target
#[derive(Debug, Error)]
pub enum BackendUrlError {
    #[error("{0}")]
    Parse(#[from] url::ParseError),
    #[error("backend is not an absolute URL: {0}")]
    NotAbsolute(String),
}

/// Parse a backend string as an absolute URL with scheme and authority
pub fn parse_backend_url(backend: &str) -> Result<Url, BackendUrlError> {
    let url = Url::parse(backend)?;
    if url.cannot_be_a_base() || url.host_str().map_or(true, str::is_empty) {
        return Err(BackendUrlError::NotAbsolute(backend.to_string()));
    }
    Ok(url)
}

/// Split `host:port` on the first colon
pub fn split_host_port(host: &str) -> (&str, &str) {
    host.split_once(':').unwrap_or((host, ""))
}

/// Per-request entry point: label extraction, lookup and forwarding
pub struct Router {
    domain: String,
    matcher: Regex,
    store: SharedStore,
    fallback: Option<Arc<dyn FallbackHandler>>,
    pool: Arc<ConnectionPool>,
    request_timeout: Option<Duration>,
}

impl Router {
    pub fn new(
        domain: &str,
        store: SharedStore,
        fallback: Option<Arc<dyn FallbackHandler>>,
        pool: Arc<ConnectionPool>,
    ) -> Result<Self, RouterError> {
        let domain = domain.trim();
        if domain.is_empty() || domain.contains(|c: char| c.is_whitespace() || c == '/' || c == ':')
        {
            return Err(RouterError::InvalidDomain(domain.to_string()));
        }

        let matcher = Regex::new(&format!(r"^(.+?)\.{}$", regex::escape(domain)))?;

        Ok(Self {
            domain: domain.to_string(),
            matcher,
            store,
            fallback,
            pool,
            request_timeout: None,
        })
    }

    /// Bound the wait for backend response headers
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Subdomain label of a port-free host, if it belongs to the root domain
    pub fn extract_label<'a>(&self, host: &'a str) -> Option<&'a str> {
        self.matcher
            .captures(host)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }

    pub async fn route(&self, mut req: Request<ProxyBody>) -> Response<ProxyBody> {
        let raw_host = request_host(&req);
        let (host, _port) = split_host_port(&raw_host);

        let label = match self.extract_label(host) {
            Some(label) => label,
            None => {
                return match &self.fallback {
                    Some(handler) => {
                        debug!(
                            host,
                            method = %req.method(),
                            uri = %req.uri(),
                            "No subdomain, using fallback"
                        );
                        handler.handle(req, Arc::clone(&self.store)).await
                    }
                    None => {
                        debug!(host, "No subdomain and no fallback configured");
                        json_error_response(
                            ProxyErrorCode::UnknownHost,
                            "Unknown or unconfigured host",
                        )
                    }
                };
            }
        };

        let backend = match self.store.get(label) {
            Ok(backend) => backend,
            Err(StoreError::NotFound) => {
                debug!(label, "No backend registered for label");
                return json_error_response(
                    ProxyErrorCode::UnknownHost,
                    "Unknown or unconfigured host",
                );
            }
            Err(StoreError::Other(message)) => {
                error!(label, error = %message, "Mapping store lookup failed");
                return json_error_response(ProxyErrorCode::StoreError, message);
            }
        };

        let target = match parse_backend_url(&backend) {
            Ok(url) => url,
            Err(e) => {
                error!(label, %backend, error = %e, "Stored backend is not a valid URL");
                return json_error_response(ProxyErrorCode::InvalidBackend, e.to_string());
            }
        };

        let request_id = set_forwarding_headers(&mut req);
        debug!(
            label,
            backend = %target,
            method = %req.method(),
            uri = %req.uri(),
            %request_id,
            "Forwarding request"
        );

        let forward = self.pool.send_request(req, &target);
        let result = match self.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, forward).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        label,
                        backend = %target,
                        timeout_ms = timeout.as_millis() as u64,
                        "Request timed out"
                    );
                    return json_error_response(
                        ProxyErrorCode::RequestTimeout,
                        format!("Request timed out after {:?}", timeout),
                    );
                }
            },
            None => forward.await,
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                error!(label, backend = %target, error = %e, "Failed to forward request");
                json_error_response(ProxyErrorCode::ConnectionFailed, e.to_string())
            }
        }
    }
}

/// Host header, falling back to the URI authority (HTTP/2)
fn request_host<B>(req: &Request<B>) -> String {
    req.headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

/// Set request ID and X-Forwarded-* headers, returning the request ID
fn set_forwarding_headers<B>(req: &mut Request<B>) -> String {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let client_ip = req.extensions().get::<ClientAddr>().map(|a| a.0.ip());
    let original_host = request_host(req);

    // Overwrite rather than append: this proxy is the first trusted hop
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Some(ip) = client_ip {
        if let Ok(value) = HeaderValue::from_str(&ip.to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(&original_host) {
        if !original_host.is_empty() {
            headers.insert(X_FORWARDED_HOST, value);
        }
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    // HTTP/2 carries the host in :authority only
    if !headers.contains_key(HOST) {
        if let Ok(value) = HeaderValue::from_str(&original_host) {
            if !original_host.is_empty() {
                headers.insert(HOST, value);
            }
        }
    }

    request_id
}
