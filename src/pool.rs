//! Connection pool for backend HTTP connections
//!
//! Requests are forwarded with single-target semantics: only scheme and
//! authority change, the target's base path (if any) is joined in front of
//! the request path, and bodies stream through in both directions.

use crate::error::ProxyBody;
use http_body_util::BodyExt;
use hyper::header::{HeaderMap, HeaderName, CONNECTION};
use hyper::{Request, Response, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Headers that apply to a single transport hop and are never forwarded
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Error type for connection pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    /// Error from the HTTP client
    #[error("Client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// Error building a request
    #[error("Request build error: {0}")]
    RequestBuild(String),
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests forwarded through the pool
    pub total_requests: AtomicU64,
    /// Requests that failed before a response arrived
    pub failed_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A connection pool for HTTP connections to backend servers
pub struct ConnectionPool {
    client: Client<HttpConnector, ProxyBody>,
    stats: Arc<PoolStats>,
}

impl ConnectionPool {
    /// Create a new connection pool with the given configuration
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward `req` to `target`, streaming the response back
    pub async fn send_request(
        &self,
        req: Request<ProxyBody>,
        target: &Url,
    ) -> Result<Response<ProxyBody>, PoolError> {
        let uri = target_uri(target, req.uri())?;

        let (mut parts, body) = req.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        parts.uri = uri;
        // Backends are spoken to over HTTP/1.1 whatever the inbound version
        parts.version = Version::HTTP_11;
        let backend_req = Request::from_parts(parts, body);

        self.stats.record_request();

        let response = match self.client.request(backend_req).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Rewrite scheme and authority to the target's, keeping path and query
pub fn target_uri(target: &Url, original: &Uri) -> Result<Uri, PoolError> {
    let host = target
        .host_str()
        .ok_or_else(|| PoolError::RequestBuild(format!("backend has no host: {}", target)))?;

    let authority = match target.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let path = join_paths(target.path(), original.path());

    let query = match (target.query(), original.query()) {
        (Some(t), Some(o)) if !t.is_empty() => format!("?{}&{}", t, o),
        (_, Some(o)) => format!("?{}", o),
        (Some(t), None) if !t.is_empty() => format!("?{}", t),
        _ => String::new(),
    };

    format!("{}://{}{}{}", target.scheme(), authority, path, query)
        .parse::<Uri>()
        .map_err(|e| PoolError::RequestBuild(e.to_string()))
}

/// Join two path segments with exactly one slash between them
fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }

    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    fn uri_for(target: &str, original: &str) -> String {
        let target = Url::parse(target).unwrap();
        let original: Uri = original.parse().unwrap();
        target_uri(&target, &original).unwrap().to_string()
    }

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();
        assert_eq!(stats.get_total_requests(), 0);
        assert_eq!(stats.get_failed_requests(), 0);

        stats.record_request();
        stats.record_request();
        stats.record_failure();
        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_failed_requests(), 1);
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let config = PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
        };

        let pool = ConnectionPool::new(config);
        assert_eq!(pool.stats().get_total_requests(), 0);
        assert_eq!(pool.stats().get_failed_requests(), 0);
    }

    #[test]
    fn test_target_uri_preserves_path_and_query() {
        assert_eq!(
            uri_for("http://localhost:8081", "/test?a=1"),
            "http://localhost:8081/test?a=1"
        );
        assert_eq!(uri_for("http://localhost:8081", "/"), "http://localhost:8081/");
        assert_eq!(uri_for("http://10.0.0.1", "/x"), "http://10.0.0.1/x");
    }

    #[test]
    fn test_target_uri_joins_base_path() {
        assert_eq!(
            uri_for("http://localhost:8081/base", "/test"),
            "http://localhost:8081/base/test"
        );
        assert_eq!(
            uri_for("http://localhost:8081/base/", "/test"),
            "http://localhost:8081/base/test"
        );
    }

    #[test]
    fn test_target_uri_merges_queries() {
        assert_eq!(
            uri_for("http://localhost:8081/?key=v", "/p?a=1"),
            "http://localhost:8081/p?key=v&a=1"
        );
        assert_eq!(
            uri_for("http://localhost:8081/?key=v", "/p"),
            "http://localhost:8081/p?key=v"
        );
    }

    #[test]
    fn test_target_uri_ipv6() {
        assert_eq!(uri_for("http://[::1]:9000", "/a"), "http://[::1]:9000/a");
    }

    #[test]
    fn test_join_paths() {
        assert_eq!(join_paths("/", "/"), "/");
        assert_eq!(join_paths("/a", "b"), "/a/b");
        assert_eq!(join_paths("/a/", "/b"), "/a/b");
        assert_eq!(join_paths("/a", "/b"), "/a/b");
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-session"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session", HeaderValue::from_static("abc"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.insert("host", HeaderValue::from_static("hoge.example.com"));

        strip_hop_by_hop(&mut headers);

        assert!(headers.get("connection").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("x-session").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("upgrade").is_none());
        assert_eq!(headers.get("content-type").unwrap(), "text/plain");
        assert_eq!(headers.get("host").unwrap(), "hoge.example.com");
    }
}
