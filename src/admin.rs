//! Control plane for registering, listing and removing label mappings
//!
//! Served as the router's fallback, so it answers on hosts that carry no
//! subdomain label (e.g. `example.com/api`).

use crate::admission::AdmissionPolicy;
use crate::error::{full_body, ProxyBody};
use crate::router::{parse_backend_url, BackendUrlError, FallbackHandler};
use crate::store::{MappingStore, SharedStore, StoreError};
use http_body_util::{BodyExt, Limited};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, Response, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Version information for the proxy
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest form body accepted on `/api`
const MAX_FORM_BODY: usize = 64 * 1024;

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(full_body(body))
        .expect("valid response with StatusCode enum")
}

/// Render `{"code", "message", "result"}`, omitting `result` when absent
fn render_json(status: StatusCode, result: Option<Value>) -> Response<ProxyBody> {
    let mut body = json!({
        "code": status.as_u16().to_string(),
        "message": status.canonical_reason().unwrap_or_default(),
    });
    if let Some(result) = result {
        body["result"] = result;
    }

    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(body.to_string()))
        .expect("valid response with StatusCode enum and static header")
}

fn render_error(status: StatusCode, err: impl std::fmt::Display) -> Response<ProxyBody> {
    render_json(status, Some(json!({ "error": err.to_string() })))
}

/// Failures of control plane operations
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("required: {0}")]
    MissingField(&'static str),
    #[error("{0}")]
    MalformedUrl(#[from] BackendUrlError),
    #[error("not allowed: {0}")]
    NotAllowed(String),
    #[error("{0}")]
    Store(#[from] StoreError),
}

impl AdminError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdminError::MissingField(_) => StatusCode::FORBIDDEN,
            AdminError::MalformedUrl(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AdminError::NotAllowed(_) => StatusCode::BAD_REQUEST,
            AdminError::Store(StoreError::NotFound) => StatusCode::NOT_FOUND,
            AdminError::Store(StoreError::Other(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Administrative surface over the mapping store
pub struct ControlPlane {
    policy: Arc<AdmissionPolicy>,
    auth_token: Option<Arc<String>>,
}

impl ControlPlane {
    pub fn new(policy: Arc<AdmissionPolicy>) -> Self {
        Self {
            policy,
            auth_token: None,
        }
    }

    /// Require `Authorization: Bearer <token>` on `/api`
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.map(Arc::new);
        self
    }

    /// Wrap this control plane as the router's fallback handler
    pub fn into_fallback(self: Arc<Self>) -> Arc<dyn FallbackHandler> {
        Arc::new(move |req: Request<ProxyBody>, store: SharedStore| {
            let control = Arc::clone(&self);
            async move { control.handle(req, store).await }
        })
    }

    /// Admission-checked upsert of `label -> backend`
    pub fn register(
        &self,
        store: &dyn MappingStore,
        label: &str,
        backend: &str,
    ) -> Result<(), AdminError> {
        if label.is_empty() {
            return Err(AdminError::MissingField("subdomain"));
        }
        if backend.is_empty() {
            return Err(AdminError::MissingField("backend"));
        }

        parse_backend_url(backend)?;
        let host = written_host(backend);
        if !self.policy.is_allowed(host) {
            return Err(AdminError::NotAllowed(host.to_string()));
        }

        store.set(label, backend)?;
        info!(label, backend, "Mapping registered");
        Ok(())
    }

    fn check_auth(&self, req: &Request<ProxyBody>) -> bool {
        let Some(expected) = self.auth_token.as_deref() else {
            return true;
        };

        req.headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|auth| {
                // Support "Bearer <token>" format
                auth.strip_prefix("Bearer ")
                    .unwrap_or(auth)
                    .eq(expected.as_str())
            })
            .unwrap_or(false)
    }

    pub async fn handle(&self, req: Request<ProxyBody>, store: SharedStore) -> Response<ProxyBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        debug!(%method, %path, "Control plane request");

        match (&method, path.as_str()) {
            // Health check (no auth required)
            (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

            // Version endpoint (no auth required)
            (&Method::GET, "/version") => render_json(
                StatusCode::OK,
                Some(json!({ "name": PKG_NAME, "version": VERSION })),
            ),

            (_, "/api") => {
                if !self.check_auth(&req) {
                    warn!(%path, "Unauthorized control plane request");
                    return render_error(StatusCode::UNAUTHORIZED, "unauthorized");
                }

                let params = match read_params(req).await {
                    Ok(params) => params,
                    Err(e) => return render_error(StatusCode::BAD_REQUEST, e),
                };

                match &method {
                    &Method::GET => self.api_get(&params, store.as_ref()),
                    &Method::POST => self.api_set(&params, store.as_ref()),
                    &Method::DELETE => self.api_delete(&params, store.as_ref()),
                    _ => render_json(StatusCode::NOT_FOUND, None),
                }
            }

            _ => render_json(StatusCode::NOT_FOUND, None),
        }
    }

    fn api_get(
        &self,
        params: &HashMap<String, String>,
        store: &dyn MappingStore,
    ) -> Response<ProxyBody> {
        if let Some(label) = param(params, "subdomain") {
            return match store.get(label) {
                Ok(backend) => render_json(StatusCode::OK, Some(json!({ label: backend }))),
                Err(e) => admin_error_response(AdminError::Store(e)),
            };
        }

        match store.map() {
            Ok(all) => render_json(StatusCode::OK, Some(json!(all))),
            Err(e) => admin_error_response(AdminError::Store(e)),
        }
    }

    fn api_set(
        &self,
        params: &HashMap<String, String>,
        store: &dyn MappingStore,
    ) -> Response<ProxyBody> {
        let label = param(params, "subdomain").unwrap_or_default();
        let backend = param(params, "backend").unwrap_or_default();

        match self.register(store, label, backend) {
            Ok(()) => render_json(StatusCode::OK, None),
            Err(e) => admin_error_response(e),
        }
    }

    fn api_delete(
        &self,
        params: &HashMap<String, String>,
        store: &dyn MappingStore,
    ) -> Response<ProxyBody> {
        let result = match param(params, "subdomain") {
            Some(label) => store.delete(label).map(|()| info!(label, "Mapping removed")),
            None => store.delete_all().map(|()| info!("All mappings removed")),
        };

        match result {
            Ok(()) => render_json(StatusCode::OK, None),
            Err(e) => admin_error_response(AdminError::Store(e)),
        }
    }
}

fn admin_error_response(err: AdminError) -> Response<ProxyBody> {
    match &err {
        AdminError::NotAllowed(host) => warn!(%host, "Backend host rejected by allow-list"),
        AdminError::MissingField(_) | AdminError::Store(StoreError::NotFound) => {
            debug!(error = %err, "Control plane request rejected")
        }
        AdminError::MalformedUrl(_) | AdminError::Store(StoreError::Other(_)) => {
            error!(error = %err, "Control plane operation failed")
        }
    }
    render_error(err.status_code(), err)
}

/// Host of a backend URL as written, before any normalization
fn written_host(backend: &str) -> &str {
    let rest = backend.split_once("://").map_or(backend, |(_, rest)| rest);
    let authority = rest
        .split(|c: char| matches!(c, '/' | '?' | '#'))
        .next()
        .unwrap_or_default();
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);

    if host_port.starts_with('[') {
        return host_port.find(']').map_or(host_port, |end| &host_port[..=end]);
    }
    host_port.split_once(':').map_or(host_port, |(host, _)| host)
}

/// Non-empty parameter value
fn param<'a>(params: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    params.get(name).map(String::as_str).filter(|v| !v.is_empty())
}

/// Query parameters, overridden by url-encoded form body fields
async fn read_params(req: Request<ProxyBody>) -> Result<HashMap<String, String>, String> {
    let mut params: HashMap<String, String> = req
        .uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    let is_form = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);

    if is_form {
        let body = Limited::new(req.into_body(), MAX_FORM_BODY)
            .collect()
            .await
            .map_err(|e| format!("failed to read form body: {}", e))?
            .to_bytes();
        params.extend(url::form_urlencoded::parse(&body).into_owned());
    }

    Ok(params)
}
