//! Middleware contract and request context.
//!
//! A middleware exposes a name and a single `handle` method. Returning
//! `false` short-circuits the rest of the chain; the middleware is expected
//! to have recorded a status (and usually a body) on the context so the
//! dispatcher can flush a response.
//!
//! Middlewares communicate through a string-keyed value bag on the context
//! (`replace_rules`, `dynamic_target_service`) and through the typed `sse` /
//! `websocket` transport flags consumed by the proxy engines.

mod auth;
mod chain;
mod cors;
mod dynamic_route;
mod factory;
mod logging;
mod rate_limit;
mod replace;
mod sse;
mod websocket;

pub use auth::AuthMiddleware;
pub use chain::MiddlewareChain;
pub use cors::CorsMiddleware;
pub use dynamic_route::DynamicRouteMiddleware;
pub use factory::MiddlewareFactory;
pub use logging::LoggingMiddleware;
pub use rate_limit::RateLimitMiddleware;
pub use replace::{apply_replace_rules, ReplaceMiddleware, ReplaceRule};
pub use sse::SseMiddleware;
pub use websocket::WebSocketMiddleware;

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{Method, StatusCode, Uri, Version};

use crate::config::ConfigMap;

/// Context key under which `replace` stores its compiled rules.
pub const REPLACE_RULES_KEY: &str = "replace_rules";
/// Context key under which `dynamic_route` stores the rerouted service name.
pub const DYNAMIC_TARGET_KEY: &str = "dynamic_target_service";

/// Per-request state threaded through the middleware chain and the
/// transport engines. Created by the dispatcher, dropped when the proxy
/// call returns.
pub struct RequestContext {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub remote_addr: SocketAddr,
    pub listener_port: u16,
    /// Collected inbound body.
    pub body: Bytes,

    /// Resolved target origin, rewritable by dynamic routing.
    pub target_url: String,
    /// Resolved service hostname, for the `X-Target-Service` header.
    pub service_name: String,

    /// Status a short-circuiting middleware wants delivered.
    pub status: Option<StatusCode>,
    /// Body a short-circuiting middleware wants delivered.
    pub response_body: Option<Bytes>,
    /// Headers merged into whatever response is finally written.
    pub response_headers: HeaderMap,

    /// Response must be streamed with a flush per upstream write.
    pub sse: bool,
    /// Request flagged as WebSocket traffic (upgrade headers, path
    /// pattern, or query parameter).
    pub websocket: bool,

    pub started_at: Instant,

    values: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl RequestContext {
    pub fn new(
        method: Method,
        uri: Uri,
        version: Version,
        headers: HeaderMap,
        body: Bytes,
        remote_addr: SocketAddr,
        listener_port: u16,
    ) -> Self {
        Self {
            method,
            uri,
            version,
            headers,
            remote_addr,
            listener_port,
            body,
            target_url: String::new(),
            service_name: String::new(),
            status: None,
            response_body: None,
            response_headers: HeaderMap::new(),
            sse: false,
            websocket: false,
            started_at: Instant::now(),
            values: HashMap::new(),
        }
    }

    /// Store a value in the inter-middleware bag.
    pub fn set_value<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.values.insert(key.into(), Box::new(value));
    }

    /// Fetch a typed value from the bag.
    pub fn value<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    /// The request path.
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// The request query string, if any.
    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// The Host header value with any `:port` suffix stripped.
    pub fn host(&self) -> &str {
        let raw = self
            .headers
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        crate::matcher::strip_port(raw)
    }

    /// Client IP resolution: first `X-Forwarded-For` segment, then
    /// `X-Real-IP`, then the socket peer address.
    pub fn client_ip(&self) -> String {
        if let Some(forwarded) = self
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
        {
            if let Some(first) = forwarded.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
        if let Some(real_ip) = self.headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
            if !real_ip.is_empty() {
                return real_ip.to_string();
            }
        }
        self.remote_addr.ip().to_string()
    }

    /// Look up a cookie value by name.
    pub fn cookie(&self, name: &str) -> Option<String> {
        let raw = self.headers.get(hyper::header::COOKIE)?.to_str().ok()?;
        for pair in raw.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            if parts.next() == Some(name) {
                return parts.next().map(|v| v.to_string());
            }
        }
        None
    }

    /// Record a rejection: status plus a plain-text body.
    pub fn reject(&mut self, status: StatusCode, message: &str) {
        self.status = Some(status);
        self.response_body = Some(Bytes::copy_from_slice(message.as_bytes()));
    }

    /// Add a header to be merged into the final response.
    pub fn insert_response_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.response_headers.insert(name, value);
    }
}

/// The middleware contract.
#[async_trait]
pub trait Middleware: Send + Sync + std::fmt::Debug {
    /// Stable middleware name, used for chain deduplication.
    fn name(&self) -> &str;

    /// Process the request. Returning `false` aborts the chain; the
    /// middleware should have set `ctx.status` (and usually a body).
    async fn handle(&self, ctx: &mut RequestContext) -> bool;
}

// Config-map accessors shared by the middleware constructors. YAML scalars
// arrive as JSON values; missing or mistyped keys fall back to defaults.

pub(crate) fn config_str(config: Option<&ConfigMap>, key: &str) -> Option<String> {
    config?
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub(crate) fn config_u64(config: Option<&ConfigMap>, key: &str) -> Option<u64> {
    config?.get(key).and_then(|v| v.as_u64())
}

pub(crate) fn config_f64(config: Option<&ConfigMap>, key: &str) -> Option<f64> {
    config?.get(key).and_then(|v| v.as_f64())
}

pub(crate) fn config_str_list(config: Option<&ConfigMap>, key: &str) -> Vec<String> {
    config
        .and_then(|c| c.get(key))
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}
