//! WebSocket traffic detection.
//!
//! Marks the context when a request looks like WebSocket traffic: a real
//! RFC 6455 upgrade, a configured path pattern, or a `websocket=true` /
//! `ws=true` query parameter. The dispatcher switches to the tunnel engine
//! on the strict header check alone — the pattern and query heuristics
//! exist for mounting and observability, since a request without upgrade
//! headers cannot complete a handshake. The tunnel itself lives in
//! [`crate::proxy::websocket`].

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::ConfigMap;
use crate::error::Result;
use crate::proxy::is_upgrade_request;

use super::{config_str_list, Middleware, RequestContext};

fn default_patterns() -> Vec<String> {
    ["/ws/*", "/websocket/*", "/socket.io/*"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug)]
pub struct WebSocketMiddleware {
    path_patterns: Vec<String>,
    total_connections: AtomicI64,
}

impl WebSocketMiddleware {
    /// Factory constructor. Config key: `path_patterns` (list of
    /// `prefix/*` or exact paths); defaults to the common WebSocket
    /// locations.
    pub fn build(config: Option<&ConfigMap>) -> Result<Arc<dyn Middleware>> {
        let mut path_patterns = config_str_list(config, "path_patterns");
        if path_patterns.is_empty() {
            path_patterns = default_patterns();
        }
        Ok(Arc::new(Self {
            path_patterns,
            total_connections: AtomicI64::new(0),
        }))
    }

    fn matches_pattern(&self, path: &str) -> bool {
        self.path_patterns.iter().any(|pattern| {
            match pattern.strip_suffix("/*") {
                Some(prefix) => path.starts_with(prefix),
                None => pattern == path,
            }
        })
    }

    fn is_websocket_request(&self, ctx: &RequestContext) -> bool {
        if is_upgrade_request(&ctx.headers) {
            return true;
        }

        if self.matches_pattern(ctx.path()) {
            return true;
        }

        if let Some(query) = ctx.query() {
            for pair in query.split('&') {
                if pair == "websocket=true" || pair == "ws=true" {
                    return true;
                }
            }
        }

        false
    }
}

#[async_trait]
impl Middleware for WebSocketMiddleware {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn handle(&self, ctx: &mut RequestContext) -> bool {
        if self.is_websocket_request(ctx) {
            ctx.websocket = true;
            self.total_connections.fetch_add(1, Ordering::Relaxed);
            debug!(path = %ctx.path(), "WebSocket traffic detected");
        }
        true
    }
}
