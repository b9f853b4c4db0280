//! Server-Sent Events detection.
//!
//! Flags the context so the HTTP engine switches to flush-on-write
//! streaming, and stages the event-stream response header set. Detection
//! triggers on the `Accept` header, on configured path patterns, or on the
//! `stream=sse` / `format=sse` query parameters.

use std::sync::Arc;

use async_trait::async_trait;
use hyper::header::{HeaderValue, ACCEPT};
use tracing::debug;

use crate::config::ConfigMap;
use crate::error::Result;

use super::{config_str_list, Middleware, RequestContext};

fn default_patterns() -> Vec<String> {
    [
        "/events/*",
        "/stream/*",
        "/sse/*",
        "/api/events/*",
        "/api/stream/*",
        "/api/sse/*",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug)]
pub struct SseMiddleware {
    path_patterns: Vec<String>,
}

impl SseMiddleware {
    /// Factory constructor. Config key: `path_patterns` (list of
    /// `prefix/*` or exact paths); defaults to the common event-stream
    /// locations.
    pub fn build(config: Option<&ConfigMap>) -> Result<Arc<dyn Middleware>> {
        let mut path_patterns = config_str_list(config, "path_patterns");
        if path_patterns.is_empty() {
            path_patterns = default_patterns();
        }
        Ok(Arc::new(Self { path_patterns }))
    }

    fn matches_pattern(&self, path: &str) -> bool {
        self.path_patterns.iter().any(|pattern| {
            match pattern.strip_suffix("/*") {
                Some(prefix) => path.starts_with(prefix),
                None => pattern == path,
            }
        })
    }

    fn is_sse_request(&self, ctx: &RequestContext) -> bool {
        if let Some(accept) = ctx.headers.get(ACCEPT).and_then(|v| v.to_str().ok()) {
            if accept.contains("text/event-stream") {
                return true;
            }
        }

        if self.matches_pattern(ctx.path()) {
            return true;
        }

        if let Some(query) = ctx.query() {
            for pair in query.split('&') {
                if pair == "stream=sse" || pair == "format=sse" {
                    return true;
                }
            }
        }

        false
    }
}

#[async_trait]
impl Middleware for SseMiddleware {
    fn name(&self) -> &str {
        "sse"
    }

    async fn handle(&self, ctx: &mut RequestContext) -> bool {
        if !self.is_sse_request(ctx) {
            return true;
        }

        ctx.sse = true;
        ctx.response_headers
            .insert("content-type", HeaderValue::from_static("text/event-stream"));
        ctx.response_headers
            .insert("cache-control", HeaderValue::from_static("no-cache"));
        ctx.response_headers
            .insert("connection", HeaderValue::from_static("keep-alive"));
        ctx.response_headers
            .insert("x-accel-buffering", HeaderValue::from_static("no"));

        debug!(method = %ctx.method, path = %ctx.path(), "SSE connection detected");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::testutil::ctx;
    use hyper::Method;

    fn sse() -> Arc<dyn Middleware> {
        SseMiddleware::build(None).unwrap()
    }

    #[tokio::test]
    async fn test_detects_accept_header() {
        let mw = sse();
        let mut c = ctx(Method::GET, "/feed", &[("accept", "text/event-stream")]);
        assert!(mw.handle(&mut c).await);
        assert!(c.sse);
        assert_eq!(
            c.response_headers.get("content-type").unwrap(),
            "text/event-stream"
        );
        assert_eq!(c.response_headers.get("x-accel-buffering").unwrap(), "no");
    }

    #[tokio::test]
    async fn test_detects_default_path_patterns() {
        let mw = sse();
        let mut c = ctx(Method::GET, "/events/orders", &[]);
        assert!(mw.handle(&mut c).await);
        assert!(c.sse);
    }

    #[tokio::test]
    async fn test_detects_query_parameter() {
        let mw = sse();
        let mut c = ctx(Method::GET, "/feed?stream=sse", &[]);
        assert!(mw.handle(&mut c).await);
        assert!(c.sse);
    }

    #[tokio::test]
    async fn test_plain_request_is_untouched() {
        let mw = sse();
        let mut c = ctx(Method::GET, "/index.html", &[("accept", "text/html")]);
        assert!(mw.handle(&mut c).await);
        assert!(!c.sse);
        assert!(c.response_headers.is_empty());
    }
}
