//! CORS middleware.
//!
//! Echoes the request origin when it is allow-listed (or the list holds
//! `*`) and answers `OPTIONS` preflights directly with 204, short-circuiting
//! the chain. Requests from non-listed origins pass through untouched.

use std::sync::Arc;

use async_trait::async_trait;
use hyper::header::{HeaderValue, ORIGIN};
use hyper::{Method, StatusCode};

use crate::config::ConfigMap;
use crate::error::Result;

use super::{config_str_list, Middleware, RequestContext};

#[derive(Debug)]
pub struct CorsMiddleware {
    allowed_origins: Vec<String>,
    allowed_methods: Vec<String>,
    allowed_headers: Vec<String>,
}

impl CorsMiddleware {
    /// Factory constructor. Config keys: `allowed_origins`,
    /// `allowed_methods`, `allowed_headers` (string lists).
    pub fn build(config: Option<&ConfigMap>) -> Result<Arc<dyn Middleware>> {
        Ok(Arc::new(Self {
            allowed_origins: config_str_list(config, "allowed_origins"),
            allowed_methods: config_str_list(config, "allowed_methods"),
            allowed_headers: config_str_list(config, "allowed_headers"),
        }))
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.is_empty()
            || self
                .allowed_origins
                .iter()
                .any(|allowed| allowed == "*" || allowed == origin)
    }
}

#[async_trait]
impl Middleware for CorsMiddleware {
    fn name(&self) -> &str {
        "cors"
    }

    async fn handle(&self, ctx: &mut RequestContext) -> bool {
        let Some(origin) = ctx
            .headers
            .get(ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string())
        else {
            return true;
        };

        if !self.origin_allowed(&origin) {
            return true;
        }

        if let Ok(value) = HeaderValue::from_str(&origin) {
            ctx.response_headers
                .insert("access-control-allow-origin", value);
        }
        ctx.response_headers.insert(
            "access-control-allow-credentials",
            HeaderValue::from_static("true"),
        );
        if !self.allowed_methods.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.allowed_methods.join(", ")) {
                ctx.response_headers
                    .insert("access-control-allow-methods", value);
            }
        }
        if !self.allowed_headers.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&self.allowed_headers.join(", ")) {
                ctx.response_headers
                    .insert("access-control-allow-headers", value);
            }
        }

        if ctx.method == Method::OPTIONS {
            ctx.status = Some(StatusCode::NO_CONTENT);
            return false;
        }

        true
    }
}
