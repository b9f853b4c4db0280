//! Token authentication middleware.
//!
//! Rejects with 401 when the configured header is absent and with 403 when
//! the presented token (optionally `Bearer `-prefixed) is not in the
//! allow-list.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use hyper::StatusCode;

use crate::config::ConfigMap;
use crate::error::Result;

use super::{config_str, config_str_list, Middleware, RequestContext};

#[derive(Debug)]
pub struct AuthMiddleware {
    header: String,
    keys: HashSet<String>,
}

impl AuthMiddleware {
    /// Factory constructor. Config keys: `header` (default `Authorization`),
    /// `keys` (list of accepted tokens).
    pub fn build(config: Option<&ConfigMap>) -> Result<Arc<dyn Middleware>> {
        let header = config_str(config, "header").unwrap_or_else(|| "Authorization".to_string());
        let keys = config_str_list(config, "keys").into_iter().collect();
        Ok(Arc::new(Self { header, keys }))
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    fn name(&self) -> &str {
        "auth"
    }

    async fn handle(&self, ctx: &mut RequestContext) -> bool {
        let value = ctx
            .headers
            .get(self.header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        let Some(value) = value else {
            ctx.reject(StatusCode::UNAUTHORIZED, "Missing authentication header");
            return false;
        };

        let token = value.strip_prefix("Bearer ").unwrap_or(&value);
        if !self.keys.contains(token) {
            ctx.reject(StatusCode::FORBIDDEN, "Invalid authentication token");
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::testutil::ctx;
    use hyper::Method;
    use serde_json::json;

    fn auth() -> Arc<dyn Middleware> {
        let config = json!({
            "header": "Authorization",
            "keys": ["valid-token"],
        });
        AuthMiddleware::build(Some(config.as_object().unwrap())).unwrap()
    }

    #[tokio::test]
    async fn test_missing_header_is_401() {
        let mw = auth();
        let mut c = ctx(Method::GET, "/", &[]);
        assert!(!mw.handle(&mut c).await);
        assert_eq!(c.status, Some(StatusCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn test_unknown_token_is_403() {
        let mw = auth();
        let mut c = ctx(Method::GET, "/", &[("authorization", "wrong")]);
        assert!(!mw.handle(&mut c).await);
        assert_eq!(c.status, Some(StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn test_valid_token_passes() {
        let mw = auth();
        let mut c = ctx(Method::GET, "/", &[("authorization", "valid-token")]);
        assert!(mw.handle(&mut c).await);
        assert!(c.status.is_none());
    }

    #[tokio::test]
    async fn test_bearer_prefix_is_stripped() {
        let mw = auth();
        let mut c = ctx(Method::GET, "/", &[("authorization", "Bearer valid-token")]);
        assert!(mw.handle(&mut c).await);
    }
}
