//! Request logging middleware.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::ConfigMap;
use crate::error::Result;

use super::{config_str, Middleware, RequestContext};

#[derive(Debug)]
pub struct LoggingMiddleware {
    level: String,
}

impl LoggingMiddleware {
    /// Factory constructor. Config key: `level` (`info` or `debug`,
    /// default `info`).
    pub fn build(config: Option<&ConfigMap>) -> Result<Arc<dyn Middleware>> {
        let level = config_str(config, "level").unwrap_or_else(|| "info".to_string());
        Ok(Arc::new(Self { level }))
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn handle(&self, ctx: &mut RequestContext) -> bool {
        if self.level == "debug" {
            debug!(
                method = %ctx.method,
                path = %ctx.path(),
                host = %ctx.host(),
                "Request started"
            );
        }

        let status = ctx.status.map_or(200, |s| s.as_u16());
        info!(
            method = %ctx.method,
            path = %ctx.path(),
            status,
            elapsed = ?ctx.started_at.elapsed(),
            "Request passing middleware chain"
        );

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::testutil::ctx;
    use hyper::Method;

    #[tokio::test]
    async fn test_logging_never_aborts() {
        let mw = LoggingMiddleware::build(None).unwrap();
        let mut c = ctx(Method::GET, "/some/path", &[("host", "example.com")]);
        assert!(mw.handle(&mut c).await);
        assert!(c.status.is_none());
    }
}
