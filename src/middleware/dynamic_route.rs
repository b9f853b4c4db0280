//! Dynamic re-routing driven by an external host-mapping API.
//!
//! On each request the middleware resolves the inbound host to a target
//! service name by POSTing `{"host": ...}` to a configured endpoint, with a
//! per-host TTL cache in front of the call. A successful answer
//! (`code == 200`, non-empty `goto_services`) is stored in the context for
//! the dispatcher to swap the target after the chain. API failures are
//! logged and never fail the request; negative answers are cached so a
//! quiet host doesn't hammer the API.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::ConfigMap;
use crate::error::{Error, Result};

use super::{config_f64, config_str, Middleware, RequestContext, DYNAMIC_TARGET_KEY};

const DEFAULT_API_URL: &str = "http://127.0.0.1:7080/api/host";

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: ApiData,
}

#[derive(Debug, Default, Deserialize)]
struct ApiData {
    #[serde(default)]
    goto_services: String,
}

#[derive(Debug)]
struct CacheEntry {
    target: String,
    fetched_at: Instant,
}

#[derive(Debug)]
pub struct DynamicRouteMiddleware {
    api_url: String,
    cache_ttl: Duration,
    client: reqwest::Client,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl DynamicRouteMiddleware {
    /// Factory constructor. Config keys: `api_url`, `timeout_seconds`
    /// (default 5), `cache_expiry_seconds` (default 60).
    pub fn build(config: Option<&ConfigMap>) -> Result<Arc<dyn Middleware>> {
        let api_url = config_str(config, "api_url").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let timeout = config_f64(config, "timeout_seconds").unwrap_or(5.0);
        let cache_ttl = config_f64(config, "cache_expiry_seconds").unwrap_or(60.0);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(timeout.max(0.1)))
            .build()
            .map_err(|e| Error::middleware_config("dynamic_route", e.to_string()))?;

        Ok(Arc::new(Self {
            api_url,
            cache_ttl: Duration::from_secs_f64(cache_ttl.max(0.0)),
            client,
            cache: Mutex::new(HashMap::new()),
        }))
    }

    fn cached_target(&self, host: &str) -> Option<String> {
        let cache = self.cache.lock();
        let entry = cache.get(host)?;
        if entry.fetched_at.elapsed() > self.cache_ttl {
            return None;
        }
        Some(entry.target.clone())
    }

    fn update_cache(&self, host: &str, target: &str) {
        self.cache.lock().insert(
            host.to_string(),
            CacheEntry {
                target: target.to_string(),
                fetched_at: Instant::now(),
            },
        );
    }

    async fn query_api(&self, host: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.api_url)
            .json(&serde_json::json!({ "host": host }))
            .send()
            .await?;

        let api: ApiResponse = response.json().await?;
        if api.code != 200 {
            return Err(Error::config(format!(
                "dynamic route API returned error: {}",
                api.msg
            )));
        }

        Ok(api.data.goto_services)
    }
}

#[async_trait]
impl Middleware for DynamicRouteMiddleware {
    fn name(&self) -> &str {
        "dynamic_route"
    }

    async fn handle(&self, ctx: &mut RequestContext) -> bool {
        let host = ctx.host().to_string();
        if host.is_empty() {
            return true;
        }

        let target = match self.cached_target(&host) {
            Some(target) => target,
            None => match self.query_api(&host).await {
                Ok(target) => {
                    self.update_cache(&host, &target);
                    target
                }
                Err(e) => {
                    warn!(host = %host, error = %e, "Dynamic route API lookup failed");
                    return true;
                }
            },
        };

        if !target.is_empty() {
            debug!(host = %host, service = %target, "Dynamic route resolved");
            ctx.set_value(DYNAMIC_TARGET_KEY, target);
        }

        true
    }
}
