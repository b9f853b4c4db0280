//! Per-client-IP rate limiting.
//!
//! Fixed one-minute window per client: the counter resets sixty seconds
//! after the window opened, and a request is rejected with 429 once the
//! window's count reaches `requests_per_minute + burst_size`. The burst
//! allowance lets short spikes through without raising the sustained rate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hyper::StatusCode;
use parking_lot::Mutex;

use crate::config::ConfigMap;
use crate::error::Result;

use super::{config_u64, Middleware, RequestContext};

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct ClientWindow {
    count: u64,
    last_reset: Instant,
}

#[derive(Debug)]
pub struct RateLimitMiddleware {
    requests_per_minute: u64,
    burst_size: u64,
    clients: Mutex<HashMap<String, ClientWindow>>,
}

impl RateLimitMiddleware {
    /// Factory constructor. Config keys: `requests_per_minute` (default
    /// 100), `burst_size` (default 20).
    pub fn build(config: Option<&ConfigMap>) -> Result<Arc<dyn Middleware>> {
        Ok(Arc::new(Self {
            requests_per_minute: config_u64(config, "requests_per_minute").unwrap_or(100),
            burst_size: config_u64(config, "burst_size").unwrap_or(20),
            clients: Mutex::new(HashMap::new()),
        }))
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        "rate_limit"
    }

    async fn handle(&self, ctx: &mut RequestContext) -> bool {
        let client_ip = ctx.client_ip();
        let now = Instant::now();

        let mut clients = self.clients.lock();
        let entry = clients.entry(client_ip).or_insert_with(|| ClientWindow {
            count: 0,
            last_reset: now,
        });

        if now.duration_since(entry.last_reset) > WINDOW {
            entry.count = 0;
            entry.last_reset = now;
        }

        if entry.count >= self.requests_per_minute + self.burst_size {
            drop(clients);
            ctx.reject(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded");
            return false;
        }
        entry.count += 1;

        true
    }
}
