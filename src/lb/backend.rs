//! Backend state for load-balanced services.

use std::time::Duration;

use crate::config::{BackendConfig, HealthCheckConfig};

/// A single upstream origin behind a load balancer.
///
/// Owned by exactly one balancer and only ever touched under its lock.
/// `active` is written by the health checker alone; `connections` and
/// `response_time` are fed by the proxy engine.
#[derive(Debug, Clone)]
pub struct Backend {
    pub url: String,
    pub weight: u32,
    pub health_check: Option<HealthCheckConfig>,

    /// Whether the backend is eligible for selection.
    pub active: bool,
    /// In-flight request count.
    pub connections: usize,
    /// Exponentially-smoothed round-trip time; zero until the first sample.
    pub response_time: Duration,
}

impl Backend {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            url: config.url.clone(),
            weight: config.weight.max(1),
            health_check: config.health_check.clone(),
            active: true,
            connections: 0,
            response_time: Duration::ZERO,
        }
    }

    /// Effective weight for the weighted strategies; never below 1.
    pub fn effective_weight(&self) -> u32 {
        self.weight.max(1)
    }
}
