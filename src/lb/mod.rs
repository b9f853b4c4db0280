//! Load balancing for multi-backend services.
//!
//! One [`LoadBalancer`] per service owns its backend list behind a single
//! read-write lock; selection works on a snapshot of the active set, and
//! every mutating operation (connection counters, response times, health
//! flips) serializes through the same lock. The selection strategy is a
//! tagged enum rather than a trait object per variant: the algorithms are
//! small and share all their state.
//!
//! Session affinity, when enabled, pins a request to a backend by a stable
//! hash of its cookie value and falls back to the inner strategy when the
//! cookie is absent.

mod backend;
mod health;
mod strategy;

pub use backend::Backend;
pub use strategy::{hash_index, Strategy};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::watch;

use crate::config::{HealthCheckConfig, LoadBalancerConfig, SessionAffinityConfig};
use crate::error::{Error, Result};

/// Default competitive response time for backends without a sample yet.
const UNMEASURED_RESPONSE_TIME: Duration = Duration::from_millis(100);

/// EMA smoothing: how much of the old value survives a new sample.
const RESPONSE_TIME_SMOOTHING: f64 = 0.7;

#[derive(Debug)]
pub struct LoadBalancer {
    strategy: Strategy,
    backends: RwLock<Vec<Backend>>,
    health_config: HealthCheckConfig,
    affinity: Option<SessionAffinityConfig>,
    rr_cursor: AtomicUsize,
    wrr_cursor: AtomicUsize,
    health_stop: Mutex<Option<watch::Sender<bool>>>,
}

impl LoadBalancer {
    /// Build a balancer from configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown strategy or an empty
    /// backend list.
    pub fn new(config: &LoadBalancerConfig) -> Result<Arc<Self>> {
        let strategy: Strategy = config.strategy.parse()?;
        if config.backends.is_empty() {
            return Err(Error::config(
                "load balancer requires at least one backend",
            ));
        }

        let backends = config.backends.iter().map(Backend::from_config).collect();

        Ok(Arc::new(Self {
            strategy,
            backends: RwLock::new(backends),
            health_config: config.health_check.clone(),
            affinity: config.session_affinity.clone(),
            rr_cursor: AtomicUsize::new(0),
            wrr_cursor: AtomicUsize::new(0),
            health_stop: Mutex::new(None),
        }))
    }

    /// The configured strategy.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// The session-affinity cookie name, when affinity is enabled.
    pub fn affinity_cookie(&self) -> Option<&str> {
        self.affinity
            .as_ref()
            .filter(|a| a.enabled)
            .map(|a| a.cookie_name.as_str())
    }

    /// Pick a backend for a request.
    ///
    /// `session` is the value of the affinity cookie when one was sent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoActiveBackends`] when every backend is inactive.
    pub fn next_backend(&self, client_ip: &str, session: Option<&str>) -> Result<Backend> {
        let backends = self.backends.read();
        let active: Vec<&Backend> = backends.iter().filter(|b| b.active).collect();
        if active.is_empty() {
            return Err(Error::NoActiveBackends);
        }

        if self.affinity.as_ref().is_some_and(|a| a.enabled) {
            if let Some(session) = session.filter(|s| !s.is_empty()) {
                let index = hash_index(session, active.len());
                return Ok(active[index].clone());
            }
        }

        let chosen = match self.strategy {
            Strategy::RoundRobin => {
                let cursor = self.rr_cursor.fetch_add(1, Ordering::Relaxed);
                active[cursor % active.len()]
            }
            Strategy::WeightedRoundRobin => {
                let total: usize = active.iter().map(|b| b.effective_weight() as usize).sum();
                let target = self.wrr_cursor.fetch_add(1, Ordering::Relaxed) % total;
                Self::cumulative_pick(&active, target)
            }
            Strategy::IpHash => active[hash_index(client_ip, active.len())],
            Strategy::LeastConnections => active
                .iter()
                .min_by_key(|b| b.connections)
                .copied()
                .unwrap_or(active[0]),
            Strategy::ResponseTime => active
                .iter()
                .min_by_key(|b| {
                    if b.response_time.is_zero() {
                        UNMEASURED_RESPONSE_TIME
                    } else {
                        b.response_time
                    }
                })
                .copied()
                .unwrap_or(active[0]),
            Strategy::Random => {
                let index = rand::thread_rng().gen_range(0..active.len());
                active[index]
            }
            Strategy::WeightedRandom => {
                let total: usize = active.iter().map(|b| b.effective_weight() as usize).sum();
                let target = rand::thread_rng().gen_range(0..total);
                Self::cumulative_pick(&active, target)
            }
        };

        Ok(chosen.clone())
    }

    /// Walk cumulative weights until `target` falls inside a backend's span.
    fn cumulative_pick<'a>(active: &[&'a Backend], target: usize) -> &'a Backend {
        let mut cumulative = 0usize;
        for backend in active {
            cumulative += backend.effective_weight() as usize;
            if target < cumulative {
                return backend;
            }
        }
        active[0]
    }

    /// Increment the in-flight counter for a backend.
    pub fn increment_connections(&self, url: &str) {
        let mut backends = self.backends.write();
        if let Some(backend) = backends.iter_mut().find(|b| b.url == url) {
            backend.connections += 1;
        }
    }

    /// Decrement the in-flight counter for a backend; never below zero.
    pub fn decrement_connections(&self, url: &str) {
        let mut backends = self.backends.write();
        if let Some(backend) = backends.iter_mut().find(|b| b.url == url) {
            backend.connections = backend.connections.saturating_sub(1);
        }
    }

    /// Feed a round-trip sample into the backend's smoothed response time.
    pub fn update_response_time(&self, url: &str, sample: Duration) {
        let mut backends = self.backends.write();
        if let Some(backend) = backends.iter_mut().find(|b| b.url == url) {
            backend.response_time = if backend.response_time.is_zero() {
                sample
            } else {
                Duration::from_secs_f64(
                    backend.response_time.as_secs_f64() * RESPONSE_TIME_SMOOTHING
                        + sample.as_secs_f64() * (1.0 - RESPONSE_TIME_SMOOTHING),
                )
            };
        }
    }

    /// Flip a backend's liveness. Called by the health checker only.
    pub fn update_backend_status(&self, url: &str, active: bool) {
        let mut backends = self.backends.write();
        if let Some(backend) = backends.iter_mut().find(|b| b.url == url) {
            backend.active = active;
        }
    }

    /// Snapshot of the active backends.
    pub fn active_backends(&self) -> Vec<Backend> {
        self.backends
            .read()
            .iter()
            .filter(|b| b.active)
            .cloned()
            .collect()
    }

    /// Snapshot of every backend.
    pub fn backends(&self) -> Vec<Backend> {
        self.backends.read().clone()
    }

    /// Pair an increment with a guaranteed decrement on drop.
    pub fn track_connection(self: &Arc<Self>, url: &str) -> ConnectionGuard {
        self.increment_connections(url);
        ConnectionGuard {
            balancer: Arc::clone(self),
            url: url.to_string(),
        }
    }

    pub(crate) fn health_config(&self) -> &HealthCheckConfig {
        &self.health_config
    }

    pub(crate) fn health_stop_slot(&self) -> &Mutex<Option<watch::Sender<bool>>> {
        &self.health_stop
    }
}

/// Scoped in-flight marker: decrements the backend's connection counter on
/// every return path out of the dispatcher.
pub struct ConnectionGuard {
    balancer: Arc<LoadBalancer>,
    url: String,
}

impl ConnectionGuard {
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.balancer.decrement_connections(&self.url);
    }
}
