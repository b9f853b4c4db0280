//! Active health checking for load-balanced backends.
//!
//! A started checker marks every backend active, then once per interval
//! fans out one probe task per backend. A probe is a `GET` against the
//! backend URL plus the configured path; the backend is active iff the
//! response status is 2xx. Per-backend health settings override the
//! balancer-wide ones for path and timeout; a backend with neither enabled
//! is treated as permanently healthy.
//!
//! Probe outcomes only ever flip the `active` flag — backends are never
//! removed, and failures never propagate into the request path.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::HealthCheckConfig;

use super::LoadBalancer;

impl LoadBalancer {
    /// Start the periodic prober. A no-op when the balancer-wide health
    /// check is disabled or a checker is already running.
    pub fn start_health_check(self: &Arc<Self>) {
        if !self.health_config().enabled {
            return;
        }

        let mut slot = self.health_stop_slot().lock();
        if slot.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        *slot = Some(stop_tx);
        drop(slot);

        // Everyone starts healthy; the first tick sorts out reality.
        for backend in self.backends() {
            self.update_backend_status(&backend.url, true);
        }

        let balancer = Arc::clone(self);
        tokio::spawn(async move {
            run_probe_loop(balancer, stop_rx).await;
        });
    }

    /// Signal the prober to stop after its current tick.
    pub fn stop_health_check(&self) {
        if let Some(stop_tx) = self.health_stop_slot().lock().take() {
            let _ = stop_tx.send(true);
        }
    }
}

async fn run_probe_loop(balancer: Arc<LoadBalancer>, mut stop_rx: watch::Receiver<bool>) {
    let config = balancer.health_config().clone();
    let interval = Duration::from_secs(config.interval_secs);

    let client = match reqwest::Client::builder().build() {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "Failed to build health check client; checker disabled");
            return;
        }
    };

    info!(
        interval = ?interval,
        path = %config.path,
        "Starting health check loop"
    );

    let mut ticker = tokio::time::interval(interval);
    // The immediate first tick would probe before backends finish booting
    // in most deployments; skip it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop_rx.changed() => {
                debug!("Health check loop stopped");
                return;
            }
        }

        for backend in balancer.backends() {
            let balancer = Arc::clone(&balancer);
            let client = client.clone();
            let global = config.clone();
            tokio::spawn(async move {
                probe_backend(&balancer, &client, &global, &backend.url, backend.health_check.as_ref())
                    .await;
            });
        }
    }
}

async fn probe_backend(
    balancer: &LoadBalancer,
    client: &reqwest::Client,
    global: &HealthCheckConfig,
    url: &str,
    own: Option<&HealthCheckConfig>,
) {
    // Backend settings win when enabled; otherwise the balancer-wide
    // config applies; with neither enabled the backend is always healthy.
    let config = match own.filter(|c| c.enabled) {
        Some(own) => own,
        None if global.enabled => global,
        None => {
            balancer.update_backend_status(url, true);
            return;
        }
    };

    let probe_url = format!("{}{}", url, config.path);
    let result = client
        .get(&probe_url)
        .timeout(Duration::from_secs(config.timeout_secs))
        .send()
        .await;

    let healthy = match result {
        Ok(response) => response.status().is_success(),
        Err(e) => {
            debug!(backend = %url, error = %e, "Health probe failed");
            false
        }
    };

    let was_active = balancer
        .backends()
        .iter()
        .find(|b| b.url == url)
        .is_some_and(|b| b.active);

    balancer.update_backend_status(url, healthy);

    if healthy && !was_active {
        info!(backend = %url, "Backend recovered");
    } else if !healthy && was_active {
        warn!(backend = %url, "Backend marked inactive");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, LoadBalancerConfig};
    use std::convert::Infallible;
    use std::net::SocketAddr;

    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::service::service_fn;
    use hyper::{Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    /// Serve a fixed status on an ephemeral port and return its address.
    async fn fixed_status_server(status: StatusCode) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let service = service_fn(move |_req| async move {
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(status)
                                .body(Full::new(Bytes::from_static(b"probe")))
                                .unwrap(),
                        )
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    fn health_config(interval_secs: u64) -> HealthCheckConfig {
        HealthCheckConfig {
            enabled: true,
            interval_secs,
            timeout_secs: 1,
            path: "/health".to_string(),
        }
    }

    fn lb_with_backends(urls: &[String], health: HealthCheckConfig) -> Arc<LoadBalancer> {
        LoadBalancer::new(&LoadBalancerConfig {
            strategy: "round_robin".to_string(),
            backends: urls
                .iter()
                .map(|url| BackendConfig {
                    url: url.clone(),
                    weight: 1,
                    health_check: None,
                })
                .collect(),
            health_check: health,
            session_affinity: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_probe_flips_active_both_ways() {
        let healthy = fixed_status_server(StatusCode::OK).await;
        let failing = fixed_status_server(StatusCode::INTERNAL_SERVER_ERROR).await;

        let urls = vec![format!("http://{healthy}"), format!("http://{failing}")];
        let lb = lb_with_backends(&urls, health_config(30));
        let client = reqwest::Client::new();
        let global = health_config(30);

        probe_backend(&lb, &client, &global, &urls[0], None).await;
        probe_backend(&lb, &client, &global, &urls[1], None).await;

        let backends = lb.backends();
        assert!(backends[0].active);
        assert!(!backends[1].active);

        // Probing again is idempotent.
        probe_backend(&lb, &client, &global, &urls[0], None).await;
        probe_backend(&lb, &client, &global, &urls[1], None).await;
        let backends = lb.backends();
        assert!(backends[0].active);
        assert!(!backends[1].active);
    }

    #[tokio::test]
    async fn test_unreachable_backend_goes_inactive() {
        let urls = vec!["http://127.0.0.1:1".to_string()];
        let lb = lb_with_backends(&urls, health_config(30));
        let client = reqwest::Client::new();
        let global = health_config(30);

        probe_backend(&lb, &client, &global, &urls[0], None).await;
        assert!(!lb.backends()[0].active);
    }

    #[tokio::test]
    async fn test_disabled_everywhere_means_always_healthy() {
        let urls = vec!["http://127.0.0.1:1".to_string()];
        let lb = lb_with_backends(&urls, HealthCheckConfig::default());
        let client = reqwest::Client::new();

        lb.update_backend_status(&urls[0], false);
        probe_backend(&lb, &client, &HealthCheckConfig::default(), &urls[0], None).await;
        assert!(lb.backends()[0].active);
    }

    #[tokio::test]
    async fn test_start_marks_all_active_and_stop_ends_loop() {
        let urls = vec!["http://127.0.0.1:1".to_string()];
        let lb = lb_with_backends(&urls, health_config(3600));
        lb.update_backend_status(&urls[0], false);

        lb.start_health_check();
        assert!(lb.backends()[0].active, "start marks backends active");

        lb.stop_health_check();
        // A second start after stop is allowed.
        lb.start_health_check();
        lb.stop_health_check();
    }

    #[tokio::test]
    async fn test_disabled_health_check_does_not_start() {
        let urls = vec!["http://127.0.0.1:1".to_string()];
        let lb = lb_with_backends(&urls, HealthCheckConfig::default());
        lb.start_health_check();
        assert!(lb.health_stop_slot().lock().is_none());
    }
}
