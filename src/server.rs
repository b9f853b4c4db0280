//! Multi-port server lifecycle.
//!
//! The set of listen ports is derived from the host rules (port 0 falls
//! back to `advanced.port`). Every listener serves the same dispatcher;
//! each accepted connection runs on its own task with HTTP/1 upgrades
//! enabled so WebSocket tunnels can take over the stream.
//!
//! SIGINT/SIGTERM broadcast a shutdown signal: listeners stop accepting,
//! health checkers stop, live tunnels are closed, and in-flight
//! connections get a grace period to finish before being aborted.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::proxy::ProxyHandler;

/// How long in-flight connections may keep running after shutdown begins.
const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// The proxy server: one dispatcher shared by one listener per port.
pub struct Server {
    config: Config,
    handler: Arc<ProxyHandler>,
}

impl Server {
    /// Build the server from a validated configuration.
    pub fn new(config: Config) -> Result<Self> {
        let handler = Arc::new(ProxyHandler::new(&config)?);
        Ok(Self { config, handler })
    }

    /// The distinct set of ports the server will listen on.
    pub fn ports(&self) -> Vec<u16> {
        let default_port = self.config.advanced.port;
        let mut ports: BTreeSet<u16> = self
            .config
            .host_rules
            .iter()
            .map(|rule| if rule.port == 0 { default_port } else { rule.port })
            .collect();
        if ports.is_empty() {
            ports.insert(default_port);
        }
        ports.into_iter().collect()
    }

    /// Bind every listener, start health checking, and serve until a
    /// termination signal arrives.
    ///
    /// # Errors
    ///
    /// Returns an error when any port fails to bind; that is a startup
    /// failure and the process should exit non-zero.
    pub async fn run(self) -> Result<()> {
        let ports = self.ports();

        let mut listeners = Vec::with_capacity(ports.len());
        for port in &ports {
            let addr: SocketAddr = format!("0.0.0.0:{port}").parse().expect("valid bind addr");
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind port {port}"))?;
            listeners.push((*port, listener));
        }

        info!(
            ports = ?ports,
            host_rules = self.config.host_rules.len(),
            services = self.config.services.len(),
            middlewares = self.config.middlewares.len(),
            "Proxy server starting"
        );

        self.handler.start_health_checks();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut listener_tasks = JoinSet::new();
        for (port, listener) in listeners {
            let handler = Arc::clone(&self.handler);
            let shutdown = shutdown_rx.clone();
            listener_tasks.spawn(async move {
                serve_listener(listener, handler, port, shutdown).await;
            });
        }

        wait_for_signal().await;
        info!("Shutdown signal received");

        // Stop accepting, then tear down tunnels and probes while in-flight
        // requests drain.
        let _ = shutdown_tx.send(true);
        self.handler.shutdown();

        while listener_tasks.join_next().await.is_some() {}
        info!("All listeners stopped");

        Ok(())
    }

    /// The shared dispatcher.
    pub fn handler(&self) -> &Arc<ProxyHandler> {
        &self.handler
    }
}

/// Accept loop for one port. Public so integration tests can drive a
/// listener on an ephemeral port without signal handling.
pub async fn serve_listener(
    listener: TcpListener,
    handler: Arc<ProxyHandler>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(port, "Listening");

    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        error!(port, error = %e, "Accept failed");
                        continue;
                    }
                };
                let handler = Arc::clone(&handler);
                connections.spawn(async move {
                    serve_connection(stream, handler, remote_addr, port).await;
                });
            }
            _ = shutdown.changed() => {
                debug!(port, "Listener closing");
                break;
            }
        }
    }

    drop(listener);

    // Let in-flight requests finish; anything still running after the
    // grace period is cut off.
    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(DRAIN_GRACE, drain).await.is_err() {
        warn!(port, "Drain grace expired; aborting remaining connections");
        connections.shutdown().await;
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    handler: Arc<ProxyHandler>,
    remote_addr: SocketAddr,
    port: u16,
) {
    let service = service_fn(move |req| {
        let handler = Arc::clone(&handler);
        async move {
            Ok::<_, std::convert::Infallible>(handler.handle(req, remote_addr, port).await)
        }
    });

    let result = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await;

    if let Err(e) = result {
        let message = e.to_string();
        // Clients dropping the connection mid-exchange is routine noise.
        if !message.contains("connection closed") && !message.contains("connection reset") {
            debug!(remote = %remote_addr, error = %message, "Connection error");
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
