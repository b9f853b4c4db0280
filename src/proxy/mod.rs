//! Per-request dispatch.
//!
//! The [`ProxyHandler`] owns everything a request needs: the compiled
//! routing table, the service map with per-service load balancers, the
//! middleware factory, and the two transport engines. Each request flows
//! through: hidden-file guard, matcher, context setup, middleware chain,
//! dynamic target swap, backend selection, and finally the HTTP engine or
//! the WebSocket tunnel.

pub mod http;
pub mod websocket;

pub use http::{full_body, text_response, HttpEngine, ProxyBody, ResolvedTarget, PROXY_NAME};
pub use websocket::{is_upgrade_request, WebSocketProxy};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::upgrade::OnUpgrade;
use hyper::{Request, Response, StatusCode};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::lb::LoadBalancer;
use crate::matcher::{HostRuleEntry, RouteRuleEntry, RoutingTable};
use crate::middleware::{
    Middleware, MiddlewareChain, MiddlewareFactory, RequestContext, DYNAMIC_TARGET_KEY,
};

/// A configured service with its optional balancer.
pub struct ServiceEntry {
    pub url: String,
    pub proxy_host: Option<String>,
    pub balancer: Option<Arc<LoadBalancer>>,
}

/// The request dispatcher shared by every listener.
pub struct ProxyHandler {
    routes: RoutingTable,
    services: HashMap<String, ServiceEntry>,
    factory: MiddlewareFactory,
    /// Enabled global middleware specs, instantiated once at startup and
    /// shared across requests, in declaration order.
    global_middlewares: Vec<(String, Arc<dyn Middleware>)>,
    engine: HttpEngine,
    websocket: Arc<WebSocketProxy>,
    deny_hidden_files: bool,
}

impl ProxyHandler {
    /// Build the dispatcher from a loaded configuration. Load balancers are
    /// created here but their health checkers are started separately via
    /// [`start_health_checks`](Self::start_health_checks).
    pub fn new(config: &Config) -> Result<Self> {
        let routes = RoutingTable::from_config(config)?;

        let mut services = HashMap::new();
        for (name, service) in &config.services {
            let balancer = match &service.load_balancer {
                Some(lb_config) => Some(LoadBalancer::new(lb_config)?),
                None => None,
            };
            services.insert(
                name.clone(),
                ServiceEntry {
                    url: service.url.clone(),
                    proxy_host: service.proxy_host.clone(),
                    balancer,
                },
            );
        }

        let mut factory = MiddlewareFactory::new();
        factory.register_services(&config.middleware_services);

        let mut global_middlewares = Vec::new();
        for spec in config.middlewares.iter().filter(|spec| spec.enabled) {
            match factory.create(&spec.name, Some(&spec.config)) {
                Ok(mw) => {
                    info!(name = %spec.name, "Middleware loaded");
                    global_middlewares.push((spec.name.clone(), mw));
                }
                Err(e) => {
                    warn!(name = %spec.name, error = %e, "Failed to create middleware")
                }
            }
        }

        let dial_timeout = Duration::from_secs(config.advanced.timeout.dial);

        Ok(Self {
            routes,
            services,
            factory,
            global_middlewares,
            engine: HttpEngine::new(dial_timeout)?,
            websocket: Arc::new(WebSocketProxy::new(
                dial_timeout,
                config.advanced.security.insecure_skip_verify,
            )),
            deny_hidden_files: config.advanced.security.deny_hidden_files,
        })
    }

    /// Start the health checker of every load-balanced service.
    pub fn start_health_checks(&self) {
        for entry in self.services.values() {
            if let Some(balancer) = &entry.balancer {
                balancer.start_health_check();
            }
        }
    }

    /// Stop health checkers and tear down live WebSocket tunnels.
    pub fn shutdown(&self) {
        for entry in self.services.values() {
            if let Some(balancer) = &entry.balancer {
                balancer.stop_health_check();
            }
        }
        self.websocket.close_all();
    }

    /// The tunnel registry, exposed for inspection.
    pub fn websocket_proxy(&self) -> &Arc<WebSocketProxy> {
        &self.websocket
    }

    /// Handle one inbound request.
    pub async fn handle(
        self: Arc<Self>,
        mut req: Request<Incoming>,
        remote_addr: SocketAddr,
        listener_port: u16,
    ) -> Response<ProxyBody> {
        let started = Instant::now();

        if self.deny_hidden_files && has_hidden_segment(req.uri().path()) {
            return text_response(StatusCode::FORBIDDEN, "Forbidden");
        }

        // The upgrade slot must be pulled out before the body is collected.
        let on_upgrade = req.extensions_mut().remove::<OnUpgrade>();

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(error = %e, "Failed to read request body");
                return text_response(StatusCode::BAD_REQUEST, "Failed to read request body");
            }
        };

        let mut ctx = RequestContext::new(
            parts.method,
            parts.uri,
            parts.version,
            parts.headers,
            body,
            remote_addr,
            listener_port,
        );

        let (host_rule, route_rule, target_name) = {
            let Some(matched) = self
                .routes
                .resolve(ctx.host(), ctx.path(), listener_port)
            else {
                let err = Error::NoRoute {
                    host: ctx.host().to_string(),
                    path: ctx.path().to_string(),
                };
                warn!(host = %ctx.host(), path = %ctx.path(), "No matching rule");
                return text_response(StatusCode::BAD_GATEWAY, &err.to_string());
            };

            let target_name = self.effective_target(&matched.host_rule.target, matched.route_rule);
            (matched.host_rule, matched.route_rule, target_name)
        };

        let Some(target_name) = target_name else {
            warn!(host = %ctx.host(), path = %ctx.path(), "Matched rule targets no known service");
            return text_response(
                StatusCode::BAD_GATEWAY,
                &format!(
                    "no matching rule found for host: {}, path: {}",
                    ctx.host(),
                    ctx.path()
                ),
            );
        };
        let mut service = &self.services[&target_name];

        ctx.target_url = service.url.clone();
        ctx.service_name = service_hostname(&service.url);

        let chain = self.assemble_chain(host_rule, route_rule);
        if !chain.execute(&mut ctx).await {
            info!(
                method = %ctx.method,
                path = %ctx.path(),
                status = ctx.status.map_or(0, |s| s.as_u16()),
                "Request aborted by middleware"
            );
            return short_circuit_response(&ctx);
        }

        // A successful dynamic_route lookup overrides the static match.
        if let Some(dynamic) = ctx.value::<String>(DYNAMIC_TARGET_KEY).cloned() {
            match self.services.get(&dynamic) {
                Some(swapped) => {
                    info!(service = %dynamic, "Dynamic routing: target swapped");
                    service = swapped;
                    ctx.target_url = service.url.clone();
                    ctx.service_name = service_hostname(&service.url);
                }
                None => {
                    warn!(service = %dynamic, "Dynamic routing: unknown service, keeping original target");
                }
            }
        }

        let mut target = ResolvedTarget {
            url: service.url.clone(),
            proxy_host: service.proxy_host.clone(),
            service_name: ctx.service_name.clone(),
        };

        let mut guard = None;
        if let Some(balancer) = &service.balancer {
            let session = balancer
                .affinity_cookie()
                .and_then(|cookie| ctx.cookie(cookie));
            match balancer.next_backend(&ctx.client_ip(), session.as_deref()) {
                Ok(backend) => {
                    guard = Some(balancer.track_connection(&backend.url));
                    target.url = backend.url;
                }
                Err(e) => {
                    warn!(error = %e, "Backend selection failed");
                    return text_response(
                        StatusCode::SERVICE_UNAVAILABLE,
                        &format!("No available backend: {e}"),
                    );
                }
            }
        }

        // The tunnel only ever serves a real upgrade; the middleware's
        // pattern/query heuristics mark the context but cannot complete a
        // handshake.
        let is_websocket = is_upgrade_request(&ctx.headers);
        let response = if is_websocket {
            let Some(on_upgrade) = on_upgrade else {
                warn!("WebSocket request on a connection that cannot upgrade");
                return text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Connection does not support upgrade",
                );
            };
            match self
                .websocket
                .proxy(&ctx, &target.url, on_upgrade, guard.take())
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, target = %target.url, "WebSocket proxy failed");
                    text_response(StatusCode::BAD_GATEWAY, "Service unavailable")
                }
            }
        } else {
            let round_trip = Instant::now();
            match self.engine.forward(&ctx, &target).await {
                Ok(response) => {
                    if let (Some(balancer), Some(guard)) =
                        (service.balancer.as_ref(), guard.as_ref())
                    {
                        balancer.update_response_time(guard.url(), round_trip.elapsed());
                    }
                    response
                }
                Err(e) => {
                    warn!(error = %e, target = %target.url, "Upstream request failed");
                    HttpEngine::error_response(&ctx)
                }
            }
        };

        let transport = if is_websocket {
            "websocket"
        } else if ctx.sse {
            "sse"
        } else {
            "http"
        };
        info!(
            method = %ctx.method,
            path = %ctx.path(),
            target = %target.url,
            host = %ctx.host(),
            status = response.status().as_u16(),
            elapsed = ?started.elapsed(),
            transport,
            "Proxied"
        );

        response
    }

    /// Resolve the matched rule's target to a known service name, letting a
    /// route rule with an undefined target fall back to the host target.
    fn effective_target(
        &self,
        host_target: &str,
        route_rule: Option<&RouteRuleEntry>,
    ) -> Option<String> {
        if let Some(route) = route_rule {
            if self.services.contains_key(&route.target) {
                return Some(route.target.clone());
            }
            warn!(
                target = %route.target,
                "Route rule targets undefined service; falling back to host target"
            );
        }
        self.services
            .contains_key(host_target)
            .then(|| host_target.to_string())
    }

    /// Assemble the per-request chain: route middlewares, host middlewares,
    /// enabled global specs, then global middleware services. The chain
    /// itself refuses duplicates, so higher scopes shadow lower ones.
    fn assemble_chain(
        &self,
        host_rule: &HostRuleEntry,
        route_rule: Option<&RouteRuleEntry>,
    ) -> MiddlewareChain {
        let mut chain = MiddlewareChain::new();

        if let Some(route) = route_rule {
            for name in &route.middlewares {
                self.mount_named(&mut chain, name, "route");
            }
        }
        for name in &host_rule.middlewares {
            self.mount_named(&mut chain, name, "host");
        }

        for (_, mw) in &self.global_middlewares {
            chain.add(Arc::clone(mw));
        }

        for mw in self.factory.global_service_instances() {
            chain.add(mw);
        }

        chain
    }

    /// Mount a rule-referenced middleware: registered service name first,
    /// then the enabled global spec under that name; otherwise skip.
    fn mount_named(&self, chain: &mut MiddlewareChain, name: &str, scope: &str) {
        if let Some(mw) = self.factory.service_instance(name) {
            chain.add(mw);
            return;
        }

        if let Some((_, mw)) = self.global_middlewares.iter().find(|(n, _)| n == name) {
            chain.add(Arc::clone(mw));
        } else {
            warn!(name = %name, scope, "Middleware not found or disabled; skipping");
        }
    }
}

/// Flush a middleware rejection: the recorded status (500 when the
/// middleware aborted without one), its body, and any staged headers.
fn short_circuit_response(ctx: &RequestContext) -> Response<ProxyBody> {
    let status = ctx.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in &ctx.response_headers {
            headers.insert(name.clone(), value.clone());
        }
    }
    let body = ctx.response_body.clone().unwrap_or_default();
    builder.body(full_body(body)).unwrap()
}

/// Whether any path segment starts with a dot.
fn has_hidden_segment(path: &str) -> bool {
    path.split('/').any(|segment| segment.starts_with('.'))
}

/// Hostname of a service URL, for `X-Target-Service`.
fn service_hostname(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_else(|| url.to_string())
}
