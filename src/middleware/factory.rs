//! Middleware construction by name.
//!
//! The factory maps middleware type names to constructor functions and
//! holds the registry of configured middleware services (custom names bound
//! to a type plus a stored config). Service instances are built once at
//! registration and shared across requests, so stateful middlewares such as
//! `rate_limit` keep their counters while chains are assembled per request.
//! Registration is open so deployments can add their own types next to the
//! built-ins; everything is resolved at startup and read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{ConfigMap, MiddlewareService};
use crate::error::{Error, Result};

use super::{
    AuthMiddleware, CorsMiddleware, DynamicRouteMiddleware, LoggingMiddleware, Middleware,
    RateLimitMiddleware, ReplaceMiddleware, SseMiddleware, WebSocketMiddleware,
};

/// Constructor signature: build a middleware from an optional config map.
pub type Constructor = fn(Option<&ConfigMap>) -> Result<Arc<dyn Middleware>>;

struct ServiceEntry {
    instance: Arc<dyn Middleware>,
    is_global: bool,
}

/// Name-keyed middleware registry.
pub struct MiddlewareFactory {
    constructors: HashMap<String, Constructor>,
    services: HashMap<String, ServiceEntry>,
    /// Global service names in registration order.
    global_order: Vec<String>,
}

impl Default for MiddlewareFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MiddlewareFactory {
    /// Create a factory with every built-in middleware registered.
    pub fn new() -> Self {
        let mut factory = Self {
            constructors: HashMap::new(),
            services: HashMap::new(),
            global_order: Vec::new(),
        };
        factory.register("auth", AuthMiddleware::build);
        factory.register("rate_limit", RateLimitMiddleware::build);
        factory.register("cors", CorsMiddleware::build);
        factory.register("logging", LoggingMiddleware::build);
        factory.register("replace", ReplaceMiddleware::build);
        factory.register("dynamic_route", DynamicRouteMiddleware::build);
        factory.register("sse", SseMiddleware::build);
        factory.register("websocket", WebSocketMiddleware::build);
        factory
    }

    /// Register a middleware type.
    pub fn register(&mut self, name: impl Into<String>, constructor: Constructor) {
        self.constructors.insert(name.into(), constructor);
    }

    /// Instantiate and register the configured middleware services so their
    /// custom names resolve through [`service_instance`](Self::service_instance).
    /// Services of unknown type or with a rejected config are logged and
    /// skipped.
    pub fn register_services(&mut self, services: &[MiddlewareService]) {
        for service in services {
            if !service.enabled {
                continue;
            }
            let Some(constructor) = self.constructors.get(&service.kind) else {
                tracing::warn!(
                    name = %service.name,
                    kind = %service.kind,
                    "Skipping middleware service of unknown type"
                );
                continue;
            };
            match constructor(Some(&service.config)) {
                Ok(instance) => {
                    if service.is_global {
                        self.global_order.push(service.name.clone());
                    }
                    self.services.insert(
                        service.name.clone(),
                        ServiceEntry {
                            instance,
                            is_global: service.is_global,
                        },
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        name = %service.name,
                        kind = %service.kind,
                        error = %e,
                        "Failed to build middleware service"
                    );
                }
            }
        }
    }

    /// The shared instance behind a registered middleware service name.
    pub fn service_instance(&self, name: &str) -> Option<Arc<dyn Middleware>> {
        self.services.get(name).map(|s| Arc::clone(&s.instance))
    }

    /// Shared instances of every service flagged as global, in
    /// registration order.
    pub fn global_service_instances(&self) -> Vec<Arc<dyn Middleware>> {
        self.global_order
            .iter()
            .filter_map(|name| self.services.get(name))
            .filter(|entry| entry.is_global)
            .map(|entry| Arc::clone(&entry.instance))
            .collect()
    }

    /// Build a fresh middleware instance.
    ///
    /// With `config = None` the name is resolved through the middleware
    /// service registry (returning its shared instance). With a config it
    /// is resolved as a plain middleware type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownMiddleware`] for unregistered names, or the
    /// constructor's own error for a rejected config.
    pub fn create(&self, name: &str, config: Option<&ConfigMap>) -> Result<Arc<dyn Middleware>> {
        match config {
            None => self
                .service_instance(name)
                .ok_or_else(|| Error::UnknownMiddleware(name.to_string())),
            Some(config) => {
                let constructor = self
                    .constructors
                    .get(name)
                    .ok_or_else(|| Error::UnknownMiddleware(name.to_string()))?;
                constructor(Some(config))
            }
        }
    }

    /// Registered type names, for startup logging.
    pub fn registered(&self) -> Vec<&str> {
        self.constructors.keys().map(|s| s.as_str()).collect()
    }
}
