//! Request routing: `(host, path, listener port)` to target service.
//!
//! Resolution is two-staged. The host stage picks a [`HostRuleEntry`] by
//! precedence (exact, then `*.domain` wildcard, then anchored regex; first
//! declared rule wins inside a class). The path stage picks a route rule
//! inside the matched host rule with the same precedence ladder, falling
//! back to the host rule's own target when no route matches.
//!
//! A host rule with a nonzero `port` only applies to the listener bound to
//! that port; port 0 applies everywhere.

mod host;
mod route;

pub use host::{strip_port, HostPattern};
pub use route::PathPattern;

use crate::config::Config;
use crate::error::Result;

/// A compiled host rule.
#[derive(Debug)]
pub struct HostRuleEntry {
    pub pattern: HostPattern,
    pub port: u16,
    pub target: String,
    pub middlewares: Vec<String>,
    pub routes: Vec<RouteRuleEntry>,
}

/// A compiled route rule nested in a host rule.
#[derive(Debug)]
pub struct RouteRuleEntry {
    pub pattern: PathPattern,
    pub target: String,
    pub middlewares: Vec<String>,
}

/// The outcome of a successful resolution.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub host_rule: &'a HostRuleEntry,
    pub route_rule: Option<&'a RouteRuleEntry>,
}

impl RouteMatch<'_> {
    /// The service name this match dispatches to.
    pub fn target(&self) -> &str {
        match self.route_rule {
            Some(route) => &route.target,
            None => &self.host_rule.target,
        }
    }
}

/// Immutable routing table compiled from the configuration at startup.
#[derive(Debug, Default)]
pub struct RoutingTable {
    rules: Vec<HostRuleEntry>,
}

impl RoutingTable {
    /// Compile the table from configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for any invalid regex pattern.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut rules = Vec::with_capacity(config.host_rules.len());
        for rule in &config.host_rules {
            let mut routes = Vec::with_capacity(rule.route_rules.len());
            for route in &rule.route_rules {
                routes.push(RouteRuleEntry {
                    pattern: PathPattern::parse(&route.pattern)?,
                    target: route.target.clone(),
                    middlewares: route.middlewares.clone(),
                });
            }
            rules.push(HostRuleEntry {
                pattern: HostPattern::parse(&rule.pattern)?,
                port: rule.port,
                target: rule.target.clone(),
                middlewares: rule.middlewares.clone(),
                routes,
            });
        }
        Ok(Self { rules })
    }

    /// Resolve a request to a host rule and optional route rule.
    ///
    /// `host` may still carry a `:port` suffix; it is stripped here.
    /// Returns `None` when no host rule matches, which callers surface
    /// as 502.
    pub fn resolve(&self, host: &str, path: &str, listener_port: u16) -> Option<RouteMatch<'_>> {
        let host = strip_port(host);

        let host_rule = self.match_host(host, listener_port)?;
        let route_rule = Self::match_route(host_rule, path);

        Some(RouteMatch {
            host_rule,
            route_rule,
        })
    }

    /// Number of compiled host rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the table holds no rules at all.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn match_host(&self, host: &str, listener_port: u16) -> Option<&HostRuleEntry> {
        for rank in 0..=2 {
            for rule in &self.rules {
                if rule.pattern.rank() != rank {
                    continue;
                }
                if rule.port != 0 && rule.port != listener_port {
                    continue;
                }
                if rule.pattern.matches(host) {
                    return Some(rule);
                }
            }
        }
        None
    }

    fn match_route<'a>(rule: &'a HostRuleEntry, path: &str) -> Option<&'a RouteRuleEntry> {
        for rank in 0..=2 {
            for route in &rule.routes {
                if route.pattern.rank() == rank && route.pattern.matches(path) {
                    return Some(route);
                }
            }
        }
        None
    }
}
