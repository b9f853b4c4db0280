//! Configuration types for the proxy.
//!
//! This module provides configuration structs for loading and validating
//! proxy settings from YAML files. It includes:
//!
//! - [`Config`] - Root configuration struct
//! - [`HostRule`] / [`RouteRule`] - host- and path-keyed routing rules
//! - [`Service`] - upstream origin definitions
//! - [`LoadBalancerConfig`] - backend pools with health checks
//!
//! A `config_dir` entry merges sibling `.yaml` files into the main file:
//! rule and middleware lists append, services overlay by name.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Free-form middleware configuration map (YAML mapping with string keys).
pub type ConfigMap = serde_json::Map<String, serde_json::Value>;

/// Result of configuration validation.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Non-fatal warnings that should be logged but don't prevent operation.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if there are any warnings.
    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Directory of additional `.yaml` files to merge, relative to the main file.
    #[serde(default)]
    pub config_dir: Option<String>,
    #[serde(default)]
    pub host_rules: Vec<HostRule>,
    /// Legacy top-level route rules; merged into every host rule at load time.
    #[serde(default)]
    pub route_rules: Vec<RouteRule>,
    #[serde(default)]
    pub services: HashMap<String, Service>,
    #[serde(default)]
    pub middlewares: Vec<MiddlewareSpec>,
    #[serde(default)]
    pub middleware_services: Vec<MiddlewareService>,
    #[serde(default)]
    pub advanced: AdvancedConfig,
}

/// Host matching rule. `pattern` is an exact hostname, `*.domain`, or `^regex$`.
#[derive(Debug, Clone, Deserialize)]
pub struct HostRule {
    pub pattern: String,
    /// Listener port this rule is bound to; 0 means any listener.
    #[serde(default)]
    pub port: u16,
    pub target: String,
    #[serde(default)]
    pub middlewares: Vec<String>,
    #[serde(default)]
    pub route_rules: Vec<RouteRule>,
}

/// Path matching rule. `pattern` is an exact path, `prefix/*`, or `^regex$`.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteRule {
    pub pattern: String,
    pub target: String,
    #[serde(default)]
    pub middlewares: Vec<String>,
}

/// Upstream service definition.
#[derive(Debug, Clone, Deserialize)]
pub struct Service {
    /// Default/fallback origin, e.g. `http://127.0.0.1:9001`.
    pub url: String,
    /// Overrides the `Host` header sent upstream.
    #[serde(default)]
    pub proxy_host: Option<String>,
    #[serde(default)]
    pub load_balancer: Option<LoadBalancerConfig>,
}

/// Globally-configured middleware with its own settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MiddlewareSpec {
    pub name: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub config: ConfigMap,
}

/// A named middleware instance that rules can mount by its custom name.
#[derive(Debug, Clone, Deserialize)]
pub struct MiddlewareService {
    /// Custom identifier used in `middlewares:` lists.
    pub name: String,
    /// Underlying middleware type (`auth`, `rate_limit`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub enabled: bool,
    /// Load on every request even when no rule names it.
    #[serde(default)]
    pub is_global: bool,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub description: Option<String>,
}

/// Load balancer configuration for a service.
#[derive(Debug, Clone, Deserialize)]
pub struct LoadBalancerConfig {
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub session_affinity: Option<SessionAffinityConfig>,
}

fn default_strategy() -> String {
    "round_robin".to_string()
}

/// One backend of a load-balanced pool.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
}

fn default_weight() -> u32 {
    1
}

/// Health check settings, per-backend or balancer-wide.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_health_path")]
    pub path: String,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
            path: default_health_path(),
        }
    }
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    5
}

fn default_health_path() -> String {
    "/health".to_string()
}

/// Cookie-anchored backend stickiness.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionAffinityConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_affinity_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_affinity_cookie")]
    pub cookie_name: String,
}

fn default_affinity_timeout() -> u64 {
    1800
}

fn default_affinity_cookie() -> String {
    "LB_SESSION".to_string()
}

/// Advanced settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AdvancedConfig {
    /// Default listener port for host rules with port 0.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub timeout: TimeoutConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            timeout: TimeoutConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

fn default_port() -> u16 {
    80
}

/// Timeouts in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_read_timeout")]
    pub read: u64,
    #[serde(default = "default_write_timeout")]
    pub write: u64,
    #[serde(default = "default_dial_timeout")]
    pub dial: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read: default_read_timeout(),
            write: default_write_timeout(),
            dial: default_dial_timeout(),
        }
    }
}

fn default_read_timeout() -> u64 {
    30
}

fn default_write_timeout() -> u64 {
    30
}

fn default_dial_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
    /// Answer 403 to any path containing a dot-prefixed segment.
    #[serde(default)]
    pub deny_hidden_files: bool,
    /// Skip upstream TLS certificate verification for `wss://` dials.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

impl Config {
    /// Load configuration from a YAML file, merging `config_dir` siblings
    /// when configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the main file cannot be read or parsed. Extra
    /// files under `config_dir` that fail to parse are logged and skipped.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::load_single(path)?;

        if let Some(dir) = config.config_dir.clone() {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            let full_dir = base.join(&dir);
            if full_dir.is_dir() {
                let mut entries: Vec<_> = fs::read_dir(&full_dir)
                    .with_context(|| format!("failed to read config dir: {}", full_dir.display()))?
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.extension().is_some_and(|ext| ext == "yaml"))
                    .collect();
                entries.sort();

                for file in entries {
                    match Self::load_single(&file) {
                        Ok(partial) => {
                            tracing::info!(file = %file.display(), "Merged config file");
                            config.merge(partial);
                        }
                        Err(e) => {
                            tracing::warn!(file = %file.display(), error = %e, "Skipping unreadable config file");
                        }
                    }
                }
            } else {
                tracing::warn!(dir = %full_dir.display(), "Config directory not found, using main file only");
            }
        }

        // The legacy top-level route list applies to every host rule.
        if !config.route_rules.is_empty() {
            let legacy = config.route_rules.clone();
            for rule in &mut config.host_rules {
                rule.route_rules.extend(legacy.iter().cloned());
            }
        }

        Ok(config)
    }

    /// Load a single YAML file without merging.
    fn load_single(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Merge another config into this one: lists append, services overlay by name.
    fn merge(&mut self, other: Config) {
        self.host_rules.extend(other.host_rules);
        self.route_rules.extend(other.route_rules);
        self.middlewares.extend(other.middlewares);
        self.middleware_services.extend(other.middleware_services);
        for (name, service) in other.services {
            self.services.insert(name, service);
        }
    }

    /// Validate the configuration.
    ///
    /// Returns a `ValidationResult` containing any non-fatal warnings.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration cannot produce a working
    /// proxy: unknown balancer strategy, balancer without backends, backend
    /// with an empty URL, enabled health check with zero interval/timeout,
    /// or enabled session affinity without a cookie name.
    pub fn validate(&self) -> Result<ValidationResult> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if self.host_rules.is_empty() {
            warnings.push("no host rules configured; all requests will be rejected".to_string());
        }

        for rule in &self.host_rules {
            if rule.pattern.is_empty() {
                errors.push("host rule pattern cannot be empty".to_string());
            }
            if !self.services.contains_key(&rule.target) {
                warnings.push(format!(
                    "host rule '{}' targets undefined service '{}'",
                    rule.pattern, rule.target
                ));
            }
            for route in &rule.route_rules {
                if !self.services.contains_key(&route.target) {
                    warnings.push(format!(
                        "route rule '{}' targets undefined service '{}'",
                        route.pattern, route.target
                    ));
                }
            }
        }

        for (name, service) in &self.services {
            if url::Url::parse(&service.url).is_err() {
                errors.push(format!(
                    "service '{}' has an unparseable URL: '{}'",
                    name, service.url
                ));
            }

            if let Some(lb) = &service.load_balancer {
                if !crate::lb::Strategy::is_supported(&lb.strategy) {
                    errors.push(format!(
                        "service '{}': unsupported load balancer strategy '{}'",
                        name, lb.strategy
                    ));
                }
                if lb.backends.is_empty() {
                    errors.push(format!(
                        "service '{}': load balancer requires at least one backend",
                        name
                    ));
                }
                for (i, backend) in lb.backends.iter().enumerate() {
                    if backend.url.is_empty() {
                        errors.push(format!("service '{}': backend {} has no URL", name, i));
                    }
                }
                if lb.health_check.enabled
                    && (lb.health_check.interval_secs == 0 || lb.health_check.timeout_secs == 0)
                {
                    errors.push(format!(
                        "service '{}': health check interval and timeout must be greater than 0",
                        name
                    ));
                }
                if let Some(affinity) = &lb.session_affinity {
                    if affinity.enabled && affinity.cookie_name.is_empty() {
                        errors.push(format!(
                            "service '{}': session affinity cookie name is required",
                            name
                        ));
                    }
                }
            }
        }

        if !errors.is_empty() {
            anyhow::bail!(
                "configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }

        Ok(ValidationResult { warnings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, content: &str) {
        let mut f = fs::File::create(dir.join(name)).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    const BASE: &str = r#"
host_rules:
  - pattern: "api.example.com"
    port: 8080
    target: "api"
services:
  api:
    url: "http://127.0.0.1:9001"
"#;

    #[test]
    fn test_load_single_file() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "config.yaml", BASE);

        let config = Config::load(dir.path().join("config.yaml")).unwrap();
        assert_eq!(config.host_rules.len(), 1);
        assert_eq!(config.host_rules[0].pattern, "api.example.com");
        assert_eq!(config.host_rules[0].port, 8080);
        assert_eq!(config.services["api"].url, "http://127.0.0.1:9001");
    }

    #[test]
    fn test_load_merges_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "config.yaml",
            &format!("config_dir: conf.d\n{BASE}"),
        );
        fs::create_dir(dir.path().join("conf.d")).unwrap();
        write_file(
            &dir.path().join("conf.d"),
            "extra.yaml",
            r#"
host_rules:
  - pattern: "*.example.com"
    target: "web"
services:
  web:
    url: "http://127.0.0.1:9002"
  api:
    url: "http://127.0.0.1:9099"
"#,
        );

        let config = Config::load(dir.path().join("config.yaml")).unwrap();
        assert_eq!(config.host_rules.len(), 2);
        // Services overlay by name: the later file wins.
        assert_eq!(config.services["api"].url, "http://127.0.0.1:9099");
        assert_eq!(config.services["web"].url, "http://127.0.0.1:9002");
    }

    #[test]
    fn test_legacy_route_rules_merged_into_host_rules() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "config.yaml",
            &format!("{BASE}\nroute_rules:\n  - pattern: \"/admin/*\"\n    target: \"api\"\n"),
        );

        let config = Config::load(dir.path().join("config.yaml")).unwrap();
        assert_eq!(config.host_rules[0].route_rules.len(), 1);
        assert_eq!(config.host_rules[0].route_rules[0].pattern, "/admin/*");
    }

    #[test]
    fn test_validate_rejects_unknown_strategy() {
        let config: Config = serde_yaml::from_str(
            r#"
services:
  api:
    url: "http://127.0.0.1:9001"
    load_balancer:
      strategy: "fastest_ever"
      backends:
        - url: "http://127.0.0.1:9001"
"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("unsupported load balancer strategy"), "{err}");
    }

    #[test]
    fn test_validate_rejects_empty_backends() {
        let config: Config = serde_yaml::from_str(
            r#"
services:
  api:
    url: "http://127.0.0.1:9001"
    load_balancer:
      strategy: "round_robin"
      backends: []
"#,
        )
        .unwrap();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("at least one backend"), "{err}");
    }

    #[test]
    fn test_validate_warns_on_undefined_target() {
        let config: Config = serde_yaml::from_str(
            r#"
host_rules:
  - pattern: "example.com"
    target: "missing"
services: {}
"#,
        )
        .unwrap();

        let result = config.validate().unwrap();
        assert!(result.has_warnings());
        assert!(result.warnings.iter().any(|w| w.contains("missing")));
    }

    #[test]
    fn test_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.advanced.port, 80);
        assert_eq!(config.advanced.timeout.dial, 10);
        assert!(!config.advanced.security.deny_hidden_files);

        let hc = HealthCheckConfig::default();
        assert_eq!(hc.interval_secs, 30);
        assert_eq!(hc.timeout_secs, 5);
        assert_eq!(hc.path, "/health");
    }
}
