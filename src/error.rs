//! Typed error handling for the proxy core.
//!
//! Request-path failures are recovered locally wherever possible (the matcher
//! returns an `Option`, the balancer returns an error value); this enum exists
//! so callers can map each failure onto the right HTTP status without string
//! matching.

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Proxy errors with structured context.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration error (bad YAML, unknown strategy, empty backends).
    /// Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// No host rule matched the request. Surfaced as 502.
    #[error("no matching rule found for host: {host}, path: {path}")]
    NoRoute { host: String, path: String },

    /// Every backend of a load-balanced service is inactive. Surfaced as 503.
    #[error("no active backends available")]
    NoActiveBackends,

    /// Middleware name is not registered with the factory.
    #[error("unknown middleware: {0}")]
    UnknownMiddleware(String),

    /// A middleware constructor rejected its configuration.
    #[error("invalid config for middleware '{name}': {reason}")]
    MiddlewareConfig { name: String, reason: String },

    /// Load balancer strategy name is not one of the supported seven.
    #[error("unsupported load balancer strategy: {0}")]
    UnknownStrategy(String),

    /// A service or backend URL failed to parse.
    #[error("invalid upstream URL '{url}': {reason}")]
    InvalidUpstream { url: String, reason: String },

    /// The upstream round trip failed. Surfaced as 502.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    /// WebSocket upgrade handshake with the upstream failed.
    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    /// IO error with context.
    #[error("IO error in {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a middleware config error.
    pub fn middleware_config(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MiddlewareConfig {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid-upstream error.
    pub fn invalid_upstream(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::InvalidUpstream {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}
