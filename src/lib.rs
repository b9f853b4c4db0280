//! crossway - an L7 reverse proxy.
//!
//! Terminates HTTP/1.1 on one or more ports, classifies each request by
//! virtual host and path, runs a per-request middleware chain, and streams
//! the response back over one of three transports: buffered HTTP,
//! flush-on-write SSE, or a hijacked bidirectional WebSocket tunnel.
//! Multi-backend services go through a load balancer with seven selection
//! strategies and an out-of-band health checker.
//!
//! # Request flow
//!
//! ```text
//! Listener -> Dispatcher -> Matcher -> Middleware Chain
//!          -> (Load Balancer) -> HTTP | SSE | WebSocket -> Backend
//! ```

pub mod config;
pub mod error;
pub mod lb;
pub mod matcher;
pub mod middleware;
pub mod proxy;
pub mod server;

pub use config::Config;
pub use error::{Error, Result};
pub use proxy::ProxyHandler;
pub use server::Server;
