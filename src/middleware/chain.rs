//! Ordered middleware execution with short-circuit semantics.

use std::sync::Arc;

use tracing::debug;

use super::{Middleware, RequestContext};

/// An ordered sequence of middlewares, assembled per request.
///
/// `add` refuses duplicates by name, so a name mounted at a higher scope
/// (route > host > global) is never executed twice.
#[derive(Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware unless one with the same name is already present.
    pub fn add(&mut self, middleware: Arc<dyn Middleware>) {
        if self.contains(middleware.name()) {
            debug!(name = middleware.name(), "Skipping duplicate middleware");
            return;
        }
        self.middlewares.push(middleware);
    }

    /// Whether a middleware with the given name is in the chain.
    pub fn contains(&self, name: &str) -> bool {
        self.middlewares.iter().any(|m| m.name() == name)
    }

    /// Execute each middleware in order, stopping at the first `false`.
    pub async fn execute(&self, ctx: &mut RequestContext) -> bool {
        for middleware in &self.middlewares {
            if !middleware.handle(ctx).await {
                debug!(name = middleware.name(), "Middleware interrupted the chain");
                return false;
            }
        }
        true
    }

    /// Names in execution order.
    pub fn names(&self) -> Vec<&str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::testutil::ctx;
    use async_trait::async_trait;
    use hyper::{Method, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Recorder {
        name: String,
        calls: Arc<AtomicUsize>,
        pass: bool,
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(&self, ctx: &mut RequestContext) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.pass {
                ctx.reject(StatusCode::FORBIDDEN, "denied");
            }
            self.pass
        }
    }

    fn recorder(name: &str, calls: Arc<AtomicUsize>, pass: bool) -> Arc<dyn Middleware> {
        Arc::new(Recorder {
            name: name.to_string(),
            calls,
            pass,
        })
    }

    #[tokio::test]
    async fn test_executes_in_order_and_short_circuits() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let third = Arc::new(AtomicUsize::new(0));

        let mut chain = MiddlewareChain::new();
        chain.add(recorder("first", first.clone(), true));
        chain.add(recorder("second", second.clone(), false));
        chain.add(recorder("third", third.clone(), true));

        let mut c = ctx(Method::GET, "/", &[]);
        assert!(!chain.execute(&mut c).await);

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(third.load(Ordering::SeqCst), 0);
        assert_eq!(c.status, Some(StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn test_duplicate_names_are_dropped() {
        let calls = Arc::new(AtomicUsize::new(0));

        let mut chain = MiddlewareChain::new();
        chain.add(recorder("auth", calls.clone(), true));
        chain.add(recorder("auth", calls.clone(), true));
        chain.add(recorder("cors", calls.clone(), true));

        assert_eq!(chain.len(), 2);
        assert_eq!(chain.names(), vec!["auth", "cors"]);

        let mut c = ctx(Method::GET, "/", &[]);
        assert!(chain.execute(&mut c).await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_chain_passes() {
        let chain = MiddlewareChain::new();
        let mut c = ctx(Method::GET, "/", &[]);
        assert!(chain.execute(&mut c).await);
    }
}
