//! Middleware chain.
//!
//! A middleware wraps everything below it in the chain. It can inspect the
//! request, call [`Next::run`] to continue, change the result on the way
//! back, or return without calling `next` to short-circuit.
//!
//! Middlewares are ordered by descending priority, ties in registration
//! order. The chain is built right to left: the lowest-priority middleware
//! wraps the terminal endpoint first, so the highest-priority middleware
//! ends up outermost.
//!
//! ```text
//! Recovery(1000) → Logging(900) → Security(100) → custom(50) → terminal
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use parley_framework::middleware::{middleware_fn, Next};
//!
//! let maintenance = middleware_fn("maintenance", 950, |ctx, next: Next| async move {
//!     if ctx.has_role("admin") {
//!         next.run(ctx).await
//!     } else {
//!         Ok(Response::message("Back soon."))
//!     }
//! });
//! router.register_middleware(Arc::new(maintenance))?;
//! ```

mod builtin;
mod guard;

pub use builtin::{
    ContextMiddleware, DEADLINE_EXPIRED_MESSAGE, INTERNAL_ERROR_MESSAGE, LoggingMiddleware,
    MetricsMiddleware, RecoveryMiddleware, RequestDeadline,
};
pub use guard::{
    AUTH_REQUIRED_MESSAGE, AuthMiddleware, RateLimitMiddleware, SecurityMiddleware,
    ValidationMiddleware,
};

use std::cmp::Reverse;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::trace;

use crate::handler::{BoxedHandler, HandlerResult, call_guarded};
use parley_core::RequestContext;

/// Something that turns a request into a [`HandlerResult`].
pub trait Endpoint: Send + Sync {
    fn call(&self, ctx: Arc<RequestContext>) -> BoxFuture<'static, HandlerResult>;
}

/// The rest of the chain, as seen from one middleware.
#[derive(Clone)]
pub struct Next {
    inner: Arc<dyn Endpoint>,
}

impl Next {
    pub fn new<E: Endpoint + 'static>(endpoint: E) -> Self {
        Self {
            inner: Arc::new(endpoint),
        }
    }

    /// A terminal endpoint that calls `handler` with panics contained.
    pub fn handler(handler: BoxedHandler) -> Self {
        Self::new(HandlerEndpoint { handler })
    }

    /// A terminal endpoint from a closure.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self::new(FnEndpoint { f })
    }

    /// Continues the chain.
    pub async fn run(self, ctx: Arc<RequestContext>) -> HandlerResult {
        self.inner.call(ctx).await
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").finish_non_exhaustive()
    }
}

struct HandlerEndpoint {
    handler: BoxedHandler,
}

impl Endpoint for HandlerEndpoint {
    fn call(&self, ctx: Arc<RequestContext>) -> BoxFuture<'static, HandlerResult> {
        let handler = Arc::clone(&self.handler);
        Box::pin(async move { call_guarded(handler.as_ref(), ctx).await })
    }
}

struct FnEndpoint<F> {
    f: F,
}

impl<F, Fut> Endpoint for FnEndpoint<F>
where
    F: Fn(Arc<RequestContext>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, ctx: Arc<RequestContext>) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.f)(ctx))
    }
}

/// An interceptor around handler execution.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Higher priorities run further out.
    fn priority(&self) -> i32;

    async fn process(&self, ctx: Arc<RequestContext>, next: Next) -> HandlerResult;
}

/// A type-erased middleware.
pub type BoxedMiddleware = Arc<dyn Middleware>;

/// Sorts by descending priority, keeping registration order on ties.
pub fn sort_by_priority(middlewares: &mut [BoxedMiddleware]) {
    middlewares.sort_by_key(|m| Reverse(m.priority()));
}

struct Layered {
    middleware: BoxedMiddleware,
    next: Next,
}

impl Endpoint for Layered {
    fn call(&self, ctx: Arc<RequestContext>) -> BoxFuture<'static, HandlerResult> {
        let middleware = Arc::clone(&self.middleware);
        let next = self.next.clone();
        Box::pin(async move {
            trace!(middleware = middleware.name(), "Entering middleware");
            let result = middleware.process(ctx, next).await;
            trace!(middleware = middleware.name(), "Leaving middleware");
            result
        })
    }
}

/// Composes `middlewares` (outermost first) around `terminal`.
pub fn chain(middlewares: &[BoxedMiddleware], terminal: Next) -> Next {
    middlewares.iter().rev().fold(terminal, |next, middleware| {
        Next::new(Layered {
            middleware: Arc::clone(middleware),
            next,
        })
    })
}

// =============================================================================
// Function adapter
// =============================================================================

/// A middleware backed by a closure. Built with [`middleware_fn`].
pub struct FnMiddleware<F> {
    name: String,
    priority: i32,
    f: F,
}

/// Turns a closure into a [`Middleware`].
pub fn middleware_fn<F, Fut>(name: impl Into<String>, priority: i32, f: F) -> FnMiddleware<F>
where
    F: Fn(Arc<RequestContext>, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnMiddleware {
        name: name.into(),
        priority,
        f,
    }
}

#[async_trait]
impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: Fn(Arc<RequestContext>, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn process(&self, ctx: Arc<RequestContext>, next: Next) -> HandlerResult {
        (self.f)(ctx, next).await
    }
}

impl<F> fmt::Debug for FnMiddleware<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnMiddleware")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use parley_core::{InteractionKind, Response};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> Arc<RequestContext> {
        Arc::new(
            RequestContext::builder(InteractionKind::Command)
                .user(1)
                .text("/ping")
                .build(),
        )
    }

    fn recording(name: &'static str, priority: i32, log: Arc<Mutex<Vec<String>>>) -> BoxedMiddleware {
        Arc::new(middleware_fn(name, priority, move |ctx, next: Next| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(format!("{name}:before"));
                let result = next.run(ctx).await;
                log.lock().push(format!("{name}:after"));
                result
            }
        }))
    }

    fn counting_terminal(counter: Arc<AtomicUsize>) -> Next {
        Next::from_fn(move |_ctx| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Response::message("pong"))
            }
        })
    }

    #[tokio::test]
    async fn test_highest_priority_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut middlewares = vec![
            recording("low", 10, Arc::clone(&log)),
            recording("high", 90, Arc::clone(&log)),
            recording("mid", 50, Arc::clone(&log)),
        ];
        sort_by_priority(&mut middlewares);

        let counter = Arc::new(AtomicUsize::new(0));
        let result = chain(&middlewares, counting_terminal(Arc::clone(&counter)))
            .run(ctx())
            .await;

        assert_eq!(result, Ok(Response::message("pong")));
        assert_eq!(
            *log.lock(),
            [
                "high:before",
                "mid:before",
                "low:before",
                "low:after",
                "mid:after",
                "high:after"
            ]
        );
    }

    #[tokio::test]
    async fn test_ties_keep_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut middlewares = vec![
            recording("first", 50, Arc::clone(&log)),
            recording("second", 50, Arc::clone(&log)),
            recording("third", 50, Arc::clone(&log)),
        ];
        sort_by_priority(&mut middlewares);

        let names: Vec<_> = middlewares.iter().map(|m| m.name().to_string()).collect();
        assert_eq!(names, ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_inner_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let deny: BoxedMiddleware = Arc::new(middleware_fn("deny", 80, |_ctx, _next| async {
            Ok(Response::message("denied"))
        }));
        let mut middlewares = vec![
            recording("outer", 100, Arc::clone(&log)),
            deny,
            recording("inner", 10, Arc::clone(&log)),
        ];
        sort_by_priority(&mut middlewares);

        let counter = Arc::new(AtomicUsize::new(0));
        let result = chain(&middlewares, counting_terminal(Arc::clone(&counter)))
            .run(ctx())
            .await;

        assert_eq!(result, Ok(Response::message("denied")));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(*log.lock(), ["outer:before", "outer:after"]);
    }

    #[tokio::test]
    async fn test_middleware_can_rewrite_result() {
        let shout: BoxedMiddleware = Arc::new(middleware_fn("shout", 50, |ctx, next: Next| async move {
            next.run(ctx)
                .await
                .map(|r| Response::message(r.text().unwrap_or_default().to_uppercase()))
        }));

        let counter = Arc::new(AtomicUsize::new(0));
        let result = chain(&[shout], counting_terminal(counter)).run(ctx()).await;
        assert_eq!(result, Ok(Response::message("PONG")));
    }

    #[tokio::test]
    async fn test_empty_chain_is_terminal() {
        let counter = Arc::new(AtomicUsize::new(0));
        let result = chain(&[], counting_terminal(Arc::clone(&counter)))
            .run(ctx())
            .await;

        assert!(result.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
