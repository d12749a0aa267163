//! Observational built-ins: recovery, logging, metrics and deadlines.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{error, info};

use super::{Middleware, Next};
use crate::error::HandlerFault;
use crate::handler::HandlerResult;
use parley_core::{Metrics, RequestContext, Response};

/// The message users see when a handler fails.
pub const INTERNAL_ERROR_MESSAGE: &str =
    "Something went wrong while processing your request. Please try again later.";

/// The message users see when a request arrives past its deadline.
pub const DEADLINE_EXPIRED_MESSAGE: &str = "Request processing time expired. Please try again.";

// ─── Recovery ─────────────────────────────────────────────────────────────────

/// Converts handler faults below it into [`INTERNAL_ERROR_MESSAGE`].
///
/// Catches both `HandlerFault` results and panics raised by inner
/// middlewares. Never returns `Err`.
#[derive(Debug, Clone)]
pub struct RecoveryMiddleware {
    priority: i32,
    message: String,
}

impl RecoveryMiddleware {
    pub fn new(priority: i32) -> Self {
        Self {
            priority,
            message: INTERNAL_ERROR_MESSAGE.to_string(),
        }
    }

    /// Replaces the generic message.
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

#[async_trait]
impl Middleware for RecoveryMiddleware {
    fn name(&self) -> &str {
        "recovery"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn process(&self, ctx: Arc<RequestContext>, next: Next) -> HandlerResult {
        let outcome = AssertUnwindSafe(next.run(Arc::clone(&ctx)))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(HandlerFault::from_panic(payload)));

        match outcome {
            Ok(response) => Ok(response),
            Err(fault) => {
                error!(
                    user_id = ctx.user_id(),
                    chat_id = ctx.chat_id(),
                    text = ctx.text(),
                    error = %fault,
                    "Recovered from handler fault"
                );
                Ok(Response::message(self.message.clone()))
            }
        }
    }
}

// ─── Logging ──────────────────────────────────────────────────────────────────

/// Logs a summary before and after the rest of the chain.
#[derive(Debug, Clone)]
pub struct LoggingMiddleware {
    priority: i32,
}

impl LoggingMiddleware {
    pub fn new(priority: i32) -> Self {
        Self { priority }
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn process(&self, ctx: Arc<RequestContext>, next: Next) -> HandlerResult {
        let start = Instant::now();
        info!(
            user_id = ctx.user_id(),
            chat_id = ctx.chat_id(),
            kind = %ctx.kind(),
            source = ctx.source(),
            text = ctx.match_text(),
            "Request received"
        );

        let result = next.run(Arc::clone(&ctx)).await;

        let outcome = match &result {
            Ok(response) => response.kind(),
            Err(_) => "fault",
        };
        info!(
            user_id = ctx.user_id(),
            chat_id = ctx.chat_id(),
            outcome,
            duration_ms = start.elapsed().as_millis() as u64,
            "Request processed"
        );

        result
    }
}

// ─── Metrics ──────────────────────────────────────────────────────────────────

/// Counts requests and records their duration, whatever the outcome.
///
/// Reports `requests.total` and `requests.duration`, tagged with the
/// interaction kind and the outcome.
pub struct MetricsMiddleware {
    priority: i32,
    metrics: Arc<dyn Metrics>,
}

impl MetricsMiddleware {
    pub fn new(metrics: Arc<dyn Metrics>, priority: i32) -> Self {
        Self { priority, metrics }
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &str {
        "metrics"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn process(&self, ctx: Arc<RequestContext>, next: Next) -> HandlerResult {
        let start = Instant::now();
        let kind = ctx.kind();

        let result = next.run(ctx).await;

        let outcome = if result.is_ok() { "ok" } else { "fault" };
        let tags = [("type", kind.as_str()), ("outcome", outcome)];
        self.metrics.increment("requests.total", &tags);
        self.metrics
            .timing("requests.duration", start.elapsed(), &tags);

        result
    }
}

impl std::fmt::Debug for MetricsMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsMiddleware")
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

// ─── Context ──────────────────────────────────────────────────────────────────

/// The deadline a request must finish by, stored in the context state.
///
/// Handlers are expected to check it cooperatively; nothing preempts them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestDeadline(pub Instant);

impl RequestDeadline {
    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.0
    }
}

/// Derives a [`RequestDeadline`] and rejects requests already past it.
///
/// The deadline is the earlier of the adapter's deadline and the configured
/// budget, if any.
#[derive(Debug, Clone)]
pub struct ContextMiddleware {
    priority: i32,
    budget: Option<Duration>,
}

impl ContextMiddleware {
    pub fn new(priority: i32) -> Self {
        Self {
            priority,
            budget: None,
        }
    }

    /// Bounds every request to `budget` from the moment it enters.
    pub fn timeout(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }

    fn derive(&self, ctx: &RequestContext) -> Option<RequestDeadline> {
        let budget = self.budget.map(|b| Instant::now() + b);
        match (ctx.deadline(), budget) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
        .map(RequestDeadline)
    }
}

#[async_trait]
impl Middleware for ContextMiddleware {
    fn name(&self) -> &str {
        "context"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn process(&self, ctx: Arc<RequestContext>, next: Next) -> HandlerResult {
        if let Some(deadline) = self.derive(&ctx) {
            if deadline.is_expired() {
                info!(
                    user_id = ctx.user_id(),
                    chat_id = ctx.chat_id(),
                    "Request deadline already expired"
                );
                return Ok(Response::message(DEADLINE_EXPIRED_MESSAGE));
            }
            ctx.set_state(deadline);
        }

        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::chain;
    use parking_lot::Mutex;
    use parley_core::{InteractionKind, Tags};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> Arc<RequestContext> {
        Arc::new(
            RequestContext::builder(InteractionKind::Command)
                .user(3)
                .chat(4)
                .text("/go")
                .build(),
        )
    }

    #[derive(Default)]
    struct CountingMetrics {
        counters: Mutex<HashMap<String, usize>>,
        timings: AtomicUsize,
    }

    impl Metrics for CountingMetrics {
        fn increment(&self, name: &str, tags: Tags<'_>) {
            let key = format!(
                "{name}{}",
                tags.iter()
                    .map(|(k, v)| format!(",{k}={v}"))
                    .collect::<String>()
            );
            *self.counters.lock().entry(key).or_default() += 1;
        }

        fn timing(&self, _name: &str, _duration: Duration, _tags: Tags<'_>) {
            self.timings.fetch_add(1, Ordering::SeqCst);
        }

        fn gauge(&self, _name: &str, _value: f64, _tags: Tags<'_>) {}
    }

    #[tokio::test]
    async fn test_recovery_converts_panic() {
        let terminal = Next::handler(crate::handler::into_handler(|_ctx| async {
            if true {
                panic!("index out of bounds");
            }
            "unreachable"
        }));
        let recovery: Arc<dyn Middleware> = Arc::new(RecoveryMiddleware::new(1000));

        let result = chain(&[recovery], terminal).run(ctx()).await;
        assert_eq!(result, Ok(Response::message(INTERNAL_ERROR_MESSAGE)));
    }

    #[tokio::test]
    async fn test_recovery_converts_failed_result() {
        let terminal = Next::from_fn(|_ctx| async {
            Err(HandlerFault::Failed("db down".to_string()))
        });
        let recovery: Arc<dyn Middleware> =
            Arc::new(RecoveryMiddleware::new(1000).message("Oops"));

        let result = chain(&[recovery], terminal).run(ctx()).await;
        assert_eq!(result, Ok(Response::message("Oops")));
    }

    #[tokio::test]
    async fn test_recovery_catches_inner_middleware_panic() {
        let faulty: Arc<dyn Middleware> =
            Arc::new(crate::middleware::middleware_fn("faulty", 10, |_ctx, _next| async {
                if true {
                    panic!("middleware bug");
                }
                Ok(Response::Silent)
            }));
        let recovery: Arc<dyn Middleware> = Arc::new(RecoveryMiddleware::new(1000));
        let terminal = Next::from_fn(|_ctx| async { Ok(Response::Silent) });

        let result = chain(&[recovery, faulty], terminal).run(ctx()).await;
        assert_eq!(result, Ok(Response::message(INTERNAL_ERROR_MESSAGE)));
    }

    #[tokio::test]
    async fn test_logging_passes_result_through() {
        let logging: Arc<dyn Middleware> = Arc::new(LoggingMiddleware::new(900));
        let terminal = Next::from_fn(|_ctx| async { Ok(Response::message("ok")) });

        let result = chain(&[logging], terminal).run(ctx()).await;
        assert_eq!(result, Ok(Response::message("ok")));
    }

    #[tokio::test]
    async fn test_metrics_record_every_outcome() {
        let metrics = Arc::new(CountingMetrics::default());
        let middleware: Arc<dyn Middleware> = Arc::new(MetricsMiddleware::new(
            Arc::clone(&metrics) as Arc<dyn Metrics>,
            800,
        ));

        let ok = Next::from_fn(|_ctx| async { Ok(Response::Silent) });
        let fail = Next::from_fn(|_ctx| async { Err(HandlerFault::Failed("x".into())) });

        let _ = chain(&[Arc::clone(&middleware)], ok).run(ctx()).await;
        let result = chain(&[middleware], fail).run(ctx()).await;
        assert!(result.is_err());

        let counters = metrics.counters.lock();
        assert_eq!(counters["requests.total,type=command,outcome=ok"], 1);
        assert_eq!(counters["requests.total,type=command,outcome=fault"], 1);
        assert_eq!(metrics.timings.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_rejects_expired_deadline() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let terminal = Next::from_fn(move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Response::Silent) }
        });
        let context: Arc<dyn Middleware> = Arc::new(ContextMiddleware::new(700));

        let expired = Instant::now();
        tokio::time::advance(Duration::from_millis(5)).await;
        let ctx = Arc::new(
            RequestContext::builder(InteractionKind::Message)
                .deadline(expired)
                .build(),
        );

        let result = chain(&[context], terminal).run(ctx).await;
        assert_eq!(result, Ok(Response::message(DEADLINE_EXPIRED_MESSAGE)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_stores_earliest_deadline() {
        let upstream = Instant::now() + Duration::from_secs(60);
        let ctx = Arc::new(
            RequestContext::builder(InteractionKind::Message)
                .deadline(upstream)
                .build(),
        );
        let context: Arc<dyn Middleware> =
            Arc::new(ContextMiddleware::new(700).timeout(Duration::from_secs(5)));
        let terminal = Next::from_fn(|ctx: Arc<RequestContext>| async move {
            let deadline = ctx.get_state::<RequestDeadline>();
            Ok(Response::message(format!(
                "{}",
                deadline.map(|d| d.remaining().as_secs()).unwrap_or_default()
            )))
        });

        let result = chain(&[context], terminal).run(Arc::clone(&ctx)).await;
        assert_eq!(result, Ok(Response::message("5")));
    }
}
