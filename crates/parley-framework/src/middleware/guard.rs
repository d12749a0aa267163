//! Gatekeeping built-ins: auth, rate limiting, validation and the global
//! security policy.
//!
//! Every guard denies by returning a response without calling `next`, so a
//! denial is never an error.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{Middleware, Next};
use crate::handler::HandlerResult;
use crate::ratelimit::{RateLimitKey, RateLimiter};
use crate::security::{SecurityFailure, SecurityPolicy, default_failure_message};
use parley_core::{RequestContext, Response};

/// The message sent when [`AuthMiddleware`] rejects a request.
pub const AUTH_REQUIRED_MESSAGE: &str = "Access denied. Authentication required.";

type Predicate = Arc<dyn Fn(&RequestContext) -> bool + Send + Sync>;
type Validator = Arc<dyn Fn(&RequestContext) -> Result<(), String> + Send + Sync>;

// ─── Auth ─────────────────────────────────────────────────────────────────────

/// Denies requests for which a predicate returns `false`.
///
/// The default predicate is [`RequestContext::is_authenticated`].
#[derive(Clone)]
pub struct AuthMiddleware {
    priority: i32,
    predicate: Predicate,
    message: String,
}

impl AuthMiddleware {
    pub fn new(priority: i32) -> Self {
        Self {
            priority,
            predicate: Arc::new(RequestContext::is_authenticated),
            message: AUTH_REQUIRED_MESSAGE.to_string(),
        }
    }

    pub fn predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RequestContext) -> bool + Send + Sync + 'static,
    {
        self.predicate = Arc::new(predicate);
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

#[async_trait]
impl Middleware for AuthMiddleware {
    fn name(&self) -> &str {
        "auth"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn process(&self, ctx: Arc<RequestContext>, next: Next) -> HandlerResult {
        if !(self.predicate)(&ctx) {
            info!(user_id = ctx.user_id(), "Unauthenticated request rejected");
            return Ok(Response::message(self.message.clone()));
        }
        next.run(ctx).await
    }
}

impl fmt::Debug for AuthMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthMiddleware")
            .field("priority", &self.priority)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

// ─── Rate limit ───────────────────────────────────────────────────────────────

/// Denies requests once the (user, chat) pair runs out of quota.
#[derive(Debug, Clone)]
pub struct RateLimitMiddleware {
    priority: i32,
    limiter: Arc<RateLimiter>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<RateLimiter>, priority: i32) -> Self {
        Self { priority, limiter }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        "rate_limit"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn process(&self, ctx: Arc<RequestContext>, next: Next) -> HandlerResult {
        let key = RateLimitKey::from(ctx.as_ref());
        if !self.limiter.allow(key) {
            info!(%key, "Rate limit exceeded");
            return Ok(Response::message(default_failure_message(
                &SecurityFailure::RateLimitExceeded,
            )));
        }
        next.run(ctx).await
    }
}

// ─── Validation ───────────────────────────────────────────────────────────────

/// Runs a validator and replies with its error message on failure.
#[derive(Clone)]
pub struct ValidationMiddleware {
    priority: i32,
    validator: Validator,
}

impl ValidationMiddleware {
    pub fn new<F>(priority: i32, validator: F) -> Self
    where
        F: Fn(&RequestContext) -> Result<(), String> + Send + Sync + 'static,
    {
        Self {
            priority,
            validator: Arc::new(validator),
        }
    }
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    fn name(&self) -> &str {
        "validation"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn process(&self, ctx: Arc<RequestContext>, next: Next) -> HandlerResult {
        if let Err(reason) = (self.validator)(&ctx) {
            info!(user_id = ctx.user_id(), %reason, "Request failed validation");
            let failure = SecurityFailure::ValidationFailed(reason);
            return Ok(Response::message(default_failure_message(&failure)));
        }
        next.run(ctx).await
    }
}

impl fmt::Debug for ValidationMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationMiddleware")
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

// ─── Security ─────────────────────────────────────────────────────────────────

/// Applies one [`SecurityPolicy`] to every request, ahead of routing.
///
/// The policy's rate limit, if any, is enforced after its other checks
/// pass, with one limiter shared by all routes.
#[derive(Debug)]
pub struct SecurityMiddleware {
    priority: i32,
    policy: SecurityPolicy,
    limiter: Option<RateLimiter>,
}

impl SecurityMiddleware {
    pub const DEFAULT_PRIORITY: i32 = 100;

    pub fn new(policy: SecurityPolicy) -> Self {
        let limiter = policy.rate_limit_policy().map(RateLimiter::new);
        Self {
            priority: Self::DEFAULT_PRIORITY,
            policy,
            limiter,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn evaluate(&self, ctx: &RequestContext) -> Result<(), SecurityFailure> {
        self.policy.check(ctx)?;
        if let Some(limiter) = &self.limiter
            && !limiter.allow(RateLimitKey::from(ctx))
        {
            return Err(SecurityFailure::RateLimitExceeded);
        }
        Ok(())
    }
}

#[async_trait]
impl Middleware for SecurityMiddleware {
    fn name(&self) -> &str {
        "security"
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn process(&self, ctx: Arc<RequestContext>, next: Next) -> HandlerResult {
        if let Err(failure) = self.evaluate(&ctx) {
            info!(
                user_id = ctx.user_id(),
                chat_id = ctx.chat_id(),
                reason = failure.code(),
                "Request denied by security policy"
            );
            return Ok(self.policy.failure_response(&ctx, &failure));
        }
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::chain;
    use crate::ratelimit::RateLimitPolicy;
    use parley_core::InteractionKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn terminal(calls: Arc<AtomicUsize>) -> Next {
        Next::from_fn(move |_ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(Response::message("handled")) }
        })
    }

    fn anonymous() -> Arc<RequestContext> {
        Arc::new(RequestContext::builder(InteractionKind::Command).text("/x").build())
    }

    fn member(user: i64) -> Arc<RequestContext> {
        Arc::new(
            RequestContext::builder(InteractionKind::Command)
                .user(user)
                .chat(1)
                .role("member")
                .text("/x")
                .build(),
        )
    }

    #[tokio::test]
    async fn test_auth_denies_anonymous() {
        let calls = Arc::new(AtomicUsize::new(0));
        let auth: Arc<dyn Middleware> = Arc::new(AuthMiddleware::new(200));
        let next = chain(&[auth], terminal(Arc::clone(&calls)));

        let denied = next.clone().run(anonymous()).await;
        assert_eq!(denied, Ok(Response::message(AUTH_REQUIRED_MESSAGE)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let allowed = next.run(member(5)).await;
        assert_eq!(allowed, Ok(Response::message("handled")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_auth_custom_predicate() {
        let calls = Arc::new(AtomicUsize::new(0));
        let auth: Arc<dyn Middleware> = Arc::new(
            AuthMiddleware::new(200)
                .predicate(|ctx| ctx.has_role("admin"))
                .message("Admins only."),
        );

        let result = chain(&[auth], terminal(calls)).run(member(5)).await;
        assert_eq!(result, Ok(Response::message("Admins only.")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_middleware() {
        let calls = Arc::new(AtomicUsize::new(0));
        let limiter = Arc::new(RateLimiter::new(RateLimitPolicy::new(
            2,
            Duration::from_secs(60),
        )));
        let middleware: Arc<dyn Middleware> =
            Arc::new(RateLimitMiddleware::new(Arc::clone(&limiter), 150));
        let next = chain(&[middleware], terminal(Arc::clone(&calls)));

        for _ in 0..2 {
            assert_eq!(
                next.clone().run(member(5)).await,
                Ok(Response::message("handled"))
            );
        }
        let denied = next.clone().run(member(5)).await;
        assert_eq!(
            denied.ok().and_then(|r| r.text().map(str::to_string)),
            Some(default_failure_message(&SecurityFailure::RateLimitExceeded))
        );
        // another user still has quota
        assert!(next.run(member(6)).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_validation_reports_reason() {
        let calls = Arc::new(AtomicUsize::new(0));
        let validation: Arc<dyn Middleware> = Arc::new(ValidationMiddleware::new(120, |ctx| {
            if ctx.text().len() > 3 {
                Err("message is too long".to_string())
            } else {
                Ok(())
            }
        }));
        let ctx = Arc::new(
            RequestContext::builder(InteractionKind::Message)
                .text("a long message")
                .build(),
        );

        let result = chain(&[validation], terminal(Arc::clone(&calls)))
            .run(ctx)
            .await;
        assert_eq!(
            result,
            Ok(Response::message("Validation error: message is too long"))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_security_checks_policy_before_limit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let security: Arc<dyn Middleware> = Arc::new(SecurityMiddleware::new(
            SecurityPolicy::new()
                .require_auth()
                .rate_limit(RateLimitPolicy::per_minute(1)),
        ));
        assert_eq!(security.name(), "security");
        assert_eq!(security.priority(), SecurityMiddleware::DEFAULT_PRIORITY);
        let next = chain(&[security], terminal(Arc::clone(&calls)));

        // denied by auth; the limiter is not consumed
        let denied = next.clone().run(anonymous()).await;
        assert_eq!(
            denied,
            Ok(Response::message("Please sign in to use this command."))
        );

        assert!(next.clone().run(member(5)).await.is_ok());
        let limited = next.run(member(5)).await;
        assert_eq!(
            limited,
            Ok(Response::message(
                "Too many requests. Please wait a moment and try again."
            ))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
