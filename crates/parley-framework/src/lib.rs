//! # Parley Framework
//!
//! Routing and request handling for conversational bots.
//!
//! This layer provides:
//! - A pattern compiler for `{placeholder}` route patterns
//! - Routes with priorities, kind filters, security policies and metadata
//! - A middleware chain with recovery, logging, metrics, deadline, auth,
//!   rate-limit, validation and security built-ins
//! - A fixed-window rate limiter keyed by (user, chat)
//! - The [`Router`]: module registry, dispatcher and lifecycle
//! - An [`EventBus`] with synchronous fan-out and a bounded worker queue
//!
//! ```rust,ignore
//! let router = Router::default();
//! router.register_middleware(Arc::new(RecoveryMiddleware::new(1000)))?;
//! router.register_module(Greeter)?;
//! router.start(Duration::from_secs(10)).await?;
//!
//! let response = router.route(ctx).await;
//! ```

pub mod bus;
pub mod error;
pub mod handler;
pub mod middleware;
pub mod module;
pub mod pattern;
pub mod ratelimit;
pub mod route;
pub mod router;
pub mod security;

pub use bus::{
    BusState, EventBus, EventBusConfig, EventBusStats, EventFilter, EventHandler, Subscription,
    SubscriptionId, WILDCARD_TOPIC, emit,
};
pub use error::{
    BoxError, BusError, BusResult, HandlerFault, PatternError, PatternResult, RouterError,
    RouterResult,
};
pub use handler::{BoxedHandler, Handler, HandlerResult, IntoResponse, into_handler};
pub use middleware::{
    AuthMiddleware, BoxedMiddleware, ContextMiddleware, FnMiddleware, LoggingMiddleware,
    MetricsMiddleware, Middleware, Next, RateLimitMiddleware, RecoveryMiddleware,
    RequestDeadline, SecurityMiddleware, ValidationMiddleware, middleware_fn,
};
pub use module::{Dependencies, EventAware, Module, ModuleContext, WildcardHandler};
pub use pattern::{Pattern, PatternMatch, PatternSet};
pub use ratelimit::{RateLimitKey, RateLimitPolicy, RateLimitUsage, RateLimiter};
pub use route::{DEFAULT_PRIORITY, Route, RouteBuilder, RouteInfo, RouteKind, RouteMeta};
pub use router::{ModuleInfo, Router};
pub use security::{FailureHandler, SecurityFailure, SecurityPolicy, ValidatorFn};
