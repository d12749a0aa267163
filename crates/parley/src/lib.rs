//! # Parley
//!
//! A routing and middleware framework for conversational bots.
//!
//! Adapters turn platform updates into a [`RequestContext`](core::RequestContext);
//! Parley finds the route whose pattern matches, runs the middleware chain
//! and the route's security policy, calls the handler and hands back a
//! [`Response`](core::Response). Side effects travel over an in-process
//! event bus.
//!
//! ```text
//! ┌─────────┐  RequestContext  ┌──────────────────────────────────────────┐
//! │ Adapter │─────────────────▶│ Router                                   │
//! │         │                  │  middleware (by priority)                │
//! │         │                  │   └─ route table (by priority)           │
//! │         │                  │        └─ security gate ─▶ handler       │
//! │         │◀─────────────────│  wildcard fallbacks                      │
//! └─────────┘     Response     └──────────────────┬───────────────────────┘
//!                                                 │ Event
//!                                                 ▼
//!                                       ┌──────────────────┐
//!                                       │ EventBus         │──▶ subscribers
//!                                       │  queue + workers │
//!                                       └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use parley::prelude::*;
//!
//! struct Orders;
//!
//! #[async_trait]
//! impl Module for Orders {
//!     fn name(&self) -> &str {
//!         "orders"
//!     }
//!
//!     fn routes(&self) -> Vec<Route> {
//!         vec![
//!             Route::builder(["/order {id}"])
//!                 .describe("order", "Show an order")
//!                 .handler(|ctx: Arc<RequestContext>| async move {
//!                     format!("Order #{}", ctx.param("id").unwrap_or_default())
//!                 }),
//!         ]
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = ParleyRuntime::new()?;
//!     runtime.register_module(Orders)?;
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config`: TOML configuration files (default)
//! - `yaml-config`: YAML configuration files
//! - `json-log`: JSON log output

pub use parley_core as core;
pub use parley_framework as framework;
pub use parley_runtime as runtime;

/// Commonly used types for building modules and adapters.
///
/// ```rust,ignore
/// use parley::prelude::*;
/// ```
pub mod prelude {
    pub use std::sync::Arc;

    // Runtime - main entry point
    pub use parley_runtime::{ParleyConfig, ParleyRuntime};

    // Requests and replies
    pub use parley_core::{
        Event, InteractionKind, Keyboard, RequestContext, Response, UserProfile, topics,
    };

    // Modules and routes
    pub use parley_framework::{
        BoxError, EventAware, HandlerResult, IntoResponse, Module, ModuleContext, Route,
        RouteKind, RouteMeta, Subscription, WildcardHandler,
    };

    // Middleware and security
    pub use parley_framework::{
        Middleware, Next, RateLimitPolicy, SecurityPolicy, middleware_fn,
    };

    // Event bus
    pub use parley_framework::{EventBus, emit};

    pub use async_trait::async_trait;
}
