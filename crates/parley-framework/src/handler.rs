//! Handler abstraction.
//!
//! Any async function or closure taking `Arc<RequestContext>` and returning
//! something that implements [`IntoResponse`] is a handler:
//!
//! ```rust,ignore
//! async fn start(_ctx: Arc<RequestContext>) -> Response {
//!     Response::message("Welcome!")
//! }
//!
//! async fn order(ctx: Arc<RequestContext>) -> Result<String, OrderError> {
//!     let id: u64 = ctx.param("id").unwrap_or_default().parse()?;
//!     Ok(format!("Order #{id}"))
//! }
//! ```
//!
//! Handlers are stored type-erased as [`BoxedHandler`]. The router calls
//! them through [`call_guarded`], which turns panics and `Err` returns into
//! a [`HandlerFault`].

use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::HandlerFault;
use parley_core::{RequestContext, Response};

/// The outcome of running a handler or the rest of a middleware chain.
pub type HandlerResult = Result<Response, HandlerFault>;

/// Conversion from a handler's return value into a [`HandlerResult`].
pub trait IntoResponse: Send + 'static {
    fn into_response(self) -> HandlerResult;
}

impl IntoResponse for Response {
    fn into_response(self) -> HandlerResult {
        Ok(self)
    }
}

impl IntoResponse for String {
    fn into_response(self) -> HandlerResult {
        Ok(Response::message(self))
    }
}

impl IntoResponse for &'static str {
    fn into_response(self) -> HandlerResult {
        Ok(Response::message(self))
    }
}

impl IntoResponse for () {
    fn into_response(self) -> HandlerResult {
        Ok(Response::Silent)
    }
}

impl<T: IntoResponse> IntoResponse for Option<T> {
    fn into_response(self) -> HandlerResult {
        match self {
            Some(inner) => inner.into_response(),
            None => Ok(Response::Silent),
        }
    }
}

impl<T, E> IntoResponse for Result<T, E>
where
    T: IntoResponse,
    E: Display + Send + 'static,
{
    fn into_response(self) -> HandlerResult {
        match self {
            Ok(inner) => inner.into_response(),
            Err(e) => Err(HandlerFault::Failed(e.to_string())),
        }
    }
}

/// Type-erased handler trait for dynamic dispatch.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: Arc<RequestContext>) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse,
{
    fn call(&self, ctx: Arc<RequestContext>) -> BoxFuture<'static, HandlerResult> {
        let fut = (self)(ctx);
        Box::pin(async move { fut.await.into_response() })
    }
}

/// A type-erased handler that can be stored in collections.
pub type BoxedHandler = Arc<dyn Handler>;

/// Convert a handler function into a boxed handler.
pub fn into_handler<F, Fut, R>(f: F) -> BoxedHandler
where
    F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse,
{
    Arc::new(f)
}

/// Calls a handler, converting a panic into [`HandlerFault::Panicked`].
///
/// Both building the future and polling it happen inside the guard.
pub async fn call_guarded(handler: &dyn Handler, ctx: Arc<RequestContext>) -> HandlerResult {
    let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.call(ctx))) {
        Ok(fut) => fut,
        Err(payload) => return Err(HandlerFault::from_panic(payload)),
    };

    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(HandlerFault::from_panic(payload)),
    }
}
