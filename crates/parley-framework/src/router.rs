//! The router: registry, dispatcher and lifecycle in one place.
//!
//! All mutable state (modules, routes, wildcard handlers, middlewares,
//! subscriptions, dependencies) lives in a single registry behind one
//! lock. Registration is only accepted before [`Router::start`]; afterwards
//! the registry is read-only and dispatch works on cheap snapshots.
//!
//! # Dispatch
//!
//! [`Router::route`] runs the middleware chain around the dispatcher:
//!
//! 1. match on the callback payload for callbacks, the text otherwise;
//! 2. walk routes by descending priority (registration order on ties),
//!    skipping routes whose kind filter rejects the request;
//! 3. on the first pattern match, bind parameters, apply the route's
//!    security policy and call the handler;
//! 4. otherwise offer the request to wildcard handlers by descending
//!    priority;
//! 5. otherwise answer [`Response::silent`].
//!
//! `route` never fails: a fault nothing recovered becomes
//! [`INTERNAL_ERROR_MESSAGE`].

use std::cmp::Reverse;
use std::convert::Infallible;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{Instrument, Level, debug, error, info, span, warn};

use crate::bus::{EventBus, EventBusConfig, SubscriptionId};
use crate::error::{HandlerFault, PatternError, RouterError, RouterResult};
use crate::handler::{HandlerResult, call_guarded};
use crate::middleware::{
    BoxedMiddleware, Endpoint, INTERNAL_ERROR_MESSAGE, Next, chain, sort_by_priority,
};
use crate::module::{Dependencies, Module, ModuleContext, WildcardHandler};
use crate::pattern::PatternSet;
use crate::ratelimit::{RateLimitKey, RateLimiter};
use crate::route::{Route, RouteInfo};
use crate::security::SecurityFailure;
use parley_core::{Event, RequestContext, Response};

/// Summary of a registered module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub routes: usize,
    pub wildcard: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Configuring,
    Starting,
    Running,
    Stopped,
}

struct RouteEntry {
    module: String,
    route: Route,
    compiled: OnceLock<Result<PatternSet, PatternError>>,
    limiter: Option<RateLimiter>,
}

impl RouteEntry {
    fn new(module: &str, route: Route) -> Self {
        let limiter = route
            .security
            .as_ref()
            .and_then(|p| p.rate_limit_policy())
            .map(RateLimiter::new);
        Self {
            module: module.to_string(),
            route,
            compiled: OnceLock::new(),
            limiter,
        }
    }

    /// Compiles on first use. A route whose patterns fail to compile is
    /// logged once and never matches.
    fn compiled(&self) -> &Result<PatternSet, PatternError> {
        self.compiled.get_or_init(|| {
            let result = PatternSet::compile(&self.route.patterns);
            if let Err(e) = &result {
                error!(module = %self.module, error = %e, "Route disabled: pattern failed to compile");
            }
            result
        })
    }

    /// Applies the route policy. Returns the denial response, if any.
    ///
    /// Validators and failure handlers are user code; a panic in either
    /// becomes a [`HandlerFault::Panicked`].
    fn guard(&self, ctx: &RequestContext) -> Result<Option<Response>, HandlerFault> {
        std::panic::catch_unwind(AssertUnwindSafe(|| self.check_policy(ctx)))
            .map_err(HandlerFault::from_panic)
    }

    fn check_policy(&self, ctx: &RequestContext) -> Option<Response> {
        let policy = self.route.security.as_ref()?;

        let failure = match policy.check(ctx) {
            Err(failure) => failure,
            Ok(()) => match &self.limiter {
                Some(limiter) if !limiter.allow(RateLimitKey::from(ctx)) => {
                    SecurityFailure::RateLimitExceeded
                }
                _ => return None,
            },
        };

        info!(
            module = %self.module,
            user_id = ctx.user_id(),
            chat_id = ctx.chat_id(),
            reason = failure.code(),
            "Request denied by route policy"
        );
        Some(policy.failure_response(ctx, &failure))
    }
}

#[derive(Clone)]
struct WildcardEntry {
    module: String,
    handler: Arc<dyn WildcardHandler>,
}

struct Registry {
    phase: Phase,
    modules: Vec<Arc<dyn Module>>,
    routes: Arc<Vec<Arc<RouteEntry>>>,
    wildcards: Arc<Vec<WildcardEntry>>,
    middlewares: Arc<Vec<BoxedMiddleware>>,
    subscriptions: Vec<SubscriptionId>,
    dependencies: Dependencies,
}

impl Registry {
    fn ensure_configuring(&self, what: &'static str) -> RouterResult<()> {
        match self.phase {
            Phase::Configuring => Ok(()),
            _ => Err(RouterError::RegistrationClosed(what)),
        }
    }
}

struct Inner {
    registry: RwLock<Registry>,
    bus: EventBus,
}

/// Routes requests to module handlers. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new(EventBus::new(EventBusConfig::default()))
    }
}

impl Router {
    pub fn new(bus: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: RwLock::new(Registry {
                    phase: Phase::Configuring,
                    modules: Vec::new(),
                    routes: Arc::new(Vec::new()),
                    wildcards: Arc::new(Vec::new()),
                    middlewares: Arc::new(Vec::new()),
                    subscriptions: Vec::new(),
                    dependencies: Dependencies::default(),
                }),
                bus,
            }),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    // =========================================================================
    // Registration
    // =========================================================================

    pub fn register_module<M: Module>(&self, module: M) -> RouterResult<()> {
        self.register_shared(Arc::new(module))
    }

    /// Registers a module that is already shared.
    ///
    /// Its routes join the priority-ordered table, its wildcard capability
    /// (if any) joins the fallback list, and its subscriptions (if any) are
    /// added to the bus. Nothing changes when an error is returned.
    pub fn register_shared(&self, module: Arc<dyn Module>) -> RouterResult<()> {
        let mut registry = self.inner.registry.write();
        registry.ensure_configuring("modules")?;

        let name = module.name().to_string();
        if registry.modules.iter().any(|m| m.name() == name) {
            return Err(RouterError::DuplicateModule(name));
        }

        let routes = module.routes();
        if let Some(index) = routes.iter().position(|r| r.patterns.is_empty()) {
            return Err(RouterError::EmptyRoute {
                module: name,
                index,
            });
        }
        let route_count = routes.len();

        let entries = routes
            .into_iter()
            .map(|route| Arc::new(RouteEntry::new(&name, route)));
        let table = Arc::make_mut(&mut registry.routes);
        table.extend(entries);
        table.sort_by_key(|entry| Reverse(entry.route.priority));

        let wildcard = Arc::clone(&module).as_wildcard();
        if let Some(handler) = &wildcard {
            let wildcards = Arc::make_mut(&mut registry.wildcards);
            wildcards.push(WildcardEntry {
                module: name.clone(),
                handler: Arc::clone(handler),
            });
            wildcards.sort_by_key(|w| Reverse(w.handler.priority()));
        }

        if let Some(aware) = module.as_event_aware() {
            for subscription in aware.subscriptions() {
                let id = self.inner.bus.add(subscription);
                registry.subscriptions.push(id);
            }
        }

        info!(
            module = %name,
            version = module.version(),
            routes = route_count,
            wildcard = wildcard.is_some(),
            "Module registered"
        );
        registry.modules.push(module);
        Ok(())
    }

    /// Adds a middleware. Order follows priority, then registration.
    pub fn register_middleware(&self, middleware: BoxedMiddleware) -> RouterResult<()> {
        let mut registry = self.inner.registry.write();
        registry.ensure_configuring("middleware")?;

        info!(
            middleware = middleware.name(),
            priority = middleware.priority(),
            "Middleware registered"
        );
        let middlewares = Arc::make_mut(&mut registry.middlewares);
        middlewares.push(middleware);
        sort_by_priority(middlewares);
        Ok(())
    }

    /// Attaches the collaborators modules receive at init.
    pub fn set_dependencies(&self, dependencies: Dependencies) -> RouterResult<()> {
        let mut registry = self.inner.registry.write();
        registry.ensure_configuring("dependencies")?;

        self.inner
            .bus
            .set_metrics(Arc::clone(&dependencies.metrics));
        registry.dependencies = dependencies;
        Ok(())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Produces the response for one request.
    pub async fn route(&self, ctx: Arc<RequestContext>) -> Response {
        let span = span!(
            Level::DEBUG,
            "route",
            user_id = ctx.user_id(),
            chat_id = ctx.chat_id(),
            kind = %ctx.kind()
        );

        let next = {
            let registry = self.inner.registry.read();
            let terminal = Next::new(Dispatch {
                routes: Arc::clone(&registry.routes),
                wildcards: Arc::clone(&registry.wildcards),
            });
            chain(&registry.middlewares, terminal)
        };

        async move {
            let result = AssertUnwindSafe(next.run(ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(HandlerFault::from_panic(payload)));
            match result {
                Ok(response) => response,
                Err(fault) => {
                    error!(error = %fault, "Unrecovered handler fault");
                    Response::message(INTERNAL_ERROR_MESSAGE)
                }
            }
        }
        .instrument(span)
        .await
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Initializes and starts every module, then the event bus.
    ///
    /// Registration closes as soon as this is called. On failure, modules
    /// that already started are stopped again and the router cannot be
    /// started a second time.
    pub async fn start(&self, timeout: Duration) -> RouterResult<()> {
        let (modules, dependencies) = {
            let mut registry = self.inner.registry.write();
            match registry.phase {
                Phase::Configuring => {}
                Phase::Starting | Phase::Running => return Err(RouterError::AlreadyStarted),
                Phase::Stopped => return Err(RouterError::Stopped),
            }
            registry.phase = Phase::Starting;
            for entry in registry.routes.iter() {
                let _ = entry.compiled();
            }
            (registry.modules.clone(), registry.dependencies.clone())
        };

        let started = AtomicUsize::new(0);
        let startup = async {
            for module in &modules {
                let ctx = ModuleContext::new(
                    module.name(),
                    dependencies.config_for(module.name()),
                    self.inner.bus.clone(),
                    Arc::clone(&dependencies.metrics),
                );
                module
                    .init(&ctx)
                    .await
                    .map_err(|e| RouterError::module_init(module.name(), e))?;
                debug!(module = module.name(), "Module initialized");
            }

            for module in &modules {
                module
                    .start()
                    .await
                    .map_err(|e| RouterError::module_start(module.name(), e))?;
                started.fetch_add(1, Ordering::SeqCst);
                info!(module = module.name(), "Module started");
            }

            self.inner.bus.start()?;
            Ok::<(), RouterError>(())
        };

        let result = match tokio::time::timeout(timeout, startup).await {
            Ok(result) => result,
            Err(_) => Err(RouterError::StartTimeout(timeout)),
        };

        match result {
            Ok(()) => {
                self.inner.registry.write().phase = Phase::Running;
                for module in &modules {
                    self.inner
                        .bus
                        .publish_async(Event::module_lifecycle(module.name(), "started"));
                }
                info!(modules = modules.len(), "Router started");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Router failed to start");
                let started = started.load(Ordering::SeqCst);
                for module in modules[..started].iter().rev() {
                    if let Err(stop_err) = module.stop().await {
                        warn!(module = module.name(), error = %stop_err, "Module failed to stop after aborted start");
                    }
                }
                self.inner.registry.write().phase = Phase::Stopped;
                Err(e)
            }
        }
    }

    /// Stops the event bus, then every module in reverse registration order.
    ///
    /// All modules are asked to stop even if an earlier step failed; the
    /// first failure is returned. `timeout` bounds the whole shutdown.
    pub async fn stop(&self, timeout: Duration) -> RouterResult<()> {
        let (modules, subscriptions) = {
            let mut registry = self.inner.registry.write();
            if registry.phase != Phase::Running {
                return Ok(());
            }
            registry.phase = Phase::Stopped;
            (
                registry.modules.clone(),
                std::mem::take(&mut registry.subscriptions),
            )
        };

        let deadline = Instant::now() + timeout;
        let mut first_error: Option<RouterError> = None;

        for module in &modules {
            self.inner
                .bus
                .publish_async(Event::module_lifecycle(module.name(), "stopping"));
        }
        if let Err(e) = self.inner.bus.stop(timeout).await {
            error!(error = %e, "Event bus failed to stop cleanly");
            first_error.get_or_insert(e.into());
        }
        for id in subscriptions {
            self.inner.bus.unsubscribe(id);
        }

        for module in modules.iter().rev() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, module.stop()).await {
                Ok(Ok(())) => info!(module = module.name(), "Module stopped"),
                Ok(Err(e)) => {
                    error!(module = module.name(), error = %e, "Module failed to stop");
                    first_error.get_or_insert(RouterError::module_stop(module.name(), e));
                }
                Err(_) => {
                    warn!(module = module.name(), "Module did not stop in time");
                    first_error.get_or_insert(RouterError::StopTimeout(module.name().to_string()));
                }
            }
        }

        info!("Router stopped");
        first_error.map_or(Ok(()), Err)
    }

    pub fn is_running(&self) -> bool {
        self.inner.registry.read().phase == Phase::Running
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn module(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.inner
            .registry
            .read()
            .modules
            .iter()
            .find(|m| m.name() == name)
            .cloned()
    }

    /// Registered modules, in registration order.
    pub fn modules(&self) -> Vec<ModuleInfo> {
        let registry = self.inner.registry.read();
        registry
            .modules
            .iter()
            .map(|m| ModuleInfo {
                name: m.name().to_string(),
                version: m.version().to_string(),
                description: m.description().to_string(),
                routes: registry
                    .routes
                    .iter()
                    .filter(|r| r.module == m.name())
                    .count(),
                wildcard: registry.wildcards.iter().any(|w| w.module == m.name()),
            })
            .collect()
    }

    /// Registered routes, in dispatch order.
    pub fn routes(&self) -> Vec<RouteInfo> {
        self.inner
            .registry
            .read()
            .routes
            .iter()
            .map(|entry| RouteInfo::new(&entry.module, &entry.route))
            .collect()
    }

    /// Middleware names, outermost first.
    pub fn middleware_names(&self) -> Vec<String> {
        self.inner
            .registry
            .read()
            .middlewares
            .iter()
            .map(|m| m.name().to_string())
            .collect()
    }

    /// Routes whose patterns do not compile, with the reason.
    pub fn pattern_errors(&self) -> Vec<(String, PatternError)> {
        self.inner
            .registry
            .read()
            .routes
            .iter()
            .filter_map(|entry| match entry.compiled() {
                Err(e) => Some((entry.module.clone(), e.clone())),
                Ok(_) => None,
            })
            .collect()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.inner.registry.read();
        f.debug_struct("Router")
            .field("phase", &registry.phase)
            .field("modules", &registry.modules.len())
            .field("routes", &registry.routes.len())
            .field("middlewares", &registry.middlewares.len())
            .finish_non_exhaustive()
    }
}

impl tower::Service<Arc<RequestContext>> for Router {
    type Response = Response;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, ctx: Arc<RequestContext>) -> Self::Future {
        let router = self.clone();
        Box::pin(async move { Ok(router.route(ctx).await) })
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// The terminal endpoint: matches a route snapshot and runs the handler.
struct Dispatch {
    routes: Arc<Vec<Arc<RouteEntry>>>,
    wildcards: Arc<Vec<WildcardEntry>>,
}

impl Endpoint for Dispatch {
    fn call(&self, ctx: Arc<RequestContext>) -> BoxFuture<'static, HandlerResult> {
        let routes = Arc::clone(&self.routes);
        let wildcards = Arc::clone(&self.wildcards);
        Box::pin(async move { dispatch(&routes, &wildcards, ctx).await })
    }
}

async fn dispatch(
    routes: &[Arc<RouteEntry>],
    wildcards: &[WildcardEntry],
    ctx: Arc<RequestContext>,
) -> HandlerResult {
    let text = ctx.match_text();

    for entry in routes {
        if !entry.route.kind.accepts(ctx.kind()) {
            continue;
        }
        let Ok(patterns) = entry.compiled() else {
            continue;
        };
        let Some(matched) = patterns.find(text) else {
            continue;
        };

        debug!(
            module = %entry.module,
            pattern = %matched.pattern,
            user_id = ctx.user_id(),
            "Route matched"
        );
        ctx.extend_params(matched.params);

        if let Some(denied) = entry.guard(&ctx)? {
            return Ok(denied);
        }
        return call_guarded(entry.route.handler.as_ref(), Arc::clone(&ctx)).await;
    }

    for wildcard in wildcards {
        let accepts =
            std::panic::catch_unwind(AssertUnwindSafe(|| wildcard.handler.should_handle(&ctx)))
                .map_err(HandlerFault::from_panic)?;
        if !accepts {
            continue;
        }
        debug!(module = %wildcard.module, user_id = ctx.user_id(), "Wildcard matched");
        return AssertUnwindSafe(wildcard.handler.handle_wildcard(Arc::clone(&ctx)))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(HandlerFault::from_panic(payload)));
    }

    debug!(text, user_id = ctx.user_id(), "No route matched");
    Ok(Response::silent())
}
