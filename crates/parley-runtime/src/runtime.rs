//! Runtime orchestration: configuration in, a running router out.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use parley_runtime::ParleyRuntime;
//!
//! // Auto-loads parley.toml and PARLEY_* variables
//! let runtime = ParleyRuntime::new()?;
//! runtime.register_module(Weather::default())?;
//!
//! // Custom configuration
//! let runtime = ParleyRuntime::builder()
//!     .config_file("config/parley.toml")
//!     .profile("production")
//!     .build()?;
//!
//! runtime.run().await?;
//! ```

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::signal;
use tracing::{debug, info};

use crate::config::{ConfigLoader, ParleyConfig};
use crate::error::{RuntimeError, RuntimeResult};
use crate::logging;
use crate::metrics::{MetricsRecorder, MetricsSnapshot};
use parley_core::{Metrics, NoopMetrics, RequestContext, Response};
use parley_framework::{
    BoxedMiddleware, ContextMiddleware, Dependencies, EventBus, EventBusStats, LoggingMiddleware,
    MetricsMiddleware, Module, RecoveryMiddleware, Router, SecurityMiddleware, SecurityPolicy,
};

/// Priorities of the built-in middleware stack, outermost first.
pub mod priority {
    pub const RECOVERY: i32 = 1000;
    pub const LOGGING: i32 = 900;
    pub const METRICS: i32 = 800;
    pub const CONTEXT: i32 = 700;
    pub const SECURITY: i32 = 100;
}

/// Owns the router, its bus and the metrics recorder, all wired from a
/// [`ParleyConfig`].
///
/// Adapters feed requests through [`handle`](Self::handle) (or the
/// [`Router`] directly) between [`start`](Self::start) and
/// [`stop`](Self::stop); [`run`](Self::run) does both around a shutdown
/// signal.
pub struct ParleyRuntime {
    config: ParleyConfig,
    router: Router,
    recorder: Option<Arc<MetricsRecorder>>,
}

/// Counts reported by [`ParleyRuntime::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub running: bool,
    pub modules: usize,
    pub routes: usize,
    pub middleware: Vec<String>,
    pub bus: EventBusStats,
    pub metrics: Option<MetricsSnapshot>,
}

impl ParleyRuntime {
    /// Loads configuration from the default locations and builds the runtime.
    pub fn new() -> RuntimeResult<Self> {
        Self::builder().build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Builds the runtime from an already loaded configuration.
    ///
    /// Initializes logging (a no-op when a subscriber is already installed),
    /// creates the bus and router, attaches the module configuration and
    /// installs the default middleware unless disabled.
    pub fn from_config(config: ParleyConfig) -> RuntimeResult<Self> {
        logging::init_from_config(&config.logging);

        let recorder = config
            .runtime
            .enable_metrics
            .then(|| Arc::new(MetricsRecorder::new()));
        let metrics: Arc<dyn Metrics> = match &recorder {
            Some(recorder) => Arc::clone(recorder) as Arc<dyn Metrics>,
            None => Arc::new(NoopMetrics),
        };

        let router = Router::new(EventBus::new(config.bus));
        router.set_dependencies(Dependencies {
            metrics: Arc::clone(&metrics),
            modules: config.modules.clone(),
        })?;

        if config.runtime.default_middleware {
            for middleware in default_middleware(&config, recorder.is_some().then_some(metrics)) {
                router.register_middleware(middleware)?;
            }
        }

        info!(
            log_level = %config.logging.level,
            workers = config.bus.workers,
            queue_capacity = config.bus.queue_capacity,
            metrics = recorder.is_some(),
            "Runtime initialized from configuration"
        );

        Ok(Self {
            config,
            router,
            recorder,
        })
    }

    pub fn config(&self) -> &ParleyConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn bus(&self) -> &EventBus {
        self.router.bus()
    }

    /// The in-memory recorder, when `runtime.enable_metrics` is set.
    pub fn metrics(&self) -> Option<&Arc<MetricsRecorder>> {
        self.recorder.as_ref()
    }

    pub fn register_module<M: Module>(&self, module: M) -> RuntimeResult<()> {
        Ok(self.router.register_module(module)?)
    }

    pub fn register_middleware(&self, middleware: BoxedMiddleware) -> RuntimeResult<()> {
        Ok(self.router.register_middleware(middleware)?)
    }

    /// Routes one request.
    pub async fn handle(&self, ctx: RequestContext) -> Response {
        self.router.route(Arc::new(ctx)).await
    }

    pub fn is_running(&self) -> bool {
        self.router.is_running()
    }

    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            running: self.router.is_running(),
            modules: self.router.modules().len(),
            routes: self.router.routes().len(),
            middleware: self.router.middleware_names(),
            bus: self.router.bus().stats(),
            metrics: self.recorder.as_ref().map(|r| r.snapshot()),
        }
    }

    /// Initializes and starts every module, then the bus.
    pub async fn start(&self) -> RuntimeResult<()> {
        info!("Starting Parley runtime");
        self.router.start(self.config.runtime.start_timeout()).await?;
        info!(modules = self.router.modules().len(), "Runtime started");
        Ok(())
    }

    /// Drains the bus and stops every module within the shutdown timeout.
    pub async fn stop(&self) -> RuntimeResult<()> {
        info!("Stopping Parley runtime");
        self.router
            .stop(self.config.runtime.shutdown_timeout())
            .await?;
        info!("Runtime stopped");
        Ok(())
    }

    /// Runs until Ctrl+C or SIGTERM, then stops.
    pub async fn run(&self) -> RuntimeResult<()> {
        self.start().await?;
        info!("Parley runtime is now running. Press Ctrl+C to stop.");

        let signal = wait_for_shutdown().await;
        self.stop().await?;
        signal
    }

    /// Runs until `shutdown` completes, then stops.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        debug!("Shutdown future completed");
        self.stop().await
    }
}

/// The built-in stack for `config`: recovery, logging, metrics (with a
/// sink), context (with a handler budget) and security (with a global
/// rate limit).
fn default_middleware(
    config: &ParleyConfig,
    metrics: Option<Arc<dyn Metrics>>,
) -> Vec<BoxedMiddleware> {
    let mut stack: Vec<BoxedMiddleware> = vec![
        Arc::new(RecoveryMiddleware::new(priority::RECOVERY)),
        Arc::new(LoggingMiddleware::new(priority::LOGGING)),
    ];
    if let Some(metrics) = metrics {
        stack.push(Arc::new(MetricsMiddleware::new(metrics, priority::METRICS)));
    }
    if let Some(budget) = config.runtime.handler_timeout() {
        stack.push(Arc::new(
            ContextMiddleware::new(priority::CONTEXT).timeout(budget),
        ));
    }
    if let Some(limit) = config.security.rate_limit {
        let policy = SecurityPolicy::new().rate_limit(limit);
        stack.push(Arc::new(
            SecurityMiddleware::new(policy).with_priority(priority::SECURITY),
        ));
    }
    stack
}

/// Waits for Ctrl+C, or SIGTERM on unix.
async fn wait_for_shutdown() -> RuntimeResult<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .map_err(RuntimeError::Signal)?;

        tokio::select! {
            result = signal::ctrl_c() => {
                result.map_err(RuntimeError::Signal)?;
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.map_err(RuntimeError::Signal)?;
        info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Loads configuration, then builds a [`ParleyRuntime`] from it.
#[derive(Debug)]
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new(),
        }
    }

    pub fn config_file<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    /// Sets the configuration profile (e.g., "development", "production").
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    pub fn search_path<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Merges configuration programmatically, above every other source.
    pub fn merge(mut self, config: ParleyConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    pub fn build(self) -> RuntimeResult<ParleyRuntime> {
        let config = self.config_loader.load()?;
        ParleyRuntime::from_config(config)
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_core::InteractionKind;
    use parley_framework::{BoxError, ModuleContext, RateLimitPolicy, Route};
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_test::assert_ok;

    #[derive(Debug, Default, Deserialize)]
    struct EchoConfig {
        #[serde(default)]
        prefix: String,
    }

    #[derive(Default)]
    struct Echo {
        prefix: Arc<parking_lot::Mutex<String>>,
        stopped: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Module for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn routes(&self) -> Vec<Route> {
            vec![
                Route::builder(["/echo {text}"]).handler(|ctx: Arc<RequestContext>| async move {
                    ctx.param("text").unwrap_or_default()
                }),
                Route::builder(["/panic"]).handler(|_ctx| async {
                    if true {
                        panic!("handler blew up");
                    }
                    "unreachable"
                }),
            ]
        }

        async fn init(&self, ctx: &ModuleContext) -> Result<(), BoxError> {
            let config: Option<EchoConfig> = ctx.config()?;
            *self.prefix.lock() = config.unwrap_or_default().prefix;
            Ok(())
        }

        async fn stop(&self) -> Result<(), BoxError> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config() -> ParleyConfig {
        let mut config = ParleyConfig::default();
        config.bus.workers = 1;
        config.bus.queue_capacity = 8;
        config
    }

    fn command(user: i64, text: &str) -> RequestContext {
        RequestContext::builder(InteractionKind::Command)
            .user(user)
            .chat(1)
            .text(text)
            .build()
    }

    #[tokio::test]
    async fn test_default_middleware_stack() {
        let mut config = config();
        config.security.rate_limit = Some(RateLimitPolicy::per_minute(10));
        let runtime = assert_ok!(ParleyRuntime::from_config(config));

        assert_eq!(
            runtime.router().middleware_names(),
            vec!["recovery", "logging", "metrics", "context", "security"]
        );
    }

    #[tokio::test]
    async fn test_optional_middleware_follows_config() {
        let mut config = config();
        config.runtime.enable_metrics = false;
        config.runtime.handler_timeout_ms = None;
        let runtime = assert_ok!(ParleyRuntime::from_config(config));

        assert!(runtime.metrics().is_none());
        assert_eq!(
            runtime.router().middleware_names(),
            vec!["recovery", "logging"]
        );

        let mut config = self::config();
        config.runtime.default_middleware = false;
        let runtime = assert_ok!(ParleyRuntime::from_config(config));
        assert!(runtime.router().middleware_names().is_empty());
    }

    #[tokio::test]
    async fn test_requests_flow_through_the_stack() {
        let runtime = assert_ok!(ParleyRuntime::from_config(config()));
        assert_ok!(runtime.register_module(Echo::default()));
        assert_ok!(runtime.start().await);

        let response = runtime.handle(command(7, "/echo hello")).await;
        assert_eq!(response, Response::message("hello"));

        let response = runtime.handle(command(7, "/panic")).await;
        assert_eq!(
            response,
            Response::message(parley_framework::middleware::INTERNAL_ERROR_MESSAGE)
        );

        let metrics = runtime.metrics().map(|m| m.snapshot()).unwrap_or_default();
        assert_eq!(metrics.counter_total("requests.total"), 2);

        let stats = runtime.stats();
        assert!(stats.running);
        assert_eq!(stats.modules, 1);
        assert_eq!(stats.routes, 2);

        assert_ok!(runtime.stop().await);
        assert!(!runtime.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_rate_limit_from_config() {
        let mut config = config();
        config.security.rate_limit = Some(RateLimitPolicy::new(2, Duration::from_secs(60)));
        let runtime = assert_ok!(ParleyRuntime::from_config(config));
        assert_ok!(runtime.register_module(Echo::default()));
        assert_ok!(runtime.start().await);

        for _ in 0..2 {
            assert_eq!(
                runtime.handle(command(7, "/echo hi")).await,
                Response::message("hi")
            );
        }
        assert_eq!(
            runtime.handle(command(7, "/echo hi")).await,
            Response::message("Too many requests. Please wait a moment and try again.")
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(
            runtime.handle(command(7, "/echo hi")).await,
            Response::message("hi")
        );
        assert_ok!(runtime.stop().await);
    }

    #[tokio::test]
    async fn test_run_until_stops_modules() {
        let mut config = config();
        config.modules.insert(
            "echo".to_string(),
            serde_json::json!({ "prefix": "> " }),
        );
        let runtime = assert_ok!(ParleyRuntime::from_config(config));
        let prefix = Arc::new(parking_lot::Mutex::new(String::new()));
        let stopped = Arc::new(AtomicUsize::new(0));
        assert_ok!(runtime.register_module(Echo {
            prefix: Arc::clone(&prefix),
            stopped: Arc::clone(&stopped),
        }));

        assert_ok!(runtime.run_until(async {}).await);
        assert_eq!(*prefix.lock(), "> ");
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert!(!runtime.is_running());
    }
}
