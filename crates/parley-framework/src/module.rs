//! Modules: the unit of registration.
//!
//! A module contributes routes and, optionally, two extra capabilities
//! queried explicitly by the router:
//!
//! - [`WildcardHandler`]: a fallback for requests no route matched.
//! - [`EventAware`]: event subscriptions registered with the module.
//!
//! ```rust,ignore
//! struct Orders;
//!
//! #[async_trait]
//! impl Module for Orders {
//!     fn name(&self) -> &str {
//!         "orders"
//!     }
//!
//!     fn routes(&self) -> Vec<Route> {
//!         vec![Route::builder(["/order {id}"]).handler(show_order)]
//!     }
//!
//!     async fn init(&self, ctx: &ModuleContext) -> Result<(), BoxError> {
//!         let config: OrdersConfig = ctx.config()?;
//!         // ...
//!         Ok(())
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::bus::{EventBus, Subscription};
use crate::error::BoxError;
use crate::handler::HandlerResult;
use crate::route::Route;
use parley_core::{Metrics, NoopMetrics, RequestContext};

/// A named bundle of routes with lifecycle hooks.
///
/// Hooks run in this order: `init` and `start` during
/// [`Router::start`](crate::Router::start), `stop` during
/// [`Router::stop`](crate::Router::stop).
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Unique within a router.
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.1.0"
    }

    fn description(&self) -> &str {
        ""
    }

    /// Called once, at registration.
    fn routes(&self) -> Vec<Route>;

    async fn init(&self, _ctx: &ModuleContext) -> Result<(), BoxError> {
        Ok(())
    }

    async fn start(&self) -> Result<(), BoxError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Returns the fallback handler, if this module has one.
    fn as_wildcard(self: Arc<Self>) -> Option<Arc<dyn WildcardHandler>> {
        None
    }

    /// Returns the subscription capability, if this module has one.
    fn as_event_aware(&self) -> Option<&dyn EventAware> {
        None
    }
}

/// Handles requests that no route matched.
///
/// Wildcard handlers are consulted by descending priority; the first whose
/// [`should_handle`](Self::should_handle) returns `true` handles the request.
#[async_trait]
pub trait WildcardHandler: Send + Sync {
    fn priority(&self) -> i32 {
        0
    }

    fn should_handle(&self, ctx: &RequestContext) -> bool;

    async fn handle_wildcard(&self, ctx: Arc<RequestContext>) -> HandlerResult;
}

/// Declares event subscriptions.
pub trait EventAware: Send + Sync {
    fn subscriptions(&self) -> Vec<Subscription>;
}

/// What a module sees during [`Module::init`].
#[derive(Clone)]
pub struct ModuleContext {
    name: String,
    config: Arc<Value>,
    bus: EventBus,
    metrics: Arc<dyn Metrics>,
}

impl ModuleContext {
    pub fn new(
        name: impl Into<String>,
        config: Arc<Value>,
        bus: EventBus,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            bus,
            metrics,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Deserializes the module's configuration section.
    ///
    /// A module without a section sees `null`, which deserializes into
    /// `Option<T>` or any type with all-default fields.
    pub fn config<T>(&self) -> serde_json::Result<T>
    where
        T: DeserializeOwned,
    {
        T::deserialize(self.config.as_ref())
    }

    pub fn raw_config(&self) -> &Value {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn metrics(&self) -> &Arc<dyn Metrics> {
        &self.metrics
    }
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Collaborators handed to modules, attached with
/// [`Router::set_dependencies`](crate::Router::set_dependencies).
#[derive(Clone)]
pub struct Dependencies {
    pub metrics: Arc<dyn Metrics>,
    /// Per-module configuration, keyed by module name.
    pub modules: Map<String, Value>,
}

impl Dependencies {
    pub fn new(metrics: Arc<dyn Metrics>) -> Self {
        Self {
            metrics,
            modules: Map::new(),
        }
    }

    pub fn module_config(mut self, name: impl Into<String>, config: Value) -> Self {
        self.modules.insert(name.into(), config);
        self
    }

    pub(crate) fn config_for(&self, name: &str) -> Arc<Value> {
        Arc::new(self.modules.get(name).cloned().unwrap_or(Value::Null))
    }
}

impl Default for Dependencies {
    fn default() -> Self {
        Self::new(Arc::new(NoopMetrics))
    }
}

impl fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependencies")
            .field("modules", &self.modules)
            .finish_non_exhaustive()
    }
}
