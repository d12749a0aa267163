//! Route descriptors.
//!
//! A [`Route`] binds one or more patterns to a handler, with a priority, an
//! interaction-kind filter, a security policy and descriptive metadata.
//!
//! ```rust,ignore
//! let route = Route::builder(["/order {id}", "order {id}"])
//!     .priority(80)
//!     .security(SecurityPolicy::new().require_auth())
//!     .describe("order", "Show an order")
//!     .handler(|ctx: Arc<RequestContext>| async move {
//!         format!("Order #{}", ctx.param("id").unwrap_or_default())
//!     });
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::handler::{BoxedHandler, IntoResponse, into_handler};
use crate::security::SecurityPolicy;
use parley_core::{InteractionKind, RequestContext};

/// Priority given to routes that do not set one.
pub const DEFAULT_PRIORITY: i32 = 50;

/// Which interaction kinds a route accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteKind {
    #[default]
    Command,
    Callback,
    Message,
    /// Accepts every kind.
    Any,
}

impl RouteKind {
    pub fn accepts(&self, kind: InteractionKind) -> bool {
        match self {
            Self::Any => true,
            Self::Command => kind == InteractionKind::Command,
            Self::Callback => kind == InteractionKind::Callback,
            Self::Message => kind == InteractionKind::Message,
        }
    }
}

/// Descriptive data used for help output and introspection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Hidden routes are left out of help listings.
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub deprecated: bool,
    #[serde(default)]
    pub examples: Vec<String>,
}

/// An immutable pattern-to-handler binding.
#[derive(Clone)]
pub struct Route {
    pub(crate) patterns: Vec<String>,
    pub(crate) handler: BoxedHandler,
    pub(crate) priority: i32,
    pub(crate) kind: RouteKind,
    pub(crate) security: Option<SecurityPolicy>,
    pub(crate) meta: RouteMeta,
}

impl Route {
    /// Starts a route for the given pattern alternatives.
    pub fn builder<I, S>(patterns: I) -> RouteBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        RouteBuilder {
            patterns: patterns.into_iter().map(Into::into).collect(),
            priority: DEFAULT_PRIORITY,
            kind: RouteKind::default(),
            security: None,
            meta: RouteMeta::default(),
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn kind(&self) -> RouteKind {
        self.kind
    }

    pub fn security(&self) -> Option<&SecurityPolicy> {
        self.security.as_ref()
    }

    pub fn meta(&self) -> &RouteMeta {
        &self.meta
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("patterns", &self.patterns)
            .field("priority", &self.priority)
            .field("kind", &self.kind)
            .field("secured", &self.security.is_some())
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Route`]. Finished by [`handler`](Self::handler).
#[derive(Debug)]
pub struct RouteBuilder {
    patterns: Vec<String>,
    priority: i32,
    kind: RouteKind,
    security: Option<SecurityPolicy>,
    meta: RouteMeta,
}

impl RouteBuilder {
    /// Higher priorities are tried first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn kind(mut self, kind: RouteKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn security(mut self, policy: SecurityPolicy) -> Self {
        self.security = Some(policy);
        self
    }

    pub fn meta(mut self, meta: RouteMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Sets the name and description.
    pub fn describe(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.meta.name = name.into();
        self.meta.description = description.into();
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.meta.category = Some(category.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.meta.tags.push(tag.into());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.meta.hidden = true;
        self
    }

    pub fn example(mut self, example: impl Into<String>) -> Self {
        self.meta.examples.push(example.into());
        self
    }

    /// Sets the handler and finishes the route.
    pub fn handler<F, Fut, R>(self, f: F) -> Route
    where
        F: Fn(Arc<RequestContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoResponse,
    {
        self.handler_boxed(into_handler(f))
    }

    /// Finishes the route with a pre-built boxed handler.
    pub fn handler_boxed(self, handler: BoxedHandler) -> Route {
        Route {
            patterns: self.patterns,
            handler,
            priority: self.priority,
            kind: self.kind,
            security: self.security,
            meta: self.meta,
        }
    }
}

/// A read-only summary of a registered route.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteInfo {
    pub module: String,
    pub patterns: Vec<String>,
    pub kind: RouteKind,
    pub priority: i32,
    pub name: String,
    pub description: String,
    pub category: Option<String>,
    pub hidden: bool,
    pub deprecated: bool,
}

impl RouteInfo {
    pub(crate) fn new(module: &str, route: &Route) -> Self {
        Self {
            module: module.to_string(),
            patterns: route.patterns.clone(),
            kind: route.kind,
            priority: route.priority,
            name: route.meta.name.clone(),
            description: route.meta.description.clone(),
            category: route.meta.category.clone(),
            hidden: route.meta.hidden,
            deprecated: route.meta.deprecated,
        }
    }

    /// Whether this route belongs in user-facing help.
    pub fn visible(&self) -> bool {
        !self.hidden
    }
}
