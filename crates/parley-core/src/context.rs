//! The request context flowing through the dispatch pipeline.
//!
//! A [`RequestContext`] is created by an adapter for every inbound
//! interaction and shared as `Arc<RequestContext>` with every middleware and
//! the selected handler. Identity, text and security attributes are fixed at
//! construction; only two bags are mutable afterwards:
//!
//! - the **parameter bag**, filled by route matching (`order {id}` → `id`)
//! - the **state bag**, a type-keyed scratch map middlewares use to hand
//!   values to handlers
//!
//! # Example
//!
//! ```rust,ignore
//! use parley_core::{InteractionKind, RequestContext};
//!
//! let ctx = RequestContext::builder(InteractionKind::Command)
//!     .user(42)
//!     .chat(7)
//!     .text("/order 15")
//!     .source("telegram")
//!     .role("admin")
//!     .build();
//!
//! assert!(ctx.is_authenticated());
//! ```

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;

/// Source tag used when an adapter does not set one.
pub const UNKNOWN_SOURCE: &str = "unknown";

/// The kind of interaction an adapter received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    /// A slash command or command-like message.
    Command,
    /// A press on an inline keyboard button.
    Callback,
    /// Free text that is not a command.
    Message,
}

impl InteractionKind {
    /// Returns the kind as a lowercase tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Callback => "callback",
            Self::Message => "message",
        }
    }
}

impl fmt::Display for InteractionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered user profile, as loaded by the adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Decides whether the current user holds a named permission.
pub type PermissionFn = Arc<dyn Fn(&RequestContext, &str) -> bool + Send + Sync>;

/// The unit of work passed through middlewares to a handler.
pub struct RequestContext {
    user_id: i64,
    chat_id: i64,
    message_id: Option<String>,
    text: String,
    callback_data: Option<String>,
    data: Map<String, Value>,
    authenticated: bool,
    roles: HashSet<String>,
    permissions: HashSet<String>,
    permission_fn: Option<PermissionFn>,
    profile: Option<UserProfile>,
    source: String,
    kind: InteractionKind,
    locale: Option<String>,
    received_at: SystemTime,
    deadline: Option<Instant>,
    params: Mutex<HashMap<String, String>>,
    state: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
}

impl RequestContext {
    /// Starts building a context for an interaction of the given kind.
    pub fn builder(kind: InteractionKind) -> RequestContextBuilder {
        RequestContextBuilder::new(kind)
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// The raw text as delivered by the adapter.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn callback_data(&self) -> Option<&str> {
        self.callback_data.as_deref()
    }

    /// Returns the text routes are matched against.
    ///
    /// Callback interactions match on the callback payload rather than the
    /// button caption.
    pub fn match_text(&self) -> &str {
        match (self.kind, self.callback_data.as_deref()) {
            (InteractionKind::Callback, Some(payload)) => payload,
            _ => &self.text,
        }
    }

    /// Structured side-data attached by the adapter.
    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn data_value(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn roles(&self) -> &HashSet<String> {
        &self.roles
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Checks a permission through the installed predicate, or against the
    /// granted permission set when no predicate was installed.
    pub fn has_permission(&self, permission: &str) -> bool {
        match &self.permission_fn {
            Some(check) => check(self, permission),
            None => self.permissions.contains(permission),
        }
    }

    pub fn profile(&self) -> Option<&UserProfile> {
        self.profile.as_ref()
    }

    pub fn has_profile(&self) -> bool {
        self.profile.is_some()
    }

    /// The adapter that produced this interaction (`telegram`, `http`, ...).
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn kind(&self) -> InteractionKind {
        self.kind
    }

    pub fn is_command(&self) -> bool {
        self.kind == InteractionKind::Command
    }

    pub fn is_callback(&self) -> bool {
        self.kind == InteractionKind::Callback
    }

    pub fn locale(&self) -> Option<&str> {
        self.locale.as_deref()
    }

    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    /// Deadline imposed by the adapter, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    // ─── Parameter bag ────────────────────────────────────────────────────────

    /// Returns a parameter extracted by route matching.
    pub fn param(&self, name: &str) -> Option<String> {
        self.params.lock().get(name).cloned()
    }

    /// Returns a snapshot of all extracted parameters.
    pub fn params(&self) -> HashMap<String, String> {
        self.params.lock().clone()
    }

    pub fn set_param(&self, name: impl Into<String>, value: impl Into<String>) {
        self.params.lock().insert(name.into(), value.into());
    }

    /// Merges a set of parameters into the bag, overwriting existing keys.
    pub fn extend_params(&self, params: HashMap<String, String>) {
        self.params.lock().extend(params);
    }

    // ─── State bag ────────────────────────────────────────────────────────────

    /// Stores a value in the scratch state. One value per type; later calls
    /// overwrite earlier ones.
    pub fn set_state<T: Send + Sync + 'static>(&self, value: T) {
        self.state.lock().insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Retrieves a cloned value from the scratch state.
    pub fn get_state<T: Clone + 'static>(&self) -> Option<T> {
        self.state
            .lock()
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    pub fn has_state<T: 'static>(&self) -> bool {
        self.state.lock().contains_key(&TypeId::of::<T>())
    }

    /// Removes and returns a value from the scratch state.
    pub fn take_state<T: 'static>(&self) -> Option<T> {
        self.state
            .lock()
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("user_id", &self.user_id)
            .field("chat_id", &self.chat_id)
            .field("kind", &self.kind)
            .field("text", &self.text)
            .field("source", &self.source)
            .field("authenticated", &self.authenticated)
            .field("roles", &self.roles)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`RequestContext`], used by adapters.
pub struct RequestContextBuilder {
    kind: InteractionKind,
    user_id: i64,
    chat_id: i64,
    message_id: Option<String>,
    text: String,
    callback_data: Option<String>,
    data: Map<String, Value>,
    authenticated: Option<bool>,
    roles: HashSet<String>,
    permissions: HashSet<String>,
    permission_fn: Option<PermissionFn>,
    profile: Option<UserProfile>,
    source: Option<String>,
    locale: Option<String>,
    deadline: Option<Instant>,
}

impl RequestContextBuilder {
    fn new(kind: InteractionKind) -> Self {
        Self {
            kind,
            user_id: 0,
            chat_id: 0,
            message_id: None,
            text: String::new(),
            callback_data: None,
            data: Map::new(),
            authenticated: None,
            roles: HashSet::new(),
            permissions: HashSet::new(),
            permission_fn: None,
            profile: None,
            source: None,
            locale: None,
            deadline: None,
        }
    }

    pub fn user(mut self, user_id: i64) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn chat(mut self, chat_id: i64) -> Self {
        self.chat_id = chat_id;
        self
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Sets the payload carried by a callback button.
    pub fn callback_data(mut self, payload: impl Into<String>) -> Self {
        self.callback_data = Some(payload.into());
        self
    }

    pub fn data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Overrides the authentication state, which otherwise follows
    /// `user_id > 0`.
    pub fn authenticated(mut self, authenticated: bool) -> Self {
        self.authenticated = Some(authenticated);
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    pub fn permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    /// Installs a permission predicate, replacing set membership checks.
    pub fn permission_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&RequestContext, &str) -> bool + Send + Sync + 'static,
    {
        self.permission_fn = Some(Arc::new(check));
        self
    }

    pub fn profile(mut self, profile: UserProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn build(self) -> RequestContext {
        RequestContext {
            authenticated: self.authenticated.unwrap_or(self.user_id > 0),
            user_id: self.user_id,
            chat_id: self.chat_id,
            message_id: self.message_id,
            text: self.text,
            callback_data: self.callback_data,
            data: self.data,
            roles: self.roles,
            permissions: self.permissions,
            permission_fn: self.permission_fn,
            profile: self.profile,
            source: self.source.unwrap_or_else(|| UNKNOWN_SOURCE.to_string()),
            kind: self.kind,
            locale: self.locale,
            received_at: SystemTime::now(),
            deadline: self.deadline,
            params: Mutex::new(HashMap::new()),
            state: Mutex::new(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let ctx = RequestContext::builder(InteractionKind::Message)
            .text("hello")
            .build();

        assert_eq!(ctx.source(), UNKNOWN_SOURCE);
        assert!(!ctx.is_authenticated());
        assert!(!ctx.is_command());
        assert!(ctx.params().is_empty());
    }

    #[test]
    fn test_authentication_follows_user_id() {
        let ctx = RequestContext::builder(InteractionKind::Command)
            .user(10)
            .build();
        assert!(ctx.is_authenticated());

        let ctx = RequestContext::builder(InteractionKind::Command)
            .user(10)
            .authenticated(false)
            .build();
        assert!(!ctx.is_authenticated());
    }

    #[test]
    fn test_callback_matches_on_payload() {
        let ctx = RequestContext::builder(InteractionKind::Callback)
            .text("Confirm order")
            .callback_data("confirm 7")
            .build();
        assert_eq!(ctx.match_text(), "confirm 7");

        let ctx = RequestContext::builder(InteractionKind::Message)
            .text("plain")
            .callback_data("ignored")
            .build();
        assert_eq!(ctx.match_text(), "plain");
    }

    #[test]
    fn test_permission_predicate_overrides_set() {
        let ctx = RequestContext::builder(InteractionKind::Command)
            .permission("orders.read")
            .build();
        assert!(ctx.has_permission("orders.read"));
        assert!(!ctx.has_permission("orders.write"));

        let ctx = RequestContext::builder(InteractionKind::Command)
            .permission("orders.read")
            .permission_check(|ctx, perm| ctx.user_id() == 1 && perm.starts_with("orders."))
            .user(1)
            .build();
        assert!(ctx.has_permission("orders.write"));
    }

    #[test]
    fn test_state_bag() {
        #[derive(Debug, Clone, PartialEq)]
        struct Tenant(String);

        let ctx = RequestContext::builder(InteractionKind::Message).build();
        assert!(!ctx.has_state::<Tenant>());

        ctx.set_state(Tenant("acme".into()));
        assert_eq!(ctx.get_state::<Tenant>(), Some(Tenant("acme".into())));
        assert_eq!(ctx.take_state::<Tenant>(), Some(Tenant("acme".into())));
        assert!(!ctx.has_state::<Tenant>());
    }

    #[test]
    fn test_param_bag() {
        let ctx = RequestContext::builder(InteractionKind::Command).build();
        ctx.set_param("id", "42");
        ctx.extend_params(HashMap::from([("name".to_string(), "bob".to_string())]));

        assert_eq!(ctx.param("id").as_deref(), Some("42"));
        assert_eq!(ctx.params().len(), 2);
    }
}
