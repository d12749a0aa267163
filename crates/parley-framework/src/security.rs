//! Per-route security policies.
//!
//! A [`SecurityPolicy`] is a set of checks evaluated before a handler runs.
//! Every configured check must pass; an empty set or an unset validator is
//! not enforced. Checks run in a fixed order and the first failure wins:
//!
//! 1. authentication
//! 2. profile presence
//! 3. roles (any of)
//! 4. permissions (all of)
//! 5. source allow-list
//! 6. custom validator
//!
//! A failure is turned into a user-facing [`Response`] by the policy's
//! failure handler, or by [`default_failure_response`] when none is set.
//! Rate limiting is enforced by the router after the checks above pass; see
//! [`SecurityPolicy::rate_limit`].

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::ratelimit::RateLimitPolicy;
use parley_core::{RequestContext, Response};

/// Why a request was denied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityFailure {
    #[error("authentication required")]
    NotAuthenticated,

    #[error("profile required")]
    ProfileRequired,

    #[error("insufficient role")]
    InsufficientRole,

    #[error("insufficient permission: {0}")]
    InsufficientPermission(String),

    #[error("source not allowed: {0}")]
    SourceNotAllowed(String),

    #[error("rate limit exceeded")]
    RateLimitExceeded,

    #[error("validation failed: {0}")]
    ValidationFailed(String),
}

impl SecurityFailure {
    /// A stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotAuthenticated => "not_authenticated",
            Self::ProfileRequired => "profile_required",
            Self::InsufficientRole => "insufficient_role",
            Self::InsufficientPermission(_) => "insufficient_permission",
            Self::SourceNotAllowed(_) => "source_not_allowed",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::ValidationFailed(_) => "validation_failed",
        }
    }
}

/// The default user-facing message for a failure.
pub fn default_failure_message(failure: &SecurityFailure) -> String {
    match failure {
        SecurityFailure::NotAuthenticated => "Please sign in to use this command.".to_string(),
        SecurityFailure::ProfileRequired => {
            "Please complete your registration first.".to_string()
        }
        SecurityFailure::InsufficientRole => {
            "You do not have the required role for this action.".to_string()
        }
        SecurityFailure::InsufficientPermission(_) => {
            "You do not have access to this feature.".to_string()
        }
        SecurityFailure::SourceNotAllowed(_) => {
            "This action is not available here.".to_string()
        }
        SecurityFailure::RateLimitExceeded => {
            "Too many requests. Please wait a moment and try again.".to_string()
        }
        SecurityFailure::ValidationFailed(reason) => format!("Validation error: {reason}"),
    }
}

/// The default failure handler.
pub fn default_failure_response(_ctx: &RequestContext, failure: &SecurityFailure) -> Response {
    Response::message(default_failure_message(failure))
}

/// A custom check; `Err` carries the message shown to the user.
pub type ValidatorFn = Arc<dyn Fn(&RequestContext) -> Result<(), String> + Send + Sync>;

/// Maps a failure to the response sent back.
pub type FailureHandler = Arc<dyn Fn(&RequestContext, &SecurityFailure) -> Response + Send + Sync>;

/// Declarative checks attached to a route.
#[derive(Clone, Default)]
pub struct SecurityPolicy {
    require_auth: bool,
    require_profile: bool,
    roles: Vec<String>,
    permissions: Vec<String>,
    sources: Vec<String>,
    validator: Option<ValidatorFn>,
    rate_limit: Option<RateLimitPolicy>,
    on_failure: Option<FailureHandler>,
}

impl SecurityPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require_auth(mut self) -> Self {
        self.require_auth = true;
        self
    }

    pub fn require_profile(mut self) -> Self {
        self.require_profile = true;
        self
    }

    /// Passes if the user holds any of the listed roles.
    pub fn roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    /// Passes if the user holds every listed permission.
    pub fn permissions<I, S>(mut self, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions
            .extend(permissions.into_iter().map(Into::into));
        self
    }

    /// Restricts the route to the listed adapter sources.
    pub fn sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources.extend(sources.into_iter().map(Into::into));
        self
    }

    pub fn validator<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestContext) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(f));
        self
    }

    /// Limits how often one (user, chat) pair may hit the route.
    pub fn rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.rate_limit = Some(policy);
        self
    }

    pub fn on_failure<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestContext, &SecurityFailure) -> Response + Send + Sync + 'static,
    {
        self.on_failure = Some(Arc::new(f));
        self
    }

    pub fn rate_limit_policy(&self) -> Option<RateLimitPolicy> {
        self.rate_limit
    }

    /// Evaluates every check except the rate limit.
    pub fn check(&self, ctx: &RequestContext) -> Result<(), SecurityFailure> {
        if self.require_auth && !ctx.is_authenticated() {
            return Err(SecurityFailure::NotAuthenticated);
        }

        if self.require_profile && !ctx.has_profile() {
            return Err(SecurityFailure::ProfileRequired);
        }

        if !self.roles.is_empty() && !self.roles.iter().any(|r| ctx.has_role(r)) {
            return Err(SecurityFailure::InsufficientRole);
        }

        if let Some(missing) = self.permissions.iter().find(|p| !ctx.has_permission(p)) {
            return Err(SecurityFailure::InsufficientPermission(missing.clone()));
        }

        if !self.sources.is_empty() && !self.sources.iter().any(|s| s == ctx.source()) {
            return Err(SecurityFailure::SourceNotAllowed(ctx.source().to_string()));
        }

        if let Some(validator) = &self.validator {
            validator(ctx).map_err(SecurityFailure::ValidationFailed)?;
        }

        Ok(())
    }

    /// Builds the response for a failure.
    pub fn failure_response(&self, ctx: &RequestContext, failure: &SecurityFailure) -> Response {
        match &self.on_failure {
            Some(handler) => handler(ctx, failure),
            None => default_failure_response(ctx, failure),
        }
    }
}

impl fmt::Debug for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityPolicy")
            .field("require_auth", &self.require_auth)
            .field("require_profile", &self.require_profile)
            .field("roles", &self.roles)
            .field("permissions", &self.permissions)
            .field("sources", &self.sources)
            .field("validator", &self.validator.is_some())
            .field("rate_limit", &self.rate_limit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{InteractionKind, UserProfile};

    fn user() -> parley_core::RequestContextBuilder {
        RequestContext::builder(InteractionKind::Command)
            .user(7)
            .chat(7)
            .source("telegram")
    }

    #[test]
    fn test_empty_policy_allows_anonymous() {
        let ctx = RequestContext::builder(InteractionKind::Command).build();
        assert_eq!(SecurityPolicy::new().check(&ctx), Ok(()));
    }

    #[test]
    fn test_auth_is_checked_first() {
        let policy = SecurityPolicy::new()
            .require_auth()
            .require_profile()
            .roles(["admin"]);
        let ctx = RequestContext::builder(InteractionKind::Command).build();

        assert_eq!(policy.check(&ctx), Err(SecurityFailure::NotAuthenticated));
    }

    #[test]
    fn test_profile_required() {
        let policy = SecurityPolicy::new().require_auth().require_profile();
        assert_eq!(
            policy.check(&user().build()),
            Err(SecurityFailure::ProfileRequired)
        );
        let ctx = user()
            .profile(UserProfile {
                id: 7,
                ..Default::default()
            })
            .build();
        assert_eq!(policy.check(&ctx), Ok(()));
    }

    #[test]
    fn test_roles_are_any_of() {
        let policy = SecurityPolicy::new().roles(["admin", "moderator"]);
        assert_eq!(
            policy.check(&user().role("member").build()),
            Err(SecurityFailure::InsufficientRole)
        );
        assert_eq!(policy.check(&user().role("moderator").build()), Ok(()));
    }

    #[test]
    fn test_permissions_are_all_of() {
        let policy = SecurityPolicy::new().permissions(["orders.read", "orders.write"]);
        let ctx = user().permission("orders.read").build();

        assert_eq!(
            policy.check(&ctx),
            Err(SecurityFailure::InsufficientPermission(
                "orders.write".to_string()
            ))
        );

        let ctx = user()
            .permission("orders.read")
            .permission("orders.write")
            .build();
        assert_eq!(policy.check(&ctx), Ok(()));
    }

    #[test]
    fn test_source_allow_list() {
        let policy = SecurityPolicy::new().sources(["api"]);
        assert_eq!(
            policy.check(&user().build()),
            Err(SecurityFailure::SourceNotAllowed("telegram".to_string()))
        );
        assert_eq!(policy.check(&user().source("api").build()), Ok(()));
    }

    #[test]
    fn test_validator_runs_last() {
        let policy = SecurityPolicy::new()
            .roles(["admin"])
            .validator(|ctx| {
                if ctx.text().len() > 5 {
                    Err("text too long".to_string())
                } else {
                    Ok(())
                }
            });

        let ctx = user().text("too long text").build();
        assert_eq!(policy.check(&ctx), Err(SecurityFailure::InsufficientRole));

        let ctx = user().role("admin").text("too long text").build();
        assert_eq!(
            policy.check(&ctx),
            Err(SecurityFailure::ValidationFailed("text too long".to_string()))
        );
    }

    #[test]
    fn test_failure_responses() {
        let ctx = user().build();
        let failure = SecurityFailure::ValidationFailed("bad date".to_string());

        let response = SecurityPolicy::new().failure_response(&ctx, &failure);
        assert_eq!(response.text(), Some("Validation error: bad date"));

        let custom = SecurityPolicy::new().on_failure(|_, f| Response::message(f.code()));
        assert_eq!(
            custom.failure_response(&ctx, &failure).text(),
            Some("validation_failed")
        );
    }

    #[test]
    fn test_failure_messages_hide_details() {
        let message = default_failure_message(&SecurityFailure::InsufficientPermission(
            "billing.admin".to_string(),
        ));
        assert!(!message.contains("billing.admin"));
    }
}
