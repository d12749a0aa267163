//! Error types for the Parley framework.

use std::time::Duration;

use thiserror::Error;
pub use tower::BoxError;

/// Errors raised while compiling a route pattern.
#[derive(Debug, Clone, Error)]
pub enum PatternError {
    /// The pattern uses a placeholder outside the supported vocabulary.
    #[error("unknown placeholder '{{{name}}}' in pattern '{pattern}'")]
    UnknownPlaceholder { pattern: String, name: String },

    /// A `{` without a matching `}`.
    #[error("unclosed placeholder in pattern '{pattern}'")]
    UnclosedPlaceholder { pattern: String },

    /// The expression produced from the pattern was rejected.
    #[error("invalid pattern '{pattern}': {source}")]
    Invalid {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// A typed failure produced at the terminal handler boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerFault {
    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The handler returned an error.
    #[error("handler failed: {0}")]
    Failed(String),
}

impl HandlerFault {
    /// Builds a fault from a panic payload caught by `catch_unwind`.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panicked(message)
    }
}

/// Errors raised by the event bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("event bus is already started")]
    AlreadyStarted,

    /// A stopped bus is terminal.
    #[error("event bus has been stopped and cannot be restarted")]
    Stopped,

    /// Workers did not drain the queue before the deadline.
    #[error("event bus did not drain within {0:?}")]
    ShutdownTimeout(Duration),

    /// One or more subscribers failed while handling an event.
    #[error("event processing for topic '{topic}' had {} error(s): {}", .failures.len(), .failures.join("; "))]
    SubscriberFailures { topic: String, failures: Vec<String> },
}

/// Errors raised while configuring or running a [`Router`](crate::Router).
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("module '{0}' is already registered")]
    DuplicateModule(String),

    /// Registration attempted after `start`.
    #[error("cannot register {0} after the router has started")]
    RegistrationClosed(&'static str),

    #[error("route {index} of module '{module}' has no patterns")]
    EmptyRoute { module: String, index: usize },

    #[error("router is already started")]
    AlreadyStarted,

    #[error("module '{module}' failed to initialize: {source}")]
    ModuleInit {
        module: String,
        #[source]
        source: BoxError,
    },

    #[error("module '{module}' failed to start: {source}")]
    ModuleStart {
        module: String,
        #[source]
        source: BoxError,
    },

    #[error("module '{module}' failed to stop: {source}")]
    ModuleStop {
        module: String,
        #[source]
        source: BoxError,
    },

    /// A stopped router cannot be restarted.
    #[error("router has been stopped")]
    Stopped,

    #[error("router did not start within {0:?}")]
    StartTimeout(Duration),

    #[error("module '{0}' did not stop in time")]
    StopTimeout(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl RouterError {
    pub(crate) fn module_init(module: &str, source: BoxError) -> Self {
        Self::ModuleInit {
            module: module.to_string(),
            source,
        }
    }

    pub(crate) fn module_start(module: &str, source: BoxError) -> Self {
        Self::ModuleStart {
            module: module.to_string(),
            source,
        }
    }

    pub(crate) fn module_stop(module: &str, source: BoxError) -> Self {
        Self::ModuleStop {
            module: module.to_string(),
            source,
        }
    }
}

/// Result type for pattern compilation.
pub type PatternResult<T> = Result<T, PatternError>;

/// Result type for event bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Result type for router configuration and lifecycle.
pub type RouterResult<T> = Result<T, RouterError>;
