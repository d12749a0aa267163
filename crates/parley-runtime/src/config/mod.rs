//! Configuration for the Parley runtime.
//!
//! Layered loading with figment, a schema covering logging, the event bus,
//! lifecycle timeouts, the global security policy and per-module sections,
//! and validation of the loaded values.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    GlobalSecurityConfig, LogFormat, LogLevel, LogOutput, LogRotation, LoggingConfig, ParleyConfig,
    RuntimeConfig, SpanEventConfig,
};
pub use validation::validate_config;
