//! Parley Runtime - bootstrap layer for the Parley dispatcher.
//!
//! This crate provides:
//! - Layered configuration (`ConfigLoader`, `ParleyConfig`)
//! - Logging initialization (`LoggingBuilder`)
//! - An in-memory metrics backend (`MetricsRecorder`)
//! - `ParleyRuntime`, which wires the event bus, router and default
//!   middleware from configuration and runs until a shutdown signal
//!
//! ```rust,ignore
//! use parley_runtime::ParleyRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = ParleyRuntime::new()?;
//!     runtime.register_module(Greeter)?;
//!
//!     // Run until Ctrl+C
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod runtime;

pub use config::{
    ConfigError, ConfigLoader, ConfigResult, LoggingConfig, ParleyConfig, RuntimeConfig,
    load_config, validate_config,
};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, SpanEvents};
pub use crate::metrics::{MetricsRecorder, MetricsSnapshot, TimingSummary};
pub use runtime::{ParleyRuntime, RuntimeBuilder, RuntimeStats};

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Logging macros in one import.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
