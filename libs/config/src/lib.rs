//! # Actor Runtime Configuration
//!
//! Centralized configuration for the actor runtime: worker pool sizing,
//! request timeouts, dead letter handling, shutdown and logging.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use actor_config::{init_tracing, RuntimeConfig};
//!
//! let config = RuntimeConfig::load(None).expect("valid configuration");
//! init_tracing(&config.logging).expect("subscriber installed once");
//! ```

pub mod logging;
pub mod runtime_config;

// Re-export commonly used types
pub use logging::{init_test_tracing, init_tracing};
pub use runtime_config::{
    DeadLetterConfig, LoggingConfig, RequestConfig, RuntimeConfig, SchedulerConfig,
    ShutdownConfig,
};
