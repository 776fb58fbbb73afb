//! Runtime Configuration Module
//!
//! Provides configuration loading for the actor runtime. Supports loading
//! from TOML files with `ACTOR_` prefixed environment overrides, e.g.
//! `ACTOR_SCHEDULER__WORKER_THREADS=4`.

use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "ACTOR";

/// Main runtime configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Worker pool settings for event-based actors
    pub scheduler: SchedulerConfig,

    /// Request/response correlation settings
    pub requests: RequestConfig,

    /// Dead letter handling
    pub dead_letters: DeadLetterConfig,

    /// System shutdown behavior
    pub shutdown: ShutdownConfig,

    /// Log output settings
    pub logging: LoggingConfig,
}

/// Worker pool settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker threads; `None` uses available parallelism
    pub worker_threads: Option<usize>,

    /// Maximum messages an actor processes before yielding its worker
    pub quantum: usize,
}

/// Request/response settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct RequestConfig {
    /// Timeout applied by helpers that do not take an explicit one
    pub default_timeout_ms: u64,
}

/// Dead letter settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// Emit a debug log line per dead letter
    pub log: bool,

    /// Number of most recent dead letters kept for inspection (0 disables)
    pub capture_limit: usize,
}

/// Shutdown settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long `shutdown` waits for actors to terminate
    pub timeout_ms: u64,
}

/// Logging settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON formatted log lines
    pub json: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            quantum: 50,
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
        }
    }
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            log: true,
            capture_limit: 0,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { timeout_ms: 5_000 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl SchedulerConfig {
    /// Resolved worker count
    pub fn worker_count(&self) -> usize {
        self.worker_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }
}

impl RequestConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

impl ShutdownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl RuntimeConfig {
    /// Load configuration from an optional TOML file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Load configuration using an explicit environment map instead of the
    /// process environment (used by tests and embedding hosts)
    pub fn load_with_env(
        path: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading runtime config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        // Override with environment variables (ACTOR_ prefix)
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let config: RuntimeConfig = builder
            .build()
            .context("Failed to build runtime configuration")?
            .try_deserialize()
            .context("Failed to deserialize runtime configuration")?;

        config.validate()?;
        debug!(?config, "Runtime configuration loaded");
        Ok(config)
    }

    /// Parse configuration from a TOML string without environment overrides
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: RuntimeConfig =
            toml::from_str(content).context("Failed to parse runtime configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Render the effective configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize runtime configuration")
    }

    /// Reject values the runtime cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.quantum == 0 {
            bail!("scheduler.quantum must be at least 1");
        }
        if self.scheduler.worker_threads == Some(0) {
            bail!("scheduler.worker_threads must be at least 1 when set");
        }
        if self.requests.default_timeout_ms == 0 {
            bail!("requests.default_timeout_ms must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.quantum, 50);
        assert!(config.scheduler.worker_count() >= 1);
        assert_eq!(config.requests.default_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_base_config() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("runtime.toml");

        let config_content = r#"
[scheduler]
worker_threads = 3
quantum = 10

[dead_letters]
capture_limit = 64

[logging]
level = "debug"
"#;

        fs::write(&config_path, config_content).unwrap();

        let config = RuntimeConfig::load_with_env(Some(&config_path), Some(HashMap::new())).unwrap();

        assert_eq!(config.scheduler.worker_threads, Some(3));
        assert_eq!(config.scheduler.quantum, 10);
        assert_eq!(config.dead_letters.capture_limit, 64);
        assert!(config.dead_letters.log);
        assert_eq!(config.logging.level, "debug");
        // Untouched sections keep their defaults
        assert_eq!(config.shutdown, ShutdownConfig::default());
    }

    #[test]
    fn test_environment_override() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("runtime.toml");
        fs::write(&config_path, "[scheduler]\nquantum = 10\n").unwrap();

        let mut env = HashMap::new();
        env.insert("ACTOR_SCHEDULER__QUANTUM".to_string(), "25".to_string());
        env.insert("ACTOR_REQUESTS__DEFAULT_TIMEOUT_MS".to_string(), "250".to_string());

        let config = RuntimeConfig::load_with_env(Some(&config_path), Some(env)).unwrap();
        assert_eq!(config.scheduler.quantum, 25);
        assert_eq!(config.requests.default_timeout_ms, 250);
    }

    #[test]
    fn test_rejects_zero_quantum() {
        let err = RuntimeConfig::from_toml_str("[scheduler]\nquantum = 0\n").unwrap_err();
        assert!(err.to_string().contains("quantum"));
    }

    #[test]
    fn test_toml_round_trip_of_defaults() {
        let rendered = RuntimeConfig::default().to_toml_string().unwrap();
        let parsed = RuntimeConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed, RuntimeConfig::default());
    }
}
