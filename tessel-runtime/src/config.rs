//! Runtime Configuration
//!
//! Configuration for a [`Runtime`](crate::Runtime) instance. It can be set
//! programmatically or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `TESSEL_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `TESSEL_NUM_WORKERS` | Number of worker threads | CPU count |
//! | `TESSEL_MAX_OPS_BEFORE_YIELD` | Interpreter steps before a fiber yields | 512 |
//! | `TESSEL_WORK_STEALING` | Enable work stealing ("true"/"false") | true |
//! | `TESSEL_IDLE_PARK_US` | Idle worker park timeout in microseconds | 10000 |
//! | `TESSEL_LOG_LEVEL` | Minimum effect log level (off/fatal/error/warn/info/debug/trace) | info |
//! | `TESSEL_DEFECT_LOG_LEVEL` | Level used to report unobserved defects | warn |
//! | `TESSEL_SHUTDOWN_TIMEOUT_MS` | Graceful shutdown timeout in milliseconds | 5000 |
//!
//! # Example
//!
//! ```rust,ignore
//! use tessel_runtime::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .num_workers(4)
//!     .max_ops_before_yield(1024)
//!     .build()?;
//! ```

use std::env;
use std::time::Duration;

use thiserror::Error;

use crate::log::LogLevel;

/// Default number of interpreter steps a fiber may take before yielding.
pub const DEFAULT_MAX_OPS_BEFORE_YIELD: usize = 512;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker threads.
    /// Default: number of available CPUs.
    pub num_workers: usize,

    /// Interpreter steps a fiber runs before voluntarily yielding its worker.
    /// Default: 512.
    pub max_ops_before_yield: usize,

    /// Enable work stealing between worker threads.
    /// Default: true.
    pub work_stealing: bool,

    /// How long an idle worker parks before re-checking the queues.
    /// Default: 10ms.
    pub idle_park_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus(),
            max_ops_before_yield: DEFAULT_MAX_OPS_BEFORE_YIELD,
            work_stealing: true,
            idle_park_timeout: Duration::from_millis(10),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum level for effect log events.
    /// Default: Info.
    pub level: LogLevel,

    /// Level used to report a defect no observer was waiting for.
    /// Default: Warn.
    pub defect_level: LogLevel,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            defect_level: LogLevel::Warn,
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// How long `Runtime::shutdown` waits for interrupted root fibers.
    /// Default: 5 seconds.
    pub graceful_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_timeout: Duration::from_secs(5),
        }
    }
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Scheduler configuration.
    pub scheduler: SchedulerConfig,

    /// Logging configuration.
    pub log: LogConfig,

    /// Shutdown configuration.
    pub shutdown: ShutdownConfig,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are not set, or fail to parse, keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("TESSEL_NUM_WORKERS") {
            if val > 0 {
                config.scheduler.num_workers = val;
            }
        }

        if let Some(val) = parse_env_usize("TESSEL_MAX_OPS_BEFORE_YIELD") {
            if val > 0 {
                config.scheduler.max_ops_before_yield = val;
            }
        }

        if let Some(val) = parse_env_bool("TESSEL_WORK_STEALING") {
            config.scheduler.work_stealing = val;
        }

        if let Some(val) = parse_env_usize("TESSEL_IDLE_PARK_US") {
            if val > 0 {
                config.scheduler.idle_park_timeout = Duration::from_micros(val as u64);
            }
        }

        if let Ok(val) = env::var("TESSEL_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                config.log.level = level;
            }
        }

        if let Ok(val) = env::var("TESSEL_DEFECT_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                config.log.defect_level = level;
            }
        }

        if let Some(val) = parse_env_usize("TESSEL_SHUTDOWN_TIMEOUT_MS") {
            config.shutdown.graceful_timeout = Duration::from_millis(val as u64);
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.num_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.num_workers".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.scheduler.max_ops_before_yield == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.max_ops_before_yield".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.scheduler.idle_park_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.idle_park_timeout".into(),
                message: "must be greater than zero".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.scheduler.num_workers = n;
        self
    }

    /// Set the fairness threshold: steps a fiber runs before yielding.
    pub fn max_ops_before_yield(mut self, n: usize) -> Self {
        self.config.scheduler.max_ops_before_yield = n;
        self
    }

    /// Enable or disable work stealing.
    pub fn work_stealing(mut self, enabled: bool) -> Self {
        self.config.scheduler.work_stealing = enabled;
        self
    }

    /// Set the idle worker park timeout.
    pub fn idle_park_timeout(mut self, timeout: Duration) -> Self {
        self.config.scheduler.idle_park_timeout = timeout;
        self
    }

    /// Set the minimum effect log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Set the level used to report unobserved defects.
    pub fn defect_log_level(mut self, level: LogLevel) -> Self {
        self.config.log.defect_level = level;
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn graceful_shutdown(mut self, timeout: Duration) -> Self {
        self.config.shutdown.graceful_timeout = timeout;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name)
        .ok()
        .and_then(|s| match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        })
}

/// Get the number of available CPUs.
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(config.scheduler.num_workers >= 1);
        assert_eq!(config.scheduler.max_ops_before_yield, 512);
        assert!(config.scheduler.work_stealing);
        assert_eq!(config.log.level, LogLevel::Info);
        assert_eq!(config.log.defect_level, LogLevel::Warn);
        assert_eq!(config.shutdown.graceful_timeout, Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::builder()
            .num_workers(4)
            .max_ops_before_yield(64)
            .work_stealing(false)
            .log_level(LogLevel::Debug)
            .graceful_shutdown(Duration::from_millis(250))
            .build()
            .unwrap();

        assert_eq!(config.scheduler.num_workers, 4);
        assert_eq!(config.scheduler.max_ops_before_yield, 64);
        assert!(!config.scheduler.work_stealing);
        assert_eq!(config.log.level, LogLevel::Debug);
        assert_eq!(config.shutdown.graceful_timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_builder_validation() {
        assert!(RuntimeConfig::builder().num_workers(0).build().is_err());
        assert!(RuntimeConfig::builder().max_ops_before_yield(0).build().is_err());
        assert!(RuntimeConfig::builder()
            .idle_park_timeout(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn test_build_unchecked_skips_validation() {
        let config = RuntimeConfig::builder().num_workers(0).build_unchecked();
        assert_eq!(config.scheduler.num_workers, 0);
    }

    #[test]
    fn test_config_error_display() {
        let err = RuntimeConfig::builder().num_workers(0).build().unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid configuration for 'scheduler.num_workers': must be at least 1"
        );
    }

    #[test]
    fn test_from_env_reads_prefixed_vars() {
        env::set_var("TESSEL_MAX_OPS_BEFORE_YIELD", "99");
        env::set_var("TESSEL_WORK_STEALING", "off");
        env::set_var("TESSEL_LOG_LEVEL", "trace");

        let config = RuntimeConfig::from_env();
        assert_eq!(config.scheduler.max_ops_before_yield, 99);
        assert!(!config.scheduler.work_stealing);
        assert_eq!(config.log.level, LogLevel::Trace);

        env::remove_var("TESSEL_MAX_OPS_BEFORE_YIELD");
        env::remove_var("TESSEL_WORK_STEALING");
        env::remove_var("TESSEL_LOG_LEVEL");
    }

    #[test]
    fn test_from_env_ignores_garbage() {
        env::set_var("TESSEL_NUM_WORKERS", "not-a-number");
        let config = RuntimeConfig::from_env();
        assert!(config.scheduler.num_workers >= 1);
        env::remove_var("TESSEL_NUM_WORKERS");
    }
}
