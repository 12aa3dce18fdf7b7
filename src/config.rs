//! Runtime configuration and validation
//!
//! The runtime is configured through [`RuntimeConfig`], which can be built in
//! code or deserialized from TOML. Fields not present in the source fall back
//! to the defaults in [`crate::defaults`].

use crate::defaults::*;
use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunable parameters for a runtime instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    /// Timeout in seconds applied when a blocking call omits one (default: 30)
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: f64,
    /// Minimum gap in microseconds between two `preempt()` suspensions
    /// (default: 50 000)
    #[serde(default = "default_preempt_interval_us")]
    pub preempt_interval_us: u64,
    /// Maximum time in milliseconds one tick may sleep in the I/O multiplexer
    /// (default: 100)
    #[serde(default = "default_max_sleep_ms")]
    pub max_sleep_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: default_timeout_seconds(),
            preempt_interval_us: default_preempt_interval_us(),
            max_sleep_ms: default_max_sleep_ms(),
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: RuntimeConfig = toml::from_str(content)
            .map_err(|e| RuntimeError::Config(format!("invalid runtime config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration from a TOML file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            RuntimeError::Config(format!(
                "cannot read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Validate the configuration values.
    ///
    /// The default timeout must be a positive, finite number of seconds and
    /// the sleep ceiling must stay within one minute so that timeout sweeps
    /// keep running at a useful cadence.
    pub fn validate(&self) -> Result<()> {
        if !self.default_timeout_seconds.is_finite() || self.default_timeout_seconds <= 0.0 {
            return Err(RuntimeError::Config(format!(
                "default_timeout_seconds must be positive and finite, got {}",
                self.default_timeout_seconds
            )));
        }
        if self.max_sleep_ms == 0 || self.max_sleep_ms > 60_000 {
            return Err(RuntimeError::Config(format!(
                "max_sleep_ms must be between 1 and 60000, got {}",
                self.max_sleep_ms
            )));
        }
        Ok(())
    }

    pub(crate) fn default_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.default_timeout_seconds)
    }

    pub(crate) fn preempt_interval(&self) -> Duration {
        Duration::from_micros(self.preempt_interval_us)
    }

    pub(crate) fn max_sleep(&self) -> Duration {
        Duration::from_millis(self.max_sleep_ms)
    }
}
