//! Runtime tuning knobs, loadable from TOML.

use std::time::Duration;

use desktop_app_contract::WindowRect;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Capacity of the event bus debug ring buffer.
pub const DEFAULT_EVENT_HISTORY_CAPACITY: usize = 256;
/// Upper bound on a window's teardown before it is forced closed.
pub const DEFAULT_TEARDOWN_TIMEOUT_MS: u64 = 3_000;
/// Delay before the single automatic module fetch retry.
pub const DEFAULT_LOAD_RETRY_BACKOFF_MS: u64 = 250;
/// How long an unreferenced module stays exempt from eviction.
pub const DEFAULT_MODULE_GRACE_PERIOD_MS: u64 = 30_000;
/// Number of cached modules a moderate memory-pressure signal trims down to.
pub const DEFAULT_MODULE_CACHE_SOFT_LIMIT: usize = 8;
/// Quiet period before a dirty layout is saved.
pub const DEFAULT_AUTOSAVE_DEBOUNCE_MS: u64 = 500;
/// Save attempts per dirty layout before giving up.
pub const DEFAULT_AUTOSAVE_MAX_ATTEMPTS: u32 = 3;
/// Maximum windows recreated from a persisted layout.
pub const DEFAULT_MAX_RESTORE_WINDOWS: usize = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Configuration parse and validation failures.
pub enum ConfigError {
    /// The TOML text could not be parsed.
    #[error("invalid runtime config: {0}")]
    Parse(String),
    /// A value is outside its accepted range.
    #[error("invalid runtime config field `{field}`: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// Runtime configuration. Every field has a default, so an empty document is valid.
pub struct RuntimeConfig {
    /// Events kept in the bus history ring buffer.
    pub event_history_capacity: usize,
    /// Teardown bound for `close`, in milliseconds.
    pub teardown_timeout_ms: u64,
    /// Backoff before the module fetch retry, in milliseconds.
    pub load_retry_backoff_ms: u64,
    /// Idle time before an unreferenced module may be evicted, in milliseconds.
    pub module_grace_period_ms: u64,
    /// Cache size a moderate memory-pressure signal trims down to.
    pub module_cache_soft_limit: usize,
    /// Layout autosave debounce, in milliseconds.
    pub autosave_debounce_ms: u64,
    /// Layout save attempts per change before reporting failure.
    pub autosave_max_attempts: u32,
    /// Windows restored from a persisted layout at most.
    pub max_restore_windows: usize,
    /// Desktop area maximized windows fill.
    pub viewport: WindowRect,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_history_capacity: DEFAULT_EVENT_HISTORY_CAPACITY,
            teardown_timeout_ms: DEFAULT_TEARDOWN_TIMEOUT_MS,
            load_retry_backoff_ms: DEFAULT_LOAD_RETRY_BACKOFF_MS,
            module_grace_period_ms: DEFAULT_MODULE_GRACE_PERIOD_MS,
            module_cache_soft_limit: DEFAULT_MODULE_CACHE_SOFT_LIMIT,
            autosave_debounce_ms: DEFAULT_AUTOSAVE_DEBOUNCE_MS,
            autosave_max_attempts: DEFAULT_AUTOSAVE_MAX_ATTEMPTS,
            max_restore_windows: DEFAULT_MAX_RESTORE_WINDOWS,
            viewport: WindowRect {
                x: 0,
                y: 0,
                w: 1280,
                h: 760,
            },
        }
    }
}

impl RuntimeConfig {
    /// Parses and validates a TOML configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML and [`ConfigError::Invalid`] for values
    /// that fail [`RuntimeConfig::validate`].
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field and range constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_history_capacity == 0 {
            return Err(invalid("event_history_capacity", "must be at least 1"));
        }
        if self.teardown_timeout_ms == 0 {
            return Err(invalid("teardown_timeout_ms", "must be positive"));
        }
        if self.autosave_max_attempts == 0 {
            return Err(invalid("autosave_max_attempts", "must be at least 1"));
        }
        if self.viewport.w <= 0 || self.viewport.h <= 0 {
            return Err(invalid("viewport", "width and height must be positive"));
        }
        Ok(())
    }

    /// Teardown bound as a [`Duration`].
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    /// Fetch retry backoff as a [`Duration`].
    pub fn load_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.load_retry_backoff_ms)
    }

    /// Module eviction grace period as a [`Duration`].
    pub fn module_grace_period(&self) -> Duration {
        Duration::from_millis(self.module_grace_period_ms)
    }

    /// Layout autosave debounce as a [`Duration`].
    pub fn autosave_debounce(&self) -> Duration {
        Duration::from_millis(self.autosave_debounce_ms)
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}
