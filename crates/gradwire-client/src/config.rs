//! Client configuration file support.
//!
//! Configuration is read from TOML files and environment variables. Every
//! field is optional so files can be layered: later sources override
//! earlier ones field by field.

use crate::retry::{BackpressurePolicy, RetryPolicy};
use gradwire_abstraction::ClientError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding `base_url`.
pub const ENV_BASE_URL: &str = "GRADWIRE_BASE_URL";
/// Environment variable overriding `api_key`.
pub const ENV_API_KEY: &str = "GRADWIRE_API_KEY";
/// Environment variable overriding `model_id`.
pub const ENV_MODEL_ID: &str = "GRADWIRE_MODEL_ID";

/// Client configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Base URL of the training service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// API key sent as a bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Default model to train
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,

    /// Log level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Timeout of a single HTTP call, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,

    /// Debounce window of queue state notifications, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debounce_secs: Option<u64>,

    /// Transport retry settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// Backpressure settings
    #[serde(default)]
    pub backpressure: BackpressureConfig,
}

/// `[retry]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,
}

/// `[backpressure]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackpressureConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_delay_ms: Option<u64>,
    /// Give up after this many try-again replies; unset waits indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,
}

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// Failed to read configuration file.
    #[error("Failed to read configuration file: {0}")]
    ReadError(String),

    /// Failed to parse configuration file.
    #[error("Failed to parse configuration file: {0}")]
    ParseError(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl From<ConfigError> for ClientError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl ClientConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;

        toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))
    }

    /// Renders the configuration as TOML.
    pub fn to_toml(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(format!("Failed to serialize: {}", e)))
    }

    /// Get default global configuration file path.
    pub fn default_global_path() -> PathBuf {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".gradwire")
            .join("config.toml")
    }

    /// Get default local configuration file path.
    pub fn default_local_path() -> PathBuf {
        PathBuf::from(".gradwirerc")
    }

    /// Discover and load configuration files.
    ///
    /// Loads the global config (~/.gradwire/config.toml), then the local
    /// config (./.gradwirerc). Local config overrides global config.
    pub fn discover_and_load() -> Self {
        Self::load_layered(&[Self::default_global_path(), Self::default_local_path()])
    }

    /// Loads and merges the files that exist, in order; later files win.
    pub fn load_layered(paths: &[PathBuf]) -> Self {
        let mut config = Self::default();
        for path in paths {
            match Self::load_from_file(path) {
                Ok(layer) => config.merge(&layer),
                Err(ConfigError::NotFound(_)) => {}
                Err(e) => tracing::warn!(error = %e, "Ignoring unreadable configuration file"),
            }
        }
        config
    }

    /// Merge another configuration into this one.
    ///
    /// Values from `other` override values in `self` if they are Some.
    pub fn merge(&mut self, other: &Self) {
        fn take<T: Clone>(target: &mut Option<T>, source: &Option<T>) {
            if let Some(value) = source {
                *target = Some(value.clone());
            }
        }

        take(&mut self.base_url, &other.base_url);
        take(&mut self.api_key, &other.api_key);
        take(&mut self.model_id, &other.model_id);
        take(&mut self.log_level, &other.log_level);
        take(&mut self.request_timeout_secs, &other.request_timeout_secs);
        take(&mut self.debounce_secs, &other.debounce_secs);

        take(&mut self.retry.max_retries, &other.retry.max_retries);
        take(&mut self.retry.initial_delay_ms, &other.retry.initial_delay_ms);
        take(&mut self.retry.max_delay_ms, &other.retry.max_delay_ms);
        take(&mut self.retry.multiplier, &other.retry.multiplier);
        take(&mut self.retry.jitter, &other.retry.jitter);

        take(&mut self.backpressure.min_delay_ms, &other.backpressure.min_delay_ms);
        take(&mut self.backpressure.max_attempts, &other.backpressure.max_attempts);
        take(&mut self.backpressure.jitter, &other.backpressure.jitter);
    }

    /// Applies `GRADWIRE_*` environment variables on top of this configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_from(|key| std::env::var(key).ok());
    }

    /// Applies overrides looked up by environment variable name.
    pub fn apply_env_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(base_url) = non_empty(ENV_BASE_URL) {
            self.base_url = Some(base_url);
        }
        if let Some(api_key) = non_empty(ENV_API_KEY) {
            self.api_key = Some(api_key);
        }
        if let Some(model_id) = non_empty(ENV_MODEL_ID) {
            self.model_id = Some(model_id);
        }
    }

    /// Sets the base URL.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Sets the API key.
    #[must_use]
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Sets the default model.
    #[must_use]
    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    /// Bounds the number of try-again replies before giving up.
    #[must_use]
    pub fn with_max_backpressure_attempts(mut self, max_attempts: u32) -> Self {
        self.backpressure.max_attempts = Some(max_attempts);
        self
    }

    /// Checks that the configuration can build a client.
    pub fn validate(&self) -> ConfigResult<()> {
        let base_url = self.base_url.as_deref().unwrap_or_default();
        if base_url.trim().is_empty() {
            return Err(ConfigError::InvalidValue(format!(
                "base_url is not set (use the config file or {})",
                ENV_BASE_URL
            )));
        }
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue(format!(
                "base_url must be an http(s) URL: {}",
                base_url
            )));
        }
        if self.request_timeout_secs == Some(0) {
            return Err(ConfigError::InvalidValue(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        if let Some(multiplier) = self.retry.multiplier {
            if !(multiplier.is_finite() && multiplier >= 1.0) {
                return Err(ConfigError::InvalidValue(format!(
                    "retry.multiplier must be >= 1.0, got {}",
                    multiplier
                )));
            }
        }
        let jitters = [
            ("retry.jitter", self.retry.jitter),
            ("backpressure.jitter", self.backpressure.jitter),
        ];
        for (name, jitter) in jitters {
            if let Some(jitter) = jitter {
                if !(0.0..=1.0).contains(&jitter) {
                    return Err(ConfigError::InvalidValue(format!(
                        "{} must be within [0, 1], got {}",
                        name, jitter
                    )));
                }
            }
        }
        if let (Some(initial), Some(max)) = (self.retry.initial_delay_ms, self.retry.max_delay_ms) {
            if initial > max {
                return Err(ConfigError::InvalidValue(format!(
                    "retry.initial_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                    initial, max
                )));
            }
        }
        Ok(())
    }

    /// The transport retry policy, with defaults for unset fields.
    pub fn retry_policy(&self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_retries: self.retry.max_retries.unwrap_or(defaults.max_retries),
            initial_delay: self
                .retry
                .initial_delay_ms
                .map_or(defaults.initial_delay, Duration::from_millis),
            max_delay: self.retry.max_delay_ms.map_or(defaults.max_delay, Duration::from_millis),
            multiplier: self.retry.multiplier.unwrap_or(defaults.multiplier),
            jitter: self.retry.jitter.unwrap_or(defaults.jitter),
        }
    }

    /// The backpressure policy, with defaults for unset fields.
    pub fn backpressure_policy(&self) -> BackpressurePolicy {
        let defaults = BackpressurePolicy::default();
        BackpressurePolicy {
            min_delay: self
                .backpressure
                .min_delay_ms
                .map_or(defaults.min_delay, Duration::from_millis),
            max_attempts: self.backpressure.max_attempts.or(defaults.max_attempts),
            jitter: self.backpressure.jitter.unwrap_or(defaults.jitter),
        }
    }

    /// Debounce window of queue state notifications, if configured.
    pub fn debounce_window(&self) -> Option<Duration> {
        self.debounce_secs.map(Duration::from_secs)
    }

    /// Timeout of a single HTTP call, if configured.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    /// A copy safe to print: the API key is masked.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.api_key.is_some() {
            copy.api_key = Some("********".to_string());
        }
        copy
    }
}
