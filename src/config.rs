//! Configuration loading via `ortho-config`.
//!
//! [`ClientConfig`] merges defaults, configuration files, and `BYOCVPN_*`
//! environment variables. Validation errors name the environment variable and
//! TOML key that fix them.

use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Default helper binary invoked by the command backend.
pub const DEFAULT_BACKEND_BIN: &str = "byocvpn";

/// Default label for instances the backend reports without a name.
pub const DEFAULT_INSTANCE_DISPLAY_NAME: &str = "VPN Server";

/// Synchroniser settings.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "BYOCVPN",
    discovery(
        app_name = "byocvpn",
        env_var = "BYOCVPN_CONFIG_PATH",
        config_file_name = "byocvpn.toml",
        dotfile_name = ".byocvpn.toml",
        project_file_name = "byocvpn.toml"
    )
)]
pub struct ClientConfig {
    /// Path to the backend helper executable.
    #[ortho_config(default = DEFAULT_BACKEND_BIN.to_owned())]
    pub backend_bin: String,
    /// Interval between VPN status reconciliation polls, in milliseconds.
    #[ortho_config(default = 2000)]
    pub status_poll_interval_ms: u64,
    /// Interval between metrics samples taken by the command backend, in
    /// milliseconds.
    #[ortho_config(default = 1000)]
    pub metrics_poll_interval_ms: u64,
    /// Upper bound on concurrent per-region inventory queries. Zero means one
    /// query per region with no cap.
    #[ortho_config(default = 0)]
    pub max_concurrent_region_queries: usize,
    /// Label used for instances without a backend supplied name.
    #[ortho_config(default = DEFAULT_INSTANCE_DISPLAY_NAME.to_owned())]
    pub instance_display_name: String,
    /// Capacity of the metrics push channel.
    #[ortho_config(default = 32)]
    pub metrics_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend_bin: DEFAULT_BACKEND_BIN.to_owned(),
            status_poll_interval_ms: 2000,
            metrics_poll_interval_ms: 1000,
            max_concurrent_region_queries: 0,
            instance_display_name: DEFAULT_INSTANCE_DISPLAY_NAME.to_owned(),
            metrics_buffer: 32,
        }
    }
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn hint(&self) -> String {
        format!(
            "set {} or add {} to byocvpn.toml",
            self.env_var, self.toml_key
        )
    }
}

impl ClientConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: {}",
                metadata.description,
                metadata.hint()
            )));
        }
        Ok(())
    }

    fn require_positive(value: u64, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} must be greater than zero: {}",
                metadata.description,
                metadata.hint()
            )));
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("byocvpn-sync")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages include guidance on how to
    /// provide corrected values via environment variables or configuration
    /// files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required string is empty
    /// and [`ConfigError::Invalid`] when an interval or buffer is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.backend_bin,
            &FieldMetadata::new("backend binary", "BYOCVPN_BACKEND_BIN", "backend_bin"),
        )?;
        Self::require_field(
            &self.instance_display_name,
            &FieldMetadata::new(
                "instance display name",
                "BYOCVPN_INSTANCE_DISPLAY_NAME",
                "instance_display_name",
            ),
        )?;
        Self::require_positive(
            self.status_poll_interval_ms,
            &FieldMetadata::new(
                "status poll interval",
                "BYOCVPN_STATUS_POLL_INTERVAL_MS",
                "status_poll_interval_ms",
            ),
        )?;
        Self::require_positive(
            self.metrics_poll_interval_ms,
            &FieldMetadata::new(
                "metrics poll interval",
                "BYOCVPN_METRICS_POLL_INTERVAL_MS",
                "metrics_poll_interval_ms",
            ),
        )?;
        Self::require_positive(
            u64::try_from(self.metrics_buffer).unwrap_or(u64::MAX),
            &FieldMetadata::new(
                "metrics buffer",
                "BYOCVPN_METRICS_BUFFER",
                "metrics_buffer",
            ),
        )?;
        Ok(())
    }

    /// Status reconciliation interval.
    #[must_use]
    pub const fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    /// Metrics sampling interval.
    #[must_use]
    pub const fn metrics_poll_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_poll_interval_ms)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field holds a value outside its accepted range.
    #[error("invalid configuration value: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
