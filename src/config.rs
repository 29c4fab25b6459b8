//! Configuration system using Figment
//!
//! Settings are layered, lowest precedence first:
//! 1. Built-in defaults (`Settings::default()`)
//! 2. A TOML file (by default `config/macroserver.toml`, optional)
//! 3. Environment variables prefixed with `MACROSERVER_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated with a double underscore:
//!
//! ```text
//! MACROSERVER_APPLICATION__LOG_LEVEL=debug
//! MACROSERVER_EXECUTOR__ABORT_RETRIES=10
//! MACROSERVER_SCAN__HISTORY_SIZE=50
//! ```
//!
//! # Example
//!
//! ```no_run
//! use daq_macroserver::config::Settings;
//!
//! let settings = Settings::load_from("config/macroserver.toml")?;
//! println!("Log level: {}", settings.application.log_level);
//! # Ok::<(), daq_macroserver::config::ConfigError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationSettings,
    /// Macro executor timing
    pub executor: ExecutorSettings,
    /// Scan engine settings
    pub scan: ScanSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: "macroserver".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Timing of the stop/abort/pause control protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// How long the abort pass waits for an in-flight stop pass
    pub stop_timeout_ms: u64,
    /// Bounded number of abort injections into the running macro
    pub abort_retries: u32,
    /// Delay between two abort injections
    pub abort_backoff_ms: u64,
    /// Grace window of the pause watchdog before it raises an abort itself
    pub pause_watchdog_grace_ms: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 3000,
            abort_retries: 5,
            abort_backoff_ms: 200,
            pause_watchdog_grace_ms: 500,
        }
    }
}

impl ExecutorSettings {
    /// Stop pass timeout as a `Duration`.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Abort backoff as a `Duration`.
    pub fn abort_backoff(&self) -> Duration {
        Duration::from_millis(self.abort_backoff_ms)
    }

    /// Pause watchdog grace window as a `Duration`.
    pub fn pause_watchdog_grace(&self) -> Duration {
        Duration::from_millis(self.pause_watchdog_grace_ms)
    }
}

/// Scan engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// Number of entries kept in the run history
    pub history_size: usize,
    /// Timeout for a single motion to become ready
    pub motion_timeout_ms: u64,
    /// Use pre-configured raw counts in step scans
    pub deterministic: bool,
    /// Continuous scan slow-down factor, in (0, 1]
    pub slow_down: f64,
    /// How long a hardware-timed scan waits for late value buffers
    pub countdown_timeout_ms: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            history_size: 20,
            motion_timeout_ms: 30_000,
            deterministic: false,
            slow_down: 1.0,
            countdown_timeout_ms: 2000,
        }
    }
}

impl ScanSettings {
    /// Motion timeout as a `Duration`.
    pub fn motion_timeout(&self) -> Duration {
        Duration::from_millis(self.motion_timeout_ms)
    }

    /// Countdown timeout as a `Duration`.
    pub fn countdown_timeout(&self) -> Duration {
        Duration::from_millis(self.countdown_timeout_ms)
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from `config/macroserver.toml` and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/macroserver.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error: defaults and environment overrides still
    /// apply. After loading, configuration is validated.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("MACROSERVER_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - History size is at least one entry
    /// - Slow-down factor is in (0, 1]
    /// - At least one abort injection is allowed
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.scan.history_size == 0 {
            return Err(ConfigError::ValidationError(
                "scan.history_size must be greater than 0".to_string(),
            ));
        }

        if !(self.scan.slow_down > 0.0 && self.scan.slow_down <= 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid scan.slow_down {}. Must be in (0, 1]",
                self.scan.slow_down
            )));
        }

        if self.executor.abort_retries == 0 {
            return Err(ConfigError::ValidationError(
                "executor.abort_retries must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.scan.history_size, 20);
        assert_eq!(settings.executor.pause_watchdog_grace(), Duration::from_millis(500));
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[scan]
history_size = 5
slow_down = 0.5
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.scan.history_size, 5);
        assert_eq!(settings.scan.slow_down, 0.5);
        // untouched sections keep their defaults
        assert_eq!(settings.executor.abort_retries, 5);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let settings = Settings::load_from("does/not/exist.toml").unwrap();
        assert_eq!(settings.application.name, "macroserver");
    }

    #[test]
    fn test_invalid_slow_down_rejected() {
        let mut settings = Settings::default();
        settings.scan.slow_down = 1.5;
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut settings = Settings::default();
        settings.application.log_level = "verbose".into();
        assert!(settings.validate().is_err());
    }
}
