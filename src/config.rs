//! Configuration loading using Figment
//!
//! Configuration is layered from:
//! 1. Built-in defaults
//! 2. A TOML file (`config/pvstream.toml` unless another path is given)
//! 3. Environment variables prefixed with `PVSTREAM_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use pvstream::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Buffers: {}", config.rotation.buffer_count);
//! # Ok::<(), pvstream::AppError>(())
//! ```

use crate::error::{AppError, AppResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use pvstream_driver::{MockCameraConfig, RunOptions};
use pvstream_pool::{PixelFormat, RotationConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/pvstream.toml";

/// Prefix of environment overrides, e.g. `PVSTREAM_ROTATION__BUFFER_COUNT=8`.
pub const ENV_PREFIX: &str = "PVSTREAM_";

/// Upper bound on the rotation buffer count.
pub const MAX_BUFFER_COUNT: usize = 64;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Rotation buffer settings
    #[serde(default)]
    pub rotation: RotationSettings,
    /// Poll loop settings
    #[serde(default)]
    pub stream: StreamSettings,
    /// Simulated camera settings
    #[serde(default)]
    pub camera: MockCameraConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Rotation buffer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationSettings {
    /// Buffers kept in rotation (default: 4)
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,
    /// Re-submit the oldest deferred buffer on every completion (default: true)
    #[serde(default = "default_resubmit")]
    pub resubmit_on_completion: bool,
    /// Longest wait for outstanding buffers on shutdown, in milliseconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

/// Streaming loop configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Poll period in milliseconds (default: 10)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Frame rate report period in milliseconds (default: 250)
    #[serde(default = "default_stats_interval")]
    pub stats_interval_ms: u64,
}

// Default value functions
fn default_name() -> String {
    "pvstream".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_buffer_count() -> usize {
    pvstream_pool::DEFAULT_BUFFER_COUNT
}

fn default_resubmit() -> bool {
    true
}

fn default_shutdown_timeout() -> u64 {
    pvstream_pool::DEFAULT_SHUTDOWN_TIMEOUT.as_millis() as u64
}

fn default_poll_interval() -> u64 {
    pvstream_driver::DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_stats_interval() -> u64 {
    pvstream_driver::DEFAULT_STATS_INTERVAL.as_millis() as u64
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            buffer_count: default_buffer_count(),
            resubmit_on_completion: default_resubmit(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            stats_interval_ms: default_stats_interval(),
        }
    }
}

impl AppConfig {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and the environment.
    ///
    /// A missing file is not an error; defaults and environment overrides still apply.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// The provider stack behind [`load_from`](Self::load_from).
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let level = self.application.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(AppError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                VALID_LOG_LEVELS.join(", ")
            )));
        }

        if self.rotation.buffer_count == 0 || self.rotation.buffer_count > MAX_BUFFER_COUNT {
            return Err(AppError::Configuration(format!(
                "Invalid buffer_count {}. Must be 1-{}",
                self.rotation.buffer_count, MAX_BUFFER_COUNT
            )));
        }

        if self.rotation.shutdown_timeout_ms == 0 {
            return Err(AppError::Configuration(
                "shutdown_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if self.stream.poll_interval_ms == 0 || self.stream.stats_interval_ms == 0 {
            return Err(AppError::Configuration(
                "poll_interval_ms and stats_interval_ms must be greater than zero".to_string(),
            ));
        }

        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(AppError::Configuration(format!(
                "Invalid camera resolution {}x{}",
                self.camera.width, self.camera.height
            )));
        }

        if self.camera.pixel_format.parse::<PixelFormat>().is_err() {
            return Err(AppError::Configuration(format!(
                "Unknown camera pixel_format '{}'",
                self.camera.pixel_format
            )));
        }

        if self.camera.queue_limit == 0 {
            return Err(AppError::Configuration(
                "camera queue_limit must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Rotation buffer settings as the pool expects them.
    pub fn rotation_config(&self) -> RotationConfig {
        RotationConfig {
            buffer_count: self.rotation.buffer_count,
            resubmit_on_completion: self.rotation.resubmit_on_completion,
            shutdown_timeout: Duration::from_millis(self.rotation.shutdown_timeout_ms),
        }
    }

    /// Poll loop options, stopping after `max_frames` when given.
    pub fn run_options(&self, max_frames: Option<u64>) -> RunOptions {
        RunOptions {
            poll_interval: Duration::from_millis(self.stream.poll_interval_ms),
            stats_interval: Duration::from_millis(self.stream.stats_interval_ms),
            max_frames,
        }
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rotation.buffer_count, 4);
        assert_eq!(config.rotation_config(), RotationConfig::default());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = AppConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(matches!(
            config.validate(),
            Err(AppError::Configuration(msg)) if msg.contains("verbose")
        ));
    }

    #[test]
    fn test_buffer_count_range() {
        let mut config = AppConfig::default();
        config.rotation.buffer_count = 0;
        assert!(config.validate().is_err());

        config.rotation.buffer_count = MAX_BUFFER_COUNT + 1;
        assert!(config.validate().is_err());

        config.rotation.buffer_count = MAX_BUFFER_COUNT;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_pixel_format() {
        let mut config = AppConfig::default();
        config.camera.pixel_format = "Mono9".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_run_options() {
        let mut config = AppConfig::default();
        config.stream.poll_interval_ms = 5;
        let options = config.run_options(Some(10));
        assert_eq!(options.poll_interval, Duration::from_millis(5));
        assert_eq!(options.stats_interval, pvstream_driver::DEFAULT_STATS_INTERVAL);
        assert_eq!(options.max_frames, Some(10));
    }

    #[test]
    fn test_toml_rendering_round_trips() {
        let config = AppConfig::default();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("[rotation]"));
        let parsed: AppConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
