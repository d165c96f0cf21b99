//! Application error type.
//!
//! `AppError` gathers what can go wrong outside the rotation buffer itself:
//!
//! - **`Config`**: figment could not read or extract the configuration.
//! - **`Configuration`**: the configuration parsed but holds values that make no
//!   sense, caught by [`AppConfig::validate`](crate::config::AppConfig::validate).
//! - **`Rotation`**: a [`RotationError`] surfaced from the buffer pool.
//! - **`Session`**: the streaming session or the camera failed.
//!
//! With `#[from]` conversions the CLI can use `?` on all of them.

use pvstream_pool::RotationError;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Errors raised by the pvstream application.
#[derive(Error, Debug)]
pub enum AppError {
    /// Loading or extracting the configuration failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Rendering the effective configuration failed.
    #[error("Failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),

    /// The rotation buffer reported an error.
    #[error("Rotation buffer error: {0}")]
    Rotation(#[from] RotationError),

    /// Logging could not be set up.
    #[error("Tracing setup failed: {0}")]
    Tracing(String),

    /// The streaming session or its camera failed.
    #[error("Streaming session failed: {0:#}")]
    Session(anyhow::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for AppError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<RotationError>() {
            Ok(rotation) => Self::Rotation(rotation),
            Err(other) => Self::Session(other),
        }
    }
}

impl AppError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Configuration(_) => 2,
            Self::Rotation(RotationError::DeviceFault(_)) => 3,
            _ => 1,
        }
    }
}
