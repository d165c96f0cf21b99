//! # pvstream
//!
//! Continuous camera streaming through a fixed set of rotating frame buffers.
//!
//! The buffer pool lives in `pvstream-pool` and the cameras and streaming
//! session in `pvstream-driver`. This crate holds what the command-line tool
//! adds on top:
//!
//! - **`app`**: Builds the camera from configuration and runs a streaming session.
//! - **`config`**: Layered configuration (defaults, TOML file, `PVSTREAM_` environment).
//! - **`error`**: The `AppError` enum and `AppResult` alias.
//! - **`tracing_setup`**: `tracing-subscriber` initialization.

pub mod app;
pub mod config;
pub mod error;
pub mod tracing_setup;

pub use config::AppConfig;
pub use error::{AppError, AppResult};
