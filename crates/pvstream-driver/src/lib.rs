//! Capture devices and streaming session for the pvstream rotation buffer.
//!
//! Components:
//! - `mock`: simulated GigE camera with its own notification thread
//! - `pvapi`: Prosilica cameras through PvAPI (feature `pvapi_sdk`)
//! - `acquisition`: start/poll/stop lifecycle and frame rate statistics

pub mod components;

pub use crate::components::acquisition::{
    FrameRateMeter, PollOutcome, RunOptions, SessionSummary, StreamSession,
    DEFAULT_POLL_INTERVAL, DEFAULT_STATS_INTERVAL,
};
#[cfg(feature = "mock")]
pub use crate::components::mock::{MockCamera, MockCameraBuilder, MockCameraConfig, MockMode};
#[cfg(feature = "pvapi_sdk")]
pub use crate::components::pvapi::PvApiCamera;
