//! Frame rotation buffer for continuous camera streaming.
//!
//! A camera driver fills caller-owned buffers asynchronously and returns them
//! on its own notification thread. This crate keeps a fixed set of such
//! buffers circulating so capture never stalls while the consumer is busy:
//!
//! - the consumer always gets the **most recent** completed frame,
//! - older completed frames are re-submitted unseen (dropped),
//! - submissions the driver refuses are parked and retried oldest-first,
//! - shutdown cancels the driver and waits, bounded, for every buffer to return.
//!
//! The driver side is abstracted by [`CaptureDevice`]; the mock and PvAPI
//! implementations live in `pvstream-driver`.
//!
//! # Example
//!
//! ```
//! use pvstream_pool::testing::ScriptedDevice;
//! use pvstream_pool::{FrameStatus, RotationBuffer, RotationConfig};
//! use std::sync::Arc;
//!
//! let camera = Arc::new(ScriptedDevice::new(64, 48));
//! let rotation = RotationBuffer::new(camera.clone(), RotationConfig::default());
//! rotation.initialize_from_device(4).unwrap();
//! rotation.submit_all().unwrap();
//!
//! camera.complete_next(FrameStatus::Success);
//! let frame = rotation.consume_latest().unwrap().expect("one frame completed");
//! assert_eq!(frame.image().len(), 64 * 48);
//! rotation.recycle(frame).unwrap();
//!
//! rotation.shutdown().unwrap();
//! assert_eq!(rotation.counts().free, 4);
//! ```

pub mod device;
pub mod error;
pub mod frame;
pub mod queue;
pub mod rotation;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use device::{CaptureDevice, CompletionHandle, DeviceResult, Rejection};
pub use error::{RotationError, RotationResult};
pub use frame::{
    FrameBuffer, FrameId, FrameMetadata, FrameState, FrameStatus, PixelFormat, UnknownPixelFormat,
};
pub use queue::RotationQueue;
pub use rotation::{
    ConsumedFrame, RotationBuffer, RotationConfig, RotationStats, StateCounts,
    DEFAULT_BUFFER_COUNT, DEFAULT_SHUTDOWN_TIMEOUT,
};
