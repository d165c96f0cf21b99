//! Capture device seam.
//!
//! The rotation buffer never talks to camera hardware directly. It moves
//! [`FrameBuffer`]s into a [`CaptureDevice`] and gets them back through a
//! [`CompletionHandle`], either immediately inside a [`Rejection`] or later
//! from the device's own notification thread.
//!
//! Implementations must:
//! - return from [`CaptureDevice::queue`] without waiting for the capture,
//! - complete frames in the order they were queued,
//! - hand back every cancelled buffer with [`FrameStatus::Cancelled`].

use crate::frame::{FrameBuffer, FrameStatus, PixelFormat};
pub use crate::rotation::CompletionHandle;

/// Result of a device call; errors use the SDK status vocabulary.
pub type DeviceResult<T> = Result<T, FrameStatus>;

/// A buffer the device refused to queue, handed back with the reason.
#[derive(Debug)]
pub struct Rejection {
    /// The refused buffer, unchanged.
    pub buffer: FrameBuffer,
    /// Why it was refused.
    pub status: FrameStatus,
}

impl Rejection {
    /// Bundle a refused buffer with its status.
    #[must_use]
    pub fn new(buffer: FrameBuffer, status: FrameStatus) -> Self {
        Self { buffer, status }
    }
}

/// A camera driver that fills caller-supplied buffers.
pub trait CaptureDevice: Send + Sync {
    /// Submit one buffer for capture.
    ///
    /// On success the device owns the buffer until it calls
    /// [`CompletionHandle::complete`]. The completion may happen on any thread,
    /// including synchronously inside this call.
    fn queue(&self, buffer: FrameBuffer, completion: CompletionHandle) -> Result<(), Rejection>;

    /// Cancel every outstanding submission.
    ///
    /// Must not be called from the completion path.
    fn cancel_all(&self) -> DeviceResult<()>;

    /// Bytes one frame needs at the current settings.
    fn bytes_per_frame(&self) -> DeviceResult<usize>;

    /// Current image width in pixels.
    fn current_width(&self) -> DeviceResult<u32>;

    /// Current image height in pixels.
    fn current_height(&self) -> DeviceResult<u32>;

    /// Current pixel format.
    fn current_pixel_format(&self) -> DeviceResult<PixelFormat>;

    /// Begin continuous acquisition.
    fn start_acquisition(&self) -> DeviceResult<()> {
        Ok(())
    }

    /// End acquisition. Devices may cancel their queue here.
    fn stop_acquisition(&self) -> DeviceResult<()> {
        Ok(())
    }
}
