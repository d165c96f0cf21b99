//! Frame buffers and the vendor status/format vocabulary.
//!
//! A [`FrameBuffer`] is one reusable capture target. Its payload is allocated
//! once at the capacity the device asks for ("TotalBytesPerFrame") and is never
//! shrunk; devices write into it and report how many bytes were actually filled
//! via [`FrameBuffer::set_completed`].
//!
//! [`FrameStatus`] and [`PixelFormat`] mirror the numeric codes of the GigE SDK
//! so that FFI-backed devices can map raw values with `from_code`.

use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

/// Stable slot index of a frame buffer inside its rotation buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(pub usize);

impl FrameId {
    /// Slot index as a plain `usize`.
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle state of a frame buffer as seen by callers.
///
/// `Free -> Queued -> Completed -> Free`; shutdown may move `Queued` straight
/// back to `Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Owned by the rotation buffer, available for submission.
    Free,
    /// Handed to the capture device, waiting for completion.
    Queued,
    /// Returned by the device and waiting for (or held by) the consumer.
    Completed,
}

/// Result code of a device call or a completed frame.
///
/// Discriminants follow the SDK's `tPvErr` ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameStatus {
    /// No error.
    Success,
    /// Unexpected camera fault.
    CameraFault,
    /// Unexpected fault in the SDK or driver.
    InternalFault,
    /// Camera handle is invalid.
    BadHandle,
    /// Bad parameter to an API call.
    BadParameter,
    /// Sequence of API calls is incorrect.
    BadSequence,
    /// Camera or attribute not found.
    NotFound,
    /// Camera cannot be opened in the requested mode.
    AccessDenied,
    /// Camera was unplugged.
    Unplugged,
    /// Setup is invalid (an attribute is invalid).
    InvalidSetup,
    /// System/network resources or memory not available.
    Resources,
    /// Link bandwidth not available.
    Bandwidth,
    /// Too many frames on the device queue.
    QueueFull,
    /// Frame buffer is too small for the current image.
    BufferTooSmall,
    /// Frame cancelled by the user.
    Cancelled,
    /// The data for the frame was lost.
    DataLost,
    /// Some data in the frame is missing.
    DataMissing,
    /// Timeout during wait.
    Timeout,
    /// Attribute value is out of range.
    OutOfRange,
    /// Attribute is not of the requested type.
    WrongType,
    /// Attribute write forbidden at this time.
    Forbidden,
    /// Attribute is not available at this time.
    Unavailable,
    /// A firewall is blocking the traffic.
    Firewall,
}

const STATUS_BY_CODE: [FrameStatus; 23] = [
    FrameStatus::Success,
    FrameStatus::CameraFault,
    FrameStatus::InternalFault,
    FrameStatus::BadHandle,
    FrameStatus::BadParameter,
    FrameStatus::BadSequence,
    FrameStatus::NotFound,
    FrameStatus::AccessDenied,
    FrameStatus::Unplugged,
    FrameStatus::InvalidSetup,
    FrameStatus::Resources,
    FrameStatus::Bandwidth,
    FrameStatus::QueueFull,
    FrameStatus::BufferTooSmall,
    FrameStatus::Cancelled,
    FrameStatus::DataLost,
    FrameStatus::DataMissing,
    FrameStatus::Timeout,
    FrameStatus::OutOfRange,
    FrameStatus::WrongType,
    FrameStatus::Forbidden,
    FrameStatus::Unavailable,
    FrameStatus::Firewall,
];

impl FrameStatus {
    /// Map a raw SDK error code. Unknown codes are reported as `InternalFault`.
    #[must_use]
    pub fn from_code(code: u32) -> Self {
        STATUS_BY_CODE
            .get(code as usize)
            .copied()
            .unwrap_or(FrameStatus::InternalFault)
    }

    /// Raw SDK error code.
    #[must_use]
    pub fn code(self) -> u32 {
        self as u32
    }

    /// `true` for [`FrameStatus::Success`].
    #[must_use]
    pub fn is_success(self) -> bool {
        self == FrameStatus::Success
    }

    /// `true` for [`FrameStatus::Cancelled`]; cancelled frames are never displayed.
    #[must_use]
    pub fn is_cancelled(self) -> bool {
        self == FrameStatus::Cancelled
    }

    /// Frames that arrived but are partially or wholly missing their data.
    #[must_use]
    pub fn is_incomplete(self) -> bool {
        matches!(self, FrameStatus::DataLost | FrameStatus::DataMissing)
    }

    /// Device-level failures that end a streaming session.
    #[must_use]
    pub fn is_device_fault(self) -> bool {
        matches!(
            self,
            FrameStatus::Unplugged
                | FrameStatus::CameraFault
                | FrameStatus::InternalFault
                | FrameStatus::BadHandle
        )
    }
}

impl fmt::Display for FrameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FrameStatus::Success => "success",
            FrameStatus::CameraFault => "camera fault",
            FrameStatus::InternalFault => "internal fault",
            FrameStatus::BadHandle => "bad handle",
            FrameStatus::BadParameter => "bad parameter",
            FrameStatus::BadSequence => "bad call sequence",
            FrameStatus::NotFound => "not found",
            FrameStatus::AccessDenied => "access denied",
            FrameStatus::Unplugged => "camera unplugged",
            FrameStatus::InvalidSetup => "invalid setup",
            FrameStatus::Resources => "resources unavailable",
            FrameStatus::Bandwidth => "bandwidth unavailable",
            FrameStatus::QueueFull => "frame queue full",
            FrameStatus::BufferTooSmall => "frame buffer too small",
            FrameStatus::Cancelled => "cancelled",
            FrameStatus::DataLost => "frame data lost",
            FrameStatus::DataMissing => "frame data missing",
            FrameStatus::Timeout => "timeout",
            FrameStatus::OutOfRange => "value out of range",
            FrameStatus::WrongType => "wrong attribute type",
            FrameStatus::Forbidden => "write forbidden",
            FrameStatus::Unavailable => "attribute unavailable",
            FrameStatus::Firewall => "blocked by firewall",
        };
        f.write_str(text)
    }
}

/// Image pixel layout reported by the device.
///
/// Discriminants follow the SDK's `tPvImageFormat` ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Monochrome, 8 bits.
    Mono8,
    /// Monochrome, 16 bits, LSB aligned.
    Mono16,
    /// Bayer-color, 8 bits.
    Bayer8,
    /// Bayer-color, 16 bits, LSB aligned.
    Bayer16,
    /// RGB, 8 bits x 3.
    Rgb24,
    /// RGB, 16 bits x 3, LSB aligned.
    Rgb48,
    /// YUV 4:1:1.
    Yuv411,
    /// YUV 4:2:2.
    Yuv422,
    /// YUV 4:4:4.
    Yuv444,
    /// BGR, 8 bits x 3.
    Bgr24,
    /// RGBA, 8 bits x 4.
    Rgba32,
    /// BGRA, 8 bits x 4.
    Bgra32,
    /// Monochrome, 12 bits packed.
    Mono12Packed,
    /// Bayer-color, 12 bits packed.
    Bayer12Packed,
}

const FORMAT_BY_CODE: [PixelFormat; 14] = [
    PixelFormat::Mono8,
    PixelFormat::Mono16,
    PixelFormat::Bayer8,
    PixelFormat::Bayer16,
    PixelFormat::Rgb24,
    PixelFormat::Rgb48,
    PixelFormat::Yuv411,
    PixelFormat::Yuv422,
    PixelFormat::Yuv444,
    PixelFormat::Bgr24,
    PixelFormat::Rgba32,
    PixelFormat::Bgra32,
    PixelFormat::Mono12Packed,
    PixelFormat::Bayer12Packed,
];

impl PixelFormat {
    /// Map a raw SDK image format code.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        FORMAT_BY_CODE.get(code as usize).copied()
    }

    /// Attribute string used by the camera's `PixelFormat` enum.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Mono8 => "Mono8",
            PixelFormat::Mono16 => "Mono16",
            PixelFormat::Bayer8 => "Bayer8",
            PixelFormat::Bayer16 => "Bayer16",
            PixelFormat::Rgb24 => "Rgb24",
            PixelFormat::Rgb48 => "Rgb48",
            PixelFormat::Yuv411 => "Yuv411",
            PixelFormat::Yuv422 => "Yuv422",
            PixelFormat::Yuv444 => "Yuv444",
            PixelFormat::Bgr24 => "Bgr24",
            PixelFormat::Rgba32 => "Rgba32",
            PixelFormat::Bgra32 => "Bgra32",
            PixelFormat::Mono12Packed => "Mono12Packed",
            PixelFormat::Bayer12Packed => "Bayer12Packed",
        }
    }

    /// Bytes needed for one `width` x `height` image, rounding packed formats up.
    #[must_use]
    pub fn frame_bytes(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Mono8 | PixelFormat::Bayer8 => pixels,
            PixelFormat::Mono16 | PixelFormat::Bayer16 | PixelFormat::Yuv422 => pixels * 2,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 | PixelFormat::Yuv444 => pixels * 3,
            PixelFormat::Rgba32 | PixelFormat::Bgra32 => pixels * 4,
            PixelFormat::Rgb48 => pixels * 6,
            PixelFormat::Yuv411 | PixelFormat::Mono12Packed | PixelFormat::Bayer12Packed => {
                (pixels * 3).div_ceil(2)
            }
        }
    }

    /// Significant bits per channel sample.
    #[must_use]
    pub fn bit_depth(self) -> u8 {
        match self {
            PixelFormat::Mono16 | PixelFormat::Bayer16 | PixelFormat::Rgb48 => 16,
            PixelFormat::Mono12Packed | PixelFormat::Bayer12Packed => 12,
            _ => 8,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a pixel format name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown pixel format '{0}'")]
pub struct UnknownPixelFormat(pub String);

impl FromStr for PixelFormat {
    type Err = UnknownPixelFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FORMAT_BY_CODE
            .iter()
            .copied()
            .find(|format| format.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownPixelFormat(s.to_string()))
    }
}

/// Per-frame metadata filled in by the device on completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Left edge of the readout region.
    pub region_x: u32,
    /// Top edge of the readout region.
    pub region_y: u32,
    /// Pixel layout of the payload.
    pub format: PixelFormat,
    /// Number of significant bits per sample.
    pub bit_depth: u8,
    /// Rolling frame counter from the device.
    pub sequence: u64,
    /// Device timestamp in camera clock ticks.
    pub timestamp: u64,
}

impl FrameMetadata {
    /// Combine the SDK's split 32-bit timestamp halves.
    #[must_use]
    pub fn timestamp_from_parts(hi: u32, lo: u32) -> u64 {
        (u64::from(hi) << 32) | u64::from(lo)
    }
}

/// One reusable capture target.
///
/// Instances are created by a [`RotationBuffer`](crate::RotationBuffer) and
/// can only circulate between it and its capture device.
#[derive(Debug)]
pub struct FrameBuffer {
    pub(crate) owner: u64,
    id: FrameId,
    payload: Vec<u8>,
    image_size: usize,
    status: FrameStatus,
    metadata: Option<FrameMetadata>,
}

impl FrameBuffer {
    /// Allocate a zero-filled buffer, reporting allocation failure instead of aborting.
    pub(crate) fn allocate(
        owner: u64,
        id: FrameId,
        capacity: usize,
    ) -> Result<Self, std::collections::TryReserveError> {
        let mut frame = Self {
            owner,
            id,
            payload: Vec::new(),
            image_size: 0,
            status: FrameStatus::Success,
            metadata: None,
        };
        frame.reallocate(capacity)?;
        Ok(frame)
    }

    /// Replace the payload with a fresh allocation of `capacity` bytes.
    pub(crate) fn reallocate(
        &mut self,
        capacity: usize,
    ) -> Result<(), std::collections::TryReserveError> {
        // Release the old storage first so growth does not briefly need both.
        self.payload = Vec::new();
        self.payload.try_reserve_exact(capacity)?;
        self.payload.resize(capacity, 0);
        self.image_size = 0;
        Ok(())
    }

    /// Clear completion results before the buffer goes back to the device.
    ///
    /// Pixel data is left in place; the next capture overwrites it.
    pub(crate) fn reset(&mut self) {
        self.image_size = 0;
        self.status = FrameStatus::Success;
        self.metadata = None;
    }

    /// Slot index of this buffer.
    #[must_use]
    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Allocated payload size in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.payload.len()
    }

    /// Completion status of the last capture.
    #[must_use]
    pub fn status(&self) -> FrameStatus {
        self.status
    }

    /// Metadata of the last capture, only present once completed.
    #[must_use]
    pub fn metadata(&self) -> Option<&FrameMetadata> {
        self.metadata.as_ref()
    }

    /// Number of payload bytes written by the last capture.
    #[must_use]
    pub fn image_size(&self) -> usize {
        self.image_size
    }

    /// Valid image bytes of the last capture.
    #[inline]
    #[must_use]
    pub fn image(&self) -> &[u8] {
        &self.payload[..self.image_size]
    }

    /// Whole payload, for the device to write into.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    /// Raw payload pointer for FFI capture targets.
    ///
    /// The pointer stays valid while the buffer is owned by the device, since
    /// the payload is never reallocated while queued.
    #[inline]
    pub fn payload_ptr(&mut self) -> *mut u8 {
        self.payload.as_mut_ptr()
    }

    /// Record a finished capture. `image_size` is clamped to the capacity.
    pub fn set_completed(
        &mut self,
        status: FrameStatus,
        image_size: usize,
        metadata: FrameMetadata,
    ) {
        self.status = status;
        self.image_size = image_size.min(self.payload.len());
        self.metadata = Some(metadata);
    }

    /// Record a capture that ended without image data (cancelled, faulted).
    pub fn set_status(&mut self, status: FrameStatus) {
        self.status = status;
        self.image_size = 0;
        self.metadata = None;
    }

    /// Copy the valid image bytes out so they can outlive the buffer's loan.
    #[must_use]
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(self.image())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(width: u32, height: u32) -> FrameMetadata {
        FrameMetadata {
            width,
            height,
            region_x: 0,
            region_y: 0,
            format: PixelFormat::Mono8,
            bit_depth: 8,
            sequence: 7,
            timestamp: 99,
        }
    }

    #[test]
    fn test_allocate_zero_filled() {
        let frame = FrameBuffer::allocate(1, FrameId(3), 64).unwrap();
        assert_eq!(frame.id(), FrameId(3));
        assert_eq!(frame.capacity(), 64);
        assert_eq!(frame.image_size(), 0);
        assert!(frame.metadata().is_none());
        assert!(frame.image().is_empty());
    }

    #[test]
    fn test_set_completed_clamps_image_size() {
        let mut frame = FrameBuffer::allocate(1, FrameId(0), 16).unwrap();
        frame.payload_mut().fill(5);
        frame.set_completed(FrameStatus::Success, 100, meta(4, 4));

        assert_eq!(frame.image_size(), 16);
        assert_eq!(frame.metadata().unwrap().sequence, 7);
        assert_eq!(frame.snapshot().len(), 16);
    }

    #[test]
    fn test_reset_keeps_capacity() {
        let mut frame = FrameBuffer::allocate(1, FrameId(0), 32).unwrap();
        frame.set_completed(FrameStatus::DataMissing, 8, meta(2, 4));
        frame.reset();

        assert_eq!(frame.capacity(), 32);
        assert_eq!(frame.status(), FrameStatus::Success);
        assert!(frame.metadata().is_none());
        assert_eq!(frame.image_size(), 0);
    }

    #[test]
    fn test_reallocate_grows() {
        let mut frame = FrameBuffer::allocate(1, FrameId(0), 8).unwrap();
        frame.reallocate(1024).unwrap();
        assert_eq!(frame.capacity(), 1024);
    }

    #[test]
    fn test_status_codes_follow_sdk_order() {
        assert_eq!(FrameStatus::from_code(0), FrameStatus::Success);
        assert_eq!(FrameStatus::from_code(8), FrameStatus::Unplugged);
        assert_eq!(FrameStatus::from_code(14), FrameStatus::Cancelled);
        assert_eq!(FrameStatus::from_code(15), FrameStatus::DataLost);
        assert_eq!(FrameStatus::from_code(22), FrameStatus::Firewall);
        assert_eq!(FrameStatus::from_code(999), FrameStatus::InternalFault);
        assert_eq!(FrameStatus::Cancelled.code(), 14);
    }

    #[test]
    fn test_status_classification() {
        assert!(FrameStatus::Unplugged.is_device_fault());
        assert!(FrameStatus::CameraFault.is_device_fault());
        assert!(!FrameStatus::QueueFull.is_device_fault());
        assert!(!FrameStatus::Cancelled.is_device_fault());
        assert!(FrameStatus::DataLost.is_incomplete());
        assert!(FrameStatus::Cancelled.is_cancelled());
    }

    #[test]
    fn test_pixel_format_parsing() {
        assert_eq!("Mono16".parse::<PixelFormat>(), Ok(PixelFormat::Mono16));
        assert_eq!("bgr24".parse::<PixelFormat>(), Ok(PixelFormat::Bgr24));
        assert!("Mono10".parse::<PixelFormat>().is_err());
        assert_eq!(PixelFormat::from_code(9), Some(PixelFormat::Bgr24));
        assert_eq!(PixelFormat::from_code(14), None);
    }

    #[test]
    fn test_frame_bytes() {
        assert_eq!(PixelFormat::Mono8.frame_bytes(640, 480), 307_200);
        assert_eq!(PixelFormat::Mono16.frame_bytes(640, 480), 614_400);
        assert_eq!(PixelFormat::Bgr24.frame_bytes(2, 2), 12);
        assert_eq!(PixelFormat::Mono12Packed.frame_bytes(3, 1), 5);
    }

    #[test]
    fn test_timestamp_from_parts() {
        assert_eq!(FrameMetadata::timestamp_from_parts(1, 2), (1u64 << 32) | 2);
    }
}
