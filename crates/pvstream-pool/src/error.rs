//! Error type for rotation buffer operations.

use crate::frame::{FrameId, FrameStatus};
use thiserror::Error;

/// Convenience alias for rotation buffer results.
pub type RotationResult<T> = Result<T, RotationError>;

/// Errors surfaced by [`RotationBuffer`](crate::RotationBuffer).
///
/// Buffer-level submission failures are absorbed and retried internally;
/// `SubmissionRejected` only appears where a caller submits a single buffer
/// and needs the reason.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RotationError {
    /// Frame storage could not be reserved. Fatal for the session.
    #[error("failed to allocate {count} frame buffers of {capacity} bytes: {reason}")]
    Allocation {
        /// Requested buffer count.
        count: usize,
        /// Requested bytes per buffer.
        capacity: usize,
        /// Allocator or argument error.
        reason: String,
    },

    /// `initialize` called while buffers are still owned by the device.
    #[error("cannot reinitialize while {queued} buffers are queued on the device")]
    BuffersInFlight {
        /// Buffers currently queued.
        queued: usize,
    },

    /// Operation needs buffers but `initialize` has not been called.
    #[error("rotation buffer has not been initialized")]
    NotInitialized,

    /// The device refused a buffer.
    #[error("capture device rejected buffer: {0}")]
    SubmissionRejected(FrameStatus),

    /// The device reported a terminal fault (unplugged, camera or driver fault).
    #[error("capture device fault: {0}")]
    DeviceFault(FrameStatus),

    /// A buffer from a different rotation buffer was handed back.
    #[error("frame buffer {0} does not belong to this rotation buffer")]
    UnknownBuffer(FrameId),

    /// A buffer was handed back while its slot was in an unexpected state.
    #[error("frame buffer {id} is in state {state}, expected it to be held by the consumer")]
    InvalidState {
        /// Slot of the buffer.
        id: FrameId,
        /// Slot state found.
        state: &'static str,
    },

    /// The device did not return every queued buffer before the shutdown deadline.
    #[error("shutdown timed out with {outstanding} buffers still queued on the device")]
    ShutdownTimeout {
        /// Buffers the device still holds.
        outstanding: usize,
    },
}

impl RotationError {
    /// Whether the streaming loop may keep going after this error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RotationError::SubmissionRejected(_)
                | RotationError::UnknownBuffer(_)
                | RotationError::InvalidState { .. }
        )
    }
}
