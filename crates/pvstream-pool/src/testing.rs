//! Hand-driven capture device for tests and benches.
//!
//! Nothing completes until the test says so, which makes every interleaving
//! of submissions, completions and rejections reproducible.

use crate::device::{CaptureDevice, CompletionHandle, DeviceResult, Rejection};
use crate::frame::{FrameBuffer, FrameId, FrameMetadata, FrameStatus, PixelFormat};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct Script {
    queued: VecDeque<(FrameBuffer, CompletionHandle)>,
    reject_plan: VecDeque<FrameStatus>,
    reject_all: Option<FrameStatus>,
    ignore_cancel: bool,
    sequence: u64,
}

/// Capture device completing buffers only on request.
pub struct ScriptedDevice {
    script: Mutex<Script>,
    width: u32,
    height: u32,
    format: PixelFormat,
    cancel_calls: AtomicUsize,
}

impl ScriptedDevice {
    /// Device reporting a `width` x `height` Mono8 image.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            script: Mutex::new(Script::default()),
            width,
            height,
            format: PixelFormat::Mono8,
            cancel_calls: AtomicUsize::new(0),
        }
    }

    /// Refuse the next `count` submissions with `status`.
    pub fn reject_next(&self, count: usize, status: FrameStatus) {
        let mut script = self.script.lock();
        script.reject_plan.extend(std::iter::repeat(status).take(count));
    }

    /// Refuse every submission with `status` until cleared with `None`.
    pub fn reject_all(&self, status: Option<FrameStatus>) {
        self.script.lock().reject_all = status;
    }

    /// Make `cancel_all` keep the queued buffers, like a wedged driver.
    pub fn ignore_cancel(&self, ignore: bool) {
        self.script.lock().ignore_cancel = ignore;
    }

    /// Complete the oldest queued buffer with `status`.
    pub fn complete_next(&self, status: FrameStatus) -> Option<FrameId> {
        let entry = self.script.lock().queued.pop_front();
        entry.map(|(frame, completion)| self.finish(frame, completion, status))
    }

    /// Complete a specific queued buffer, out of order if need be.
    pub fn complete_frame(&self, id: FrameId, status: FrameStatus) -> bool {
        let entry = {
            let mut script = self.script.lock();
            script
                .queued
                .iter()
                .position(|(frame, _)| frame.id() == id)
                .and_then(|index| script.queued.remove(index))
        };
        match entry {
            Some((frame, completion)) => {
                self.finish(frame, completion, status);
                true
            }
            None => false,
        }
    }

    /// Complete every queued buffer in order. Returns how many were completed.
    pub fn complete_all(&self, status: FrameStatus) -> usize {
        let entries: Vec<_> = self.script.lock().queued.drain(..).collect();
        let count = entries.len();
        for (frame, completion) in entries {
            self.finish(frame, completion, status);
        }
        count
    }

    /// Queued buffer ids, oldest first.
    pub fn queued_ids(&self) -> Vec<FrameId> {
        self.script
            .lock()
            .queued
            .iter()
            .map(|(frame, _)| frame.id())
            .collect()
    }

    /// Number of `cancel_all` calls so far.
    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::Relaxed)
    }

    fn finish(
        &self,
        mut frame: FrameBuffer,
        completion: CompletionHandle,
        status: FrameStatus,
    ) -> FrameId {
        let id = frame.id();
        if status.is_cancelled() || status.is_device_fault() {
            frame.set_status(status);
        } else {
            let sequence = {
                let mut script = self.script.lock();
                script.sequence += 1;
                script.sequence
            };
            let size = self.format.frame_bytes(self.width, self.height);
            frame.set_completed(
                status,
                size,
                FrameMetadata {
                    width: self.width,
                    height: self.height,
                    region_x: 0,
                    region_y: 0,
                    format: self.format,
                    bit_depth: self.format.bit_depth(),
                    sequence,
                    timestamp: sequence * 1_000,
                },
            );
        }
        completion.complete(frame);
        id
    }
}

impl CaptureDevice for ScriptedDevice {
    fn queue(&self, buffer: FrameBuffer, completion: CompletionHandle) -> Result<(), Rejection> {
        let mut script = self.script.lock();
        let refusal = match script.reject_all {
            Some(status) => Some(status),
            None => script.reject_plan.pop_front(),
        };
        if let Some(status) = refusal {
            return Err(Rejection::new(buffer, status));
        }
        script.queued.push_back((buffer, completion));
        Ok(())
    }

    fn cancel_all(&self) -> DeviceResult<()> {
        self.cancel_calls.fetch_add(1, Ordering::Relaxed);
        let entries: Vec<_> = {
            let mut script = self.script.lock();
            if script.ignore_cancel {
                return Ok(());
            }
            script.queued.drain(..).collect()
        };
        for (frame, completion) in entries {
            self.finish(frame, completion, FrameStatus::Cancelled);
        }
        Ok(())
    }

    fn bytes_per_frame(&self) -> DeviceResult<usize> {
        Ok(self.format.frame_bytes(self.width, self.height))
    }

    fn current_width(&self) -> DeviceResult<u32> {
        Ok(self.width)
    }

    fn current_height(&self) -> DeviceResult<u32> {
        Ok(self.height)
    }

    fn current_pixel_format(&self) -> DeviceResult<PixelFormat> {
        Ok(self.format)
    }
}
