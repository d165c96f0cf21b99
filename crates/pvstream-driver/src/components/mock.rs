//! Simulated GigE camera.
//!
//! Behaves like the PvAPI capture queue: buffers complete strictly in the order
//! they were queued, on a notification thread owned by the camera, and only
//! while acquisition runs. Queue limits, rejections, data loss, resolution
//! changes and unplugging can be injected for tests.

use anyhow::{Context, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use pvstream_pool::{
    CaptureDevice, CompletionHandle, DeviceResult, FrameBuffer, FrameId, FrameMetadata,
    FrameStatus, PixelFormat, Rejection,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default queue depth, matching the driver's queue-full limit.
pub const DEFAULT_QUEUE_LIMIT: usize = 32;

/// Who completes queued buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockMode {
    /// The camera's notification thread completes one buffer per frame interval.
    #[default]
    Streaming,
    /// Buffers complete only through [`MockCamera::complete_next`] and friends.
    Manual,
}

/// Configuration for the simulated camera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MockCameraConfig {
    /// Frame width in pixels (default: 640)
    #[serde(default = "default_width")]
    pub width: u32,

    /// Frame height in pixels (default: 480)
    #[serde(default = "default_height")]
    pub height: u32,

    /// PvAPI pixel format name (default: "Mono8")
    #[serde(default = "default_pixel_format")]
    pub pixel_format: String,

    /// Time between completed frames in milliseconds (default: 33)
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,

    /// Maximum buffers queued at once (default: 32)
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,
}

fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_pixel_format() -> String {
    PixelFormat::Mono8.as_str().to_string()
}
fn default_frame_interval_ms() -> u64 {
    33
}
fn default_queue_limit() -> usize {
    DEFAULT_QUEUE_LIMIT
}

impl Default for MockCameraConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            pixel_format: default_pixel_format(),
            frame_interval_ms: default_frame_interval_ms(),
            queue_limit: default_queue_limit(),
        }
    }
}

/// Builder for [`MockCamera`].
#[derive(Debug, Clone)]
pub struct MockCameraBuilder {
    width: u32,
    height: u32,
    format: PixelFormat,
    frame_interval: Duration,
    queue_limit: usize,
    mode: MockMode,
}

impl MockCameraBuilder {
    /// Start from a `width` x `height` Mono8 streaming camera.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            format: PixelFormat::Mono8,
            frame_interval: Duration::from_millis(default_frame_interval_ms()),
            queue_limit: DEFAULT_QUEUE_LIMIT,
            mode: MockMode::default(),
        }
    }

    /// Set completion mode.
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set pixel format.
    pub fn pixel_format(mut self, format: PixelFormat) -> Self {
        self.format = format;
        self
    }

    /// Set time between frames in streaming mode.
    pub fn frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Set maximum queue depth.
    pub fn queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = limit;
        self
    }

    /// Build the camera; streaming mode starts its notification thread.
    pub fn build(self) -> MockCamera {
        let core = Arc::new(Core {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                acquiring: false,
                unplugged: false,
                closing: false,
                reject_next: 0,
                reject_all: false,
                injected: VecDeque::new(),
                width: self.width,
                height: self.height,
                format: self.format,
                sequence: 0,
            }),
            wake: Condvar::new(),
            rejected: AtomicU64::new(0),
            epoch: Instant::now(),
            frame_interval: self.frame_interval,
            queue_limit: self.queue_limit,
        });

        let worker = match self.mode {
            MockMode::Streaming => {
                let core = Arc::clone(&core);
                match std::thread::Builder::new()
                    .name("mock-camera".into())
                    .spawn(move || core.notification_loop())
                {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        warn!(error = %err, "failed to spawn mock camera thread, falling back to manual mode");
                        None
                    }
                }
            }
            MockMode::Manual => None,
        };

        MockCamera {
            core,
            mode: if worker.is_some() { self.mode } else { MockMode::Manual },
            worker: Mutex::new(worker),
        }
    }
}

struct Pending {
    buffer: FrameBuffer,
    completion: CompletionHandle,
}

struct State {
    queue: VecDeque<Pending>,
    acquiring: bool,
    unplugged: bool,
    closing: bool,
    reject_next: usize,
    reject_all: bool,
    /// Statuses forced onto the next completions.
    injected: VecDeque<FrameStatus>,
    width: u32,
    height: u32,
    format: PixelFormat,
    sequence: u64,
}

struct Core {
    state: Mutex<State>,
    wake: Condvar,
    rejected: AtomicU64,
    epoch: Instant,
    frame_interval: Duration,
    queue_limit: usize,
}

impl Core {
    fn notification_loop(&self) {
        let mut state = self.state.lock();
        loop {
            if state.closing {
                break;
            }
            if !state.acquiring || state.queue.is_empty() {
                self.wake.wait(&mut state);
                continue;
            }

            let deadline = Instant::now() + self.frame_interval;
            while !state.closing && Instant::now() < deadline {
                self.wake.wait_until(&mut state, deadline);
            }
            if state.closing {
                break;
            }
            if !state.acquiring {
                continue;
            }
            let Some(pending) = state.queue.pop_front() else {
                continue;
            };
            let status = state.injected.pop_front().unwrap_or(FrameStatus::Success);
            let frame = self.expose(&mut state, pending.buffer, status);
            MutexGuard::unlocked(&mut state, || pending.completion.complete(frame));
        }
        debug!("mock camera notification thread exiting");
    }

    /// Fill a buffer the way the camera would for the current settings.
    fn expose(&self, state: &mut State, mut buffer: FrameBuffer, status: FrameStatus) -> FrameBuffer {
        state.sequence += 1;
        let sequence = state.sequence;
        let required = state.format.frame_bytes(state.width, state.height);
        let metadata = FrameMetadata {
            width: state.width,
            height: state.height,
            region_x: 0,
            region_y: 0,
            format: state.format,
            bit_depth: state.format.bit_depth(),
            sequence,
            timestamp: self.epoch.elapsed().as_micros() as u64,
        };

        if buffer.capacity() < required {
            buffer.set_completed(FrameStatus::BufferTooSmall, 0, metadata);
            return buffer;
        }
        if status.is_cancelled() || status.is_device_fault() {
            buffer.set_status(status);
            return buffer;
        }

        let written = if status.is_incomplete() {
            required / 2
        } else {
            required
        };
        for (i, byte) in buffer.payload_mut()[..written].iter_mut().enumerate() {
            *byte = (i as u64).wrapping_add(sequence) as u8;
        }
        buffer.set_completed(status, written, metadata);
        buffer
    }

    fn take_all(&self) -> Vec<Pending> {
        self.state.lock().queue.drain(..).collect()
    }
}

/// Simulated capture device.
pub struct MockCamera {
    core: Arc<Core>,
    mode: MockMode,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MockCamera {
    /// Streaming camera with default timing.
    pub fn new(width: u32, height: u32) -> Self {
        Self::builder(width, height).build()
    }

    /// Start building a camera.
    pub fn builder(width: u32, height: u32) -> MockCameraBuilder {
        MockCameraBuilder::new(width, height)
    }

    /// Streaming camera from configuration.
    pub fn with_config(config: &MockCameraConfig) -> Result<Self> {
        if config.width == 0 || config.height == 0 {
            anyhow::bail!("Camera resolution must be non-zero");
        }
        let format: PixelFormat = config
            .pixel_format
            .parse()
            .with_context(|| format!("invalid camera pixel format {:?}", config.pixel_format))?;
        Ok(Self::builder(config.width, config.height)
            .pixel_format(format)
            .frame_interval(Duration::from_millis(config.frame_interval_ms))
            .queue_limit(config.queue_limit)
            .build())
    }

    /// Completion mode.
    pub fn mode(&self) -> MockMode {
        self.mode
    }

    /// Whether acquisition is running.
    pub fn is_acquiring(&self) -> bool {
        self.core.state.lock().acquiring
    }

    /// Buffers currently queued.
    pub fn outstanding(&self) -> usize {
        self.core.state.lock().queue.len()
    }

    /// Queued buffer ids, oldest first.
    pub fn queued_ids(&self) -> Vec<FrameId> {
        self.core
            .state
            .lock()
            .queue
            .iter()
            .map(|pending| pending.buffer.id())
            .collect()
    }

    /// Submissions refused so far.
    pub fn rejected_total(&self) -> u64 {
        self.core.rejected.load(Ordering::Relaxed)
    }

    /// Frames exposed so far.
    pub fn frames_exposed(&self) -> u64 {
        self.core.state.lock().sequence
    }

    /// Refuse the next `count` submissions with `QueueFull`.
    pub fn reject_next(&self, count: usize) {
        self.core.state.lock().reject_next += count;
    }

    /// Refuse every submission with `QueueFull` while set.
    pub fn set_reject_all(&self, reject: bool) {
        self.core.state.lock().reject_all = reject;
    }

    /// Complete the next `count` frames with `status` instead of success.
    ///
    /// Incomplete statuses still deliver half a frame of data.
    pub fn inject_status(&self, count: usize, status: FrameStatus) {
        let mut state = self.core.state.lock();
        state.injected.extend(std::iter::repeat(status).take(count));
    }

    /// Change the resolution. Bytes per frame follows immediately; queued
    /// buffers that became too small complete with `BufferTooSmall`.
    pub fn set_resolution(&self, width: u32, height: u32) {
        let mut state = self.core.state.lock();
        state.width = width;
        state.height = height;
        info!(width, height, "mock camera resolution changed");
    }

    /// Simulate the cable being pulled: every queued buffer completes with
    /// `Unplugged` and further submissions are refused.
    pub fn unplug(&self) {
        let pending = {
            let mut state = self.core.state.lock();
            state.unplugged = true;
            state.acquiring = false;
            state.queue.drain(..).collect::<Vec<_>>()
        };
        warn!(outstanding = pending.len(), "mock camera unplugged");
        for Pending {
            mut buffer,
            completion,
        } in pending
        {
            buffer.set_status(FrameStatus::Unplugged);
            completion.complete(buffer);
        }
    }

    /// Complete the oldest queued buffer with `status`, regardless of mode.
    pub fn complete_next(&self, status: FrameStatus) -> Option<FrameId> {
        let (completion, frame) = {
            let mut state = self.core.state.lock();
            let Pending { buffer, completion } = state.queue.pop_front()?;
            let frame = self.core.expose(&mut state, buffer, status);
            (completion, frame)
        };
        let id = frame.id();
        completion.complete(frame);
        Some(id)
    }

    /// Complete one specific queued buffer, out of order if need be.
    pub fn complete_frame(&self, id: FrameId, status: FrameStatus) -> bool {
        let completed = {
            let mut state = self.core.state.lock();
            let Some(index) = state.queue.iter().position(|p| p.buffer.id() == id) else {
                return false;
            };
            match state.queue.remove(index) {
                Some(Pending { buffer, completion }) => {
                    let frame = self.core.expose(&mut state, buffer, status);
                    Some((completion, frame))
                }
                None => None,
            }
        };
        match completed {
            Some((completion, frame)) => {
                completion.complete(frame);
                true
            }
            None => false,
        }
    }
}

impl CaptureDevice for MockCamera {
    fn queue(&self, buffer: FrameBuffer, completion: CompletionHandle) -> Result<(), Rejection> {
        let mut state = self.core.state.lock();
        let refusal = if state.unplugged {
            Some(FrameStatus::Unplugged)
        } else if state.reject_all {
            Some(FrameStatus::QueueFull)
        } else if state.reject_next > 0 {
            state.reject_next -= 1;
            Some(FrameStatus::QueueFull)
        } else if state.queue.len() >= self.core.queue_limit {
            Some(FrameStatus::QueueFull)
        } else {
            None
        };

        if let Some(status) = refusal {
            drop(state);
            self.core.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(Rejection::new(buffer, status));
        }

        state.queue.push_back(Pending { buffer, completion });
        drop(state);
        self.core.wake.notify_all();
        Ok(())
    }

    fn cancel_all(&self) -> DeviceResult<()> {
        let pending = self.core.take_all();
        if !pending.is_empty() {
            debug!(count = pending.len(), "mock camera cancelling queued buffers");
        }
        for Pending {
            mut buffer,
            completion,
        } in pending
        {
            buffer.set_status(FrameStatus::Cancelled);
            completion.complete(buffer);
        }
        Ok(())
    }

    fn bytes_per_frame(&self) -> DeviceResult<usize> {
        let state = self.core.state.lock();
        if state.unplugged {
            return Err(FrameStatus::Unplugged);
        }
        Ok(state.format.frame_bytes(state.width, state.height))
    }

    fn current_width(&self) -> DeviceResult<u32> {
        Ok(self.core.state.lock().width)
    }

    fn current_height(&self) -> DeviceResult<u32> {
        Ok(self.core.state.lock().height)
    }

    fn current_pixel_format(&self) -> DeviceResult<PixelFormat> {
        Ok(self.core.state.lock().format)
    }

    fn start_acquisition(&self) -> DeviceResult<()> {
        let mut state = self.core.state.lock();
        if state.unplugged {
            return Err(FrameStatus::Unplugged);
        }
        state.acquiring = true;
        drop(state);
        self.core.wake.notify_all();
        Ok(())
    }

    fn stop_acquisition(&self) -> DeviceResult<()> {
        self.core.state.lock().acquiring = false;
        self.core.wake.notify_all();
        Ok(())
    }
}

impl Drop for MockCamera {
    fn drop(&mut self) {
        self.core.state.lock().closing = true;
        self.core.wake.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            join_worker(handle);
        }
    }
}

/// Join the frame worker. The worker can hold the last strong reference while
/// it resubmits a buffer, in which case the drop runs on the worker itself and
/// the thread is left to return on its own. Returns whether it was joined.
fn join_worker(handle: JoinHandle<()>) -> bool {
    if handle.thread().id() == std::thread::current().id() {
        debug!("mock camera dropped on its own worker, not joining");
        return false;
    }
    let _ = handle.join();
    true
}
