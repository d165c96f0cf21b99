//! Streaming session.
//!
//! Drives a [`RotationBuffer`] the way a display refresh does: take the newest
//! frame, hand it to the caller, give it back, drop whatever went stale in the
//! meantime and retry buffers the camera refused earlier.

use anyhow::{anyhow, bail, Context, Result};
use pvstream_pool::{
    CaptureDevice, FrameBuffer, FrameId, FrameStatus, RotationBuffer, RotationConfig,
    RotationError, RotationStats,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Default period of the poll loop.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default period of the frame rate report.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_millis(250);

/// Result of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A displayable frame was handed to the handler.
    Frame(FrameId),
    /// A frame completed with a non-success status and was recycled unseen.
    Skipped(FrameStatus),
    /// Nothing completed since the last poll.
    Idle,
    /// The device reported a terminal fault.
    Faulted(FrameStatus),
}

/// Loop timing and limits for [`StreamSession::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Poll period; completions also wake the loop directly.
    pub poll_interval: Duration,
    /// Frame rate report period.
    pub stats_interval: Duration,
    /// Stop after this many handled frames.
    pub max_frames: Option<u64>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            stats_interval: DEFAULT_STATS_INTERVAL,
            max_frames: None,
        }
    }
}

/// What a finished run did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSummary {
    /// Frames handed to the handler.
    pub frames: u64,
    /// Frames recycled because their status was not success.
    pub skipped: u64,
    /// Mean handled frames per second over the run.
    pub average_fps: f64,
    /// Rotation buffer counters at the end of the run.
    pub rotation: RotationStats,
}

/// Counts handled frames and reports the rate between samples.
#[derive(Debug, Clone)]
pub struct FrameRateMeter {
    started: Instant,
    last_sample: Instant,
    since_sample: u64,
    total: u64,
}

impl FrameRateMeter {
    /// Start measuring now.
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Start measuring at `now`.
    pub fn starting_at(now: Instant) -> Self {
        Self {
            started: now,
            last_sample: now,
            since_sample: 0,
            total: 0,
        }
    }

    /// Count one frame.
    pub fn record(&mut self) {
        self.since_sample += 1;
        self.total += 1;
    }

    /// Frames counted since the meter started.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Frames per second since the previous sample; starts a new window.
    pub fn sample(&mut self) -> f64 {
        self.sample_at(Instant::now())
    }

    /// Like [`sample`](Self::sample) with an explicit clock.
    pub fn sample_at(&mut self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_sample).as_secs_f64();
        let fps = if elapsed > 0.0 {
            self.since_sample as f64 / elapsed
        } else {
            0.0
        };
        self.last_sample = now;
        self.since_sample = 0;
        fps
    }

    /// Mean frames per second since the meter started.
    pub fn average_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        if elapsed > 0.0 {
            self.total as f64 / elapsed
        } else {
            0.0
        }
    }
}

impl Default for FrameRateMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// A camera streaming into a rotation buffer.
pub struct StreamSession<D: CaptureDevice + 'static> {
    device: Arc<D>,
    rotation: RotationBuffer,
    meter: FrameRateMeter,
    skipped: u64,
    active: bool,
}

impl<D: CaptureDevice + 'static> StreamSession<D> {
    /// Bind a session to `device`. Nothing is allocated until [`start`](Self::start).
    pub fn new(device: Arc<D>, config: RotationConfig) -> Self {
        let rotation = RotationBuffer::new(Arc::clone(&device), config);
        Self {
            device,
            rotation,
            meter: FrameRateMeter::new(),
            skipped: 0,
            active: false,
        }
    }

    /// The capture device.
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// The rotation buffer behind this session.
    pub fn rotation(&self) -> &RotationBuffer {
        &self.rotation
    }

    /// Frame rate meter of the current session.
    pub fn meter(&self) -> &FrameRateMeter {
        &self.meter
    }

    /// Whether `start` succeeded and `stop` has not run since.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Size buffers from the device, start acquisition and submit every buffer.
    ///
    /// Returns the number of buffers the device accepted. Fails when not a
    /// single buffer could be queued.
    pub fn start(&mut self) -> Result<usize> {
        if self.active {
            bail!("stream session already started");
        }

        let count = self.rotation.config().buffer_count;
        let bytes = self
            .rotation
            .initialize_from_device(count)
            .context("failed to size frame buffers from camera")?;
        let width = self.device.current_width().unwrap_or_default();
        let height = self.device.current_height().unwrap_or_default();
        let format = self
            .device
            .current_pixel_format()
            .map(|f| f.as_str())
            .unwrap_or("unknown");

        self.device
            .start_acquisition()
            .map_err(|status| anyhow!("failed to start acquisition: {status}"))?;
        self.active = true;
        self.meter = FrameRateMeter::new();
        self.skipped = 0;

        let queued = match self.rotation.submit_all() {
            Ok(queued) => queued,
            Err(err) => {
                let _ = self.stop();
                return Err(err).context("failed to submit frame buffers");
            }
        };
        if queued == 0 {
            let _ = self.stop();
            bail!("camera accepted none of the {count} frame buffers");
        }

        info!(
            width,
            height,
            format,
            bytes_per_frame = bytes,
            buffers = count,
            queued,
            "Stream session started"
        );
        Ok(queued)
    }

    /// Handle at most one frame: the newest completed one.
    ///
    /// `handler` only sees successful frames. Whatever else completed since the
    /// last poll is re-submitted unseen, and refused buffers are retried.
    pub fn poll_once<F>(&mut self, handler: &mut F) -> Result<PollOutcome>
    where
        F: FnMut(&FrameBuffer),
    {
        let frame = match self.rotation.consume_latest() {
            Ok(frame) => frame,
            Err(RotationError::DeviceFault(status)) => {
                error!(%status, "camera fault while streaming");
                return Ok(PollOutcome::Faulted(status));
            }
            Err(err) => return Err(err.into()),
        };

        let Some(frame) = frame else {
            self.rotation.drain_remaining();
            return Ok(PollOutcome::Idle);
        };

        let status = frame.status();
        let outcome = if status.is_success() {
            handler(&frame);
            self.meter.record();
            PollOutcome::Frame(frame.id())
        } else {
            self.skipped += 1;
            debug!(frame = %frame.id(), %status, "skipping frame that did not complete");
            PollOutcome::Skipped(status)
        };

        match self.rotation.recycle(frame) {
            Ok(()) => {}
            Err(err) if err.is_recoverable() => {
                debug!(error = %err, "recycled frame deferred to retry queue");
            }
            Err(err) => return Err(err.into()),
        }
        self.rotation.recycle_stale();
        self.rotation.drain_remaining();
        Ok(outcome)
    }

    /// Poll until `stop` flips to `true`, the frame limit is reached, or the
    /// device faults. Stops the session before returning.
    pub async fn run<F>(
        &mut self,
        mut handler: F,
        options: RunOptions,
        mut stop: watch::Receiver<bool>,
    ) -> Result<SessionSummary>
    where
        F: FnMut(&FrameBuffer),
    {
        if !self.active {
            bail!("stream session not started");
        }

        let mut poll = tokio::time::interval(options.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut stats = tokio::time::interval(options.stats_interval);
        stats.set_missed_tick_behavior(MissedTickBehavior::Skip);
        stats.tick().await;

        let mut stop_open = true;
        loop {
            if *stop.borrow() {
                break;
            }
            if let Some(limit) = options.max_frames {
                if self.meter.total() >= limit {
                    break;
                }
            }

            let report = tokio::select! {
                changed = stop.changed(), if stop_open => {
                    if changed.is_err() {
                        // Sender gone; keep running until another limit hits.
                        stop_open = false;
                    }
                    false
                }
                _ = self.rotation.notified() => false,
                _ = poll.tick() => false,
                _ = stats.tick() => true,
            };

            if report {
                let fps = self.meter.sample();
                let counts = self.rotation.counts();
                info!(
                    fps = format_args!("{fps:.1}"),
                    frames = self.meter.total(),
                    queued = counts.queued,
                    retry = self.rotation.retry_len(),
                    "stream statistics"
                );
                continue;
            }

            if let PollOutcome::Faulted(status) = self.poll_once(&mut handler)? {
                if let Err(err) = self.stop() {
                    warn!(error = %err, "session stop after camera fault did not complete");
                }
                return Err(anyhow::Error::new(RotationError::DeviceFault(status))
                    .context("streaming stopped by camera fault"));
            }
        }

        let summary = SessionSummary {
            frames: self.meter.total(),
            skipped: self.skipped,
            average_fps: self.meter.average_at(Instant::now()),
            rotation: self.rotation.stats(),
        };
        self.stop()?;
        Ok(summary)
    }

    /// Stop acquisition and return every buffer. Safe to call repeatedly.
    pub fn stop(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;

        if let Err(status) = self.device.stop_acquisition() {
            warn!(%status, "camera failed to stop acquisition");
        }
        self.rotation
            .shutdown()
            .context("frame buffers did not settle during shutdown")?;

        let stats = self.rotation.stats();
        info!(
            frames = self.meter.total(),
            skipped = self.skipped,
            dropped = stats.dropped,
            rejected = stats.rejected,
            "Stream session stopped"
        );
        Ok(())
    }
}

impl<D: CaptureDevice + 'static> Drop for StreamSession<D> {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "stream session did not stop cleanly on drop");
        }
    }
}
