//! Streaming from the configured camera.
//!
//! Ties configuration to a [`StreamSession`]: builds the camera, starts the
//! session, counts what the handler sees and stops on request.

use crate::config::AppConfig;
use crate::error::AppResult;
use pvstream_driver::{MockCamera, SessionSummary, StreamSession};
use pvstream_pool::{CaptureDevice, FrameBuffer};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Totals observed by the frame handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameTally {
    /// Frames delivered.
    pub frames: u64,
    /// Image bytes delivered.
    pub bytes: u64,
    /// Sequence number of the last delivered frame.
    pub last_sequence: Option<u64>,
    /// Frames whose sequence did not follow the previous one.
    pub sequence_gaps: u64,
}

impl FrameTally {
    /// Account for one delivered frame.
    pub fn record(&mut self, frame: &FrameBuffer) {
        self.frames += 1;
        self.bytes += frame.image().len() as u64;
        if let Some(meta) = frame.metadata() {
            if let Some(last) = self.last_sequence {
                if meta.sequence != last + 1 {
                    self.sequence_gaps += 1;
                }
            }
            self.last_sequence = Some(meta.sequence);
        }
    }
}

/// What a finished stream did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamReport {
    /// Session summary.
    pub summary: SessionSummary,
    /// Handler totals.
    pub tally: FrameTally,
}

/// Stream from the simulated camera described by `config.camera`.
pub async fn stream_mock(
    config: &AppConfig,
    max_frames: Option<u64>,
    stop: watch::Receiver<bool>,
) -> AppResult<StreamReport> {
    let camera = Arc::new(MockCamera::with_config(&config.camera)?);
    info!(
        width = config.camera.width,
        height = config.camera.height,
        format = %config.camera.pixel_format,
        "Using simulated camera"
    );
    stream_from(camera, config, max_frames, stop).await
}

/// Stream from `device` until `stop` flips, `max_frames` are delivered or the
/// device faults.
pub async fn stream_from<D: CaptureDevice + 'static>(
    device: Arc<D>,
    config: &AppConfig,
    max_frames: Option<u64>,
    stop: watch::Receiver<bool>,
) -> AppResult<StreamReport> {
    let mut session = StreamSession::new(device, config.rotation_config());
    session.start()?;

    let mut tally = FrameTally::default();
    let summary = session
        .run(
            |frame: &FrameBuffer| {
                tally.record(frame);
                debug!(frame = %frame.id(), bytes = frame.image_size(), "frame delivered");
            },
            config.run_options(max_frames),
            stop,
        )
        .await?;

    Ok(StreamReport { summary, tally })
}
