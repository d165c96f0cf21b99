//! Integration tests for StreamSession against the simulated camera.
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p pvstream-driver --test stream_session
//! ```

use pvstream_driver::{MockCamera, PollOutcome, RunOptions, StreamSession};
use pvstream_pool::{FrameBuffer, FrameStatus, RotationConfig, RotationError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn streaming_camera(interval_ms: u64) -> Arc<MockCamera> {
    Arc::new(
        MockCamera::builder(32, 24)
            .frame_interval(Duration::from_millis(interval_ms))
            .build(),
    )
}

fn options(max_frames: Option<u64>) -> RunOptions {
    RunOptions {
        poll_interval: Duration::from_millis(2),
        stats_interval: Duration::from_millis(50),
        max_frames,
    }
}

#[tokio::test]
async fn run_stops_after_frame_limit() {
    let camera = streaming_camera(1);
    let mut session = StreamSession::new(camera.clone(), RotationConfig::default());
    assert_eq!(session.start().unwrap(), 4);
    assert!(camera.is_acquiring());

    let (_stop_tx, stop_rx) = watch::channel(false);
    let mut sequences = Vec::new();
    let summary = session
        .run(
            |frame: &FrameBuffer| sequences.push(frame.metadata().map(|m| m.sequence)),
            options(Some(20)),
            stop_rx,
        )
        .await
        .unwrap();

    assert_eq!(summary.frames, 20);
    assert_eq!(sequences.len(), 20);
    assert!(sequences.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(summary.rotation.consumed, 20 + summary.skipped);

    assert!(!session.is_active());
    assert!(!camera.is_acquiring());
    assert_eq!(camera.outstanding(), 0);
    assert_eq!(session.rotation().counts().free, 4);
}

#[tokio::test]
async fn run_stops_on_signal() {
    let camera = streaming_camera(2);
    let mut session = StreamSession::new(camera.clone(), RotationConfig::default());
    session.start().unwrap();

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        let _ = stop_tx.send(true);
    });

    let summary = session
        .run(|_: &FrameBuffer| {}, options(None), stop_rx)
        .await
        .unwrap();

    assert!(summary.frames > 0);
    assert!(session.rotation().is_shut_down());
    assert_eq!(camera.outstanding(), 0);
}

#[tokio::test]
async fn run_returns_device_fault() {
    let camera = streaming_camera(1);
    let mut session = StreamSession::new(camera.clone(), RotationConfig::default());
    session.start().unwrap();

    let unplugger = Arc::clone(&camera);
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(40));
        unplugger.unplug();
    });

    let (_stop_tx, stop_rx) = watch::channel(false);
    let err = session
        .run(|_: &FrameBuffer| {}, options(None), stop_rx)
        .await
        .unwrap_err();

    assert_eq!(
        err.downcast_ref::<RotationError>(),
        Some(&RotationError::DeviceFault(FrameStatus::Unplugged))
    );
    assert!(!session.is_active());
    assert_eq!(session.rotation().counts().free, 4);
}

#[tokio::test]
async fn run_requires_started_session() {
    let camera = streaming_camera(1);
    let mut session = StreamSession::new(camera, RotationConfig::default());
    let (_stop_tx, stop_rx) = watch::channel(false);

    assert!(session
        .run(|_: &FrameBuffer| {}, options(Some(1)), stop_rx)
        .await
        .is_err());
}

#[test]
fn restart_after_stop() {
    let camera = Arc::new(MockCamera::builder(8, 8).mode(pvstream_driver::MockMode::Manual).build());
    let mut session = StreamSession::new(camera.clone(), RotationConfig::default());

    session.start().unwrap();
    camera.complete_next(FrameStatus::Success);
    session.stop().unwrap();

    assert_eq!(session.start().unwrap(), 4);
    assert_eq!(
        session.poll_once(&mut |_: &FrameBuffer| {}).unwrap(),
        PollOutcome::Idle
    );
    camera.complete_next(FrameStatus::Success);
    assert!(matches!(
        session.poll_once(&mut |_: &FrameBuffer| {}).unwrap(),
        PollOutcome::Frame(_)
    ));
}
