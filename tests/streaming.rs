//! End-to-end streaming from configuration to report.

use pvstream::app::{self, stream_from};
use pvstream::config::AppConfig;
use pvstream::AppError;
use pvstream_driver::MockCamera;
use pvstream_pool::{FrameStatus, RotationError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.camera.width = 64;
    config.camera.height = 48;
    config.camera.frame_interval_ms = 1;
    config.stream.poll_interval_ms = 2;
    config.stream.stats_interval_ms = 20;
    config.rotation.shutdown_timeout_ms = 1000;
    config
}

#[tokio::test]
async fn streams_requested_frame_count() {
    let config = fast_config();
    config.validate().unwrap();
    let (_stop_tx, stop_rx) = watch::channel(false);

    let report = app::stream_mock(&config, Some(25), stop_rx).await.unwrap();

    assert_eq!(report.summary.frames, 25);
    assert_eq!(report.tally.frames, 25);
    assert_eq!(report.tally.bytes, 25 * 64 * 48);
    assert!(report.summary.rotation.submitted >= 4);
}

#[tokio::test]
async fn stop_signal_ends_stream() {
    let config = fast_config();
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        let _ = stop_tx.send(true);
    });

    let report = tokio::time::timeout(
        Duration::from_secs(10),
        app::stream_mock(&config, None, stop_rx),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(report.summary.frames > 0);
}

#[tokio::test]
async fn camera_fault_maps_to_rotation_error() {
    let config = fast_config();
    let camera = Arc::new(MockCamera::with_config(&config.camera).unwrap());
    let unplugger = Arc::clone(&camera);
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        unplugger.unplug();
    });

    let (_stop_tx, stop_rx) = watch::channel(false);
    let err = stream_from(camera, &config, None, stop_rx).await.unwrap_err();

    assert!(matches!(
        err,
        AppError::Rotation(RotationError::DeviceFault(FrameStatus::Unplugged))
    ));
    assert_eq!(err.exit_code(), 3);
}

#[tokio::test]
async fn invalid_pixel_format_is_reported() {
    let mut config = fast_config();
    config.camera.pixel_format = "Mono3".to_string();
    let (_stop_tx, stop_rx) = watch::channel(false);

    let err = app::stream_mock(&config, Some(1), stop_rx).await.unwrap_err();
    assert!(matches!(err, AppError::Session(_)));
}
