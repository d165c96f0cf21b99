//! CLI entry point for pvstream
//!
//! # Usage
//!
//! Stream 300 frames from the simulated camera:
//! ```bash
//! pvstream stream --frames 300
//! ```
//!
//! Stream for ten seconds with a custom configuration:
//! ```bash
//! pvstream stream --config config/pvstream.toml --seconds 10
//! ```
//!
//! Print the effective configuration:
//! ```bash
//! PVSTREAM_ROTATION__BUFFER_COUNT=8 pvstream config
//! ```

use clap::{Parser, Subcommand};
use pvstream::app::{self, StreamReport};
use pvstream::config::{AppConfig, DEFAULT_CONFIG_PATH};
use pvstream::tracing_setup::{self, OutputFormat, TracingConfig};
use pvstream::{AppError, AppResult};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "pvstream")]
#[command(about = "Stream frames from a GigE camera through a rotation buffer", long_about = None)]
struct Cli {
    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "pretty")]
    log_format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream frames and report statistics
    Stream {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Stop after this many frames
        #[arg(long)]
        frames: Option<u64>,

        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<f64>,

        /// Stream from the PvAPI camera with this unique id instead of the simulator
        /// (requires the `pvapi_sdk` feature)
        #[arg(long)]
        uid: Option<u32>,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file
        #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "pvstream failed");
            eprintln!("Error: {err}");
            ExitCode::from(err.exit_code() as u8)
        }
    }
}

async fn run(cli: Cli) -> AppResult<()> {
    match cli.command {
        Commands::Config { config } => {
            let config = load_config(&config)?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Stream {
            config,
            frames,
            seconds,
            uid,
        } => {
            let config = load_config(&config)?;
            let tracing = TracingConfig::from_app_config(&config)
                .map_err(AppError::Configuration)?
                .with_format(cli.log_format);
            tracing_setup::init(tracing).map_err(AppError::Tracing)?;
            info!(name = %config.application.name, "Starting pvstream");

            let stop = stop_signal(seconds)?;

            let report = match uid {
                Some(uid) => stream_pvapi(uid, &config, frames, stop).await?,
                None => app::stream_mock(&config, frames, stop).await?,
            };
            print_report(&report);
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> AppResult<AppConfig> {
    let config = AppConfig::load_from(path)?;
    config.validate()?;
    Ok(config)
}

#[cfg(feature = "pvapi_sdk")]
async fn stream_pvapi(
    uid: u32,
    config: &AppConfig,
    frames: Option<u64>,
    stop: watch::Receiver<bool>,
) -> AppResult<StreamReport> {
    let camera = std::sync::Arc::new(pvstream_driver::PvApiCamera::open(uid)?);
    app::stream_from(camera, config, frames, stop).await
}

#[cfg(not(feature = "pvapi_sdk"))]
async fn stream_pvapi(
    uid: u32,
    _config: &AppConfig,
    _frames: Option<u64>,
    _stop: watch::Receiver<bool>,
) -> AppResult<StreamReport> {
    Err(AppError::Configuration(format!(
        "camera {uid} requested but pvstream was built without the pvapi_sdk feature"
    )))
}

/// Flips to `true` on Ctrl-C or once `seconds` have elapsed.
fn stop_signal(seconds: Option<f64>) -> AppResult<watch::Receiver<bool>> {
    let deadline = match seconds {
        Some(s) if s.is_finite() && s > 0.0 => Some(Duration::from_secs_f64(s)),
        Some(s) => {
            return Err(AppError::Configuration(format!(
                "--seconds must be a positive number, got {s}"
            )))
        }
        None => None,
    };

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let elapsed = async {
            match deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(elapsed);
        let reason = tokio::select! {
            result = tokio::signal::ctrl_c() => result.map(|()| "Ctrl-C received"),
            _ = elapsed.as_mut() => Ok("time limit reached"),
        };
        let reason = match reason {
            Ok(reason) => reason,
            Err(err) => {
                error!(error = %err, "failed to listen for Ctrl-C");
                elapsed.await;
                "time limit reached"
            }
        };
        info!("{reason}, stopping stream");
        let _ = tx.send(true);
    });
    Ok(rx)
}

fn print_report(report: &StreamReport) {
    let summary = &report.summary;
    let stats = &summary.rotation;
    println!("Frames delivered:  {}", summary.frames);
    println!("Frames skipped:    {}", summary.skipped);
    println!("Average rate:      {:.1} fps", summary.average_fps);
    println!("Bytes delivered:   {}", report.tally.bytes);
    println!("Sequence gaps:     {}", report.tally.sequence_gaps);
    println!(
        "Buffers:           submitted {} / completed {} / dropped {} / rejected {}",
        stats.submitted, stats.completed, stats.dropped, stats.rejected
    );
}
