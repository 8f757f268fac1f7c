//! isp-capture binary: stream frames and run auto exposure on them.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use isp_capture::mock::MockBus;
use isp_capture::{
    AaaController, CameraError, CaptureWorker, CapturePipeline, CapturedFrame, ExposureRequest,
    ExposureSink, ExposureSyncEngine, FrameSyncListener, IspControl, IspController,
    MeanLumaExposure, NodeOpener, PipelineConfig, Result, SensorControls, Statistics, V4L2Opener,
};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "isp-capture", version, about = "Capture frames with frame-synchronized auto exposure")]
struct Args {
    /// Pipeline configuration file (TOML).
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Use in-process mock devices instead of /dev/video*.
    #[arg(long)]
    mock: bool,
    /// Frames to capture before exiting.
    #[arg(short = 'n', long, default_value_t = 30)]
    frames: u64,
    /// Override the primary device index.
    #[arg(short, long)]
    device: Option<u32>,
}

/// Sensor sink for nodes without a sensor control interface.
#[derive(Debug)]
struct LoggingSensor;

impl ExposureSink for LoggingSensor {
    fn apply_exposure(&self, request: &ExposureRequest) -> Result<()> {
        info!(
            gain = request.gain,
            integration = ?request.integration_time,
            sequence = ?request.sequence,
            "exposure applied"
        );
        Ok(())
    }
}

impl SensorControls for LoggingSensor {}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "capture failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };
    if let Some(index) = args.device {
        config.primary.index = index;
    }
    config.validate()?;

    if args.mock {
        run_with(&MockBus::new(2), &config, args.frames)
    } else {
        run_with(&V4L2Opener, &config, args.frames)
    }
}

fn run_with<O>(opener: &O, config: &PipelineConfig, frames: u64) -> Result<()>
where
    O: NodeOpener,
    O::Node: 'static,
{
    let sensor = Arc::new(LoggingSensor);
    let engine = Arc::new(ExposureSyncEngine::new_or_bypass(
        &config.exposure,
        Arc::clone(&sensor) as Arc<dyn ExposureSink>,
    ));
    let isp = Arc::new(IspController::new(
        Arc::clone(&engine),
        sensor as Arc<dyn SensorControls>,
    ));
    let mut aaa = AaaController::new(MeanLumaExposure::default(), isp as Arc<dyn IspControl>);

    let mut pipeline = CapturePipeline::open(opener, config)?;
    pipeline.add_listener(Arc::clone(&engine) as Arc<dyn FrameSyncListener>);
    let format = pipeline
        .format()
        .cloned()
        .ok_or_else(|| CameraError::Configuration("pipeline has no format".to_owned()))?;

    // 3A skips frames it cannot keep up with.
    let (stats_tx, stats_rx) = mpsc::sync_channel::<Statistics>(2);
    let handler = move |frame: &CapturedFrame, data: Option<&[u8]>| {
        let Some(data) = data else {
            debug!(sequence = frame.primary.sequence, "frame memory not mapped");
            return;
        };
        match Statistics::from_frame(&frame.primary, &format, data) {
            Ok(stats) => {
                let _ = stats_tx.try_send(stats);
            }
            Err(err) => warn!(%err, "no statistics for frame"),
        }
    };

    let worker = CaptureWorker::spawn("capture", pipeline, handler)?;
    worker.start()?;

    while worker.frames() < frames {
        if let Some(err) = worker.take_error() {
            worker.shutdown()?.close();
            return Err(err);
        }
        match stats_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(stats) => {
                if let Err(err) = aaa.run(&stats) {
                    warn!(%err, sequence = stats.sequence, "3A iteration failed");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let captured = worker.frames();
    let mut pipeline = worker.shutdown()?;
    info!(
        frames = captured,
        recoveries = pipeline.recoveries(),
        exposures = engine.applied_count(),
        iterations = aaa.iterations(),
        "capture finished"
    );
    pipeline.close();
    Ok(())
}
