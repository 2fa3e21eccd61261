//! Multi-Camera Calibration Tool
//!
//! Calibrates a camera rig from ChArUco detections and writes the per-camera
//! calibration records, optionally after a bundle adjustment pass.
//!
//! Usage:
//! ```bash
//! cargo run --release -- \
//!   --detections detections.json \
//!   --board samples/board.yaml \
//!   --config samples/calibration.yaml \
//!   --output calibration.json \
//!   --diagnostics diagnostics.json \
//!   --bundle-adjust
//! ```

use clap::Parser;
use log::{error, info, warn};
use multicam_calib::config::LossKind;
use multicam_calib::export::save_calibration_records;
use multicam_calib::{
    BoardModel, CalibrationConfig, CalibrationEvent, CalibrationSession, DetectionStore,
    LevenbergMarquardtSolver,
};
use std::path::PathBuf;

/// Multi-camera calibration tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the detections JSON file
    #[arg(short = 'd', long)]
    detections: PathBuf,

    /// Path to the board YAML file
    #[arg(short = 'b', long)]
    board: PathBuf,

    /// Path to a calibration config YAML file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Name of the reference camera (defaults to the first camera)
    #[arg(short = 'r', long)]
    reference: Option<String>,

    /// Frames to leave out of the extrinsic stages
    #[arg(long = "exclude-frame")]
    exclude_frames: Vec<u32>,

    /// Refine cameras and points with bundle adjustment
    #[arg(long)]
    bundle_adjust: bool,

    /// Robust loss of the bundle adjustment (none, huber, cauchy)
    #[arg(long)]
    loss: Option<LossKind>,

    /// Where to write the calibration records
    #[arg(short = 'o', long)]
    output: PathBuf,

    /// Where to write the diagnostic record
    #[arg(long)]
    diagnostics: Option<PathBuf>,

    /// Log solver progress
    #[arg(short = 'v', long)]
    verbose: bool,
}

fn report(events: &[CalibrationEvent]) {
    for event in events {
        match event {
            CalibrationEvent::CameraCalibrated {
                camera,
                frames,
                rms_error,
            } => info!("Camera '{camera}': {frames} frame(s), RMS {rms_error:.4} px"),
            CalibrationEvent::EdgeEstimated {
                parent,
                child,
                frames,
                error,
            } => info!("Edge '{parent}' -> '{child}': {frames} frame(s), spread {error:.6} m"),
            CalibrationEvent::PointsTriangulated { points } => {
                info!("Triangulated {points} point(s)")
            }
            CalibrationEvent::Failure(err) => warn!("{err}"),
            CalibrationEvent::SolverWarning { status } => {
                warn!("Bundle adjustment did not converge: {status}")
            }
            CalibrationEvent::StageInvalidated(stage) => info!("{stage:?} invalidated"),
            CalibrationEvent::StageFinished { stage, version } => {
                info!("{stage:?} finished (state version {version})")
            }
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => CalibrationConfig::load_from_yaml(path)?,
        None => CalibrationConfig::default(),
    };
    if cli.reference.is_some() {
        config.extrinsic.reference_camera = cli.reference.clone();
    }
    if let Some(loss) = cli.loss {
        config.bundle_adjustment.loss = loss;
    }

    let store = DetectionStore::load_from_json(&cli.detections)?;
    let board = BoardModel::load_from_yaml(&cli.board)?;
    info!(
        "Loaded {} camera(s) over {} frame(s)",
        store.camera_count(),
        store.frames().len()
    );

    let mut session = CalibrationSession::new(store, board, config)?;
    for frame in &cli.exclude_frames {
        let update = session.state().exclusions.set_extrinsic(*frame, true);
        report(&session.update_exclusions(update));
    }
    report(&session.run_all()?);

    if cli.bundle_adjust {
        let solver = LevenbergMarquardtSolver::new(cli.verbose);
        let (result, events) = session.bundle_adjust(&solver)?;
        report(&events);
        info!(
            "Bundle adjustment: cost {:.6} -> {:.6} in {} iteration(s), {} observation(s) used",
            result.initial_cost,
            result.final_cost,
            result.iterations,
            result.statistics.observations_used
        );
        report(&session.apply_bundle_adjustment(&result)?);
    }

    let records = session.calibration_records();
    save_calibration_records(&cli.output, &records)?;
    info!("Wrote {} calibration record(s) to {:?}", records.len(), cli.output);

    if let Some(path) = &cli.diagnostics {
        session.diagnostic_record()?.save(path)?;
        info!("Wrote diagnostics to {path:?}");
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(err) = run(cli) {
        error!("{err}");
        std::process::exit(1);
    }
}
