use anyhow::Result;
use common::{DisplayMap, SyntheticTracker, TrackerSession};
use gazecal::{
    load_config, AppConfig, CalibrationOutcome, ControlKey, GazeController, ScriptedRenderer,
    StimulusRef,
};
use glam::Vec2;
use log::{error, info, warn};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Five-point layout in window units, matching the classic infant
/// calibration grid.
const CALIBRATION_POINTS: [Vec2; 5] = [
    Vec2::new(-0.4, 0.4),
    Vec2::new(-0.4, -0.4),
    Vec2::new(0.0, 0.0),
    Vec2::new(0.4, 0.4),
    Vec2::new(0.4, -0.4),
];

fn main() -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    info!("Starting gazecal demo session...");

    let config = load_config(Path::new("gazecal.json")).unwrap_or_else(|e| {
        error!("Failed to load config: {}. Using defaults.", e);
        AppConfig::default()
    });

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        info!("Received Ctrl-C, shutting down...");
        r.store(false, Ordering::SeqCst);
    })
    .expect("Error setting Ctrl-C handler");

    let tracker = SyntheticTracker::discover(None)?;
    let session = TrackerSession::new(Box::new(tracker));
    let mut controller = GazeController::new(
        session,
        DisplayMap::normalized(),
        config.build_policy(),
        &config,
    );

    let stimuli: Vec<StimulusRef> = (1..=CALIBRATION_POINTS.len())
        .map(|i| StimulusRef(format!("infant/target{}.png", i)))
        .collect();

    // Scripted operator: check positioning, run one pass over all five
    // points, accept the result.
    let mut script = vec![ControlKey::Exit];
    for digit in 1..=CALIBRATION_POINTS.len() as u8 {
        script.push(ControlKey::Digit(digit));
        script.push(ControlKey::Collect);
    }
    script.push(ControlKey::Decide);
    let mut renderer = ScriptedRenderer::new(script);

    controller.show_status(&mut renderer)?;
    if !running.load(Ordering::SeqCst) {
        return Ok(());
    }

    match controller.run_calibration(&mut renderer, &CALIBRATION_POINTS, &stimuli)? {
        CalibrationOutcome::Accepted => info!("Calibration accepted"),
        CalibrationOutcome::Failed { review_cycles } => {
            warn!(
                "Calibration failed after {} review cycle(s); not recording",
                review_cycles
            );
            return Ok(());
        }
    }
    if !running.load(Ordering::SeqCst) {
        return Ok(());
    }

    fs::create_dir_all(&config.data_dir)?;
    let recording_path = config.data_dir.join("demo_gaze.tsv");
    controller.start_recording(&recording_path)?;
    controller.record_event("demo-start")?;
    thread::sleep(Duration::from_millis(500));
    controller.record_event("demo-end")?;
    let rows = controller.stop_recording()?;
    controller.close()?;
    info!("Recorded {} rows to {:?}", rows, recording_path);

    Ok(())
}
