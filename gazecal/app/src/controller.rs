use crate::config::AppConfig;
use crate::policy::PresentationPolicy;
use crate::renderer::{ControlKey, Renderer, StimulusRef};
use anyhow::{Context, Result};
use api::{EyeGaze, GazeSample, TrackerError, TrackerEvent};
use common::{
    CalibrationConfig, CalibrationEngine, CollectProgress, DisplayMap, EnginePhase, Error,
    GazeRecorder, TrackerSession,
};
use glam::Vec2;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

/// Frame pacing for the foreground loops.
const FRAME_WAIT: Duration = Duration::from_millis(5);

/// Outcome of one calibration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationOutcome {
    /// Every point accepted; the vendor fit is applied on the device.
    Accepted,
    /// Aborted by the operator or the review-cycle cap was reached.
    Failed { review_cycles: u32 },
}

/// Composes the tracker session, recorder, coordinate transform and a
/// presentation policy into the operator-facing surface an experiment
/// script drives. Positions on this surface are window units.
pub struct GazeController {
    session: TrackerSession,
    recorder: GazeRecorder,
    map: DisplayMap,
    policy: Box<dyn PresentationPolicy>,
    calibration: CalibrationConfig,
    max_review_cycles: u32,
}

impl GazeController {
    pub fn new(
        session: TrackerSession,
        map: DisplayMap,
        policy: Box<dyn PresentationPolicy>,
        config: &AppConfig,
    ) -> Self {
        Self {
            session,
            recorder: GazeRecorder::new(map),
            map,
            policy,
            calibration: config.calibration.clone(),
            max_review_cycles: config.max_review_cycles,
        }
    }

    pub fn session(&self) -> &TrackerSession {
        &self.session
    }

    /// Run one calibration attempt. `points` are window-unit targets;
    /// `stimuli` must cover them (checked before anything is displayed).
    pub fn run_calibration<R: Renderer>(
        &mut self,
        renderer: &mut R,
        points: &[Vec2],
        stimuli: &[StimulusRef],
    ) -> Result<CalibrationOutcome> {
        let targets: Vec<Vec2> = points.iter().map(|p| self.map.window_to_adcs(*p)).collect();
        let mut engine = CalibrationEngine::new(&targets, stimuli.len(), self.calibration.clone())?;

        self.session.start_stream()?;
        self.session.begin_calibration()?;
        let outcome = self.drive_calibration(renderer, &mut engine, stimuli);
        if let Err(e) = self.session.end_calibration() {
            warn!("Failed to leave vendor calibration mode: {}", e);
        }
        outcome
    }

    fn drive_calibration<R: Renderer>(
        &mut self,
        renderer: &mut R,
        engine: &mut CalibrationEngine,
        stimuli: &[StimulusRef],
    ) -> Result<CalibrationOutcome> {
        // Points the operator has marked for recalibration during review.
        let mut marked: BTreeSet<usize> = BTreeSet::new();
        let mut shown_since: Option<Instant> = None;
        let mut collect_armed = false;
        let mut attention = false;

        loop {
            let collecting = matches!(engine.phase(), EnginePhase::Collecting { .. });

            // Operator input is suspended while a window is in flight or a
            // collect signal is waiting on the policy gate.
            if !collecting && !collect_armed {
                for key in renderer.poll_keys() {
                    match key {
                        ControlKey::Digit(digit) => {
                            let index = digit as usize;
                            if engine.phase() == EnginePhase::Reviewing {
                                if index == 0 {
                                    marked.clear();
                                } else if index <= engine.points().len() && !marked.remove(&index) {
                                    marked.insert(index);
                                }
                            } else {
                                match engine.select_point(index) {
                                    Ok(()) => {
                                        shown_since = (index != 0).then(Instant::now);
                                    }
                                    Err(e) => debug!("Selection ignored: {}", e),
                                }
                            }
                        }
                        ControlKey::Collect => {
                            if matches!(engine.phase(), EnginePhase::PointSelected { .. }) {
                                collect_armed = true;
                            } else {
                                debug!("Collect ignored: no point selected");
                            }
                        }
                        ControlKey::Finish => {
                            if let Err(e) = engine.finish(&self.session) {
                                warn!("Finish ignored: {}", e);
                            }
                        }
                        ControlKey::Decide => {
                            if engine.phase() != EnginePhase::Reviewing {
                                debug!("Decision ignored outside review");
                            } else if marked.is_empty() {
                                if let Err(e) = engine.accept() {
                                    warn!("Cannot accept: {}", e);
                                }
                            } else {
                                if self.max_review_cycles > 0
                                    && engine.review_cycles() >= self.max_review_cycles
                                {
                                    let review_cycles = engine.review_cycles();
                                    warn!(
                                        "Review cycle cap ({}) reached; calibration failed",
                                        self.max_review_cycles
                                    );
                                    engine.abort();
                                    return Ok(CalibrationOutcome::Failed { review_cycles });
                                }
                                let subset: Vec<usize> = marked.iter().copied().collect();
                                engine.recalibrate(&subset, &self.session)?;
                                marked.clear();
                                shown_since = None;
                            }
                        }
                        ControlKey::ToggleAttention => {
                            if self.policy.attention_getter().is_some() {
                                attention = !attention;
                            }
                        }
                        ControlKey::Abort => {
                            let review_cycles = engine.review_cycles();
                            engine.abort();
                            info!("Calibration aborted by operator");
                            return Ok(CalibrationOutcome::Failed { review_cycles });
                        }
                        ControlKey::Exit => {}
                    }
                }
            }

            if collecting {
                match engine.poll_collection(&self.session) {
                    Ok(CollectProgress::PointDone { index, status }) => {
                        info!("Point {} done: {:?}", index, status);
                        shown_since = None;
                    }
                    Ok(CollectProgress::Computed) => {
                        shown_since = None;
                    }
                    Ok(_) => {}
                    Err(e @ Error::Tracker(_)) => {
                        return Err(e).context("device stream ended during calibration");
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            if collect_armed {
                if let EnginePhase::PointSelected { .. } = engine.phase() {
                    let shown_for = shown_since.map(|t| t.elapsed()).unwrap_or_default();
                    if self.policy.ready_to_collect(shown_for) {
                        let focus = self.policy.focus_delay();
                        if !focus.is_zero() {
                            thread::sleep(focus);
                        }
                        engine.begin_collection(&self.session)?;
                        collect_armed = false;
                    }
                } else {
                    collect_armed = false;
                }
            }

            renderer.clear();
            if attention {
                if let Some(stimulus) = self.policy.attention_getter() {
                    renderer.draw_attention_getter(stimulus);
                }
            } else {
                match engine.phase() {
                    EnginePhase::PointSelected { index } | EnginePhase::Collecting { index } => {
                        if let Some(point) = engine.point(index) {
                            let pos = self.map.adcs_to_window(point.target);
                            let shown_for = shown_since.map(|t| t.elapsed()).unwrap_or_default();
                            renderer.draw_target(
                                &stimuli[point.stimulus],
                                pos,
                                self.policy.target_scale(shown_for),
                            );
                        }
                    }
                    EnginePhase::Reviewing => {
                        if let Some(result) = engine.result() {
                            renderer.draw_result(result, &marked);
                        }
                    }
                    _ => {}
                }
            }
            renderer.flip()?;

            match engine.phase() {
                EnginePhase::Computed => {
                    let result = engine.begin_review()?;
                    info!(
                        "Reviewing calibration: {} of {} points need recalibration",
                        result.failing_indices().len(),
                        result.fits.len()
                    );
                    marked.clear();
                }
                EnginePhase::Accepted => {
                    return Ok(CalibrationOutcome::Accepted);
                }
                _ => {}
            }

            thread::sleep(FRAME_WAIT);
        }
    }

    /// Live feedback loop for positioning the subject: draws per-eye gaze
    /// markers until an exit key arrives. Persists nothing.
    pub fn show_status<R: Renderer>(&mut self, renderer: &mut R) -> Result<()> {
        self.session.start_stream()?;
        let subscription = self.session.subscribe();
        let mut last: Option<GazeSample> = None;
        info!("Status display running");

        loop {
            for key in renderer.poll_keys() {
                if matches!(key, ControlKey::Exit | ControlKey::Abort) {
                    info!("Status display closed");
                    return Ok(());
                }
            }

            loop {
                match subscription.try_recv() {
                    Ok(TrackerEvent::Sample(sample)) => last = Some(sample),
                    Ok(TrackerEvent::StreamClosed { reason }) => {
                        warn!("Stream closed during status display: {}", reason);
                        return Err(Error::Tracker(TrackerError::StreamClosed(reason)).into());
                    }
                    Err(_) => break,
                }
            }

            renderer.clear();
            let marker = |eye: &EyeGaze| {
                eye.validity
                    .is_valid()
                    .then(|| self.map.adcs_to_window(eye.gaze))
            };
            match &last {
                Some(sample) => {
                    renderer.draw_gaze_marker(marker(&sample.left), marker(&sample.right))
                }
                None => renderer.draw_gaze_marker(None, None),
            }
            renderer.flip()?;
            thread::sleep(FRAME_WAIT);
        }
    }

    /// Open a recording session on `path`, starting the stream if needed.
    pub fn start_recording(&mut self, path: &Path) -> Result<()> {
        self.session.start_stream()?;
        self.recorder
            .start_recording(&self.session, path)
            .with_context(|| format!("failed to start recording to {:?}", path))?;
        Ok(())
    }

    /// Stop appending and flush; the sink stays open for `close`. Returns
    /// the number of rows written.
    pub fn stop_recording(&mut self) -> Result<u64> {
        Ok(self.recorder.stop_recording()?)
    }

    /// Finalize and release the recording sink (implicit stop if needed).
    pub fn close(&mut self) -> Result<()> {
        Ok(self.recorder.close()?)
    }

    /// Write an annotation row into the open recording.
    pub fn record_event(&self, label: &str) -> Result<()> {
        Ok(self.recorder.record_event(label)?)
    }

    /// Latest combined gaze position in window units, if the tracker
    /// currently sees the subject.
    pub fn current_gaze(&self) -> Option<Vec2> {
        self.session
            .current_gaze()
            .and_then(|sample| sample.combined_gaze())
            .map(|gaze| self.map.adcs_to_window(gaze))
    }
}
