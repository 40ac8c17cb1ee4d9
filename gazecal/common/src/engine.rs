use api::{TrackerError, TrackerEvent};
use glam::Vec2;
use log::{debug, info, warn};
use std::collections::BTreeSet;
use std::sync::mpsc::TryRecvError;
use std::time::{Duration, Instant};

use crate::calibration::{
    fit_point, CalibrationConfig, CalibrationPoint, CalibrationResult, CalibrationSample,
    PointStatus, Verdict,
};
use crate::session::{Subscription, TrackerSession};
use crate::Error;

/// Where the engine currently is. `RecalibrateSubset` behaves like `Idle`
/// with point selection restricted to the retry subset; `Accepted` is
/// terminal for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    Idle,
    PointSelected { index: usize },
    Collecting { index: usize },
    Computed,
    Reviewing,
    RecalibrateSubset,
    Accepted,
}

/// Progress report from `poll_collection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectProgress {
    /// No collection in flight.
    Idle,
    /// Still gathering samples for the current point.
    Collecting { valid: usize, total: usize },
    /// The current point's window just ended.
    PointDone { index: usize, status: PointStatus },
    /// Every point in the active subset has been attempted; fit computed.
    Computed,
}

struct Collection {
    index: usize,
    started: Instant,
    subscription: Subscription,
    gathered: Vec<CalibrationSample>,
    valid: usize,
    seen: usize,
}

/// Sequences target presentation, sample collection, fit computation and
/// selective recalibration. Polled from the foreground loop; never blocks
/// the driver thread.
pub struct CalibrationEngine {
    config: CalibrationConfig,
    points: Vec<CalibrationPoint>,
    phase: EnginePhase,
    /// Indices currently eligible for selection (1-based).
    active: BTreeSet<usize>,
    in_retry: bool,
    result: Option<CalibrationResult>,
    review_cycles: u32,
    collection: Option<Collection>,
}

impl CalibrationEngine {
    /// `targets` are ADCS positions; `stimuli_count` is the length of the
    /// caller's asset list. Checked here, before anything is displayed.
    pub fn new(
        targets: &[Vec2],
        stimuli_count: usize,
        config: CalibrationConfig,
    ) -> Result<Self, Error> {
        if targets.is_empty() {
            return Err(Error::Config("no calibration points supplied".into()));
        }
        if stimuli_count < targets.len() {
            return Err(Error::Config(format!(
                "{} calibration points but only {} stimuli",
                targets.len(),
                stimuli_count
            )));
        }
        let points = targets
            .iter()
            .enumerate()
            .map(|(i, target)| CalibrationPoint {
                index: i + 1,
                target: *target,
                stimulus: i,
                status: PointStatus::Pending,
                samples: Vec::new(),
            })
            .collect::<Vec<_>>();
        Ok(Self {
            config,
            active: (1..=points.len()).collect(),
            points,
            phase: EnginePhase::Idle,
            in_retry: false,
            result: None,
            review_cycles: 0,
            collection: None,
        })
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    pub fn point(&self, index: usize) -> Option<&CalibrationPoint> {
        self.points.get(index.checked_sub(1)?)
    }

    /// The fit from the latest compute pass; `None` until computed and after
    /// a recalibration restarts collection.
    pub fn result(&self) -> Option<&CalibrationResult> {
        self.result.as_ref()
    }

    pub fn review_cycles(&self) -> u32 {
        self.review_cycles
    }

    pub fn active_subset(&self) -> &BTreeSet<usize> {
        &self.active
    }

    /// Select a point (1..=N) for display, or 0 to deselect. Deselection
    /// never touches the prior point's status.
    pub fn select_point(&mut self, index: usize) -> Result<(), Error> {
        match self.phase {
            EnginePhase::Idle
            | EnginePhase::PointSelected { .. }
            | EnginePhase::RecalibrateSubset => {}
            phase => {
                return Err(Error::Calibration(format!(
                    "cannot select a point in {:?}",
                    phase
                )))
            }
        }
        if index == 0 {
            self.phase = self.idle_phase();
            return Ok(());
        }
        if !self.active.contains(&index) {
            return Err(Error::Calibration(format!(
                "point {} is not in the active set",
                index
            )));
        }
        debug!("Point {} selected", index);
        self.phase = EnginePhase::PointSelected { index };
        Ok(())
    }

    /// Start the sampling window for the selected point. Prior samples for
    /// the point are overwritten; the vendor hook collects at the same
    /// target.
    pub fn begin_collection(&mut self, session: &TrackerSession) -> Result<(), Error> {
        let EnginePhase::PointSelected { index } = self.phase else {
            return Err(Error::Calibration("no calibration point selected".into()));
        };
        session.start_stream()?;
        session.collect_calibration_point(self.points[index - 1].target)?;
        let subscription = session.subscribe();
        self.points[index - 1].samples.clear();
        self.collection = Some(Collection {
            index,
            started: Instant::now(),
            subscription,
            gathered: Vec::new(),
            valid: 0,
            seen: 0,
        });
        self.phase = EnginePhase::Collecting { index };
        info!("Collecting samples for point {}", index);
        Ok(())
    }

    /// Drain whatever arrived since the last poll. Called from the
    /// foreground loop; ends the window once enough valid samples are in or
    /// the timeout elapses. A timeout short of `min_valid_samples` marks the
    /// point failed without aborting the run.
    pub fn poll_collection(&mut self, session: &TrackerSession) -> Result<CollectProgress, Error> {
        let Some(collection) = self.collection.as_mut() else {
            return Ok(CollectProgress::Idle);
        };

        let mut closed_reason: Option<String> = None;
        let mut enough = false;
        loop {
            match collection.subscription.try_recv() {
                Ok(TrackerEvent::Sample(sample)) => {
                    collection.seen += 1;
                    // Let gaze settle on the new target before tagging.
                    if collection.seen <= self.config.warmup_samples {
                        continue;
                    }
                    let valid = sample.combined_gaze().is_some();
                    collection.gathered.push(CalibrationSample {
                        point: collection.index,
                        sample,
                    });
                    if valid {
                        collection.valid += 1;
                        if collection.valid >= self.config.samples_per_point {
                            enough = true;
                            break;
                        }
                    }
                }
                Ok(TrackerEvent::StreamClosed { reason }) => {
                    closed_reason = Some(reason);
                    break;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    closed_reason = Some("stream ended".into());
                    break;
                }
            }
        }

        let index = collection.index;
        let valid = collection.valid;
        let total = collection.gathered.len();
        let timed_out = collection.started.elapsed()
            >= Duration::from_millis(self.config.collection_timeout_ms);

        if let Some(reason) = closed_reason {
            warn!(
                "Stream closed while collecting point {}: {}",
                index, reason
            );
            self.finish_collection(PointStatus::Failed);
            return Err(Error::Tracker(TrackerError::StreamClosed(reason)));
        }
        if enough {
            self.finish_collection(PointStatus::Collected);
            return self.after_point(session, index, PointStatus::Collected);
        }
        if timed_out {
            let status = if valid >= self.config.min_valid_samples {
                PointStatus::Collected
            } else {
                warn!(
                    "Point {} timed out with {} valid of {} samples; marked failed",
                    index, valid, total
                );
                PointStatus::Failed
            };
            self.finish_collection(status);
            return self.after_point(session, index, status);
        }
        Ok(CollectProgress::Collecting { valid, total })
    }

    /// Force the transition to the computed fit: an in-flight window is
    /// ended with whatever arrived, never-attempted points are marked
    /// failed.
    pub fn finish(&mut self, session: &TrackerSession) -> Result<(), Error> {
        match self.phase {
            EnginePhase::Computed | EnginePhase::Reviewing => {
                return Err(Error::Calibration("fit already computed".into()))
            }
            EnginePhase::Accepted => {
                return Err(Error::Calibration("calibration already accepted".into()))
            }
            EnginePhase::Collecting { .. } => {
                let status = match self.collection.as_ref() {
                    Some(c) if c.valid >= self.config.min_valid_samples => PointStatus::Collected,
                    _ => PointStatus::Failed,
                };
                self.finish_collection(status);
            }
            _ => {}
        }
        let indices: Vec<usize> = self.active.iter().copied().collect();
        for i in indices {
            if self.points[i - 1].status == PointStatus::Pending {
                debug!("Point {} never attempted; marked failed", i);
                self.points[i - 1].status = PointStatus::Failed;
            }
        }
        self.compute(session)
    }

    /// Present the computed result for operator review.
    pub fn begin_review(&mut self) -> Result<&CalibrationResult, Error> {
        if self.phase != EnginePhase::Computed {
            return Err(Error::Calibration(format!(
                "nothing to review in {:?}",
                self.phase
            )));
        }
        self.phase = EnginePhase::Reviewing;
        self.result
            .as_ref()
            .ok_or_else(|| Error::Calibration("no computed result available".into()))
    }

    /// Accept the whole result. Only permitted once every point is
    /// accepted; the result is frozen from here on.
    pub fn accept(&mut self) -> Result<(), Error> {
        if self.phase != EnginePhase::Reviewing {
            return Err(Error::Calibration(format!(
                "cannot accept in {:?}",
                self.phase
            )));
        }
        let result = self
            .result
            .as_ref()
            .ok_or_else(|| Error::Calibration("no computed result available".into()))?;
        if !result.all_accepted() {
            return Err(Error::Calibration(format!(
                "points {:?} need recalibration",
                result.failing_indices()
            )));
        }
        self.phase = EnginePhase::Accepted;
        info!("Calibration accepted with {} points", self.points.len());
        Ok(())
    }

    /// Re-enter point selection for `subset` only. Untouched points keep
    /// their samples; subset points return to pending and their vendor data
    /// is discarded.
    pub fn recalibrate(&mut self, subset: &[usize], session: &TrackerSession) -> Result<(), Error> {
        if self.phase != EnginePhase::Reviewing {
            return Err(Error::Calibration(format!(
                "cannot recalibrate in {:?}",
                self.phase
            )));
        }
        if subset.is_empty() {
            return Err(Error::Calibration("empty recalibration subset".into()));
        }
        if let Some(&bad) = subset.iter().find(|&&i| i == 0 || i > self.points.len()) {
            return Err(Error::Calibration(format!("no calibration point {}", bad)));
        }
        for &i in subset {
            session.discard_calibration_point(self.points[i - 1].target)?;
            self.points[i - 1].status = PointStatus::Pending;
            // Prior samples stay until the re-collection overwrites them.
        }
        self.active = subset.iter().copied().collect();
        self.in_retry = true;
        self.review_cycles += 1;
        self.result = None;
        self.phase = EnginePhase::RecalibrateSubset;
        info!(
            "Recalibrating points {:?} (review cycle {})",
            subset, self.review_cycles
        );
        Ok(())
    }

    /// Cooperative abort back to idle from any phase: drops the live
    /// subscription and restores the full selection set. Point statuses are
    /// left as they were.
    pub fn abort(&mut self) {
        self.collection = None;
        self.in_retry = false;
        self.active = (1..=self.points.len()).collect();
        self.phase = EnginePhase::Idle;
        info!("Calibration aborted to idle");
    }

    fn idle_phase(&self) -> EnginePhase {
        if self.in_retry {
            EnginePhase::RecalibrateSubset
        } else {
            EnginePhase::Idle
        }
    }

    fn finish_collection(&mut self, status: PointStatus) {
        if let Some(collection) = self.collection.take() {
            let point = &mut self.points[collection.index - 1];
            point.samples = collection.gathered;
            point.status = status;
            debug!(
                "Point {} window ended: {:?} with {} samples",
                collection.index,
                status,
                point.samples.len()
            );
            self.phase = self.idle_phase();
        }
    }

    fn after_point(
        &mut self,
        session: &TrackerSession,
        index: usize,
        status: PointStatus,
    ) -> Result<CollectProgress, Error> {
        if self.all_attempted() {
            self.compute(session)?;
            Ok(CollectProgress::Computed)
        } else {
            Ok(CollectProgress::PointDone { index, status })
        }
    }

    fn all_attempted(&self) -> bool {
        self.active
            .iter()
            .all(|&i| self.points[i - 1].status != PointStatus::Pending)
    }

    fn compute(&mut self, session: &TrackerSession) -> Result<(), Error> {
        session.apply_calibration()?;
        let fits: Vec<_> = self
            .points
            .iter()
            .map(|p| fit_point(p, &self.config))
            .collect();
        for (point, fit) in self.points.iter_mut().zip(&fits) {
            point.status = match fit.verdict {
                Verdict::Accepted => PointStatus::Accepted,
                Verdict::NeedsRecalibration => PointStatus::Failed,
            };
        }
        let accepted = fits
            .iter()
            .filter(|f| f.verdict == Verdict::Accepted)
            .count();
        info!(
            "Calibration fit computed: {}/{} points accepted",
            accepted,
            fits.len()
        );
        self.result = Some(CalibrationResult { fits });
        self.phase = EnginePhase::Computed;
        Ok(())
    }
}
