use api::{EyeGaze, GazeSample, SampleSink, TrackerBackend, TrackerError, TrackerEvent};
use glam::Vec2;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const SERIAL: &str = "SIM-000001";
const DEVICE_NAME: &str = "Synthetic Tracker SIM-000001";

/// Behavior knobs for the simulated device.
#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub rate_hz: u32,
    /// Jitter amplitude around the fixation point, ADCS units.
    pub noise: f32,
    /// Every Nth sample is reported with both eyes undetected; 0 = never.
    pub invalid_every: u32,
    /// Deliver a terminal stream close after this many samples.
    pub fail_after: Option<u64>,
    /// Snap the simulated fixation onto each vendor-collected target, as a
    /// subject following the displayed stimulus would.
    pub follow_calibration_targets: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            rate_hz: 120,
            noise: 0.005,
            invalid_every: 0,
            fail_after: None,
            follow_calibration_targets: true,
        }
    }
}

struct SynthControl {
    running: AtomicBool,
    fixation: RwLock<Vec2>,
    calibrating: AtomicBool,
    collected: Mutex<Vec<Vec2>>,
    applied: AtomicU32,
}

/// Control surface that stays usable after the tracker is boxed into a
/// session: points the simulated gaze and inspects vendor-hook bookkeeping.
#[derive(Clone)]
pub struct SyntheticHandle {
    control: Arc<SynthControl>,
}

impl SyntheticHandle {
    /// Point the simulated gaze at `target` (ADCS).
    pub fn fixate(&self, target: Vec2) {
        if let Ok(mut fixation) = self.control.fixation.write() {
            *fixation = target;
        }
    }

    pub fn collected_targets(&self) -> Vec<Vec2> {
        self.control
            .collected
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn apply_count(&self) -> u32 {
        self.control.applied.load(Ordering::SeqCst)
    }

    pub fn in_calibration(&self) -> bool {
        self.control.calibrating.load(Ordering::SeqCst)
    }
}

/// Simulated eye tracker used by the test suite and the demo binary. Runs a
/// driver thread at the configured rate, jittering deterministically around
/// the current fixation point.
pub struct SyntheticTracker {
    config: SyntheticConfig,
    control: Arc<SynthControl>,
    worker: Option<JoinHandle<()>>,
}

impl SyntheticTracker {
    /// Simulated device discovery. A requested serial that does not match
    /// the simulated unit reports `NoDevice`, like an absent tracker.
    pub fn discover(serial: Option<&str>) -> Result<Self, TrackerError> {
        match serial {
            Some(s) if s != SERIAL => Err(TrackerError::NoDevice),
            _ => Ok(Self::with_config(SyntheticConfig::default())),
        }
    }

    pub fn with_config(config: SyntheticConfig) -> Self {
        Self {
            config,
            control: Arc::new(SynthControl {
                running: AtomicBool::new(false),
                fixation: RwLock::new(Vec2::new(0.5, 0.5)),
                calibrating: AtomicBool::new(false),
                collected: Mutex::new(Vec::new()),
                applied: AtomicU32::new(0),
            }),
            worker: None,
        }
    }

    pub fn handle(&self) -> SyntheticHandle {
        SyntheticHandle {
            control: self.control.clone(),
        }
    }
}

impl TrackerBackend for SyntheticTracker {
    fn name(&self) -> &str {
        DEVICE_NAME
    }

    fn start_stream(&mut self, sink: Arc<dyn SampleSink>) -> Result<(), TrackerError> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.control.running.store(true, Ordering::SeqCst);
        let control = self.control.clone();
        let config = self.config.clone();
        let worker = thread::Builder::new()
            .name("synthetic-tracker".into())
            .spawn(move || drive(control, config, sink))
            .map_err(|e| TrackerError::Backend(e.to_string()))?;
        self.worker = Some(worker);
        info!("Synthetic tracker streaming at {} Hz", self.config.rate_hz);
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<(), TrackerError> {
        self.control.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        Ok(())
    }

    fn begin_calibration(&mut self) -> Result<(), TrackerError> {
        self.control.calibrating.store(true, Ordering::SeqCst);
        if let Ok(mut collected) = self.control.collected.lock() {
            collected.clear();
        }
        debug!("Entered calibration mode");
        Ok(())
    }

    fn collect_calibration_point(&mut self, target: Vec2) -> Result<(), TrackerError> {
        if !self.control.calibrating.load(Ordering::SeqCst) {
            return Err(TrackerError::Backend("not in calibration mode".into()));
        }
        if self.config.follow_calibration_targets {
            if let Ok(mut fixation) = self.control.fixation.write() {
                *fixation = target;
            }
        }
        if let Ok(mut collected) = self.control.collected.lock() {
            collected.push(target);
        }
        Ok(())
    }

    fn discard_calibration_point(&mut self, target: Vec2) -> Result<(), TrackerError> {
        if let Ok(mut collected) = self.control.collected.lock() {
            collected.retain(|t| t.distance_squared(target) > 1e-9);
        }
        Ok(())
    }

    fn apply_calibration(&mut self) -> Result<(), TrackerError> {
        let collected = self
            .control
            .collected
            .lock()
            .map(|c| c.len())
            .unwrap_or(0);
        if collected == 0 {
            return Err(TrackerError::Backend(
                "no calibration data collected".into(),
            ));
        }
        self.control.applied.fetch_add(1, Ordering::SeqCst);
        debug!("Applied calibration over {} targets", collected);
        Ok(())
    }

    fn end_calibration(&mut self) -> Result<(), TrackerError> {
        self.control.calibrating.store(false, Ordering::SeqCst);
        debug!("Left calibration mode");
        Ok(())
    }
}

impl Drop for SyntheticTracker {
    fn drop(&mut self) {
        self.control.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn drive(control: Arc<SynthControl>, config: SyntheticConfig, sink: Arc<dyn SampleSink>) {
    let period = Duration::from_micros(1_000_000 / config.rate_hz.max(1) as u64);
    let mut rng = XorShift::new(0x9E37_79B9);
    let mut timestamp_us = 0i64;
    let mut count = 0u64;

    while control.running.load(Ordering::SeqCst) {
        if config.fail_after.is_some_and(|limit| count >= limit) {
            sink.deliver(TrackerEvent::StreamClosed {
                reason: "simulated device disconnect".into(),
            });
            control.running.store(false, Ordering::SeqCst);
            return;
        }

        let fixation = control
            .fixation
            .read()
            .map(|f| *f)
            .unwrap_or(Vec2::new(0.5, 0.5));
        count += 1;
        timestamp_us += period.as_micros() as i64;

        let sample = if config.invalid_every > 0 && count % config.invalid_every as u64 == 0 {
            GazeSample {
                timestamp_us,
                left: EyeGaze::invalid(),
                right: EyeGaze::invalid(),
            }
        } else {
            let jitter = |rng: &mut XorShift| {
                Vec2::new(rng.next_f32() - 0.5, rng.next_f32() - 0.5) * 2.0 * config.noise
            };
            GazeSample {
                timestamp_us,
                left: EyeGaze::valid(fixation + jitter(&mut rng), 3.2),
                right: EyeGaze::valid(fixation + jitter(&mut rng), 3.1),
            }
        };
        sink.deliver(TrackerEvent::Sample(sample));
        thread::sleep(period);
    }
}

/// Small deterministic generator so test runs are reproducible.
struct XorShift(u32);

impl XorShift {
    fn new(seed: u32) -> Self {
        Self(seed.max(1))
    }

    fn next_f32(&mut self) -> f32 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.0 = x;
        (x >> 8) as f32 / (1 << 24) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_by_serial() {
        assert!(SyntheticTracker::discover(None).is_ok());
        assert!(SyntheticTracker::discover(Some(SERIAL)).is_ok());
        assert!(matches!(
            SyntheticTracker::discover(Some("TX300-42")),
            Err(TrackerError::NoDevice)
        ));
    }

    #[test]
    fn collect_requires_calibration_mode() {
        let mut tracker = SyntheticTracker::discover(None).unwrap();
        assert!(tracker
            .collect_calibration_point(Vec2::new(0.5, 0.5))
            .is_err());
        tracker.begin_calibration().unwrap();
        tracker
            .collect_calibration_point(Vec2::new(0.5, 0.5))
            .unwrap();
        assert_eq!(tracker.handle().collected_targets().len(), 1);
    }

    #[test]
    fn apply_without_data_fails() {
        let mut tracker = SyntheticTracker::discover(None).unwrap();
        tracker.begin_calibration().unwrap();
        assert!(tracker.apply_calibration().is_err());
        tracker.collect_calibration_point(Vec2::new(0.2, 0.8)).unwrap();
        tracker.apply_calibration().unwrap();
        assert_eq!(tracker.handle().apply_count(), 1);
    }

    #[test]
    fn discard_removes_a_collected_target() {
        let mut tracker = SyntheticTracker::discover(None).unwrap();
        tracker.begin_calibration().unwrap();
        tracker.collect_calibration_point(Vec2::new(0.2, 0.2)).unwrap();
        tracker.collect_calibration_point(Vec2::new(0.8, 0.8)).unwrap();
        tracker
            .discard_calibration_point(Vec2::new(0.2, 0.2))
            .unwrap();
        assert_eq!(
            tracker.handle().collected_targets(),
            vec![Vec2::new(0.8, 0.8)]
        );
    }

    #[test]
    fn xorshift_is_deterministic_and_bounded() {
        let mut a = XorShift::new(1);
        let mut b = XorShift::new(1);
        for _ in 0..100 {
            let v = a.next_f32();
            assert_eq!(v, b.next_f32());
            assert!((0.0..1.0).contains(&v));
        }
    }
}
