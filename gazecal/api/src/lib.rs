use glam::Vec2;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Per-eye validity code as reported by the tracker hardware.
/// Serialized as 1 (valid) / 0 (invalid) in recordings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Validity {
    Valid,
    #[default]
    Invalid,
}

impl Validity {
    pub fn is_valid(self) -> bool {
        matches!(self, Validity::Valid)
    }

    pub fn code(self) -> u8 {
        match self {
            Validity::Valid => 1,
            Validity::Invalid => 0,
        }
    }
}

/// One eye's gaze point in the tracker's Active Display Coordinate System
/// (origin top-left, both axes in [0, 1], y grows downward).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EyeGaze {
    pub gaze: Vec2,
    pub pupil_diameter_mm: f32,
    pub validity: Validity,
}

impl EyeGaze {
    pub fn valid(gaze: Vec2, pupil_diameter_mm: f32) -> Self {
        Self {
            gaze,
            pupil_diameter_mm,
            validity: Validity::Valid,
        }
    }

    /// The hardware failed to detect this eye; position fields carry NaN.
    pub fn invalid() -> Self {
        Self {
            gaze: Vec2::NAN,
            pupil_diameter_mm: f32::NAN,
            validity: Validity::Invalid,
        }
    }
}

impl Default for EyeGaze {
    fn default() -> Self {
        Self::invalid()
    }
}

/// One raw sample from the device stream. Timestamps are device clock
/// microseconds, monotonically non-decreasing within one stream.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GazeSample {
    pub timestamp_us: i64,
    pub left: EyeGaze,
    pub right: EyeGaze,
}

impl GazeSample {
    pub fn both_invalid(&self) -> bool {
        !self.left.validity.is_valid() && !self.right.validity.is_valid()
    }

    /// Midpoint of whichever eyes were detected, in ADCS. `None` when the
    /// hardware saw neither eye.
    pub fn combined_gaze(&self) -> Option<Vec2> {
        match (self.left.validity.is_valid(), self.right.validity.is_valid()) {
            (true, true) => Some((self.left.gaze + self.right.gaze) * 0.5),
            (true, false) => Some(self.left.gaze),
            (false, true) => Some(self.right.gaze),
            (false, false) => None,
        }
    }
}

/// Event delivered to stream consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    Sample(GazeSample),
    /// Terminal: the device will deliver nothing further on this stream.
    StreamClosed { reason: String },
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("no eye tracker found")]
    NoDevice,
    #[error("tracker stream closed: {0}")]
    StreamClosed(String),
    #[error("tracker backend error: {0}")]
    Backend(String),
}

/// Delivery handle handed to a backend at stream start. Invoked once per
/// raw sample from the backend's driver thread; implementations must return
/// promptly and never block on a consumer.
pub trait SampleSink: Send + Sync {
    fn deliver(&self, event: TrackerEvent);
}

/// Seam to the vendor SDK: one implementation per device family. The
/// session layer owns idempotence of start/stop; a backend may assume it is
/// never asked to start twice without an intervening stop.
///
/// Calibration positions are ADCS.
pub trait TrackerBackend: Send {
    fn name(&self) -> &str;

    fn start_stream(&mut self, sink: Arc<dyn SampleSink>) -> Result<(), TrackerError>;
    fn stop_stream(&mut self) -> Result<(), TrackerError>;

    fn begin_calibration(&mut self) -> Result<(), TrackerError>;
    fn collect_calibration_point(&mut self, target: Vec2) -> Result<(), TrackerError>;
    fn discard_calibration_point(&mut self, target: Vec2) -> Result<(), TrackerError>;
    /// Run the vendor's calibration fit over the collected points and load
    /// it onto the device.
    fn apply_calibration(&mut self) -> Result<(), TrackerError>;
    fn end_calibration(&mut self) -> Result<(), TrackerError>;
}
