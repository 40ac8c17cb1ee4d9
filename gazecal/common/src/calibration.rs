use api::GazeSample;
use glam::Vec2;
use serde::{Deserialize, Serialize};

/// Collection and fit-quality parameters for one calibration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Valid samples to gather per point before collection ends early.
    #[serde(default = "default_samples_per_point")]
    pub samples_per_point: usize,
    /// Fewer valid samples than this at timeout marks the point failed.
    #[serde(default = "default_min_valid_samples")]
    pub min_valid_samples: usize,
    /// Collection window per point, milliseconds.
    #[serde(default = "default_collection_timeout_ms")]
    pub collection_timeout_ms: u64,
    /// Samples discarded at the start of each window while gaze settles on
    /// the new target.
    #[serde(default = "default_warmup_samples")]
    pub warmup_samples: usize,
    /// Largest acceptable mean offset from the target, in ADCS units.
    #[serde(default = "default_max_offset")]
    pub max_offset: f32,
    /// Largest acceptable RMS dispersion about the sample mean, ADCS units.
    #[serde(default = "default_max_dispersion")]
    pub max_dispersion: f32,
}

fn default_samples_per_point() -> usize {
    30
}

fn default_min_valid_samples() -> usize {
    10
}

fn default_collection_timeout_ms() -> u64 {
    3000
}

fn default_warmup_samples() -> usize {
    3
}

fn default_max_offset() -> f32 {
    0.1
}

fn default_max_dispersion() -> f32 {
    0.08
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            samples_per_point: default_samples_per_point(),
            min_valid_samples: default_min_valid_samples(),
            collection_timeout_ms: default_collection_timeout_ms(),
            warmup_samples: default_warmup_samples(),
            max_offset: default_max_offset(),
            max_dispersion: default_max_dispersion(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointStatus {
    Pending,
    Collected,
    Accepted,
    Failed,
}

/// One calibration target. The index is 1-based and stable across
/// recalibration passes; `stimulus` indexes the caller's asset list.
#[derive(Debug, Clone)]
pub struct CalibrationPoint {
    pub index: usize,
    pub target: Vec2,
    pub stimulus: usize,
    pub status: PointStatus,
    pub samples: Vec<CalibrationSample>,
}

/// A raw sample captured while one calibration point was active.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationSample {
    pub point: usize,
    pub sample: GazeSample,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Accepted,
    NeedsRecalibration,
}

/// Aggregated fit quality for one point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointFit {
    pub index: usize,
    pub target: Vec2,
    /// Distance from the sample mean to the target, ADCS units. NaN when no
    /// valid samples were gathered.
    pub offset: f32,
    /// RMS distance of the samples from their own mean, ADCS units.
    pub dispersion: f32,
    pub valid_samples: usize,
    pub total_samples: usize,
    pub verdict: Verdict,
}

/// Per-point classification of one compute pass. Rebuilt wholesale by every
/// pass; frozen once the engine reaches its terminal accepted state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalibrationResult {
    pub fits: Vec<PointFit>,
}

impl CalibrationResult {
    pub fn all_accepted(&self) -> bool {
        !self.fits.is_empty() && self.fits.iter().all(|f| f.verdict == Verdict::Accepted)
    }

    pub fn failing_indices(&self) -> Vec<usize> {
        self.fits
            .iter()
            .filter(|f| f.verdict == Verdict::NeedsRecalibration)
            .map(|f| f.index)
            .collect()
    }

    pub fn fit(&self, index: usize) -> Option<&PointFit> {
        self.fits.iter().find(|f| f.index == index)
    }
}

pub(crate) fn fit_point(point: &CalibrationPoint, config: &CalibrationConfig) -> PointFit {
    let gazes: Vec<Vec2> = point
        .samples
        .iter()
        .filter_map(|s| s.sample.combined_gaze())
        .collect();
    let valid_samples = gazes.len();
    let total_samples = point.samples.len();

    let (offset, dispersion) = if gazes.is_empty() {
        (f32::NAN, f32::NAN)
    } else {
        let mean = gazes.iter().copied().sum::<Vec2>() / gazes.len() as f32;
        let offset = mean.distance(point.target);
        let dispersion = (gazes.iter().map(|g| g.distance_squared(mean)).sum::<f32>()
            / gazes.len() as f32)
            .sqrt();
        (offset, dispersion)
    };

    // NaN offset/dispersion fail both comparisons, so a point with no valid
    // samples can never be accepted.
    let verdict = if valid_samples >= config.min_valid_samples
        && offset <= config.max_offset
        && dispersion <= config.max_dispersion
    {
        Verdict::Accepted
    } else {
        Verdict::NeedsRecalibration
    };

    PointFit {
        index: point.index,
        target: point.target,
        offset,
        dispersion,
        valid_samples,
        total_samples,
        verdict,
    }
}
