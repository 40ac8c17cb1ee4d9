pub use api::{
    EyeGaze, GazeSample, SampleSink, TrackerBackend, TrackerError, TrackerEvent, Validity,
};

mod backend;
mod calibration;
mod coords;
mod engine;
mod error;
mod recorder;
mod session;

pub use backend::{SyntheticConfig, SyntheticHandle, SyntheticTracker};
pub use calibration::{
    CalibrationConfig, CalibrationPoint, CalibrationResult, CalibrationSample, PointFit,
    PointStatus, Verdict,
};
pub use coords::DisplayMap;
pub use engine::{CalibrationEngine, CollectProgress, EnginePhase};
pub use error::Error;
pub use recorder::GazeRecorder;
pub use session::{Subscription, SubscriptionGuard, TrackerSession};
