use api::TrackerError;
use thiserror::Error;

/// Error taxonomy for the calibration and recording pipeline.
///
/// Configuration errors are fatal and raised before any stateful
/// interaction; stream errors are terminal for the device stream;
/// calibration errors are recoverable and drive the review loop; I/O errors
/// propagate from the recording sink with partial writes left on disk.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("a recording session is already open")]
    RecordingOpen,
    #[error("no recording session is open")]
    NotRecording,
    #[error("calibration error: {0}")]
    Calibration(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
