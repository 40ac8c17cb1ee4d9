use api::{GazeSample, TrackerEvent};
use log::{debug, info, warn};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::coords::DisplayMap;
use crate::session::{SubscriptionGuard, TrackerSession};
use crate::Error;

const HEADER: &str = "timestamp_us\tleft_x\tleft_y\tleft_validity\tright_x\tright_y\tright_validity\tleft_x_adcs\tleft_y_adcs\tright_x_adcs\tright_y_adcs\tleft_pupil_mm\tright_pupil_mm\tevent";

/// How often the writer wakes to check for annotations and shutdown while
/// the stream is quiet.
const WRITER_IDLE_WAIT: Duration = Duration::from_millis(50);

struct WriterOutcome {
    sink: BufWriter<File>,
    rows: u64,
}

struct RecordingSession {
    path: PathBuf,
    guard: Option<SubscriptionGuard>,
    writer: Option<JoinHandle<io::Result<WriterOutcome>>>,
    /// Present between a stop and the final close.
    sink: Option<BufWriter<File>>,
    rows: u64,
}

/// Durable, ordered recording of every sample delivered while a session is
/// open. At most one session at a time; the open sink is owned exclusively
/// by the writer until `stop_recording`/`close` take it back.
pub struct GazeRecorder {
    map: DisplayMap,
    session: Option<RecordingSession>,
    annotations: Arc<Mutex<Vec<String>>>,
}

impl GazeRecorder {
    pub fn new(map: DisplayMap) -> Self {
        Self {
            map,
            session: None,
            annotations: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Whether samples are currently being appended.
    pub fn is_recording(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.writer.is_some())
    }

    /// Open `path`, write the header and register as a stream consumer.
    /// Fails with `RecordingOpen` if a session is already open, leaving that
    /// session untouched.
    pub fn start_recording(&mut self, session: &TrackerSession, path: &Path) -> Result<(), Error> {
        if self.session.is_some() {
            return Err(Error::RecordingOpen);
        }
        let file = File::create(path)?;
        let mut sink = BufWriter::new(file);
        writeln!(sink, "{}", HEADER)?;

        if let Ok(mut pending) = self.annotations.lock() {
            pending.clear();
        }

        let (guard, events) = session.subscribe().into_parts();
        let map = self.map;
        let annotations = self.annotations.clone();
        let writer = thread::Builder::new()
            .name("gaze-recorder".into())
            .spawn(move || run_writer(events, sink, map, annotations))
            .map_err(Error::Io)?;

        info!("Recording gaze data to {:?}", path);
        self.session = Some(RecordingSession {
            path: path.to_path_buf(),
            guard: Some(guard),
            writer: Some(writer),
            sink: None,
            rows: 0,
        });
        Ok(())
    }

    /// Queue an annotation row. Written by the writer thread in arrival
    /// order, stamped with the last seen device timestamp.
    pub fn record_event(&self, label: &str) -> Result<(), Error> {
        if !self.is_recording() {
            return Err(Error::NotRecording);
        }
        if let Ok(mut pending) = self.annotations.lock() {
            pending.push(label.to_string());
        }
        Ok(())
    }

    /// Unregister as a consumer, drain everything delivered before the stop
    /// and flush. The sink stays open for `close()` to finalize. Returns the
    /// number of rows written.
    pub fn stop_recording(&mut self) -> Result<u64, Error> {
        let session = self.session.as_mut().ok_or(Error::NotRecording)?;
        let writer = session.writer.take().ok_or(Error::NotRecording)?;
        // Removing the subscriber is the atomic cut-off: nothing delivered
        // past this point reaches the queue, everything already queued is
        // drained by the writer before it exits.
        session.guard.take();
        match join_writer(writer) {
            Ok(outcome) => {
                session.sink = Some(outcome.sink);
                session.rows = outcome.rows;
                info!(
                    "Recording stopped after {} rows ({:?})",
                    outcome.rows, session.path
                );
                Ok(outcome.rows)
            }
            Err(e) => {
                let path = session.path.clone();
                self.session = None;
                warn!("Recording to {:?} failed: {}", path, e);
                Err(Error::Io(e))
            }
        }
    }

    /// Release the sink on every exit path. Called without a prior
    /// `stop_recording` this performs the implicit stop first; calling it
    /// with nothing open is a no-op.
    pub fn close(&mut self) -> Result<(), Error> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        session.guard.take();
        let mut first_error: Option<io::Error> = None;
        if let Some(writer) = session.writer.take() {
            match join_writer(writer) {
                Ok(outcome) => {
                    session.sink = Some(outcome.sink);
                    session.rows = outcome.rows;
                }
                Err(e) => first_error = Some(e),
            }
        }
        if let Some(mut sink) = session.sink.take() {
            let finalize = sink.flush().and_then(|_| sink.get_ref().sync_all());
            if let Err(e) = finalize {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => {
                warn!("Closing {:?} reported: {}", session.path, e);
                Err(Error::Io(e))
            }
            None => {
                info!(
                    "Recording file {:?} closed ({} rows)",
                    session.path, session.rows
                );
                Ok(())
            }
        }
    }
}

impl Drop for GazeRecorder {
    fn drop(&mut self) {
        if self.session.is_some() {
            if let Err(e) = self.close() {
                warn!("Failed to close recording on drop: {}", e);
            }
        }
    }
}

fn join_writer(writer: JoinHandle<io::Result<WriterOutcome>>) -> io::Result<WriterOutcome> {
    match writer.join() {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::Other,
            "recorder writer thread panicked",
        )),
    }
}

fn run_writer(
    events: Receiver<TrackerEvent>,
    mut sink: BufWriter<File>,
    map: DisplayMap,
    annotations: Arc<Mutex<Vec<String>>>,
) -> io::Result<WriterOutcome> {
    let mut rows = 0u64;
    let mut last_timestamp_us = 0i64;
    loop {
        match events.recv_timeout(WRITER_IDLE_WAIT) {
            Ok(TrackerEvent::Sample(sample)) => {
                last_timestamp_us = sample.timestamp_us;
                write_sample_row(&mut sink, &map, &sample)?;
                rows += 1;
            }
            Ok(TrackerEvent::StreamClosed { reason }) => {
                warn!("Stream closed while recording: {}", reason);
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
            // Unsubscribed: the queue has been fully drained.
            Err(RecvTimeoutError::Disconnected) => break,
        }
        rows += drain_annotations(&mut sink, &annotations, last_timestamp_us)?;
    }
    rows += drain_annotations(&mut sink, &annotations, last_timestamp_us)?;
    sink.flush()?;
    debug!("Writer thread finished after {} rows", rows);
    Ok(WriterOutcome { sink, rows })
}

fn drain_annotations(
    sink: &mut BufWriter<File>,
    annotations: &Arc<Mutex<Vec<String>>>,
    timestamp_us: i64,
) -> io::Result<u64> {
    let pending: Vec<String> = match annotations.lock() {
        Ok(mut pending) => pending.drain(..).collect(),
        Err(_) => return Ok(0),
    };
    let mut written = 0u64;
    for label in pending {
        writeln!(
            sink,
            "{}\t\t\t\t\t\t\t\t\t\t\t\t\t{}",
            timestamp_us, label
        )?;
        written += 1;
    }
    Ok(written)
}

fn write_sample_row(
    sink: &mut BufWriter<File>,
    map: &DisplayMap,
    sample: &GazeSample,
) -> io::Result<()> {
    let left_window = map.adcs_to_window(sample.left.gaze);
    let right_window = map.adcs_to_window(sample.right.gaze);
    writeln!(
        sink,
        "{}\t{:.6}\t{:.6}\t{}\t{:.6}\t{:.6}\t{}\t{:.6}\t{:.6}\t{:.6}\t{:.6}\t{:.3}\t{:.3}\t",
        sample.timestamp_us,
        left_window.x,
        left_window.y,
        sample.left.validity.code(),
        right_window.x,
        right_window.y,
        sample.right.validity.code(),
        sample.left.gaze.x,
        sample.left.gaze.y,
        sample.right.gaze.x,
        sample.right.gaze.y,
        sample.left.pupil_diameter_mm,
        sample.right.pupil_diameter_mm,
    )
}
