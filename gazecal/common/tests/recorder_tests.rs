//! Recorder tests over a manually driven backend, so delivery is exact and
//! deterministic.

use api::{EyeGaze, GazeSample, SampleSink, TrackerBackend, TrackerError, TrackerEvent};
use common::{DisplayMap, Error, GazeRecorder, TrackerSession};
use glam::Vec2;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

type SharedSink = Arc<Mutex<Option<Arc<dyn SampleSink>>>>;

/// Backend whose "driver thread" is the test itself.
#[derive(Default)]
struct ManualBackend {
    sink: SharedSink,
}

struct ManualHandle {
    sink: SharedSink,
}

impl ManualHandle {
    fn deliver(&self, event: TrackerEvent) {
        self.sink
            .lock()
            .unwrap()
            .as_ref()
            .expect("stream not started")
            .deliver(event);
    }

    fn sample(&self, timestamp_us: i64) {
        self.deliver(TrackerEvent::Sample(GazeSample {
            timestamp_us,
            left: EyeGaze::valid(Vec2::new(0.25, 0.25), 3.0),
            right: EyeGaze::valid(Vec2::new(0.75, 0.75), 3.0),
        }));
    }
}

impl TrackerBackend for ManualBackend {
    fn name(&self) -> &str {
        "Manual Test Tracker"
    }

    fn start_stream(&mut self, sink: Arc<dyn SampleSink>) -> Result<(), TrackerError> {
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<(), TrackerError> {
        *self.sink.lock().unwrap() = None;
        Ok(())
    }

    fn begin_calibration(&mut self) -> Result<(), TrackerError> {
        Ok(())
    }

    fn collect_calibration_point(&mut self, _target: Vec2) -> Result<(), TrackerError> {
        Ok(())
    }

    fn discard_calibration_point(&mut self, _target: Vec2) -> Result<(), TrackerError> {
        Ok(())
    }

    fn apply_calibration(&mut self) -> Result<(), TrackerError> {
        Ok(())
    }

    fn end_calibration(&mut self) -> Result<(), TrackerError> {
        Ok(())
    }
}

fn manual_session() -> (TrackerSession, ManualHandle) {
    let backend = ManualBackend::default();
    let handle = ManualHandle {
        sink: backend.sink.clone(),
    };
    let session = TrackerSession::new(Box::new(backend));
    session.start_stream().unwrap();
    (session, handle)
}

fn data_rows(path: &Path) -> Vec<String> {
    let contents = fs::read_to_string(path).unwrap();
    let mut lines = contents.lines();
    let header = lines.next().expect("header row");
    assert!(header.starts_with("timestamp_us\tleft_x\tleft_y\tleft_validity"));
    lines.map(|l| l.to_string()).collect()
}

fn timestamp_of(row: &str) -> i64 {
    row.split('\t').next().unwrap().parse().unwrap()
}

mod completeness {
    use super::*;

    #[test]
    fn records_exactly_the_delivery_window_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gaze.tsv");
        let (session, handle) = manual_session();
        let mut recorder = GazeRecorder::new(DisplayMap::normalized());

        handle.sample(1);
        handle.sample(2);

        recorder.start_recording(&session, &path).unwrap();
        for ts in 10..15 {
            handle.sample(ts);
        }
        let rows = recorder.stop_recording().unwrap();
        assert_eq!(rows, 5);

        handle.sample(20);
        handle.sample(21);
        recorder.close().unwrap();

        let rows = data_rows(&path);
        let timestamps: Vec<i64> = rows.iter().map(|r| timestamp_of(r)).collect();
        assert_eq!(timestamps, vec![10, 11, 12, 13, 14]);
    }

    #[test]
    fn both_eyes_invalid_is_still_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gaze.tsv");
        let (session, handle) = manual_session();
        let mut recorder = GazeRecorder::new(DisplayMap::normalized());

        recorder.start_recording(&session, &path).unwrap();
        handle.deliver(TrackerEvent::Sample(GazeSample {
            timestamp_us: 42,
            left: EyeGaze::invalid(),
            right: EyeGaze::invalid(),
        }));
        recorder.stop_recording().unwrap();
        recorder.close().unwrap();

        let rows = data_rows(&path);
        assert_eq!(rows.len(), 1);
        let fields: Vec<&str> = rows[0].split('\t').collect();
        assert_eq!(fields[0], "42");
        // Validity columns carry 0; positions are NaN, not fabricated.
        assert_eq!(fields[3], "0");
        assert_eq!(fields[6], "0");
        assert_eq!(fields[1], "NaN");
    }

    #[test]
    fn window_units_and_adcs_both_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gaze.tsv");
        let (session, handle) = manual_session();
        let mut recorder = GazeRecorder::new(DisplayMap::new(Vec2::new(960.0, 540.0)));

        recorder.start_recording(&session, &path).unwrap();
        handle.sample(7);
        recorder.stop_recording().unwrap();
        recorder.close().unwrap();

        let rows = data_rows(&path);
        let fields: Vec<&str> = rows[0].split('\t').collect();
        // Left eye at ADCS (0.25, 0.25) -> window (-480, 270) on 1920x1080.
        assert_eq!(fields[1], "-480.000000");
        assert_eq!(fields[2], "270.000000");
        assert_eq!(fields[7], "0.250000");
        assert_eq!(fields[8], "0.250000");
    }
}

mod lifecycle {
    use super::*;

    #[test]
    fn second_start_fails_without_closing_the_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gaze.tsv");
        let other = dir.path().join("other.tsv");
        let (session, handle) = manual_session();
        let mut recorder = GazeRecorder::new(DisplayMap::normalized());

        recorder.start_recording(&session, &path).unwrap();
        let err = recorder
            .start_recording(&session, &other)
            .expect_err("second start must fail");
        assert!(matches!(err, Error::RecordingOpen));
        assert!(!other.exists());

        // The original session keeps recording.
        handle.sample(1);
        handle.sample(2);
        assert_eq!(recorder.stop_recording().unwrap(), 2);
        recorder.close().unwrap();
        assert_eq!(data_rows(&path).len(), 2);
    }

    #[test]
    fn close_without_stop_flushes_and_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gaze.tsv");
        let (session, handle) = manual_session();
        let mut recorder = GazeRecorder::new(DisplayMap::normalized());

        recorder.start_recording(&session, &path).unwrap();
        for ts in 0..3 {
            handle.sample(ts);
        }
        recorder.close().unwrap();

        assert_eq!(data_rows(&path).len(), 3);
        assert!(!recorder.is_recording());
    }

    #[test]
    fn stop_and_close_without_start() {
        let mut recorder = GazeRecorder::new(DisplayMap::normalized());
        assert!(matches!(
            recorder.stop_recording(),
            Err(Error::NotRecording)
        ));
        // Close with nothing open releases nothing and succeeds.
        recorder.close().unwrap();
    }

    #[test]
    fn stream_close_mid_recording_finalizes_the_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gaze.tsv");
        let (session, handle) = manual_session();
        let mut recorder = GazeRecorder::new(DisplayMap::normalized());

        recorder.start_recording(&session, &path).unwrap();
        handle.sample(1);
        handle.sample(2);
        handle.deliver(TrackerEvent::StreamClosed {
            reason: "unplugged".into(),
        });

        assert_eq!(recorder.stop_recording().unwrap(), 2);
        recorder.close().unwrap();
        assert_eq!(data_rows(&path).len(), 2);
        assert!(session.is_closed());
    }
}

mod annotations {
    use super::*;

    #[test]
    fn event_rows_carry_the_label() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gaze.tsv");
        let (session, handle) = manual_session();
        let mut recorder = GazeRecorder::new(DisplayMap::normalized());

        recorder.start_recording(&session, &path).unwrap();
        handle.sample(100);
        recorder.record_event("trial-1").unwrap();
        // Give the writer a couple of idle wakeups to drain the annotation
        // before the next sample arrives.
        thread::sleep(Duration::from_millis(150));
        handle.sample(200);
        recorder.stop_recording().unwrap();
        recorder.close().unwrap();

        let rows = data_rows(&path);
        assert_eq!(rows.len(), 3);
        assert_eq!(timestamp_of(&rows[0]), 100);
        assert!(rows[1].ends_with("trial-1"));
        assert_eq!(timestamp_of(&rows[1]), 100);
        assert_eq!(timestamp_of(&rows[2]), 200);
    }

    #[test]
    fn record_event_requires_an_open_session() {
        let recorder = GazeRecorder::new(DisplayMap::normalized());
        assert!(matches!(
            recorder.record_event("x"),
            Err(Error::NotRecording)
        ));
    }
}
