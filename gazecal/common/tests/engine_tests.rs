//! Calibration engine tests against the synthetic tracker.

use common::{
    CalibrationConfig, CalibrationEngine, CollectProgress, EnginePhase, Error, PointStatus,
    SyntheticConfig, SyntheticHandle, SyntheticTracker, TrackerError, TrackerSession,
};
use glam::Vec2;
use std::thread;
use std::time::Duration;

fn five_targets() -> Vec<Vec2> {
    vec![
        Vec2::new(0.3, 0.3),
        Vec2::new(0.3, 0.7),
        Vec2::new(0.5, 0.5),
        Vec2::new(0.7, 0.3),
        Vec2::new(0.7, 0.7),
    ]
}

fn fast_config() -> CalibrationConfig {
    CalibrationConfig {
        samples_per_point: 8,
        min_valid_samples: 4,
        collection_timeout_ms: 800,
        warmup_samples: 2,
        max_offset: 0.05,
        max_dispersion: 0.05,
    }
}

fn session_with(config: SyntheticConfig) -> (TrackerSession, SyntheticHandle) {
    let tracker = SyntheticTracker::with_config(config);
    let handle = tracker.handle();
    (TrackerSession::new(Box::new(tracker)), handle)
}

/// Drive one point's window to completion from the foreground side.
fn collect_point(engine: &mut CalibrationEngine, session: &TrackerSession, index: usize) {
    engine.select_point(index).unwrap();
    engine.begin_collection(session).unwrap();
    loop {
        match engine.poll_collection(session).unwrap() {
            CollectProgress::PointDone { .. } | CollectProgress::Computed => break,
            _ => thread::sleep(Duration::from_millis(5)),
        }
    }
}

mod acceptance {
    use super::*;

    #[test]
    fn full_run_reaches_accepted() {
        let (session, handle) = session_with(SyntheticConfig::default());
        session.begin_calibration().unwrap();

        let targets = five_targets();
        let mut engine = CalibrationEngine::new(&targets, 5, fast_config()).unwrap();
        for index in 1..=5 {
            collect_point(&mut engine, &session, index);
        }

        assert_eq!(engine.phase(), EnginePhase::Computed);
        let result = engine.begin_review().unwrap();
        assert!(result.all_accepted(), "failing: {:?}", result.failing_indices());
        engine.accept().unwrap();
        assert_eq!(engine.phase(), EnginePhase::Accepted);
        assert!(engine
            .points()
            .iter()
            .all(|p| p.status == PointStatus::Accepted));

        // Vendor hooks: one collect per point, one fit pass.
        assert_eq!(handle.collected_targets().len(), 5);
        assert_eq!(handle.apply_count(), 1);
    }

    #[test]
    fn result_identifies_every_point() {
        let (session, _handle) = session_with(SyntheticConfig::default());
        session.begin_calibration().unwrap();

        let targets = five_targets();
        let mut engine = CalibrationEngine::new(&targets, 5, fast_config()).unwrap();
        for index in 1..=5 {
            collect_point(&mut engine, &session, index);
        }

        let result = engine.begin_review().unwrap();
        let mut indices: Vec<usize> = result.fits.iter().map(|f| f.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![1, 2, 3, 4, 5]);
    }
}

mod selective_recalibration {
    use super::*;

    #[test]
    fn one_bad_point_recalibrates_alone() {
        let (session, handle) = session_with(SyntheticConfig {
            follow_calibration_targets: false,
            ..Default::default()
        });
        session.begin_calibration().unwrap();

        let targets = five_targets();
        let mut engine = CalibrationEngine::new(&targets, 5, fast_config()).unwrap();
        for index in 1..=5 {
            // Simulated subject looks 0.2 off for point 3 only.
            let fixation = if index == 3 {
                targets[index - 1] + Vec2::new(0.2, 0.0)
            } else {
                targets[index - 1]
            };
            handle.fixate(fixation);
            collect_point(&mut engine, &session, index);
        }

        let result = engine.begin_review().unwrap();
        assert_eq!(result.failing_indices(), vec![3]);

        let untouched: Vec<i64> = engine
            .point(1)
            .unwrap()
            .samples
            .iter()
            .map(|s| s.sample.timestamp_us)
            .collect();

        engine.recalibrate(&[3], &session).unwrap();
        assert_eq!(engine.phase(), EnginePhase::RecalibrateSubset);
        assert_eq!(
            engine.active_subset().iter().copied().collect::<Vec<_>>(),
            vec![3]
        );
        // Points outside the subset are not selectable.
        assert!(engine.select_point(1).is_err());

        handle.fixate(targets[2]);
        collect_point(&mut engine, &session, 3);

        assert_eq!(engine.phase(), EnginePhase::Computed);
        let result = engine.begin_review().unwrap();
        assert!(result.all_accepted(), "failing: {:?}", result.failing_indices());
        engine.accept().unwrap();

        // The accepted point's stored samples were never touched.
        let after: Vec<i64> = engine
            .point(1)
            .unwrap()
            .samples
            .iter()
            .map(|s| s.sample.timestamp_us)
            .collect();
        assert_eq!(untouched, after);

        // Discard-then-recollect ran a second vendor fit.
        assert_eq!(handle.apply_count(), 2);
    }

    #[test]
    fn accept_with_failing_points_is_rejected() {
        let (session, handle) = session_with(SyntheticConfig {
            follow_calibration_targets: false,
            ..Default::default()
        });
        session.begin_calibration().unwrap();

        let targets = five_targets();
        let mut engine = CalibrationEngine::new(&targets, 5, fast_config()).unwrap();
        for index in 1..=5 {
            // Everyone looks at the center; only point 3 can pass.
            handle.fixate(Vec2::new(0.5, 0.5));
            collect_point(&mut engine, &session, index);
        }

        engine.begin_review().unwrap();
        let err = engine.accept().expect_err("accept must be rejected");
        assert!(matches!(err, Error::Calibration(_)));
        assert_eq!(engine.phase(), EnginePhase::Reviewing);
    }
}

mod collection_failures {
    use super::*;

    #[test]
    fn all_invalid_samples_time_out_as_failed() {
        let (session, _handle) = session_with(SyntheticConfig {
            invalid_every: 1,
            ..Default::default()
        });
        session.begin_calibration().unwrap();

        let targets = five_targets();
        let mut engine = CalibrationEngine::new(&targets, 5, fast_config()).unwrap();
        engine.select_point(1).unwrap();
        engine.begin_collection(&session).unwrap();

        let status = loop {
            match engine.poll_collection(&session).unwrap() {
                CollectProgress::PointDone { status, .. } => break status,
                CollectProgress::Computed => panic!("cannot compute with four points pending"),
                _ => thread::sleep(Duration::from_millis(5)),
            }
        };
        assert_eq!(status, PointStatus::Failed);
        // One failed point does not abort the run.
        assert_eq!(engine.phase(), EnginePhase::Idle);
        assert_eq!(engine.point(2).unwrap().status, PointStatus::Pending);
    }

    #[test]
    fn disconnect_fails_the_point_in_progress() {
        // Every sample invalid so the window cannot complete early; the
        // simulated unplug lands mid-collection.
        let (session, _handle) = session_with(SyntheticConfig {
            fail_after: Some(30),
            invalid_every: 1,
            ..Default::default()
        });
        session.begin_calibration().unwrap();

        let targets = five_targets();
        let mut engine = CalibrationEngine::new(&targets, 5, fast_config()).unwrap();
        engine.select_point(1).unwrap();
        engine.begin_collection(&session).unwrap();

        let err = loop {
            match engine.poll_collection(&session) {
                Ok(_) => thread::sleep(Duration::from_millis(5)),
                Err(e) => break e,
            }
        };
        assert!(matches!(
            err,
            Error::Tracker(TrackerError::StreamClosed(_))
        ));
        assert_eq!(engine.point(1).unwrap().status, PointStatus::Failed);
        assert_eq!(engine.phase(), EnginePhase::Idle);
    }

    #[test]
    fn forced_finish_marks_unattempted_points_failed() {
        let (session, _handle) = session_with(SyntheticConfig::default());
        session.begin_calibration().unwrap();

        let targets = five_targets();
        let mut engine = CalibrationEngine::new(&targets, 5, fast_config()).unwrap();
        collect_point(&mut engine, &session, 1);
        collect_point(&mut engine, &session, 2);

        engine.finish(&session).unwrap();
        assert_eq!(engine.phase(), EnginePhase::Computed);
        for index in 3..=5 {
            assert_eq!(engine.point(index).unwrap().status, PointStatus::Failed);
        }
        let result = engine.begin_review().unwrap();
        assert_eq!(result.failing_indices(), vec![3, 4, 5]);
    }
}
