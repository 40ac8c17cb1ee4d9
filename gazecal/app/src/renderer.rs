use anyhow::Result;
use common::CalibrationResult;
use glam::Vec2;
use std::collections::{BTreeSet, VecDeque};

/// Reference to a stimulus asset owned by the rendering engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StimulusRef(pub String);

/// Abstract operator input during calibration and status display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKey {
    /// 1-9 select a calibration point; 0 deselects (or clears review marks).
    Digit(u8),
    /// Start sample collection for the selected point.
    Collect,
    /// Force the transition to fit computation.
    Finish,
    /// Accept in review, or recalibrate the marked subset.
    Decide,
    /// Toggle the attention-getting stimulus.
    ToggleAttention,
    Abort,
    /// Leave the status display.
    Exit,
}

/// Seam to the stimulus-presentation engine. The controller never draws
/// directly; an implementation adapts whatever windowing toolkit the
/// experiment script uses. All positions are window units.
pub trait Renderer {
    fn draw_target(&mut self, stimulus: &StimulusRef, pos: Vec2, scale: f32);
    fn draw_attention_getter(&mut self, stimulus: &StimulusRef);
    /// Live per-eye gaze markers for the status display; `None` for an eye
    /// the tracker does not currently see.
    fn draw_gaze_marker(&mut self, left: Option<Vec2>, right: Option<Vec2>);
    fn draw_result(&mut self, result: &CalibrationResult, marked: &BTreeSet<usize>);
    fn clear(&mut self);
    fn flip(&mut self) -> Result<()>;
    fn poll_keys(&mut self) -> Vec<ControlKey>;
}

/// Headless renderer replaying a scripted key sequence, one key per frame.
/// Used by the demo binary and the integration tests; reports `Abort` once
/// the script runs dry so a driving loop can never hang.
#[derive(Default)]
pub struct ScriptedRenderer {
    keys: VecDeque<ControlKey>,
    pub frames: u64,
    pub targets_drawn: Vec<(StimulusRef, Vec2, f32)>,
    pub markers_drawn: u64,
    pub results_drawn: u64,
    pub attention_frames: u64,
}

impl ScriptedRenderer {
    pub fn new(keys: impl IntoIterator<Item = ControlKey>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn push_keys(&mut self, keys: impl IntoIterator<Item = ControlKey>) {
        self.keys.extend(keys);
    }
}

impl Renderer for ScriptedRenderer {
    fn draw_target(&mut self, stimulus: &StimulusRef, pos: Vec2, scale: f32) {
        self.targets_drawn.push((stimulus.clone(), pos, scale));
    }

    fn draw_attention_getter(&mut self, _stimulus: &StimulusRef) {
        self.attention_frames += 1;
    }

    fn draw_gaze_marker(&mut self, _left: Option<Vec2>, _right: Option<Vec2>) {
        self.markers_drawn += 1;
    }

    fn draw_result(&mut self, _result: &CalibrationResult, _marked: &BTreeSet<usize>) {
        self.results_drawn += 1;
    }

    fn clear(&mut self) {}

    fn flip(&mut self) -> Result<()> {
        self.frames += 1;
        Ok(())
    }

    fn poll_keys(&mut self) -> Vec<ControlKey> {
        match self.keys.pop_front() {
            Some(key) => vec![key],
            None => vec![ControlKey::Abort],
        }
    }
}
