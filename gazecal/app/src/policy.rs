use crate::renderer::StimulusRef;
use std::time::Duration;

/// How calibration targets are presented: animation curve, pacing, and when
/// the subject is considered settled enough to sample. Injected into the
/// controller rather than baked in, so an infant procedure and a plain adult
/// procedure share the same state machine.
pub trait PresentationPolicy: Send {
    /// Scale factor for the target after it has been shown for `shown_for`.
    fn target_scale(&self, shown_for: Duration) -> f32;

    /// Whether collection may start now that the operator has signaled it.
    fn ready_to_collect(&self, shown_for: Duration) -> bool;

    /// Settle time between the ready signal and sample collection.
    fn focus_delay(&self) -> Duration;

    /// Optional attention-getting stimulus the operator can toggle.
    fn attention_getter(&self) -> Option<&StimulusRef>;
}

/// Static target, immediate collection.
pub struct FixedPolicy;

impl PresentationPolicy for FixedPolicy {
    fn target_scale(&self, _shown_for: Duration) -> f32 {
        1.0
    }

    fn ready_to_collect(&self, _shown_for: Duration) -> bool {
        true
    }

    fn focus_delay(&self) -> Duration {
        Duration::ZERO
    }

    fn attention_getter(&self) -> Option<&StimulusRef> {
        None
    }
}

/// Infant-oriented presentation: the target pulses on a sin^2 curve and
/// collection waits until it has shrunk back down, pulling the subject's
/// gaze to the target center first.
pub struct InfantPolicy {
    /// Radians per second through the pulse curve.
    pub shrink_speed: f32,
    /// Scale the target shrinks down to between pulses.
    pub min_scale: f32,
    pub focus: Duration,
    pub attention: Option<StimulusRef>,
}

impl Default for InfantPolicy {
    fn default() -> Self {
        Self {
            shrink_speed: 1.5,
            min_scale: 0.2,
            focus: Duration::from_millis(500),
            attention: None,
        }
    }
}

impl PresentationPolicy for InfantPolicy {
    fn target_scale(&self, shown_for: Duration) -> f32 {
        let t = shown_for.as_secs_f32() * self.shrink_speed;
        t.sin().powi(2) + self.min_scale
    }

    fn ready_to_collect(&self, shown_for: Duration) -> bool {
        self.target_scale(shown_for) < 2.0 * self.min_scale
    }

    fn focus_delay(&self) -> Duration {
        self.focus
    }

    fn attention_getter(&self) -> Option<&StimulusRef> {
        self.attention.as_ref()
    }
}
