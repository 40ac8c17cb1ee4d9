pub mod config;
pub mod controller;
pub mod policy;
pub mod renderer;

pub use config::{load_config, AppConfig, PolicyKind};
pub use controller::{CalibrationOutcome, GazeController};
pub use policy::{FixedPolicy, InfantPolicy, PresentationPolicy};
pub use renderer::{ControlKey, Renderer, ScriptedRenderer, StimulusRef};
