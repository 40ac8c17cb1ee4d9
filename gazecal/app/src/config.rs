use crate::policy::{FixedPolicy, InfantPolicy, PresentationPolicy};
use crate::renderer::StimulusRef;
use anyhow::Result;
use common::CalibrationConfig;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which presentation policy the controller runs with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub enum PolicyKind {
    #[default]
    #[serde(alias = "infant")]
    Infant,
    #[serde(alias = "fixed", alias = "adult", alias = "Adult")]
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub calibration: CalibrationConfig,

    #[serde(default)]
    pub policy: PolicyKind,
    #[serde(default = "default_shrink_speed")]
    pub shrink_speed: f32,
    #[serde(default = "default_min_target_scale")]
    pub min_target_scale: f32,
    #[serde(default = "default_focus_ms")]
    pub focus_ms: u64,
    /// Asset shown when the operator toggles the attention getter.
    #[serde(default)]
    pub attention_getter: Option<String>,

    /// Review cycles before a calibration attempt is reported failed;
    /// 0 = unlimited.
    #[serde(default = "default_max_review_cycles")]
    pub max_review_cycles: u32,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_shrink_speed() -> f32 {
    1.5
}

fn default_min_target_scale() -> f32 {
    0.2
}

fn default_focus_ms() -> u64 {
    500
}

fn default_max_review_cycles() -> u32 {
    5
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("participant_data")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            calibration: CalibrationConfig::default(),
            policy: PolicyKind::default(),
            shrink_speed: default_shrink_speed(),
            min_target_scale: default_min_target_scale(),
            focus_ms: default_focus_ms(),
            attention_getter: None,
            max_review_cycles: default_max_review_cycles(),
            data_dir: default_data_dir(),
        }
    }
}

impl AppConfig {
    pub fn build_policy(&self) -> Box<dyn PresentationPolicy> {
        match self.policy {
            PolicyKind::Infant => Box::new(InfantPolicy {
                shrink_speed: self.shrink_speed,
                min_scale: self.min_target_scale,
                focus: Duration::from_millis(self.focus_ms),
                attention: self.attention_getter.clone().map(StimulusRef),
            }),
            PolicyKind::Fixed => Box::new(FixedPolicy),
        }
    }
}

pub fn load_config(path: &Path) -> Result<AppConfig> {
    if path.exists() {
        info!("Loading config from {:?}", path);
        let file = fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let config = serde_json::from_reader(reader)?;
        Ok(config)
    } else {
        info!("Config not found. Creating default at {:?}", path);
        let config = AppConfig::default();
        let file = fs::File::create(path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &config)?;
        Ok(config)
    }
}
