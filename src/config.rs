use std::{fs, path::Path, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::PipelineError;

#[derive(Clone, Debug, Deserialize)]
pub struct PipelineConfig {
    /// Minimum aggregate confidence (exclusive) for a pose to be published.
    #[serde(default = "default_publish_threshold")]
    pub publish_threshold: f32,
    /// Minimum per-keypoint confidence (exclusive) for a joint to be drawn.
    #[serde(default = "default_display_threshold")]
    pub display_threshold: f32,
    #[serde(default = "default_min_frame_interval_ms")]
    pub min_frame_interval_ms: u64,
    /// Square model input edge in pixels.
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    #[serde(default = "default_good_band")]
    pub good_band: f32,
    #[serde(default = "default_marginal_band")]
    pub marginal_band: f32,
    #[serde(default = "default_render_fps")]
    pub render_fps: u32,
    #[serde(default)]
    pub model: ModelConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_path")]
    pub path: PathBuf,
    /// Where to fetch the model from when `path` does not exist yet.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub input_type: InputType,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

/// Element type of the model input tensor. The pixels are always 8-bit RGB;
/// this only picks how they are widened.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    Uint8,
    #[default]
    Int32,
    Float32,
}

fn default_publish_threshold() -> f32 { 0.3 }
fn default_display_threshold() -> f32 { 0.5 }
fn default_min_frame_interval_ms() -> u64 { 125 }
fn default_input_size() -> u32 { 192 }
fn default_good_band() -> f32 { 0.7 }
fn default_marginal_band() -> f32 { 0.4 }
fn default_render_fps() -> u32 { 60 }
fn default_model_path() -> PathBuf {
    PathBuf::from("models").join("movenet_singlepose_lightning.onnx")
}
fn default_intra_threads() -> usize { 2 }

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            publish_threshold: default_publish_threshold(),
            display_threshold: default_display_threshold(),
            min_frame_interval_ms: default_min_frame_interval_ms(),
            input_size: default_input_size(),
            good_band: default_good_band(),
            marginal_band: default_marginal_band(),
            render_fps: default_render_fps(),
            model: ModelConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: default_model_path(),
            url: None,
            input_type: InputType::default(),
            intra_threads: default_intra_threads(),
        }
    }
}

impl PipelineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: PipelineConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("rejected config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), PipelineError> {
        for (name, value) in [
            ("publish_threshold", self.publish_threshold),
            ("display_threshold", self.display_threshold),
            ("good_band", self.good_band),
            ("marginal_band", self.marginal_band),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PipelineError::Config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.marginal_band > self.good_band {
            return Err(PipelineError::Config(format!(
                "marginal_band ({}) must not exceed good_band ({})",
                self.marginal_band, self.good_band
            )));
        }
        if self.min_frame_interval_ms == 0 {
            return Err(PipelineError::Config(
                "min_frame_interval_ms must be positive".into(),
            ));
        }
        if self.input_size == 0 {
            return Err(PipelineError::Config("input_size must be positive".into()));
        }
        if self.render_fps == 0 {
            return Err(PipelineError::Config("render_fps must be positive".into()));
        }
        Ok(())
    }

    pub fn min_frame_interval(&self) -> Duration {
        Duration::from_millis(self.min_frame_interval_ms)
    }

    pub fn render_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.render_fps.max(1) as f64)
    }
}
