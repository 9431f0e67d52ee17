use anyhow::{Context, Result, anyhow};
use ndarray::Array4;
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;

use crate::{
    config::{InputType, ModelConfig},
    error::PipelineError,
    model_download::ensure_model_ready,
};

use super::{
    model::{ModelLoader, PoseModel},
    preprocess::ModelInput,
};

/// Loads a single-pose keypoint model (MoveNet layout: `[1, S, S, 3]` input,
/// `[1, 1, 17, 3]` output) through ONNX Runtime.
#[derive(Clone, Debug)]
pub struct OrtModelLoader {
    config: ModelConfig,
}

impl OrtModelLoader {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }

    fn load_session(&self) -> Result<Session> {
        let path = &self.config.path;
        ensure_model_ready(path, self.config.url.as_deref(), |_evt| {})?;

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(self.config.intra_threads.max(1))?
            .commit_from_file(path)
            .with_context(|| format!("failed to load ORT session from {}", path.display()))?;
        Ok(session)
    }
}

impl ModelLoader for OrtModelLoader {
    fn load(&self) -> Result<Box<dyn PoseModel>, PipelineError> {
        let session = self
            .load_session()
            .map_err(|err| PipelineError::model_load(&err))?;
        log::info!(
            "pose model session ready using {} ({:?} input)",
            self.config.path.display(),
            self.config.input_type
        );
        Ok(Box::new(MoveNetModel {
            session,
            input_type: self.config.input_type,
        }))
    }

    fn describe(&self) -> String {
        format!("pose model {}", self.config.path.display())
    }
}

pub struct MoveNetModel {
    session: Session,
    input_type: InputType,
}

impl PoseModel for MoveNetModel {
    fn infer(&mut self, input: &ModelInput) -> Result<Vec<f32>> {
        let side = input.size as usize;
        let shape = (1, side, side, 3);

        let outputs = match self.input_type {
            InputType::Uint8 => {
                let array = Array4::<u8>::from_shape_vec(shape, input.rgb.clone())
                    .map_err(|err| anyhow!("failed to build input tensor: {err}"))?;
                self.session
                    .run(ort::inputs![Tensor::from_array(array)?])
                    .context("failed to run ORT session")?
            }
            InputType::Int32 => {
                let array = Array4::<i32>::from_shape_vec(
                    shape,
                    input.rgb.iter().map(|&v| i32::from(v)).collect(),
                )
                .map_err(|err| anyhow!("failed to build input tensor: {err}"))?;
                self.session
                    .run(ort::inputs![Tensor::from_array(array)?])
                    .context("failed to run ORT session")?
            }
            InputType::Float32 => {
                let array = Array4::<f32>::from_shape_vec(
                    shape,
                    input.rgb.iter().map(|&v| f32::from(v)).collect(),
                )
                .map_err(|err| anyhow!("failed to build input tensor: {err}"))?;
                self.session
                    .run(ort::inputs![Tensor::from_array(array)?])
                    .context("failed to run ORT session")?
            }
        };

        if outputs.len() < 1 {
            return Err(anyhow!("model returned no outputs"));
        }

        let keypoints = outputs[0].try_extract_array::<f32>()?;
        Ok(keypoints.iter().copied().collect())
    }
}
