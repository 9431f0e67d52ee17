use thiserror::Error;

/// Faults surfaced by the pose pipeline.
///
/// `FrameProcessing` never leaves the frame processor: it is logged and the
/// frame is dropped. The other variants reach the hosting screen.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("frame processing failed: {0}")]
    FrameProcessing(String),
    #[error("camera device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn model_load(err: &anyhow::Error) -> Self {
        PipelineError::ModelLoad(format!("{err:#}"))
    }

    pub fn frame_processing(err: &anyhow::Error) -> Self {
        PipelineError::FrameProcessing(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, anyhow};

    #[test]
    fn model_load_keeps_context_chain() {
        let err = Err::<(), _>(anyhow!("connection reset"))
            .context("failed to download model")
            .unwrap_err();
        let mapped = PipelineError::model_load(&err);
        assert_eq!(
            mapped,
            PipelineError::ModelLoad("failed to download model: connection reset".into())
        );
        assert_eq!(
            mapped.to_string(),
            "model load failed: failed to download model: connection reset"
        );
    }
}
