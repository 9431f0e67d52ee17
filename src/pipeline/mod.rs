pub mod bridge;
#[cfg(feature = "camera-nokhwa")]
pub mod camera;
pub mod decode;
pub mod lifecycle;
pub mod model;
pub mod ort;
pub mod preprocess;
pub mod processor;
pub mod rate_limit;
#[cfg(feature = "camera-nokhwa")]
pub mod rgb_converter;

use std::{sync::Arc, time::Duration};

use crate::{
    config::PipelineConfig,
    error::PipelineError,
    types::{Diagnostics, DisplaySize, Frame, PipelineState, Pose},
};

// Re-exports for convenience
pub use bridge::{DisplaySizeCell, PoseBridge};
pub use lifecycle::{AppState, FrameSource, LifecycleController, StateCell};
pub use model::{ModelHandle, ModelLoader, ModelManager, ModelStatus, PoseModel};
pub use processor::{DropReason, FrameOutcome, FrameProcessor, spawn_frame_worker};
pub use self::ort::OrtModelLoader;

/// The assembled pose pipeline for one hosting screen.
///
/// Owned by the UI thread. Hand [`PosePipeline::processor`] to the frame
/// thread and [`PosePipeline::bridge`] to the render loop.
pub struct PosePipeline {
    config: PipelineConfig,
    state: Arc<StateCell>,
    model: Arc<ModelManager>,
    bridge: Arc<PoseBridge>,
    display: Arc<DisplaySizeCell>,
    processor: Arc<FrameProcessor>,
    controller: LifecycleController,
}

impl PosePipeline {
    pub fn new(config: PipelineConfig, loader: Arc<dyn ModelLoader>) -> Result<Self, PipelineError> {
        config.validate()?;

        let state = Arc::new(StateCell::new());
        let model = Arc::new(ModelManager::new(loader));
        let bridge = Arc::new(PoseBridge::new());
        let display = Arc::new(DisplaySizeCell::new());
        let processor = Arc::new(FrameProcessor::new(
            &config,
            Arc::clone(&state),
            Arc::clone(&model),
            Arc::clone(&bridge),
            Arc::clone(&display),
        ));
        let controller =
            LifecycleController::new(Arc::clone(&state), Arc::clone(&model), Arc::clone(&bridge));

        Ok(Self {
            config,
            state,
            model,
            bridge,
            display,
            processor,
            controller,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn processor(&self) -> Arc<FrameProcessor> {
        Arc::clone(&self.processor)
    }

    pub fn bridge(&self) -> Arc<PoseBridge> {
        Arc::clone(&self.bridge)
    }

    pub fn display_size(&self) -> Arc<DisplaySizeCell> {
        Arc::clone(&self.display)
    }

    pub fn model(&self) -> Arc<ModelManager> {
        Arc::clone(&self.model)
    }

    pub fn controller(&mut self) -> &mut LifecycleController {
        &mut self.controller
    }

    pub fn state(&self) -> PipelineState {
        self.state.get()
    }

    /// Convenience for callers delivering frames on their own thread.
    pub fn process_frame(&self, frame: &Frame) -> FrameOutcome {
        self.processor.process_frame(frame)
    }

    pub fn set_display_size(&self, size: DisplaySize) {
        self.display.set(size);
    }

    pub fn get_latest_poses(&self) -> Arc<Vec<Pose>> {
        self.bridge.read()
    }

    pub fn get_diagnostics(&self) -> Diagnostics {
        let poses = self.bridge.read();
        let stats = self.processor.snapshot();
        Diagnostics {
            model_state: self.state.get(),
            is_active: self.state.is_active(),
            pose_count: poses.len(),
            last_confidence: stats.last_confidence,
            frames_accepted: stats.accepted,
            frames_dropped: stats.dropped,
            frames_faulted: stats.faulted,
        }
    }

    pub fn mount(&mut self) {
        self.controller.mount();
    }

    pub fn unmount(&mut self) {
        self.controller.unmount();
        self.processor.reset_rate_limit();
    }

    pub fn start(&mut self) -> Result<(), PipelineError> {
        self.controller.start()
    }

    pub fn stop(&mut self) {
        self.controller.stop();
    }

    pub fn wait_for_model(&mut self, timeout: Duration) -> bool {
        self.controller.wait_for_model(timeout)
    }
}
