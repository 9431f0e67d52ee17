//! Real-time single-person pose estimation from a camera stream.
//!
//! Frames are admitted by [`pipeline::FrameProcessor`], inferred with a
//! keypoint model, and published through [`pipeline::PoseBridge`] for a
//! display-rate consumer such as [`render::RenderLoop`].

pub mod config;
pub mod error;
pub mod model_download;
pub mod pipeline;
pub mod render;
pub mod types;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use pipeline::PosePipeline;
pub use types::{DisplaySize, Frame, Keypoint, KeypointIndex, PipelineState, PixelFormat, Pose};
