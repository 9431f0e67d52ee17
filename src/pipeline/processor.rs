use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    thread,
};

use anyhow::{Result, anyhow};
use crossbeam_channel::Receiver;

use crate::{
    config::PipelineConfig,
    error::PipelineError,
    types::{Frame, Pose},
};

use super::{
    bridge::{DisplaySizeCell, PoseBridge},
    decode,
    lifecycle::StateCell,
    model::ModelManager,
    preprocess,
    rate_limit::RateLimiter,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    Inactive,
    Busy,
    RateLimited,
    ModelNotReady,
    /// The pipeline left `Active` while the frame was being inferred.
    Cancelled,
}

impl DropReason {
    pub const COUNT: usize = 5;
}

#[derive(Clone, Debug, PartialEq)]
pub enum FrameOutcome {
    Dropped(DropReason),
    Faulted(PipelineError),
    /// Written to the bridge; holds the number of poses published.
    Published(usize),
}

#[derive(Debug, Default)]
struct ProcessorStats {
    accepted: AtomicU64,
    dropped: AtomicU64,
    dropped_by_reason: [AtomicU64; DropReason::COUNT],
    faulted: AtomicU64,
    published: AtomicU64,
    // f32 bits; NO_CONFIDENCE until the first pose is decoded.
    last_confidence: AtomicU32,
}

const NO_CONFIDENCE: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ProcessorSnapshot {
    pub accepted: u64,
    pub dropped: u64,
    /// Indexed by `DropReason as usize`.
    pub dropped_by_reason: [u64; DropReason::COUNT],
    pub faulted: u64,
    pub published: u64,
    pub last_confidence: Option<f32>,
}

/// Per-frame inference routine. `process_frame` may be called from any
/// thread; at most one call does work at a time and the rest are dropped.
pub struct FrameProcessor {
    state: Arc<StateCell>,
    model: Arc<ModelManager>,
    bridge: Arc<PoseBridge>,
    display: Arc<DisplaySizeCell>,
    limiter: RateLimiter,
    in_flight: AtomicBool,
    input_size: u32,
    publish_threshold: f32,
    stats: ProcessorStats,
}

impl FrameProcessor {
    pub fn new(
        config: &PipelineConfig,
        state: Arc<StateCell>,
        model: Arc<ModelManager>,
        bridge: Arc<PoseBridge>,
        display: Arc<DisplaySizeCell>,
    ) -> Self {
        Self {
            state,
            model,
            bridge,
            display,
            limiter: RateLimiter::new(config.min_frame_interval()),
            in_flight: AtomicBool::new(false),
            input_size: config.input_size,
            publish_threshold: config.publish_threshold,
            stats: ProcessorStats {
                last_confidence: AtomicU32::new(NO_CONFIDENCE),
                ..ProcessorStats::default()
            },
        }
    }

    pub fn process_frame(&self, frame: &Frame) -> FrameOutcome {
        if !self.state.is_active() {
            return self.drop_frame(DropReason::Inactive);
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return self.drop_frame(DropReason::Busy);
        }

        let outcome = self.process_admitted(frame);
        self.in_flight.store(false, Ordering::Release);
        outcome
    }

    fn process_admitted(&self, frame: &Frame) -> FrameOutcome {
        if !self.limiter.try_admit(frame.timestamp) {
            return self.drop_frame(DropReason::RateLimited);
        }
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);

        let pose = match self.infer(frame) {
            Ok(Some(pose)) => pose,
            Ok(None) => return self.drop_frame(DropReason::ModelNotReady),
            Err(err) => {
                log::warn!("pose inference failed: {err:#}");
                self.stats.faulted.fetch_add(1, Ordering::Relaxed);
                return FrameOutcome::Faulted(PipelineError::frame_processing(&err));
            }
        };

        let confidence = pose.confidence();
        let poses = if confidence > self.publish_threshold {
            vec![pose]
        } else {
            Vec::new()
        };
        let count = poses.len();

        // Admission was checked before inference; the state may have changed
        // since. The re-check and the write are one step against transitions.
        if !self.state.publish_if_active(|| self.bridge.write(poses)) {
            log::debug!("pipeline left active during inference, result discarded");
            return self.drop_frame(DropReason::Cancelled);
        }

        self.stats
            .last_confidence
            .store(confidence.to_bits(), Ordering::Relaxed);
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        FrameOutcome::Published(count)
    }

    fn infer(&self, frame: &Frame) -> Result<Option<Pose>> {
        let input = preprocess::prepare_input(frame, self.input_size)?;
        let raw = {
            let Some(mut model) = self.model.get_handle_for_inference() else {
                return Ok(None);
            };
            model.infer(&input)?
        };
        if raw.is_empty() {
            return Err(anyhow!("model returned an empty output"));
        }
        decode::decode_pose(&raw, self.display.get()).map(Some)
    }

    fn drop_frame(&self, reason: DropReason) -> FrameOutcome {
        log::trace!("frame dropped: {reason:?}");
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        self.stats.dropped_by_reason[reason as usize].fetch_add(1, Ordering::Relaxed);
        FrameOutcome::Dropped(reason)
    }

    pub fn snapshot(&self) -> ProcessorSnapshot {
        let bits = self.stats.last_confidence.load(Ordering::Relaxed);
        ProcessorSnapshot {
            accepted: self.stats.accepted.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            dropped_by_reason: std::array::from_fn(|i| {
                self.stats.dropped_by_reason[i].load(Ordering::Relaxed)
            }),
            faulted: self.stats.faulted.load(Ordering::Relaxed),
            published: self.stats.published.load(Ordering::Relaxed),
            last_confidence: (bits != NO_CONFIDENCE).then(|| f32::from_bits(bits)),
        }
    }

    pub fn reset_rate_limit(&self) {
        self.limiter.reset();
    }
}

/// Runs the processor on a dedicated thread fed by a frame channel. Frames
/// that queue up while inference runs are skipped in favour of the newest one.
pub fn spawn_frame_worker(
    processor: Arc<FrameProcessor>,
    frame_rx: Receiver<Frame>,
) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("pose-frame-processor".into())
        .spawn(move || {
            log::info!("frame processor worker started");
            while let Some(frame) = recv_latest_frame(&frame_rx) {
                if let FrameOutcome::Faulted(err) = processor.process_frame(&frame) {
                    log::debug!("frame fault recovered: {err}");
                }
            }
            log::info!("frame processor worker stopped");
        })
}

fn recv_latest_frame(frame_rx: &Receiver<Frame>) -> Option<Frame> {
    let mut frame = frame_rx.recv().ok()?;
    while let Ok(newer) = frame_rx.try_recv() {
        frame = newer;
    }
    Some(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{
        model::{ModelLoader, PoseModel},
        preprocess::ModelInput,
    };
    use crate::types::{KEYPOINT_COUNT, PixelFormat};
    use std::time::{Duration, Instant};

    struct FixedModel(Vec<f32>);

    impl PoseModel for FixedModel {
        fn infer(&mut self, input: &ModelInput) -> anyhow::Result<Vec<f32>> {
            assert_eq!(input.rgb.len(), 192 * 192 * 3);
            if self.0.is_empty() {
                return Err(anyhow!("tensor shape mismatch"));
            }
            Ok(self.0.clone())
        }
    }

    struct FixedLoader(Vec<f32>);

    impl ModelLoader for FixedLoader {
        fn load(&self) -> Result<Box<dyn PoseModel>, PipelineError> {
            Ok(Box::new(FixedModel(self.0.clone())))
        }
    }

    fn output(confidence: f32) -> Vec<f32> {
        (0..KEYPOINT_COUNT).flat_map(|_| [0.5, 0.5, confidence]).collect()
    }

    fn frame(at: Instant) -> Frame {
        Frame {
            data: vec![128; 32 * 24 * 3],
            width: 32,
            height: 24,
            format: PixelFormat::Rgb,
            timestamp: at,
        }
    }

    struct Rig {
        processor: FrameProcessor,
        state: Arc<StateCell>,
        bridge: Arc<PoseBridge>,
    }

    fn rig(raw: Vec<f32>, active: bool) -> Rig {
        let state = Arc::new(StateCell::new());
        let model = Arc::new(ModelManager::new(Arc::new(FixedLoader(raw))));
        model.load_blocking().unwrap();
        if active {
            state.set(crate::types::PipelineState::Active);
        }
        let bridge = Arc::new(PoseBridge::new());
        let processor = FrameProcessor::new(
            &PipelineConfig::default(),
            state.clone(),
            model,
            bridge.clone(),
            Arc::new(DisplaySizeCell::new()),
        );
        Rig {
            processor,
            state,
            bridge,
        }
    }

    #[test]
    fn inactive_pipeline_drops_frames() {
        let rig = rig(output(0.9), false);
        assert_eq!(
            rig.processor.process_frame(&frame(Instant::now())),
            FrameOutcome::Dropped(DropReason::Inactive)
        );
        assert_eq!(rig.bridge.write_count(), 0);
    }

    #[test]
    fn low_confidence_publishes_empty_collection() {
        let rig = rig(output(0.25), true);
        assert_eq!(
            rig.processor.process_frame(&frame(Instant::now())),
            FrameOutcome::Published(0)
        );
        assert!(rig.bridge.read().is_empty());
        assert_eq!(rig.bridge.write_count(), 1);
        assert_eq!(rig.processor.snapshot().last_confidence, Some(0.25));
    }

    // Leaves `Active` while inference runs, like a focus loss would.
    struct LeavingModel(Arc<StateCell>);

    impl PoseModel for LeavingModel {
        fn infer(&mut self, _input: &ModelInput) -> anyhow::Result<Vec<f32>> {
            self.0.set(crate::types::PipelineState::Ready);
            Ok(output(0.9))
        }
    }

    struct LeavingLoader(Arc<StateCell>);

    impl ModelLoader for LeavingLoader {
        fn load(&self) -> Result<Box<dyn PoseModel>, PipelineError> {
            Ok(Box::new(LeavingModel(Arc::clone(&self.0))))
        }
    }

    #[test]
    fn cancelled_cycle_leaves_bridge_and_diagnostics_untouched() {
        let state = Arc::new(StateCell::new());
        let model = Arc::new(ModelManager::new(Arc::new(LeavingLoader(state.clone()))));
        model.load_blocking().unwrap();
        state.set(crate::types::PipelineState::Active);
        let bridge = Arc::new(PoseBridge::new());
        let processor = FrameProcessor::new(
            &PipelineConfig::default(),
            state.clone(),
            model,
            bridge.clone(),
            Arc::new(DisplaySizeCell::new()),
        );

        assert_eq!(
            processor.process_frame(&frame(Instant::now())),
            FrameOutcome::Dropped(DropReason::Cancelled)
        );
        assert_eq!(bridge.write_count(), 0);
        let stats = processor.snapshot();
        assert_eq!(stats.last_confidence, None);
        assert_eq!(stats.published, 0);
        assert_eq!(stats.dropped_by_reason[DropReason::Cancelled as usize], 1);
    }

    #[test]
    fn model_fault_is_contained() {
        let rig = rig(Vec::new(), true);
        let outcome = rig.processor.process_frame(&frame(Instant::now()));
        assert!(matches!(
            outcome,
            FrameOutcome::Faulted(PipelineError::FrameProcessing(_))
        ));
        assert_eq!(rig.bridge.write_count(), 0);
        assert_eq!(rig.state.get(), crate::types::PipelineState::Active);
        assert_eq!(rig.processor.snapshot().faulted, 1);
    }

    #[test]
    fn rate_limit_applies_between_accepted_frames() {
        let rig = rig(output(0.8), true);
        let base = Instant::now();
        assert_eq!(rig.processor.process_frame(&frame(base)), FrameOutcome::Published(1));
        assert_eq!(
            rig.processor
                .process_frame(&frame(base + Duration::from_millis(40))),
            FrameOutcome::Dropped(DropReason::RateLimited)
        );
        assert_eq!(
            rig.processor
                .process_frame(&frame(base + Duration::from_millis(130))),
            FrameOutcome::Published(1)
        );
        let stats = rig.processor.snapshot();
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.dropped_by_reason[DropReason::RateLimited as usize], 1);
    }
}
