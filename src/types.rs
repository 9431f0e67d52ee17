use std::time::Instant;

/// Pixel layout of a camera frame buffer. All layouts are 8 bits per channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    Rgb,
    Rgba,
    Bgra,
}

impl PixelFormat {
    pub fn channels(&self) -> usize {
        match self {
            PixelFormat::Rgb => 3,
            PixelFormat::Rgba | PixelFormat::Bgra => 4,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub timestamp: Instant,
}

impl Frame {
    pub fn expected_len(&self) -> usize {
        (self.width as usize)
            .saturating_mul(self.height as usize)
            .saturating_mul(self.format.channels())
    }
}

/// The 17 body landmarks in model output order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum KeypointIndex {
    Nose = 0,
    LeftEye = 1,
    RightEye = 2,
    LeftEar = 3,
    RightEar = 4,
    LeftShoulder = 5,
    RightShoulder = 6,
    LeftElbow = 7,
    RightElbow = 8,
    LeftWrist = 9,
    RightWrist = 10,
    LeftHip = 11,
    RightHip = 12,
    LeftKnee = 13,
    RightKnee = 14,
    LeftAnkle = 15,
    RightAnkle = 16,
}

pub const KEYPOINT_COUNT: usize = 17;

pub const KEYPOINT_NAMES: [&str; KEYPOINT_COUNT] = [
    "nose",
    "left_eye",
    "right_eye",
    "left_ear",
    "right_ear",
    "left_shoulder",
    "right_shoulder",
    "left_elbow",
    "right_elbow",
    "left_wrist",
    "right_wrist",
    "left_hip",
    "right_hip",
    "left_knee",
    "right_knee",
    "left_ankle",
    "right_ankle",
];

impl KeypointIndex {
    pub const ALL: [KeypointIndex; KEYPOINT_COUNT] = [
        KeypointIndex::Nose,
        KeypointIndex::LeftEye,
        KeypointIndex::RightEye,
        KeypointIndex::LeftEar,
        KeypointIndex::RightEar,
        KeypointIndex::LeftShoulder,
        KeypointIndex::RightShoulder,
        KeypointIndex::LeftElbow,
        KeypointIndex::RightElbow,
        KeypointIndex::LeftWrist,
        KeypointIndex::RightWrist,
        KeypointIndex::LeftHip,
        KeypointIndex::RightHip,
        KeypointIndex::LeftKnee,
        KeypointIndex::RightKnee,
        KeypointIndex::LeftAnkle,
        KeypointIndex::RightAnkle,
    ];

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn name(&self) -> &'static str {
        KEYPOINT_NAMES[*self as usize]
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, confidence: f32) -> Self {
        Self { x, y, confidence }
    }
}

/// One detected subject. `confidence` is the mean of the keypoint confidences
/// and is fixed at construction.
#[derive(Clone, Debug, PartialEq)]
pub struct Pose {
    keypoints: [Keypoint; KEYPOINT_COUNT],
    confidence: f32,
}

impl Pose {
    pub fn new(keypoints: [Keypoint; KEYPOINT_COUNT]) -> Self {
        let sum: f32 = keypoints.iter().map(|k| k.confidence).sum();
        Self {
            keypoints,
            confidence: sum / KEYPOINT_COUNT as f32,
        }
    }

    pub fn keypoints(&self) -> &[Keypoint; KEYPOINT_COUNT] {
        &self.keypoints
    }

    pub fn get(&self, index: KeypointIndex) -> &Keypoint {
        &self.keypoints[index as usize]
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    Idle = 0,
    ModelLoading = 1,
    Ready = 2,
    Active = 3,
    Error = 4,
}

impl PipelineState {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => PipelineState::ModelLoading,
            2 => PipelineState::Ready,
            3 => PipelineState::Active,
            4 => PipelineState::Error,
            _ => PipelineState::Idle,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::ModelLoading => "loading model",
            PipelineState::Ready => "ready",
            PipelineState::Active => "active",
            PipelineState::Error => "error",
        }
    }
}

/// Render surface size in pixels, as reported by the display layer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DisplaySize {
    pub width: f32,
    pub height: f32,
}

impl DisplaySize {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    pub fn is_usable(&self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.width > 0.0 && self.height > 0.0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Diagnostics {
    pub model_state: PipelineState,
    pub is_active: bool,
    pub pose_count: usize,
    pub last_confidence: Option<f32>,
    pub frames_accepted: u64,
    pub frames_dropped: u64,
    pub frames_faulted: u64,
}
