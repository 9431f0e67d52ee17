use std::{
    collections::VecDeque,
    fmt,
    time::{Duration, Instant},
};

use crate::types::{KeypointIndex, Pose};

const FPS_WINDOW: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfidenceBand {
    Good,
    Marginal,
    Poor,
}

impl ConfidenceBand {
    pub fn classify(confidence: f32, good: f32, marginal: f32) -> Self {
        if confidence > good {
            ConfidenceBand::Good
        } else if confidence > marginal {
            ConfidenceBand::Marginal
        } else {
            ConfidenceBand::Poor
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConfidenceBand::Good => "good",
            ConfidenceBand::Marginal => "marginal",
            ConfidenceBand::Poor => "poor",
        }
    }

    pub fn color(&self) -> [u8; 3] {
        match self {
            ConfidenceBand::Good => [34, 197, 94],
            ConfidenceBand::Marginal => [234, 179, 8],
            ConfidenceBand::Poor => [239, 68, 68],
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DebugRow {
    pub keypoint: KeypointIndex,
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
    pub band: ConfidenceBand,
}

impl fmt::Display for DebugRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<15} x={:>8.1} y={:>8.1} conf={:.2} [{}]",
            self.keypoint.name(),
            self.x,
            self.y,
            self.confidence,
            self.band.label()
        )
    }
}

/// Every keypoint of `pose` with its raw coordinates and confidence band.
pub fn debug_listing(pose: &Pose, good: f32, marginal: f32) -> Vec<DebugRow> {
    KeypointIndex::ALL
        .iter()
        .map(|&keypoint| {
            let kp = pose.get(keypoint);
            DebugRow {
                keypoint,
                x: kp.x,
                y: kp.y,
                confidence: kp.confidence,
                band: ConfidenceBand::classify(kp.confidence, good, marginal),
            }
        })
        .collect()
}

/// Frames per second over a trailing one-second window.
#[derive(Debug, Default)]
pub struct FpsCounter {
    ticks: VecDeque<Instant>,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&mut self, now: Instant) {
        self.ticks.push_back(now);
        self.trim(now);
    }

    pub fn fps(&mut self, now: Instant) -> f32 {
        self.trim(now);
        self.ticks.len() as f32 / FPS_WINDOW.as_secs_f32()
    }

    fn trim(&mut self, now: Instant) {
        while let Some(&oldest) = self.ticks.front() {
            if now.saturating_duration_since(oldest) >= FPS_WINDOW {
                self.ticks.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KEYPOINT_COUNT, Keypoint};

    #[test]
    fn bands_use_exclusive_lower_bounds() {
        assert_eq!(ConfidenceBand::classify(0.9, 0.7, 0.4), ConfidenceBand::Good);
        assert_eq!(ConfidenceBand::classify(0.7, 0.7, 0.4), ConfidenceBand::Marginal);
        assert_eq!(ConfidenceBand::classify(0.41, 0.7, 0.4), ConfidenceBand::Marginal);
        assert_eq!(ConfidenceBand::classify(0.4, 0.7, 0.4), ConfidenceBand::Poor);
    }

    #[test]
    fn listing_covers_every_keypoint_in_order() {
        let mut keypoints = [Keypoint::new(1.0, 2.0, 0.5); KEYPOINT_COUNT];
        keypoints[0] = Keypoint::new(120.0, 40.0, 0.9);
        let rows = debug_listing(&Pose::new(keypoints), 0.7, 0.4);
        assert_eq!(rows.len(), KEYPOINT_COUNT);
        assert_eq!(rows[0].keypoint, KeypointIndex::Nose);
        assert_eq!(rows[0].band, ConfidenceBand::Good);
        assert_eq!((rows[0].x, rows[0].y), (120.0, 40.0));
        assert_eq!(rows[16].keypoint, KeypointIndex::RightAnkle);
        assert!(rows[0].to_string().starts_with("nose"));
    }

    #[test]
    fn fps_counts_ticks_in_trailing_window() {
        let mut counter = FpsCounter::new();
        let base = Instant::now();
        for i in 0..60 {
            counter.tick(base + Duration::from_millis(i * 16));
        }
        assert_eq!(counter.fps(base + Duration::from_millis(959)), 60.0);
        // Ticks older than one second fall out.
        assert_eq!(counter.fps(base + Duration::from_millis(1_500)), 29.0);
        assert_eq!(counter.fps(base + Duration::from_secs(5)), 0.0);
    }
}
