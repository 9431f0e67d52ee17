use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use arc_swap::ArcSwap;

use crate::types::{DisplaySize, Pose};

/// Latest published poses. Single slot, last write wins: the frame processor
/// overwrites it and render code reads it at its own cadence.
pub struct PoseBridge {
    slot: ArcSwap<Vec<Pose>>,
    writes: AtomicU64,
}

impl PoseBridge {
    pub fn new() -> Self {
        Self {
            slot: ArcSwap::from_pointee(Vec::new()),
            writes: AtomicU64::new(0),
        }
    }

    /// Replaces the current value. Never blocks the writer.
    ///
    /// The frame processor is the only writer while the pipeline is active.
    /// The one exception is the lifecycle controller clearing the slot on
    /// unmount, after admission and publication are closed, so the two never
    /// race.
    pub fn write(&self, poses: Vec<Pose>) {
        self.slot.store(Arc::new(poses));
        self.writes.fetch_add(1, Ordering::Release);
    }

    /// Most recent value, or an empty collection before the first write.
    pub fn read(&self) -> Arc<Vec<Pose>> {
        self.slot.load_full()
    }

    /// Number of writes since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Acquire)
    }
}

impl Default for PoseBridge {
    fn default() -> Self {
        Self::new()
    }
}

const UNSET: u64 = 0;

/// Most recently reported render surface size, packed as two `f32` bit
/// patterns in one atomic word so width and height always change together.
#[derive(Debug, Default)]
pub struct DisplaySizeCell {
    packed: AtomicU64,
}

impl DisplaySizeCell {
    pub fn new() -> Self {
        Self {
            packed: AtomicU64::new(UNSET),
        }
    }

    pub fn set(&self, size: DisplaySize) {
        let packed = (u64::from(size.width.to_bits()) << 32) | u64::from(size.height.to_bits());
        self.packed.store(packed, Ordering::Release);
    }

    pub fn clear(&self) {
        self.packed.store(UNSET, Ordering::Release);
    }

    /// `None` until a usable size has been reported.
    pub fn get(&self) -> Option<DisplaySize> {
        let packed = self.packed.load(Ordering::Acquire);
        if packed == UNSET {
            return None;
        }
        let size = DisplaySize::new(
            f32::from_bits((packed >> 32) as u32),
            f32::from_bits(packed as u32),
        );
        size.is_usable().then_some(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KEYPOINT_COUNT, Keypoint};
    use std::thread;

    fn pose_with(confidence: f32) -> Pose {
        Pose::new([Keypoint::new(1.0, 2.0, confidence); KEYPOINT_COUNT])
    }

    #[test]
    fn empty_before_first_write() {
        let bridge = PoseBridge::new();
        assert!(bridge.read().is_empty());
        assert_eq!(bridge.write_count(), 0);
    }

    #[test]
    fn read_returns_last_write() {
        let bridge = PoseBridge::new();
        for i in 1..=10 {
            bridge.write(vec![pose_with(i as f32 / 10.0)]);
        }
        let latest = bridge.read();
        assert_eq!(latest.len(), 1);
        assert!((latest[0].confidence() - 1.0).abs() < 1e-6);
        assert_eq!(bridge.write_count(), 10);
    }

    #[test]
    fn reader_keeps_its_snapshot_across_writes() {
        let bridge = PoseBridge::new();
        bridge.write(vec![pose_with(0.4)]);
        let snapshot = bridge.read();
        bridge.write(Vec::new());
        assert_eq!(snapshot.len(), 1);
        assert!(bridge.read().is_empty());
    }

    #[test]
    fn concurrent_reader_never_sees_older_value_after_newer() {
        let bridge = Arc::new(PoseBridge::new());
        let writer = {
            let bridge = Arc::clone(&bridge);
            thread::spawn(move || {
                for i in 1..=500u32 {
                    bridge.write(vec![pose_with(i as f32 / 500.0)]);
                }
            })
        };

        let mut last_seen = 0.0f32;
        for _ in 0..2_000 {
            if let Some(pose) = bridge.read().first() {
                assert!(pose.confidence() >= last_seen);
                last_seen = pose.confidence();
            }
        }
        writer.join().unwrap();
        assert!((bridge.read()[0].confidence() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn display_size_cell_reports_latest_usable_size() {
        let cell = DisplaySizeCell::new();
        assert_eq!(cell.get(), None);
        cell.set(DisplaySize::new(1280.0, 720.0));
        assert_eq!(cell.get(), Some(DisplaySize::new(1280.0, 720.0)));
        cell.set(DisplaySize::new(720.0, 1280.0));
        assert_eq!(cell.get(), Some(DisplaySize::new(720.0, 1280.0)));
        cell.set(DisplaySize::new(0.0, 1280.0));
        assert_eq!(cell.get(), None);
        cell.clear();
        assert_eq!(cell.get(), None);
    }
}
