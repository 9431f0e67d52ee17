pub mod debug;
pub mod skeleton;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::Receiver;
use image::RgbImage;

use crate::{
    config::PipelineConfig,
    pipeline::{DisplaySizeCell, PoseBridge},
    types::{DisplaySize, Frame, PixelFormat},
};

pub use debug::{ConfidenceBand, DebugRow, FpsCounter, debug_listing};
pub use skeleton::{Canvas, SKELETON_CONNECTIONS, Segment, draw_pose, visible_segments};

const LISTING_INTERVAL: Duration = Duration::from_secs(1);

/// What the render loop leaves behind once it is joined.
#[derive(Debug, Default)]
pub struct RenderSummary {
    pub frames_rendered: u64,
    pub segments_drawn: u64,
    pub last_fps: f32,
    pub last_composite: Option<RgbImage>,
}

impl RenderSummary {
    pub fn save_snapshot(&self, path: &std::path::Path) -> Result<()> {
        let image = self
            .last_composite
            .as_ref()
            .ok_or_else(|| anyhow!("no frame was rendered"))?;
        image
            .save(path)
            .with_context(|| format!("failed to save snapshot {}", path.display()))
    }
}

struct OverlaySettings {
    display_threshold: f32,
    good_band: f32,
    marginal_band: f32,
    interval: Duration,
}

/// Display-rate consumer of the pose bridge.
///
/// Each tick takes the newest preview frame, reports its size as the display
/// size, and composites whatever poses the bridge currently holds on top of
/// it. The loop never blocks on the frame processor.
pub struct RenderLoop {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<RenderSummary>>,
}

impl RenderLoop {
    pub fn spawn(
        config: &PipelineConfig,
        bridge: Arc<PoseBridge>,
        display: Arc<DisplaySizeCell>,
        preview_rx: Receiver<Frame>,
    ) -> std::io::Result<Self> {
        let settings = OverlaySettings {
            display_threshold: config.display_threshold,
            good_band: config.good_band,
            marginal_band: config.marginal_band,
            interval: config.render_interval(),
        };
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();

        let handle = thread::Builder::new()
            .name("pose-render".into())
            .spawn(move || run(settings, bridge, display, preview_rx, stop_flag))?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stops the loop and returns what it rendered.
    pub fn join(mut self) -> RenderSummary {
        self.stop.store(true, Ordering::SeqCst);
        self.handle
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    }
}

impl Drop for RenderLoop {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    settings: OverlaySettings,
    bridge: Arc<PoseBridge>,
    display: Arc<DisplaySizeCell>,
    preview_rx: Receiver<Frame>,
    stop: Arc<AtomicBool>,
) -> RenderSummary {
    let mut summary = RenderSummary::default();
    let mut fps = FpsCounter::new();
    let mut current: Option<RgbImage> = None;
    let mut last_listing = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        let tick_start = Instant::now();

        if let Some(frame) = drain_latest(&preview_rx) {
            match frame_to_rgb(&frame) {
                Some(image) => {
                    display.set(DisplaySize::new(image.width() as f32, image.height() as f32));
                    current = Some(image);
                }
                None => log::warn!(
                    "preview frame {}x{} has a short buffer",
                    frame.width,
                    frame.height
                ),
            }
        }

        let poses = bridge.read();
        if let Some(base) = current.as_ref() {
            let mut composite = base.clone();
            let (width, height) = composite.dimensions();
            if let Some(mut canvas) = Canvas::new(&mut composite, width, height, 3) {
                for pose in poses.iter() {
                    summary.segments_drawn +=
                        draw_pose(&mut canvas, pose, settings.display_threshold) as u64;
                }
            }
            summary.last_composite = Some(composite);
            summary.frames_rendered += 1;
            fps.tick(Instant::now());
        }

        if last_listing.elapsed() >= LISTING_INTERVAL {
            last_listing = Instant::now();
            summary.last_fps = fps.fps(last_listing);
            log::debug!("render fps {:.1}, {} pose(s)", summary.last_fps, poses.len());
            if log::log_enabled!(log::Level::Trace) {
                for pose in poses.iter() {
                    log::trace!("pose confidence {:.2}", pose.confidence());
                    for row in debug_listing(pose, settings.good_band, settings.marginal_band) {
                        log::trace!("  {row}");
                    }
                }
            }
        }

        if let Some(remaining) = settings.interval.checked_sub(tick_start.elapsed()) {
            thread::sleep(remaining);
        }
    }

    summary.last_fps = fps.fps(Instant::now());
    summary
}

fn drain_latest(rx: &Receiver<Frame>) -> Option<Frame> {
    let mut latest = None;
    while let Ok(frame) = rx.try_recv() {
        latest = Some(frame);
    }
    latest
}

/// Copies a preview frame into an RGB image, dropping alpha and undoing BGRA
/// ordering. `None` when the buffer is shorter than its dimensions imply.
pub fn frame_to_rgb(frame: &Frame) -> Option<RgbImage> {
    if frame.data.len() < frame.expected_len() {
        return None;
    }
    let pixels = frame.width as usize * frame.height as usize;
    let rgb = match frame.format {
        PixelFormat::Rgb => frame.data[..pixels * 3].to_vec(),
        PixelFormat::Rgba => frame
            .data
            .chunks_exact(4)
            .take(pixels)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect(),
        PixelFormat::Bgra => frame
            .data
            .chunks_exact(4)
            .take(pixels)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect(),
    };
    RgbImage::from_raw(frame.width, frame.height, rgb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KEYPOINT_COUNT, Keypoint, Pose};
    use crossbeam_channel::bounded;

    fn frame(format: PixelFormat, data: Vec<u8>, width: u32, height: u32) -> Frame {
        Frame {
            data,
            width,
            height,
            format,
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn bgra_preview_is_reordered() {
        let image = frame_to_rgb(&frame(PixelFormat::Bgra, vec![1, 2, 3, 255], 1, 1)).unwrap();
        assert_eq!(image.as_raw(), &vec![3, 2, 1]);
        assert!(frame_to_rgb(&frame(PixelFormat::Rgb, vec![0; 5], 2, 1)).is_none());
    }

    #[test]
    fn loop_reports_display_size_and_draws_published_pose() {
        let mut config = PipelineConfig::default();
        config.render_fps = 200;
        let bridge = Arc::new(PoseBridge::new());
        let display = Arc::new(DisplaySizeCell::new());
        let (tx, rx) = bounded(1);

        let mut keypoints = [Keypoint::new(8.0, 8.0, 0.9); KEYPOINT_COUNT];
        keypoints[0] = Keypoint::new(2.0, 2.0, 0.9);
        bridge.write(vec![Pose::new(keypoints)]);

        let render = RenderLoop::spawn(&config, bridge, display.clone(), rx).unwrap();
        tx.send(frame(PixelFormat::Rgb, vec![0; 32 * 24 * 3], 32, 24))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while display.get().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        thread::sleep(Duration::from_millis(50));
        let summary = render.join();

        assert_eq!(display.get(), Some(DisplaySize::new(32.0, 24.0)));
        assert!(summary.frames_rendered > 0);
        assert!(summary.segments_drawn > 0);
        let composite = summary.last_composite.unwrap();
        assert!(composite.pixels().any(|px| px.0 != [0, 0, 0]));
    }
}
