use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Instant,
};

use anyhow::{Result, anyhow};
use crossbeam_channel::Sender;
use nokhwa::{
    Camera,
    pixel_format::RgbFormat,
    query,
    utils::{
        ApiBackend, CameraIndex, CameraInfo, FrameFormat, RequestedFormat, RequestedFormatType,
    },
};

use super::{lifecycle::FrameSource, rgb_converter};
use crate::{
    error::PipelineError,
    types::{Frame, PixelFormat},
};

// Formats that decode straight to RGB come first; MJPEG is the last resort.
const PREFERRED_PIXEL_FORMATS: &[FrameFormat] = &[
    FrameFormat::RAWRGB,
    FrameFormat::RAWBGR,
    FrameFormat::YUYV,
    FrameFormat::NV12,
    FrameFormat::GRAY,
    FrameFormat::MJPEG,
];

fn requested_formats() -> [RequestedFormat<'static>; 3] {
    [
        RequestedFormat::with_formats(
            RequestedFormatType::AbsoluteHighestFrameRate,
            PREFERRED_PIXEL_FORMATS,
        ),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestFrameRate),
        RequestedFormat::new::<RgbFormat>(RequestedFormatType::None),
    ]
}

#[derive(Clone, Debug)]
pub struct CameraDevice {
    pub index: CameraIndex,
    pub label: String,
}

/// Capture thread handle. Stopping (or dropping) joins the thread, which
/// closes the device.
#[derive(Debug)]
pub struct CameraStream {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CameraStream {
    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl FrameSource for CameraStream {
    fn stop(mut self: Box<Self>) {
        self.shutdown();
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub fn available_cameras() -> Result<Vec<CameraDevice>> {
    let cameras = query(ApiBackend::Auto)?;
    Ok(cameras
        .into_iter()
        .map(|info| CameraDevice {
            index: info.index().clone(),
            label: format_camera_label(&info),
        })
        .collect())
}

fn format_camera_label(info: &CameraInfo) -> String {
    info.human_name()
}

/// First camera on the system, or `DeviceUnavailable`.
pub fn default_camera() -> Result<CameraDevice, PipelineError> {
    let cameras =
        available_cameras().map_err(|err| PipelineError::DeviceUnavailable(format!("{err:#}")))?;
    cameras
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::DeviceUnavailable("no camera found".into()))
}

fn build_camera(index: CameraIndex) -> Result<Camera> {
    let mut last_err = None;

    for requested in requested_formats() {
        match Camera::new(index.clone(), requested) {
            Ok(mut camera) => match camera.open_stream() {
                Ok(()) => return Ok(camera),
                Err(err) => last_err = Some(err.into()),
            },
            Err(err) => last_err = Some(err.into()),
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("failed to open camera with any supported format")))
}

/// Starts capturing on its own thread. Every frame goes to `frame_tx` for
/// inference and `preview_tx` for display; each is skipped when its consumer
/// is still busy with the previous one.
pub fn start_camera_stream(
    device: &CameraDevice,
    frame_tx: Sender<Frame>,
    preview_tx: Sender<Frame>,
) -> Result<CameraStream, PipelineError> {
    // Fail fast before spawning the capture thread.
    build_camera(device.index.clone())
        .map_err(|err| PipelineError::DeviceUnavailable(format!("{}: {err:#}", device.label)))?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let index = device.index.clone();
    log::info!("starting camera {}", device.label);

    let handle = thread::Builder::new()
        .name("pose-camera".into())
        .spawn(move || {
            let mut camera = match build_camera(index) {
                Ok(cam) => cam,
                Err(err) => {
                    log::error!("failed to open camera: {err:?}");
                    return;
                }
            };

            while !stop_flag.load(Ordering::Relaxed) {
                let read_start = Instant::now();
                let buffer = match camera.frame() {
                    Ok(buffer) => buffer,
                    Err(err) => {
                        log::warn!(
                            "camera frame read failed (after {:?}): {err:?}",
                            read_start.elapsed()
                        );
                        continue;
                    }
                };

                let converted = match rgb_converter::convert_camera_frame(&buffer) {
                    Ok(rgb) => rgb,
                    Err(err) => {
                        log::warn!("failed to decode camera frame {err:?}");
                        continue;
                    }
                };

                let frame = Frame {
                    data: converted.rgb,
                    width: converted.width,
                    height: converted.height,
                    format: PixelFormat::Rgb,
                    timestamp: Instant::now(),
                };

                let _ = preview_tx.try_send(frame.clone());
                let _ = frame_tx.try_send(frame);
            }

            if let Err(err) = camera.stop_stream() {
                log::warn!("failed to stop camera stream: {err:?}");
            }
        })
        .map_err(|err| PipelineError::DeviceUnavailable(format!("failed to spawn capture thread: {err}")))?;

    Ok(CameraStream {
        stop,
        handle: Some(handle),
    })
}
