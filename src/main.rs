use std::{
    env,
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use crossbeam_channel::{Sender, bounded};
use pose_stream::{
    Frame, PipelineConfig, PipelineError, PosePipeline,
    pipeline::{OrtModelLoader, spawn_frame_worker},
    render::RenderLoop,
};

const DEFAULT_RUN_SECS: u64 = 30;
const MODEL_WAIT: Duration = Duration::from_secs(120);
const STATUS_INTERVAL: Duration = Duration::from_secs(2);

fn main() -> Result<()> {
    env_logger::init();

    // pose-stream [config.toml] [seconds]
    let mut args = env::args().skip(1);
    let config = match args.next() {
        Some(path) if path != "-" => PipelineConfig::load(&path)?,
        _ => PipelineConfig::default(),
    };
    let run_for = match args.next() {
        Some(secs) => Duration::from_secs(
            secs.parse()
                .with_context(|| format!("invalid run duration {secs:?}"))?,
        ),
        None => Duration::from_secs(DEFAULT_RUN_SECS),
    };
    let snapshot_path = env::var_os("POSE_STREAM_SNAPSHOT").map(PathBuf::from);

    let loader = Arc::new(OrtModelLoader::new(config.model.clone()));
    let mut pipeline = PosePipeline::new(config.clone(), loader)?;

    let (frame_tx, frame_rx) = bounded(1);
    let (preview_tx, preview_rx) = bounded(1);

    attach_default_camera(&mut pipeline, frame_tx, preview_tx)?;

    let worker = spawn_frame_worker(pipeline.processor(), frame_rx)
        .context("failed to spawn frame worker")?;
    let render = RenderLoop::spawn(
        &config,
        pipeline.bridge(),
        pipeline.display_size(),
        preview_rx,
    )
    .context("failed to spawn render loop")?;

    if let Err(err) = pipeline.start() {
        log::info!("pipeline not active yet: {err}");
    }
    if !pipeline.wait_for_model(MODEL_WAIT) {
        let diagnostics = pipeline.get_diagnostics();
        log::error!("model did not become ready ({:?})", diagnostics.model_state);
    }
    if let Err(err) = pipeline.start() {
        log::error!("pipeline cannot start: {err}");
    }

    let started = Instant::now();
    while started.elapsed() < run_for {
        thread::sleep(STATUS_INTERVAL);
        if let Some(err) = pipeline.controller().pump() {
            log::error!("{err}");
        }
        let diagnostics = pipeline.get_diagnostics();
        log::info!(
            "state={} poses={} confidence={} accepted={} dropped={} faulted={}",
            diagnostics.model_state.label(),
            diagnostics.pose_count,
            diagnostics
                .last_confidence
                .map(|c| format!("{c:.2}"))
                .unwrap_or_else(|| "-".into()),
            diagnostics.frames_accepted,
            diagnostics.frames_dropped,
            diagnostics.frames_faulted,
        );
    }

    pipeline.stop();
    let diagnostics = pipeline.get_diagnostics();
    // Releases the camera, which closes the frame channel and ends the worker.
    pipeline.unmount();
    let _ = worker.join();
    let summary = render.join();

    if let Some(path) = snapshot_path {
        match summary.save_snapshot(&path) {
            Ok(()) => log::info!("snapshot saved to {}", path.display()),
            Err(err) => log::warn!("{err:#}"),
        }
    }

    println!(
        "frames accepted {}, dropped {}, faulted {}; rendered {} at {:.1} fps",
        diagnostics.frames_accepted,
        diagnostics.frames_dropped,
        diagnostics.frames_faulted,
        summary.frames_rendered,
        summary.last_fps,
    );
    Ok(())
}

#[cfg(feature = "camera-nokhwa")]
fn attach_default_camera(
    pipeline: &mut PosePipeline,
    frame_tx: Sender<Frame>,
    preview_tx: Sender<Frame>,
) -> Result<(), PipelineError> {
    use pose_stream::pipeline::camera;

    let device = camera::default_camera()?;
    let stream = camera::start_camera_stream(&device, frame_tx, preview_tx)?;
    let controller = pipeline.controller();
    controller.attach_camera(Box::new(stream));
    // Opening the device succeeded, so access was granted.
    controller.on_permission_changed(true);
    Ok(())
}

#[cfg(not(feature = "camera-nokhwa"))]
fn attach_default_camera(
    _pipeline: &mut PosePipeline,
    _frame_tx: Sender<Frame>,
    _preview_tx: Sender<Frame>,
) -> Result<(), PipelineError> {
    Err(PipelineError::DeviceUnavailable(
        "built without camera support (enable the camera-nokhwa feature)".into(),
    ))
}
