use std::{
    fs,
    io::{Read, Write},
    path::Path,
    time::Duration,
};

use anyhow::{Context, anyhow};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelFetchEvent {
    AlreadyPresent,
    Started { total: Option<u64> },
    Progress { downloaded: u64, total: Option<u64> },
    Finished,
}

/// Makes sure the model artifact exists at `model_path`, downloading it from
/// `url` when it is missing.
pub fn ensure_model_ready<F>(model_path: &Path, url: Option<&str>, mut on_event: F) -> anyhow::Result<()>
where
    F: FnMut(ModelFetchEvent),
{
    if model_path.exists() {
        on_event(ModelFetchEvent::AlreadyPresent);
        on_event(ModelFetchEvent::Finished);
        return Ok(());
    }

    let Some(url) = url else {
        return Err(anyhow!(
            "model not found at {} and no download url configured",
            model_path.display()
        ));
    };

    if let Some(parent) = model_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create model directory {}", parent.display()))?;
    }

    let mut progress: Option<ProgressBar> = None;
    download_to_path(url, model_path, &mut |event| {
        match &event {
            ModelFetchEvent::Started { total } => {
                progress = Some(create_progress_bar(*total));
            }
            ModelFetchEvent::Progress { downloaded, .. } => {
                if let Some(pb) = progress.as_ref() {
                    pb.set_position(*downloaded);
                }
            }
            ModelFetchEvent::Finished => {
                if let Some(pb) = progress.take() {
                    pb.finish_with_message("pose model ready");
                }
            }
            ModelFetchEvent::AlreadyPresent => {}
        }
        on_event(event);
    })
    .with_context(|| format!("failed to download pose model to {}", model_path.display()))
}

fn download_to_path<F>(url: &str, dest: &Path, on_event: &mut F) -> anyhow::Result<()>
where
    F: FnMut(ModelFetchEvent),
{
    log::info!("downloading pose model from {url} to {}", dest.display());

    let client = Client::new();
    let mut response = client
        .get(url)
        .send()
        .context("failed to start model download")?
        .error_for_status()
        .context("model download returned error status")?;

    let total = response.content_length();
    on_event(ModelFetchEvent::Started { total });
    save_stream(&mut response, total, dest, on_event)?;
    on_event(ModelFetchEvent::Finished);
    Ok(())
}

/// Copies `reader` into a temp file next to `dest` and renames it into place.
/// The temp file is removed when anything fails.
fn save_stream<R, F>(reader: &mut R, total: Option<u64>, dest: &Path, on_event: &mut F) -> anyhow::Result<()>
where
    R: Read,
    F: FnMut(ModelFetchEvent),
{
    let tmp_path = dest.with_extension("download");
    let result = copy_to_temp(reader, total, &tmp_path, on_event).and_then(|()| {
        fs::rename(&tmp_path, dest).with_context(|| {
            format!(
                "failed to move temp model {} into place at {}",
                tmp_path.display(),
                dest.display()
            )
        })
    });
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

fn copy_to_temp<R, F>(reader: &mut R, total: Option<u64>, tmp_path: &Path, on_event: &mut F) -> anyhow::Result<()>
where
    R: Read,
    F: FnMut(ModelFetchEvent),
{
    let mut file = fs::File::create(tmp_path)
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    let mut downloaded: u64 = 0;
    let mut buffer = [0u8; 16 * 1024];
    loop {
        let bytes_read = reader
            .read(&mut buffer)
            .context("failed while reading model bytes")?;
        if bytes_read == 0 {
            break;
        }

        file.write_all(&buffer[..bytes_read])
            .context("failed while writing model to disk")?;
        downloaded += bytes_read as u64;
        on_event(ModelFetchEvent::Progress { downloaded, total });
    }

    file.sync_all()
        .context("failed to flush downloaded model to disk")
}

fn create_progress_bar(total: Option<u64>) -> ProgressBar {
    match total {
        Some(total) if total > 0 => {
            let pb = ProgressBar::new(total);
            if let Ok(style) = ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})",
            ) {
                pb.set_style(style.progress_chars("=>-"));
            }
            pb
        }
        _ => {
            let pb = ProgressBar::new_spinner();
            if let Ok(style) = ProgressStyle::with_template("{spinner:.green} downloading pose model") {
                pb.set_style(style);
            }
            pb.enable_steady_tick(Duration::from_millis(100));
            pb
        }
    }
}
