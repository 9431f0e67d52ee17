use anyhow::{Context, Result, anyhow};
use fast_image_resize as fir;
use rayon::prelude::*;

use crate::types::{Frame, PixelFormat};

/// Square, interleaved 8-bit RGB image at the model's input geometry.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelInput {
    pub rgb: Vec<u8>,
    pub size: u32,
}

impl ModelInput {
    pub fn empty(size: u32) -> Self {
        Self {
            rgb: vec![0u8; (size as usize) * (size as usize) * 3],
            size,
        }
    }
}

/// Stretches the whole frame to `size`×`size` and drops alpha. The frame is
/// not letterboxed, so normalized model coordinates stay relative to the full
/// frame.
pub fn prepare_input(frame: &Frame, size: u32) -> Result<ModelInput> {
    if frame.width == 0 || frame.height == 0 {
        return Err(anyhow!("empty frame {}x{}", frame.width, frame.height));
    }
    if size == 0 {
        return Err(anyhow!("model input size must be positive"));
    }
    let expected_len = frame.expected_len();
    if frame.data.len() != expected_len {
        return Err(anyhow!(
            "frame buffer size mismatch: got {}, expected {}",
            frame.data.len(),
            expected_len
        ));
    }

    let pixel_type = match frame.format {
        PixelFormat::Rgb => fir::PixelType::U8x3,
        PixelFormat::Rgba | PixelFormat::Bgra => fir::PixelType::U8x4,
    };

    let src_image =
        fir::images::Image::from_vec_u8(frame.width, frame.height, frame.data.clone(), pixel_type)
            .context("failed to wrap camera frame")?;
    let mut dst_image = fir::images::Image::new(size, size, pixel_type);
    let mut resizer = fir::Resizer::new();
    let resize_options = fir::ResizeOptions::new()
        .resize_alg(fir::ResizeAlg::Interpolation(fir::FilterType::Bilinear));
    resizer
        .resize(&src_image, &mut dst_image, Some(&resize_options))
        .context("fast resize failed")?;
    let resized = dst_image.into_vec();

    let rgb = match frame.format {
        PixelFormat::Rgb => resized,
        PixelFormat::Rgba => resized
            .par_chunks_exact(4)
            .flat_map_iter(|px| [px[0], px[1], px[2]])
            .collect(),
        PixelFormat::Bgra => resized
            .par_chunks_exact(4)
            .flat_map_iter(|px| [px[2], px[1], px[0]])
            .collect(),
    };

    Ok(ModelInput { rgb, size })
}
