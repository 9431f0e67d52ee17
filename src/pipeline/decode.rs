use anyhow::{Result, anyhow};

use crate::types::{DisplaySize, KEYPOINT_COUNT, Keypoint, Pose};

/// Decodes the flat model output into normalized keypoints.
///
/// The buffer holds one `(row, column, confidence)` triple per keypoint, all in
/// [0, 1]. Row maps to `y`, column to `x`.
pub fn decode_keypoints(flat: &[f32]) -> Result<[Keypoint; KEYPOINT_COUNT]> {
    if flat.len() < KEYPOINT_COUNT * 3 {
        return Err(anyhow!(
            "unexpected keypoint buffer length: got {}, need {}",
            flat.len(),
            KEYPOINT_COUNT * 3
        ));
    }

    let mut keypoints = [Keypoint::default(); KEYPOINT_COUNT];
    for (slot, chunk) in keypoints.iter_mut().zip(flat.chunks_exact(3)) {
        let [row, col, confidence] = [chunk[0], chunk[1], chunk[2]];
        if !(row.is_finite() && col.is_finite() && confidence.is_finite()) {
            return Err(anyhow!("non-finite value in keypoint output"));
        }
        *slot = Keypoint::new(col, row, confidence.clamp(0.0, 1.0));
    }
    Ok(keypoints)
}

/// Scales normalized keypoints to display pixels. Without a usable display
/// size the normalized coordinates are returned unchanged.
pub fn scale_to_display(
    keypoints: [Keypoint; KEYPOINT_COUNT],
    display: Option<DisplaySize>,
) -> [Keypoint; KEYPOINT_COUNT] {
    let Some(size) = display.filter(DisplaySize::is_usable) else {
        return keypoints;
    };
    keypoints.map(|kp| Keypoint::new(kp.x * size.width, kp.y * size.height, kp.confidence))
}

pub fn decode_pose(flat: &[f32], display: Option<DisplaySize>) -> Result<Pose> {
    let normalized = decode_keypoints(flat)?;
    Ok(Pose::new(scale_to_display(normalized, display)))
}
