use crate::types::{Keypoint, KeypointIndex, Pose};

/// Keypoint pairs drawn as limb segments.
pub const SKELETON_CONNECTIONS: [(KeypointIndex, KeypointIndex); 16] = [
    // face
    (KeypointIndex::LeftEar, KeypointIndex::LeftEye),
    (KeypointIndex::LeftEye, KeypointIndex::Nose),
    (KeypointIndex::Nose, KeypointIndex::RightEye),
    (KeypointIndex::RightEye, KeypointIndex::RightEar),
    // arms
    (KeypointIndex::LeftShoulder, KeypointIndex::RightShoulder),
    (KeypointIndex::LeftShoulder, KeypointIndex::LeftElbow),
    (KeypointIndex::LeftElbow, KeypointIndex::LeftWrist),
    (KeypointIndex::RightShoulder, KeypointIndex::RightElbow),
    (KeypointIndex::RightElbow, KeypointIndex::RightWrist),
    // torso
    (KeypointIndex::LeftShoulder, KeypointIndex::LeftHip),
    (KeypointIndex::RightShoulder, KeypointIndex::RightHip),
    (KeypointIndex::LeftHip, KeypointIndex::RightHip),
    // legs
    (KeypointIndex::LeftHip, KeypointIndex::LeftKnee),
    (KeypointIndex::LeftKnee, KeypointIndex::LeftAnkle),
    (KeypointIndex::RightHip, KeypointIndex::RightKnee),
    (KeypointIndex::RightKnee, KeypointIndex::RightAnkle),
];

pub const SKELETON_LINE_THICKNESS: i32 = 3;
const LINE_COLOR: [u8; 3] = [56, 189, 248];
const POINT_COLOR: [u8; 3] = [248, 113, 113];
const POINT_RADIUS: i32 = 4;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Segment {
    pub from: KeypointIndex,
    pub to: KeypointIndex,
    pub start: (f32, f32),
    pub end: (f32, f32),
}

fn visible(kp: &Keypoint, threshold: f32) -> bool {
    kp.confidence > threshold
}

/// Connections whose endpoints both clear the per-joint display threshold.
pub fn visible_segments(pose: &Pose, threshold: f32) -> Vec<Segment> {
    SKELETON_CONNECTIONS
        .iter()
        .filter_map(|&(from, to)| {
            let (a, b) = (pose.get(from), pose.get(to));
            (visible(a, threshold) && visible(b, threshold)).then(|| Segment {
                from,
                to,
                start: (a.x, a.y),
                end: (b.x, b.y),
            })
        })
        .collect()
}

/// Mutable view over an interleaved 8-bit pixel buffer (RGB or RGBA).
pub struct Canvas<'a> {
    buffer: &'a mut [u8],
    width: u32,
    height: u32,
    channels: usize,
}

impl<'a> Canvas<'a> {
    pub fn new(buffer: &'a mut [u8], width: u32, height: u32, channels: usize) -> Option<Self> {
        let expected = (width as usize) * (height as usize) * channels;
        if !(3..=4).contains(&channels) || buffer.len() < expected {
            return None;
        }
        Some(Self {
            buffer,
            width,
            height,
            channels,
        })
    }

    fn put_pixel(&mut self, x: i32, y: i32, color: [u8; 3]) {
        if x < 0 || y < 0 {
            return;
        }
        let (ux, uy) = (x as u32, y as u32);
        if ux >= self.width || uy >= self.height {
            return;
        }
        let idx = ((uy * self.width + ux) as usize) * self.channels;
        self.buffer[idx..idx + 3].copy_from_slice(&color);
    }

    fn draw_line(&mut self, p0: (f32, f32), p1: (f32, f32), color: [u8; 3], thickness: i32) {
        let (mut x0, mut y0) = (p0.0 as i32, p0.1 as i32);
        let (x1, y1) = (p1.0 as i32, p1.1 as i32);
        let dx = (x1 - x0).abs();
        let sx = if x0 < x1 { 1 } else { -1 };
        let dy = -(y1 - y0).abs();
        let sy = if y0 < y1 { 1 } else { -1 };
        let mut err = dx + dy;
        let radius = (thickness.max(1) - 1) / 2;

        loop {
            for ox in -radius..=radius {
                for oy in -radius..=radius {
                    if ox.abs() + oy.abs() <= radius {
                        self.put_pixel(x0 + ox, y0 + oy, color);
                    }
                }
            }
            if x0 == x1 && y0 == y1 {
                break;
            }
            let e2 = 2 * err;
            if e2 >= dy {
                err += dy;
                x0 += sx;
            }
            if e2 <= dx {
                err += dx;
                y0 += sy;
            }
        }
    }

    fn draw_circle(&mut self, center: (i32, i32), radius: i32, color: [u8; 3]) {
        let (cx, cy) = center;
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                if dx * dx + dy * dy <= radius * radius {
                    self.put_pixel(cx + dx, cy + dy, color);
                }
            }
        }
    }
}

/// Draws the visible limbs and joints of `pose`. Coordinates must already be
/// in the canvas' pixel space. Returns the number of segments drawn.
pub fn draw_pose(canvas: &mut Canvas<'_>, pose: &Pose, threshold: f32) -> usize {
    let segments = visible_segments(pose, threshold);
    for segment in &segments {
        canvas.draw_line(segment.start, segment.end, LINE_COLOR, SKELETON_LINE_THICKNESS);
    }
    for kp in pose.keypoints().iter().filter(|kp| visible(kp, threshold)) {
        canvas.draw_circle((kp.x as i32, kp.y as i32), POINT_RADIUS, POINT_COLOR);
    }
    segments.len()
}
