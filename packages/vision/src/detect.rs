//! Corner detection and binary patch descriptors.
//!
//! Detection is segment-test based (FAST-style, 16-pixel Bresenham circle,
//! contiguous arc of 9), followed by score-ordered non-maximum suppression.
//! Descriptors are 256-bit binary intensity comparisons over a smoothed
//! 31×31 patch, with a sampling pattern derived from a fixed seed so results
//! are reproducible across runs and processes.

use image::GrayImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Descriptor length in bytes (256 comparison bits).
pub const DESCRIPTOR_BYTES: usize = 32;

/// Bresenham circle of radius 3 used by the segment test.
const CIRCLE: [(i32, i32); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

/// Minimum contiguous arc length for a positive segment test.
const ARC_LEN: usize = 9;

/// Half-width of the descriptor sampling patch.
const PATCH_RADIUS: i32 = 15;

/// A detected corner with its detection score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub score: f32,
}

impl Keypoint {
    /// Position as a double-precision point for geometry code.
    pub fn point(&self) -> nalgebra::Point2<f64> {
        nalgebra::Point2::new(self.x as f64, self.y as f64)
    }
}

/// A 256-bit binary descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor(pub [u8; DESCRIPTOR_BYTES]);

impl Descriptor {
    /// Hamming distance to another descriptor.
    pub fn hamming(&self, other: &Descriptor) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }
}

/// Detector tuning knobs.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Intensity delta for the segment test.
    pub threshold: u8,
    /// Upper bound on keypoints kept after suppression.
    pub max_keypoints: usize,
    /// Minimum distance between kept keypoints, in pixels.
    pub nms_radius: f32,
    /// Keypoints closer than this to any image edge are discarded, so the
    /// full descriptor patch always lies inside the image.
    pub border_margin: u32,
    /// Seed for the descriptor sampling pattern.
    pub pattern_seed: u64,
    /// Gaussian sigma applied before detection and description.
    pub blur_sigma: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            threshold: 18,
            max_keypoints: 500,
            nms_radius: 8.0,
            border_margin: 20,
            pattern_seed: 0x5eed_cafe,
            blur_sigma: 1.2,
        }
    }
}

/// Detect corners and compute descriptors in one pass.
///
/// Returns keypoints ordered by descending detection score, and one
/// descriptor per keypoint at the same index.
pub fn detect_and_describe(image: &GrayImage, config: &DetectorConfig) -> (Vec<Keypoint>, Vec<Descriptor>) {
    let smoothed = if config.blur_sigma > 0.0 {
        image::imageops::blur(image, config.blur_sigma)
    } else {
        image.clone()
    };

    let keypoints = detect_corners(&smoothed, config);
    let pattern = sampling_pattern(config.pattern_seed);
    let descriptors = keypoints
        .iter()
        .map(|kp| describe(&smoothed, kp, &pattern))
        .collect();

    (keypoints, descriptors)
}

fn detect_corners(image: &GrayImage, config: &DetectorConfig) -> Vec<Keypoint> {
    let width = image.width() as i32;
    let height = image.height() as i32;
    // clamp keeps the descriptor patch of every keypoint inside the image
    let margin = (config.border_margin as i32).max(PATCH_RADIUS + 1);

    let mut candidates = Vec::new();

    for y in margin..height - margin {
        for x in margin..width - margin {
            if let Some(score) = segment_test(image, x, y, config.threshold) {
                candidates.push(Keypoint {
                    x: x as f32,
                    y: y as f32,
                    score,
                });
            }
        }
    }

    suppress(candidates, config.nms_radius, config.max_keypoints)
}

/// Segment test at (x, y). Returns the corner score when at least `ARC_LEN`
/// contiguous circle pixels are all brighter or all darker than the center
/// by the threshold, `None` otherwise.
fn segment_test(image: &GrayImage, x: i32, y: i32, threshold: u8) -> Option<f32> {
    let center = image.get_pixel(x as u32, y as u32)[0];
    let hi = center.saturating_add(threshold);
    let lo = center.saturating_sub(threshold);

    // -1 darker, +1 brighter, 0 neither
    let mut flags = [0i8; 16];
    for (i, &(dx, dy)) in CIRCLE.iter().enumerate() {
        let v = image.get_pixel((x + dx) as u32, (y + dy) as u32)[0];
        flags[i] = if v > hi {
            1
        } else if v < lo {
            -1
        } else {
            0
        };
    }

    for sign in [1i8, -1i8] {
        let mut run = 0usize;
        // walk twice around the circle to catch arcs that wrap
        for i in 0..32 {
            if flags[i % 16] == sign {
                run += 1;
                if run >= ARC_LEN {
                    let score: u32 = CIRCLE
                        .iter()
                        .enumerate()
                        .filter(|(j, _)| flags[*j] == sign)
                        .map(|(_, &(dx, dy))| {
                            let v = image.get_pixel((x + dx) as u32, (y + dy) as u32)[0];
                            (v as i32 - center as i32).unsigned_abs()
                        })
                        .sum();
                    return Some(score as f32);
                }
            } else {
                run = 0;
            }
        }
    }

    None
}

/// Greedy non-maximum suppression: strongest first, drop anything within
/// `radius` of an already kept point.
fn suppress(mut candidates: Vec<Keypoint>, radius: f32, max_keypoints: usize) -> Vec<Keypoint> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let r2 = radius * radius;
    let mut kept: Vec<Keypoint> = Vec::new();

    for kp in candidates {
        if kept.len() >= max_keypoints {
            break;
        }
        let clear = kept.iter().all(|k| {
            let dx = k.x - kp.x;
            let dy = k.y - kp.y;
            dx * dx + dy * dy >= r2
        });
        if clear {
            kept.push(kp);
        }
    }

    kept
}

/// Comparison-point pairs within the descriptor patch, fixed by seed.
fn sampling_pattern(seed: u64) -> Vec<[(i32, i32); 2]> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..DESCRIPTOR_BYTES * 8)
        .map(|_| {
            let a = (
                rng.random_range(-PATCH_RADIUS..=PATCH_RADIUS),
                rng.random_range(-PATCH_RADIUS..=PATCH_RADIUS),
            );
            let b = (
                rng.random_range(-PATCH_RADIUS..=PATCH_RADIUS),
                rng.random_range(-PATCH_RADIUS..=PATCH_RADIUS),
            );
            [a, b]
        })
        .collect()
}

fn describe(image: &GrayImage, kp: &Keypoint, pattern: &[[(i32, i32); 2]]) -> Descriptor {
    let cx = kp.x as i32;
    let cy = kp.y as i32;
    let mut bytes = [0u8; DESCRIPTOR_BYTES];

    for (i, pair) in pattern.iter().enumerate() {
        let a = image.get_pixel((cx + pair[0].0) as u32, (cy + pair[0].1) as u32)[0];
        let b = image.get_pixel((cx + pair[1].0) as u32, (cy + pair[1].1) as u32)[0];
        if a > b {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }

    Descriptor(bytes)
}
