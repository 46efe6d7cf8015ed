//! Vision primitives for duocam: keypoint detection, descriptor matching,
//! robust homography estimation, and image warping.
//!
//! This crate is self-contained and synchronous: no I/O, no async. It exists
//! so the streaming core can treat "detect, match, estimate, warp" as plain
//! library calls.
//!
//! # Quick Start
//!
//! ```ignore
//! use duocam_vision::{DetectorConfig, RansacParams};
//! use duocam_vision::{detect_and_describe, match_descriptors, estimate_homography_ransac};
//!
//! let det = DetectorConfig::default();
//! let (kps_a, desc_a) = detect_and_describe(&gray_a, &det);
//! let (kps_b, desc_b) = detect_and_describe(&gray_b, &det);
//!
//! let matches = match_descriptors(&desc_a, &desc_b, 0.8);
//! let from: Vec<_> = matches.iter().map(|m| kps_a[m.query].point()).collect();
//! let to: Vec<_> = matches.iter().map(|m| kps_b[m.train].point()).collect();
//!
//! let (h, inliers) = estimate_homography_ransac(&from, &to, &RansacParams::default())?;
//! ```

mod detect;
mod homography;
mod matcher;
mod warp;

pub use detect::{detect_and_describe, Descriptor, DetectorConfig, Keypoint, DESCRIPTOR_BYTES};
pub use homography::{estimate_homography, estimate_homography_ransac, HomographyError, RansacParams};
pub use matcher::{match_descriptors, PointMatch};
pub use warp::{hconcat, translate, warp_perspective};

// The homography type used throughout; re-exported so callers don't need a
// separate nalgebra version in lockstep.
pub use nalgebra::{Matrix3, Point2};
