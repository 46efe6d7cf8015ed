//! Feature-based homography stitching of the two camera views.
//!
//! [`HomographyStitcher::build`] runs the one-shot calibration: detect
//! corners in both views, match descriptors with a ratio test, and estimate
//! the moving-to-anchor homography robustly. The resulting stitcher is
//! cheap to apply per frame with [`HomographyStitcher::warp`].

use duocam_vision::{
    detect_and_describe, estimate_homography_ransac, match_descriptors, warp_perspective,
    DetectorConfig, HomographyError, Matrix3, Point2, RansacParams,
};
use image::RgbImage;
use thiserror::Error;

/// Calibration parameters.
#[derive(Debug, Clone)]
pub struct StitchConfig {
    /// Lowe ratio for the nearest/second-nearest descriptor test.
    pub ratio: f32,
    /// Minimum surviving matches required before estimation is attempted.
    pub min_matches: usize,
    /// RANSAC inlier threshold in pixels.
    pub reproj_threshold: f64,
    /// Corner detector settings shared by both views.
    pub detector: DetectorConfig,
    /// Seed for the robust estimator.
    pub ransac_seed: u64,
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            ratio: 0.8,
            min_matches: 20,
            reproj_threshold: 5.0,
            detector: DetectorConfig::default(),
            ransac_seed: 17,
        }
    }
}

#[derive(Debug, Error)]
pub enum StitchError {
    /// The views do not share enough matched features to calibrate.
    #[error("not enough correspondences: found {found}, need {required}")]
    InsufficientCorrespondences { found: usize, required: usize },
    /// The robust estimator could not settle on a model.
    #[error("homography estimation failed: {0}")]
    Estimation(#[from] HomographyError),
    /// The stored homography cannot be applied.
    #[error("homography is not invertible")]
    NotInvertible,
}

/// A locked moving-to-anchor homography, ready to composite frame pairs.
///
/// Convention: the homography maps points of the *moving* view (the first
/// argument everywhere) into the coordinates of the *anchor* view. The
/// composite canvas shares the anchor's coordinate frame, so the anchor is
/// pasted at the origin and the moving view is warped across.
#[derive(Debug, Clone)]
pub struct HomographyStitcher {
    homography: Matrix3<f64>,
}

impl HomographyStitcher {
    /// Calibrate from one frame pair.
    pub fn build(
        moving: &RgbImage,
        anchor: &RgbImage,
        config: &StitchConfig,
    ) -> Result<Self, StitchError> {
        let gray_moving = image::imageops::grayscale(moving);
        let gray_anchor = image::imageops::grayscale(anchor);

        let (keypoints_moving, descriptors_moving) =
            detect_and_describe(&gray_moving, &config.detector);
        let (keypoints_anchor, descriptors_anchor) =
            detect_and_describe(&gray_anchor, &config.detector);

        let matches = match_descriptors(&descriptors_moving, &descriptors_anchor, config.ratio);
        if matches.len() < config.min_matches {
            return Err(StitchError::InsufficientCorrespondences {
                found: matches.len(),
                required: config.min_matches,
            });
        }

        let from: Vec<Point2<f64>> = matches
            .iter()
            .map(|m| keypoints_moving[m.query].point())
            .collect();
        let to: Vec<Point2<f64>> = matches
            .iter()
            .map(|m| keypoints_anchor[m.train].point())
            .collect();

        let params = RansacParams {
            reproj_threshold: config.reproj_threshold,
            min_inliers: 4,
            seed: config.ransac_seed,
            ..RansacParams::default()
        };
        let (homography, inliers) = estimate_homography_ransac(&from, &to, &params)?;

        tracing::debug!(
            keypoints_moving = keypoints_moving.len(),
            keypoints_anchor = keypoints_anchor.len(),
            matches = matches.len(),
            inliers = inliers.len(),
            "homography locked"
        );
        Ok(Self { homography })
    }

    /// Wrap a known homography, e.g. from a stored rig calibration.
    pub fn from_homography(homography: Matrix3<f64>) -> Self {
        Self { homography }
    }

    pub fn homography(&self) -> &Matrix3<f64> {
        &self.homography
    }

    /// Composite one frame pair onto a canvas as wide as both views
    /// together and as tall as the moving view. The anchor overwrites the
    /// overlap region.
    pub fn warp(&self, moving: &RgbImage, anchor: &RgbImage) -> Result<RgbImage, StitchError> {
        let canvas_w = moving.width() + anchor.width();
        let canvas_h = moving.height();
        let mut canvas = warp_perspective(moving, &self.homography, canvas_w, canvas_h)
            .ok_or(StitchError::NotInvertible)?;
        image::imageops::replace(&mut canvas, anchor, 0, 0);
        Ok(canvas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duocam_vision::translate;
    use image::Rgb;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Seeded mosaic of 6x6 gray blocks; rich in corners, locally unique.
    fn mosaic(width: u32, height: u32, seed: u64) -> RgbImage {
        let mut rng = StdRng::seed_from_u64(seed);
        let blocks_x = width.div_ceil(6);
        let blocks_y = height.div_ceil(6);
        let mut shades = Vec::with_capacity((blocks_x * blocks_y) as usize);
        for _ in 0..blocks_x * blocks_y {
            shades.push(rng.random_range(30u8..=225));
        }
        RgbImage::from_fn(width, height, |x, y| {
            let idx = (y / 6) * blocks_x + x / 6;
            let v = shades[idx as usize];
            Rgb([v, v, v])
        })
    }

    fn flat(width: u32, height: u32, value: u8) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb([value, value, value]))
    }

    #[test]
    fn test_build_recovers_translation() {
        let moving = mosaic(240, 180, 42);
        let anchor = translate(&moving, 10, 6);

        let stitcher =
            HomographyStitcher::build(&moving, &anchor, &StitchConfig::default()).unwrap();
        let h = stitcher.homography();

        assert!((h[(0, 0)] - 1.0).abs() < 0.05, "h00 = {}", h[(0, 0)]);
        assert!((h[(1, 1)] - 1.0).abs() < 0.05, "h11 = {}", h[(1, 1)]);
        assert!((h[(0, 1)]).abs() < 0.05, "h01 = {}", h[(0, 1)]);
        assert!((h[(1, 0)]).abs() < 0.05, "h10 = {}", h[(1, 0)]);
        assert!((h[(0, 2)] - 10.0).abs() <= 2.0, "h02 = {}", h[(0, 2)]);
        assert!((h[(1, 2)] - 6.0).abs() <= 2.0, "h12 = {}", h[(1, 2)]);
    }

    #[test]
    fn test_build_rejects_featureless_views() {
        let moving = flat(160, 120, 60);
        let anchor = flat(160, 120, 60);

        let err = HomographyStitcher::build(&moving, &anchor, &StitchConfig::default())
            .unwrap_err();
        assert!(matches!(
            err,
            StitchError::InsufficientCorrespondences { required: 20, .. }
        ));
    }

    #[test]
    fn test_warp_canvas_geometry() {
        let stitcher = HomographyStitcher::from_homography(Matrix3::identity());
        let moving = RgbImage::from_pixel(40, 30, Rgb([0, 200, 0]));
        let anchor = RgbImage::from_pixel(20, 30, Rgb([0, 0, 200]));

        let composite = stitcher.warp(&moving, &anchor).unwrap();
        assert_eq!(composite.dimensions(), (60, 30));
        // anchor overwrites the overlap at the origin
        assert_eq!(*composite.get_pixel(5, 5), Rgb([0, 0, 200]));
        // moving view shows through beyond the anchor
        assert_eq!(*composite.get_pixel(30, 15), Rgb([0, 200, 0]));
        // area no view maps onto stays black
        assert_eq!(*composite.get_pixel(55, 15), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_warp_rejects_singular_homography() {
        let stitcher = HomographyStitcher::from_homography(Matrix3::zeros());
        let moving = flat(16, 16, 80);
        let anchor = flat(16, 16, 90);
        assert!(matches!(
            stitcher.warp(&moving, &anchor),
            Err(StitchError::NotInvertible)
        ));
    }

    #[test]
    fn test_composite_end_to_end() {
        let moving = mosaic(240, 180, 42);
        let anchor = translate(&moving, 10, 6);

        let stitcher =
            HomographyStitcher::build(&moving, &anchor, &StitchConfig::default()).unwrap();
        let composite = stitcher.warp(&moving, &anchor).unwrap();

        assert_eq!(composite.dimensions(), (480, 180));
        // warped moving content reaches just past the anchor's right edge
        assert_ne!(*composite.get_pixel(245, 90), Rgb([0, 0, 0]));
        // far right of the canvas is beyond any source pixel
        assert_eq!(*composite.get_pixel(470, 90), Rgb([0, 0, 0]));
    }
}
