//! Homography estimation: normalized DLT and a RANSAC wrapper.
//!
//! The estimated matrix `H` maps `from`-points into `to`-coordinates:
//! `p_to ~ H p_from`. Hartley-style normalization (zero mean, average
//! distance sqrt(2)) is applied internally and the result de-normalized,
//! scaled so `H[2,2] == 1`.

use nalgebra::{DMatrix, Matrix3, Point2, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;

/// Estimation failures.
#[derive(Debug, Error)]
pub enum HomographyError {
    #[error("need at least {need} correspondences, got {got}")]
    NotEnoughPoints { need: usize, got: usize },
    #[error("correspondence lists differ in length ({from} vs {to})")]
    LengthMismatch { from: usize, to: usize },
    #[error("point configuration is degenerate")]
    Degenerate,
    #[error("no consensus: best support {support}/{total}, need {min}")]
    NoConsensus {
        support: usize,
        total: usize,
        min: usize,
    },
}

/// RANSAC tuning.
#[derive(Debug, Clone)]
pub struct RansacParams {
    /// Iteration cap; the loop may stop earlier once the confidence bound
    /// is met.
    pub max_iters: usize,
    /// Inlier reprojection threshold in pixels.
    pub reproj_threshold: f64,
    /// Minimum inlier support for an acceptable model.
    pub min_inliers: usize,
    /// Desired probability of having sampled at least one all-inlier set.
    pub confidence: f64,
    /// RNG seed; fixed so estimation is reproducible.
    pub seed: u64,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            max_iters: 1000,
            reproj_threshold: 5.0,
            min_inliers: 10,
            confidence: 0.995,
            seed: 7,
        }
    }
}

/// Estimate a homography from all given correspondences with normalized DLT.
pub fn estimate_homography(
    from: &[Point2<f64>],
    to: &[Point2<f64>],
) -> Result<Matrix3<f64>, HomographyError> {
    if from.len() != to.len() {
        return Err(HomographyError::LengthMismatch {
            from: from.len(),
            to: to.len(),
        });
    }
    let n = from.len();
    if n < 4 {
        return Err(HomographyError::NotEnoughPoints { need: 4, got: n });
    }

    let (from_n, t_from) = normalize_points(from).ok_or(HomographyError::Degenerate)?;
    let (to_n, t_to) = normalize_points(to).ok_or(HomographyError::Degenerate)?;

    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for (i, (pf, pt)) in from_n.iter().zip(to_n.iter()).enumerate() {
        let (x, y) = (pf.x, pf.y);
        let (u, v) = (pt.x, pt.y);
        let r0 = 2 * i;
        let r1 = 2 * i + 1;

        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    // pad the minimal 8x9 case so the SVD yields a full right null space
    if a.nrows() < a.ncols() {
        let (rows, cols) = (a.nrows(), a.ncols());
        let mut padded = DMatrix::<f64>::zeros(cols, cols);
        padded.view_mut((0, 0), (rows, cols)).copy_from(&a);
        a = padded;
    }

    let svd = a.svd(true, true);
    let v_t = svd.v_t.ok_or(HomographyError::Degenerate)?;
    let h_vec = v_t.row(v_t.nrows() - 1);

    let mut h = Matrix3::<f64>::zeros();
    for r in 0..3 {
        for c in 0..3 {
            h[(r, c)] = h_vec[3 * r + c];
        }
    }

    let t_to_inv = t_to.try_inverse().ok_or(HomographyError::Degenerate)?;
    h = t_to_inv * h * t_from;

    let scale = h[(2, 2)];
    if scale.abs() <= f64::EPSILON {
        return Err(HomographyError::Degenerate);
    }
    Ok(h / scale)
}

/// Estimate a homography robustly: sample minimal sets, score by inlier
/// support under the reprojection threshold, then refit on the best inlier
/// set. Returns the homography and the inlier indices.
pub fn estimate_homography_ransac(
    from: &[Point2<f64>],
    to: &[Point2<f64>],
    params: &RansacParams,
) -> Result<(Matrix3<f64>, Vec<usize>), HomographyError> {
    if from.len() != to.len() {
        return Err(HomographyError::LengthMismatch {
            from: from.len(),
            to: to.len(),
        });
    }
    let n = from.len();
    if n < 4 {
        return Err(HomographyError::NotEnoughPoints { need: 4, got: n });
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut best_model: Option<Matrix3<f64>> = None;
    let mut best_inliers: Vec<usize> = Vec::new();
    let mut best_residual = f64::INFINITY;
    let mut needed = params.max_iters;

    let mut iter = 0;
    while iter < needed.min(params.max_iters) {
        iter += 1;

        let sample = rand::seq::index::sample(&mut rng, n, 4).into_vec();
        if sample_is_degenerate(from, &sample) {
            continue;
        }

        let sampled_from: Vec<_> = sample.iter().map(|&i| from[i]).collect();
        let sampled_to: Vec<_> = sample.iter().map(|&i| to[i]).collect();
        let model = match estimate_homography(&sampled_from, &sampled_to) {
            Ok(m) => m,
            Err(_) => continue,
        };

        let (inliers, residual) = score_model(&model, from, to, params.reproj_threshold);
        let better = inliers.len() > best_inliers.len()
            || (inliers.len() == best_inliers.len() && residual < best_residual);
        if better {
            best_residual = residual;
            best_inliers = inliers;
            best_model = Some(model);

            // shrink the iteration bound as inlier support grows
            let w = best_inliers.len() as f64 / n as f64;
            needed = required_iterations(w, params.confidence, params.max_iters);
        }
    }

    if best_model.is_none() || best_inliers.len() < params.min_inliers.max(4) {
        return Err(HomographyError::NoConsensus {
            support: best_inliers.len(),
            total: n,
            min: params.min_inliers,
        });
    }

    // refit on the full inlier set; keep the minimal-sample model if the
    // refit degenerates
    let refit_from: Vec<_> = best_inliers.iter().map(|&i| from[i]).collect();
    let refit_to: Vec<_> = best_inliers.iter().map(|&i| to[i]).collect();
    if let Ok(refit) = estimate_homography(&refit_from, &refit_to) {
        let (inliers, _) = score_model(&refit, from, to, params.reproj_threshold);
        if inliers.len() >= best_inliers.len() {
            return Ok((refit, inliers));
        }
    }

    Ok((best_model.ok_or(HomographyError::Degenerate)?, best_inliers))
}

/// Reprojection error of one correspondence under `h`.
pub fn reprojection_error(h: &Matrix3<f64>, from: &Point2<f64>, to: &Point2<f64>) -> f64 {
    let p = h * Vector3::new(from.x, from.y, 1.0);
    if p.z.abs() < 1e-12 {
        return f64::INFINITY;
    }
    let du = p.x / p.z - to.x;
    let dv = p.y / p.z - to.y;
    (du * du + dv * dv).sqrt()
}

fn score_model(
    h: &Matrix3<f64>,
    from: &[Point2<f64>],
    to: &[Point2<f64>],
    threshold: f64,
) -> (Vec<usize>, f64) {
    let mut inliers = Vec::new();
    let mut total = 0.0;
    for i in 0..from.len() {
        let e = reprojection_error(h, &from[i], &to[i]);
        if e < threshold {
            inliers.push(i);
            total += e;
        }
    }
    (inliers, total)
}

/// Any collinear triple within the minimal sample makes it unusable.
fn sample_is_degenerate(points: &[Point2<f64>], sample: &[usize]) -> bool {
    for i in 0..sample.len() {
        for j in (i + 1)..sample.len() {
            for k in (j + 1)..sample.len() {
                let (p0, p1, p2) = (points[sample[i]], points[sample[j]], points[sample[k]]);
                let area = (p1.x - p0.x) * (p2.y - p0.y) - (p1.y - p0.y) * (p2.x - p0.x);
                if area.abs() < 1e-9 {
                    return true;
                }
            }
        }
    }
    false
}

fn required_iterations(inlier_ratio: f64, confidence: f64, cap: usize) -> usize {
    if inlier_ratio <= 0.0 {
        return cap;
    }
    if inlier_ratio >= 1.0 {
        return 1;
    }
    let p_sample = inlier_ratio.powi(4);
    if p_sample <= f64::EPSILON {
        return cap;
    }
    let needed = (1.0 - confidence).ln() / (1.0 - p_sample).ln();
    if !needed.is_finite() {
        return cap;
    }
    (needed.ceil() as usize).clamp(1, cap)
}

/// Hartley normalization: translate to zero mean, scale so the average
/// distance from the origin is sqrt(2). Returns the transformed points and
/// the 3x3 transform that was applied.
fn normalize_points(points: &[Point2<f64>]) -> Option<(Vec<Point2<f64>>, Matrix3<f64>)> {
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.y).sum::<f64>() / n;

    let mean_dist = points
        .iter()
        .map(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    if mean_dist < 1e-12 {
        return None;
    }

    let s = std::f64::consts::SQRT_2 / mean_dist;
    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let transformed = points
        .iter()
        .map(|p| Point2::new(s * (p.x - cx), s * (p.y - cy)))
        .collect();
    Some((transformed, t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn square() -> Vec<Point2<f64>> {
        vec![
            Point2::new(10.0, 10.0),
            Point2::new(110.0, 12.0),
            Point2::new(108.0, 95.0),
            Point2::new(12.0, 98.0),
        ]
    }

    #[test]
    fn test_dlt_recovers_translation() {
        let from = square();
        let to: Vec<_> = from.iter().map(|p| Point2::new(p.x + 15.0, p.y - 7.0)).collect();

        let h = estimate_homography(&from, &to).unwrap();

        assert_abs_diff_eq!(h[(0, 0)], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(h[(1, 1)], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(h[(0, 2)], 15.0, epsilon = 1e-4);
        assert_abs_diff_eq!(h[(1, 2)], -7.0, epsilon = 1e-4);
        assert_abs_diff_eq!(h[(2, 0)], 0.0, epsilon = 1e-8);
        assert_abs_diff_eq!(h[(2, 1)], 0.0, epsilon = 1e-8);
    }

    #[test]
    fn test_dlt_recovers_scale() {
        let from = vec![
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 0.0),
            Point2::new(1.0, 1.0),
            Point2::new(0.0, 1.0),
        ];
        let to: Vec<_> = from.iter().map(|p| Point2::new(2.0 * p.x, 2.0 * p.y)).collect();

        let h = estimate_homography(&from, &to).unwrap();
        assert_abs_diff_eq!(h[(0, 0)], 2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(h[(1, 1)], 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_dlt_rejects_too_few_points() {
        let from = vec![Point2::new(0.0, 0.0), Point2::new(1.0, 1.0)];
        let to = from.clone();
        assert!(matches!(
            estimate_homography(&from, &to),
            Err(HomographyError::NotEnoughPoints { .. })
        ));
    }

    #[test]
    fn test_dlt_rejects_coincident_points() {
        let from = vec![Point2::new(5.0, 5.0); 4];
        let to = square();
        assert!(matches!(
            estimate_homography(&from, &to),
            Err(HomographyError::Degenerate)
        ));
    }

    #[test]
    fn test_ransac_survives_outliers() {
        // a grid of inlier correspondences under a known translation
        let mut from = Vec::new();
        let mut to = Vec::new();
        for gy in 0..5 {
            for gx in 0..5 {
                let p = Point2::new(20.0 + 30.0 * gx as f64, 25.0 + 28.0 * gy as f64);
                from.push(p);
                to.push(Point2::new(p.x + 12.0, p.y + 4.0));
            }
        }
        // a third as many wild outliers
        for i in 0..8 {
            from.push(Point2::new(15.0 * i as f64, 160.0 - 11.0 * i as f64));
            to.push(Point2::new(200.0 - 17.0 * i as f64, 13.0 * i as f64));
        }

        let params = RansacParams {
            reproj_threshold: 2.0,
            min_inliers: 15,
            ..RansacParams::default()
        };
        let (h, inliers) = estimate_homography_ransac(&from, &to, &params).unwrap();

        assert!(inliers.len() >= 25, "expected the grid as inliers, got {}", inliers.len());
        assert_abs_diff_eq!(h[(0, 2)], 12.0, epsilon = 1e-3);
        assert_abs_diff_eq!(h[(1, 2)], 4.0, epsilon = 1e-3);
    }

    #[test]
    fn test_ransac_reports_no_consensus_on_noise() {
        // deterministic scatter with no common model
        let mut from = Vec::new();
        let mut to = Vec::new();
        let mut a = 1u64;
        for _ in 0..30 {
            a = a.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let x = (a >> 33) % 300;
            a = a.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let y = (a >> 33) % 300;
            from.push(Point2::new(x as f64, y as f64));
            a = a.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let u = (a >> 33) % 300;
            a = a.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let v = (a >> 33) % 300;
            to.push(Point2::new(u as f64, v as f64));
        }

        let params = RansacParams {
            reproj_threshold: 1.5,
            min_inliers: 20,
            max_iters: 300,
            ..RansacParams::default()
        };
        assert!(matches!(
            estimate_homography_ransac(&from, &to, &params),
            Err(HomographyError::NoConsensus { .. })
        ));
    }

    #[test]
    fn test_reprojection_error_zero_under_identity() {
        let h = Matrix3::identity();
        let p = Point2::new(33.0, 44.0);
        assert_abs_diff_eq!(reprojection_error(&h, &p, &p), 0.0, epsilon = 1e-12);
    }
}
