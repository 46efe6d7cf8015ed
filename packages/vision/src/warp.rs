//! Image warping and composition helpers.

use image::{Rgb, RgbImage};
use nalgebra::{Matrix3, Vector3};

/// Resample `src` through the homography `h` into a canvas of the given
/// size. `h` maps source coordinates into canvas coordinates; each canvas
/// pixel is bilinearly sampled at the inverse-mapped source position.
/// Pixels mapping outside `src` stay black. Returns `None` when `h` is not
/// invertible.
pub fn warp_perspective(src: &RgbImage, h: &Matrix3<f64>, out_w: u32, out_h: u32) -> Option<RgbImage> {
    let h_inv = h.try_inverse()?;
    let mut out = RgbImage::new(out_w, out_h);

    for y in 0..out_h {
        for x in 0..out_w {
            let p = h_inv * Vector3::new(x as f64, y as f64, 1.0);
            if p.z.abs() < 1e-12 {
                continue;
            }
            let sx = p.x / p.z;
            let sy = p.y / p.z;
            if let Some(px) = sample_bilinear(src, sx, sy) {
                out.put_pixel(x, y, px);
            }
        }
    }

    Some(out)
}

/// Shift `src` by integer pixel offsets; uncovered regions stay black.
/// Positive offsets move content right/down.
pub fn translate(src: &RgbImage, dx: i32, dy: i32) -> RgbImage {
    let (w, h) = (src.width(), src.height());
    let mut out = RgbImage::new(w, h);

    for y in 0..h as i32 {
        for x in 0..w as i32 {
            let sx = x - dx;
            let sy = y - dy;
            if sx >= 0 && sx < w as i32 && sy >= 0 && sy < h as i32 {
                out.put_pixel(x as u32, y as u32, *src.get_pixel(sx as u32, sy as u32));
            }
        }
    }

    out
}

/// Concatenate two images side by side, left first. The canvas height is
/// the taller of the two; the shorter image is padded with black below.
pub fn hconcat(left: &RgbImage, right: &RgbImage) -> RgbImage {
    let w = left.width() + right.width();
    let h = left.height().max(right.height());
    let mut out = RgbImage::new(w, h);
    paste(&mut out, left, 0, 0);
    paste(&mut out, right, left.width(), 0);
    out
}

/// Copy `src` into `canvas` with its top-left corner at `(x0, y0)`,
/// clipping at the canvas edges.
pub fn paste(canvas: &mut RgbImage, src: &RgbImage, x0: u32, y0: u32) {
    let w = src.width().min(canvas.width().saturating_sub(x0));
    let h = src.height().min(canvas.height().saturating_sub(y0));
    for y in 0..h {
        for x in 0..w {
            canvas.put_pixel(x0 + x, y0 + y, *src.get_pixel(x, y));
        }
    }
}

fn sample_bilinear(src: &RgbImage, x: f64, y: f64) -> Option<Rgb<u8>> {
    let (w, h) = (src.width() as f64, src.height() as f64);
    if x < -1.0 || y < -1.0 || x > w || y > h {
        return None;
    }

    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;

    let clamp_get = |ix: f64, iy: f64| -> [f64; 3] {
        let cx = ix.clamp(0.0, w - 1.0) as u32;
        let cy = iy.clamp(0.0, h - 1.0) as u32;
        let p = src.get_pixel(cx, cy);
        [p[0] as f64, p[1] as f64, p[2] as f64]
    };

    let p00 = clamp_get(x0, y0);
    let p10 = clamp_get(x0 + 1.0, y0);
    let p01 = clamp_get(x0, y0 + 1.0);
    let p11 = clamp_get(x0 + 1.0, y0 + 1.0);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] * (1.0 - fx) + p10[c] * fx;
        let bot = p01[c] * (1.0 - fx) + p11[c] * fx;
        out[c] = (top * (1.0 - fy) + bot * fy).round().clamp(0.0, 255.0) as u8;
    }
    Some(Rgb(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                Rgb([200, 40, 40])
            } else {
                Rgb([40, 40, 200])
            }
        })
    }

    #[test]
    fn test_translate_moves_content() {
        let src = checker(32, 32);
        let out = translate(&src, 5, 3);

        assert_eq!(out.dimensions(), (32, 32));
        assert_eq!(out.get_pixel(5, 3), src.get_pixel(0, 0));
        assert_eq!(out.get_pixel(20, 17), src.get_pixel(15, 14));
        // uncovered border is black
        assert_eq!(*out.get_pixel(0, 0), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_translate_zero_is_identity() {
        let src = checker(16, 16);
        assert_eq!(translate(&src, 0, 0), src);
    }

    #[test]
    fn test_hconcat_dimensions_and_content() {
        let left = checker(20, 30);
        let right = checker(12, 24);
        let out = hconcat(&left, &right);

        assert_eq!(out.dimensions(), (32, 30));
        assert_eq!(out.get_pixel(3, 3), left.get_pixel(3, 3));
        assert_eq!(out.get_pixel(23, 5), right.get_pixel(3, 5));
        // padding below the shorter image is black
        assert_eq!(*out.get_pixel(25, 29), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_warp_identity_preserves_pixels() {
        let src = checker(24, 24);
        let out = warp_perspective(&src, &Matrix3::identity(), 24, 24).unwrap();
        assert_eq!(out, src);
    }

    #[test]
    fn test_warp_translation_matches_translate() {
        let src = checker(24, 24);
        let h = Matrix3::new(1.0, 0.0, 6.0, 0.0, 1.0, 2.0, 0.0, 0.0, 1.0);

        let warped = warp_perspective(&src, &h, 24, 24).unwrap();
        let shifted = translate(&src, 6, 2);

        // interior pixels must agree exactly; skip the uncovered border
        for y in 2..24u32 {
            for x in 6..24u32 {
                assert_eq!(warped.get_pixel(x, y), shifted.get_pixel(x, y), "at ({x}, {y})");
            }
        }
    }

    #[test]
    fn test_warp_singular_matrix_is_rejected() {
        let src = checker(8, 8);
        assert!(warp_perspective(&src, &Matrix3::zeros(), 8, 8).is_none());
    }

    #[test]
    fn test_paste_clips_at_canvas_edge() {
        let mut canvas = RgbImage::new(10, 10);
        let src = checker(8, 8);
        paste(&mut canvas, &src, 6, 6);

        assert_eq!(canvas.get_pixel(6, 6), src.get_pixel(0, 0));
        assert_eq!(canvas.get_pixel(9, 9), src.get_pixel(3, 3));
    }
}
