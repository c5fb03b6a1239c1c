//! Face alignment onto the canonical ArcFace 112×112 template.

use image::{Rgb, RgbImage};
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};

use crate::types::Landmarks5;

/// Side length of the aligned crop fed to the recognizer.
pub const ALIGNED_SIZE: u32 = 112;

/// Reference keypoints of the ArcFace template, same order as [`Landmarks5`].
pub const ARCFACE_TEMPLATE: Landmarks5 = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// 2-D similarity transform `q = [a -b; b a] p + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `src` points onto `dst` points.
    ///
    /// Returns `None` when the source points are (nearly) coincident.
    pub fn estimate(src: &[(f32, f32)], dst: &[(f32, f32)]) -> Option<Self> {
        let n = src.len().min(dst.len());
        if n < 2 {
            return None;
        }
        let mean = |pts: &[(f32, f32)]| {
            let (sx, sy) = pts[..n]
                .iter()
                .fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
            (sx / n as f32, sy / n as f32)
        };
        let (pmx, pmy) = mean(src);
        let (qmx, qmy) = mean(dst);

        let mut denom = 0.0f32;
        let mut num_a = 0.0f32;
        let mut num_b = 0.0f32;
        for (p, q) in src[..n].iter().zip(&dst[..n]) {
            let (px, py) = (p.0 - pmx, p.1 - pmy);
            let (qx, qy) = (q.0 - qmx, q.1 - qmy);
            denom += px * px + py * py;
            num_a += px * qx + py * qy;
            num_b += px * qy - py * qx;
        }
        if denom < 1e-6 {
            return None;
        }
        let a = num_a / denom;
        let b = num_b / denom;
        if a * a + b * b < 1e-12 {
            return None;
        }
        Some(Self {
            a,
            b,
            tx: qmx - (a * pmx - b * pmy),
            ty: qmy - (b * pmx + a * pmy),
        })
    }

    pub fn apply(&self, p: (f32, f32)) -> (f32, f32) {
        (
            self.a * p.0 - self.b * p.1 + self.tx,
            self.b * p.0 + self.a * p.1 + self.ty,
        )
    }

    /// Row-major 3×3 homogeneous form; `None` if the scale is zero.
    pub fn to_projection(&self) -> Option<Projection> {
        Projection::from_matrix([
            self.a, -self.b, self.tx, //
            self.b, self.a, self.ty, //
            0.0, 0.0, 1.0,
        ])
    }

    pub fn invert(&self, q: (f32, f32)) -> (f32, f32) {
        let det = self.a * self.a + self.b * self.b;
        let (x, y) = (q.0 - self.tx, q.1 - self.ty);
        ((self.a * x + self.b * y) / det, (-self.b * x + self.a * y) / det)
    }
}

/// Warp the face described by `landmarks` into a 112×112 aligned crop.
///
/// Returns `None` if the keypoints are degenerate (coincident or non-finite).
pub fn align_face(frame: &RgbImage, landmarks: &Landmarks5) -> Option<RgbImage> {
    if landmarks.iter().any(|p| !p.0.is_finite() || !p.1.is_finite()) {
        return None;
    }
    let transform = Similarity::estimate(landmarks, &ARCFACE_TEMPLATE)?;
    warp(frame, &transform, ALIGNED_SIZE)
}

/// Warp `frame` through `transform` into a `size`×`size` crop with bilinear
/// sampling. Pixels that fall outside the source frame are black.
pub fn warp(frame: &RgbImage, transform: &Similarity, size: u32) -> Option<RgbImage> {
    let projection = transform.to_projection()?;
    let mut out = RgbImage::new(size, size);
    warp_into(frame, &projection, Interpolation::Bilinear, Rgb([0, 0, 0]), &mut out);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_recovers_known_transform() {
        let truth = Similarity { a: 0.5, b: 0.2, tx: 10.0, ty: -4.0 };
        let src: Vec<(f32, f32)> = vec![(0.0, 0.0), (40.0, 0.0), (20.0, 25.0), (5.0, 50.0)];
        let dst: Vec<(f32, f32)> = src.iter().map(|&p| truth.apply(p)).collect();

        let est = Similarity::estimate(&src, &dst).unwrap();
        assert!((est.a - truth.a).abs() < 1e-4);
        assert!((est.b - truth.b).abs() < 1e-4);
        assert!((est.tx - truth.tx).abs() < 1e-3);
        assert!((est.ty - truth.ty).abs() < 1e-3);

        let back = est.invert(est.apply((13.0, 7.0)));
        assert!((back.0 - 13.0).abs() < 1e-3);
        assert!((back.1 - 7.0).abs() < 1e-3);
    }

    #[test]
    fn test_estimate_rejects_coincident_points() {
        let src = [(5.0, 5.0); 5];
        assert!(Similarity::estimate(&src, &ARCFACE_TEMPLATE).is_none());
        let frame = RgbImage::new(10, 10);
        assert!(align_face(&frame, &src).is_none());
        let mut nan = ARCFACE_TEMPLATE;
        nan[2].0 = f32::NAN;
        assert!(align_face(&frame, &nan).is_none());
    }

    #[test]
    fn test_align_identity_template() {
        // Landmarks already at template positions: warp is the identity.
        let mut frame = RgbImage::from_pixel(112, 112, Rgb([0, 0, 0]));
        frame.put_pixel(56, 72, Rgb([255, 255, 255]));
        let aligned = align_face(&frame, &ARCFACE_TEMPLATE).unwrap();
        assert_eq!(aligned.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert_eq!(aligned.get_pixel(56, 72), &Rgb([255, 255, 255]));
        assert_eq!(aligned.get_pixel(10, 10), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_align_scaled_face_inside_frame() {
        let frame = RgbImage::from_pixel(200, 200, Rgb([90, 90, 90]));
        let lm: Landmarks5 = [
            (80.0, 100.0),
            (120.0, 100.0),
            (100.0, 100.0),
            (100.0, 100.0),
            (100.0, 100.0),
        ];
        let aligned = align_face(&frame, &lm).unwrap();
        let p = aligned.get_pixel(56, 56);
        assert!(p.0.iter().all(|&c| (c as i32 - 90).abs() <= 1), "{p:?}");
    }

    #[test]
    fn test_out_of_frame_is_black() {
        let frame = RgbImage::from_pixel(4, 4, Rgb([200, 200, 200]));
        let t = Similarity { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 };
        let out = warp(&frame, &t, 8).unwrap();
        assert_eq!(out.get_pixel(7, 7), &Rgb([0, 0, 0]));
        assert_eq!(out.get_pixel(1, 1), &Rgb([200, 200, 200]));
    }

    #[test]
    fn test_projection_matches_similarity() {
        let t = Similarity { a: 0.8, b: -0.3, tx: 5.0, ty: 2.0 };
        let projection = t.to_projection().unwrap();
        let (x, y) = t.apply((10.0, 20.0));
        let (px, py) = projection * (10.0, 20.0);
        assert!((x - px).abs() < 1e-4 && (y - py).abs() < 1e-4);

        let zero = Similarity { a: 0.0, b: 0.0, tx: 1.0, ty: 1.0 };
        assert!(zero.to_projection().is_none());
        assert!(warp(&RgbImage::new(4, 4), &zero, 8).is_none());
    }
}
