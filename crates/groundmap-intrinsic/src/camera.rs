//! Pinhole camera with an OpenCV-ordered distortion vector.
//!
//! Coefficient order is `k1 k2 p1 p2 [k3 [k4 k5 k6 [s1 s2 s3 s4]]]`: radial,
//! tangential, rational and thin-prism terms.

use nalgebra::{Isometry3, Matrix3, Point2, Point3, Vector3};
use serde::{Deserialize, Serialize};

/// Distortion vector lengths the model understands.
pub const SUPPORTED_DISTORTION_LENGTHS: [usize; 4] = [4, 5, 8, 12];

const UNDISTORT_ITERS: usize = 20;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("camera matrix has non-finite entries")]
    NonFiniteMatrix,
    #[error("camera matrix focal lengths must be positive (fx={fx}, fy={fy})")]
    NonPositiveFocal { fx: f64, fy: f64 },
    #[error("camera matrix bottom row must be [0, 0, 1]")]
    NotUpperTriangular,
    #[error("unsupported distortion vector length {0} (expected 4, 5, 8 or 12)")]
    UnsupportedDistortion(usize),
    #[error("distortion coefficients contain non-finite values")]
    NonFiniteDistortion,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraModel {
    pub k: Matrix3<f64>,
    pub distortion: Vec<f64>,
}

impl CameraModel {
    pub fn new(k: Matrix3<f64>, distortion: Vec<f64>) -> Result<Self, ModelError> {
        let model = Self { k, distortion };
        model.validate()?;
        Ok(model)
    }

    pub fn pinhole(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            k: Matrix3::new(fx, 0.0, cx, 0.0, fy, cy, 0.0, 0.0, 1.0),
            distortion: vec![0.0; 5],
        }
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        if self.k.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::NonFiniteMatrix);
        }
        let (fx, fy) = (self.fx(), self.fy());
        if fx <= 0.0 || fy <= 0.0 {
            return Err(ModelError::NonPositiveFocal { fx, fy });
        }
        if self.k[(2, 0)] != 0.0 || self.k[(2, 1)] != 0.0 || self.k[(1, 0)] != 0.0 {
            return Err(ModelError::NotUpperTriangular);
        }
        if (self.k[(2, 2)] - 1.0).abs() > 1e-9 {
            return Err(ModelError::NotUpperTriangular);
        }
        if !SUPPORTED_DISTORTION_LENGTHS.contains(&self.distortion.len()) {
            return Err(ModelError::UnsupportedDistortion(self.distortion.len()));
        }
        if self.distortion.iter().any(|v| !v.is_finite()) {
            return Err(ModelError::NonFiniteDistortion);
        }
        Ok(())
    }

    #[inline]
    pub fn fx(&self) -> f64 {
        self.k[(0, 0)]
    }
    #[inline]
    pub fn fy(&self) -> f64 {
        self.k[(1, 1)]
    }
    #[inline]
    pub fn cx(&self) -> f64 {
        self.k[(0, 2)]
    }
    #[inline]
    pub fn cy(&self) -> f64 {
        self.k[(1, 2)]
    }
    #[inline]
    fn skew(&self) -> f64 {
        self.k[(0, 1)]
    }

    #[inline]
    fn coeff(&self, i: usize) -> f64 {
        self.distortion.get(i).copied().unwrap_or(0.0)
    }

    pub fn has_distortion(&self) -> bool {
        self.distortion.iter().any(|&v| v != 0.0)
    }

    pub fn normalized_to_pixel(&self, n: Point2<f64>) -> Point2<f64> {
        Point2::new(
            self.fx() * n.x + self.skew() * n.y + self.cx(),
            self.fy() * n.y + self.cy(),
        )
    }

    pub fn pixel_to_normalized(&self, p: Point2<f64>) -> Point2<f64> {
        let y = (p.y - self.cy()) / self.fy();
        let x = (p.x - self.cx() - self.skew() * y) / self.fx();
        Point2::new(x, y)
    }

    fn radial_ratio(&self, r2: f64) -> (f64, f64) {
        let (r4, r6) = (r2 * r2, r2 * r2 * r2);
        let num = 1.0 + self.coeff(0) * r2 + self.coeff(1) * r4 + self.coeff(4) * r6;
        let den = 1.0 + self.coeff(5) * r2 + self.coeff(6) * r4 + self.coeff(7) * r6;
        (num, den)
    }

    fn tangential_prism(&self, x: f64, y: f64, r2: f64) -> (f64, f64) {
        let (p1, p2) = (self.coeff(2), self.coeff(3));
        let r4 = r2 * r2;
        let dx = 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x) + self.coeff(8) * r2 + self.coeff(9) * r4;
        let dy = p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y + self.coeff(10) * r2 + self.coeff(11) * r4;
        (dx, dy)
    }

    /// Apply distortion to an ideal normalized point.
    pub fn distort(&self, n: Point2<f64>) -> Point2<f64> {
        let r2 = n.x * n.x + n.y * n.y;
        let (num, den) = self.radial_ratio(r2);
        let (dx, dy) = self.tangential_prism(n.x, n.y, r2);
        Point2::new(n.x * num / den + dx, n.y * num / den + dy)
    }

    /// Fixed-point inverse of [`CameraModel::distort`].
    pub fn undistort(&self, d: Point2<f64>) -> Point2<f64> {
        let (mut x, mut y) = (d.x, d.y);
        for _ in 0..UNDISTORT_ITERS {
            let r2 = x * x + y * y;
            let (num, den) = self.radial_ratio(r2);
            if num.abs() < f64::EPSILON {
                break;
            }
            let (dx, dy) = self.tangential_prism(x, y, r2);
            x = (d.x - dx) * den / num;
            y = (d.y - dy) * den / num;
        }
        Point2::new(x, y)
    }

    /// Undistort a pixel to the pixel an ideal pinhole would have seen.
    pub fn undistort_pixel(&self, p: Point2<f64>) -> Point2<f64> {
        self.normalized_to_pixel(self.undistort(self.pixel_to_normalized(p)))
    }

    /// Project board-frame points through `pose` (board to camera).
    ///
    /// Points behind the camera come back as NaN.
    pub fn project(&self, points: &[Point3<f64>], pose: &Isometry3<f64>) -> Vec<Point2<f64>> {
        points
            .iter()
            .map(|p| {
                let pc: Vector3<f64> = (pose * p).coords;
                if pc.z <= f64::EPSILON {
                    return Point2::new(f64::NAN, f64::NAN);
                }
                let n = Point2::new(pc.x / pc.z, pc.y / pc.z);
                self.normalized_to_pixel(self.distort(n))
            })
            .collect()
    }
}
