//! Camera calibration capability and the default linear planar solver.
//!
//! [`PlanarSolver`] estimates intrinsics from board homographies (Zhang's closed
//! form), alternates with a linear Brown-Conrady distortion fit on
//! undistorted corners, and recovers one pose per view from its homography.

use groundmap_core::estimate_homography;
use nalgebra::{
    DMatrix, DVector, Isometry3, Matrix3, Point2, Point3, Rotation3, Translation3, UnitQuaternion,
    Vector3, Vector6,
};
use serde::{Deserialize, Serialize};

use crate::camera::CameraModel;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Views needed by the closed-form intrinsics.
pub const MIN_SOLVER_VIEWS: usize = 3;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    #[error("need at least {required} views, got {found}")]
    NotEnoughViews { found: usize, required: usize },
    #[error("view {view}: {object} object points vs {image} image points")]
    MismatchedView {
        view: usize,
        object: usize,
        image: usize,
    },
    #[error("view {0}: object points are not on the z = 0 plane")]
    NonPlanar(usize),
    #[error("view {0}: homography estimation failed")]
    Homography(usize),
    #[error("image size is empty")]
    EmptyImageSize,
    #[error("degenerate configuration: {0}")]
    Degenerate(&'static str),
}

/// Camera matrix, distortion and per-view poses from a solver run.
#[derive(Clone, Debug)]
pub struct SolverOutput {
    pub model: CameraModel,
    /// Board-to-camera transform per view.
    pub poses: Vec<Isometry3<f64>>,
    /// The solver's own RMS; callers recompute their reported error.
    pub rms: f64,
}

/// External camera calibration capability.
pub trait CameraSolver: Send + Sync {
    fn calibrate(
        &self,
        object_points: &[Vec<Point3<f64>>],
        image_points: &[Vec<Point2<f64>>],
        image_size: (usize, usize),
    ) -> Result<SolverOutput, SolverError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanarSolverOptions {
    /// Alternations between intrinsics and distortion estimation.
    pub iterations: usize,
    pub fit_tangential: bool,
    pub fit_k3: bool,
}

impl Default for PlanarSolverOptions {
    fn default() -> Self {
        Self {
            iterations: 3,
            fit_tangential: true,
            fit_k3: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PlanarSolver {
    pub options: PlanarSolverOptions,
}

impl PlanarSolver {
    pub fn new(options: PlanarSolverOptions) -> Self {
        Self { options }
    }
}

fn v_ij(h: &Matrix3<f64>, i: usize, j: usize) -> Vector6<f64> {
    let hi = h.column(i);
    let hj = h.column(j);
    Vector6::new(
        hi[0] * hj[0],
        hi[0] * hj[1] + hi[1] * hj[0],
        hi[1] * hj[1],
        hi[2] * hj[0] + hi[0] * hj[2],
        hi[2] * hj[1] + hi[1] * hj[2],
        hi[2] * hj[2],
    )
}

/// Pixel conditioning: centre the image and scale it to roughly unit size.
fn pixel_conditioning(image_size: (usize, usize)) -> Matrix3<f64> {
    let (w, h) = (image_size.0 as f64, image_size.1 as f64);
    let s = 2.0 / (w + h);
    Matrix3::new(s, 0.0, -s * w * 0.5, 0.0, s, -s * h * 0.5, 0.0, 0.0, 1.0)
}

/// Zhang's closed-form K from board-to-image homographies, zero skew.
fn intrinsics_from_homographies(
    homographies: &[Matrix3<f64>],
    image_size: (usize, usize),
) -> Result<Matrix3<f64>, SolverError> {
    let n = pixel_conditioning(image_size);
    let n_inv = n
        .try_inverse()
        .ok_or(SolverError::Degenerate("pixel conditioning"))?;

    let m = homographies.len();
    let mut v = DMatrix::<f64>::zeros(2 * m, 6);
    for (k, h) in homographies.iter().enumerate() {
        let hc = n * h;
        let hc = hc / hc.norm();
        v.row_mut(2 * k).copy_from(&v_ij(&hc, 0, 1).transpose());
        v.row_mut(2 * k + 1)
            .copy_from(&(v_ij(&hc, 0, 0) - v_ij(&hc, 1, 1)).transpose());
    }

    let svd = v.svd(false, true);
    let v_t = svd.v_t.ok_or(SolverError::Degenerate("intrinsics svd"))?;
    let b = v_t.row(v_t.nrows() - 1);
    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    let denom = b11 * b22 - b12 * b12;
    if denom.abs() <= 1e-12 * (b11 * b11 + b22 * b22) || b11.abs() < f64::EPSILON {
        return Err(SolverError::Degenerate("board views are too similar"));
    }

    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    let alpha = (lambda / b11).sqrt();
    let beta = (lambda * b11 / denom).sqrt();
    let gamma = -b12 * alpha * alpha * beta / lambda;
    let u0 = gamma * v0 / beta - b13 * alpha * alpha / lambda;

    if ![alpha, beta, u0, v0].iter().all(|v| v.is_finite()) || alpha <= 0.0 || beta <= 0.0 {
        return Err(SolverError::Degenerate("no positive focal length"));
    }

    let k_cond = Matrix3::new(alpha, 0.0, u0, 0.0, beta, v0, 0.0, 0.0, 1.0);
    let k = n_inv * k_cond;
    Ok(k / k[(2, 2)])
}

/// Board pose from its homography and K.
fn pose_from_homography(k: &Matrix3<f64>, h: &Matrix3<f64>) -> Result<Isometry3<f64>, SolverError> {
    let k_inv = k
        .try_inverse()
        .ok_or(SolverError::Degenerate("camera matrix is singular"))?;
    let a1 = k_inv * h.column(0);
    let a2 = k_inv * h.column(1);
    let mut lambda = 2.0 / (a1.norm() + a2.norm());
    let mut t: Vector3<f64> = lambda * (k_inv * h.column(2));
    if t.z < 0.0 {
        lambda = -lambda;
        t = -t;
    }

    let r1 = lambda * a1;
    let r2 = lambda * a2;
    let r3 = r1.cross(&r2);
    let r = Matrix3::from_columns(&[r1, r2, r3]);

    let svd = r.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(SolverError::Degenerate("pose svd"));
    };
    let mut r_orth = u * v_t;
    if r_orth.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r_orth = u_flipped * v_t;
    }

    let rot = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r_orth));
    Ok(Isometry3::from_parts(Translation3::from(t), rot))
}

struct View<'a> {
    board: Vec<Point2<f64>>,
    pixels: &'a [Point2<f64>],
}

/// Linear least squares for `[k1, k2, p1, p2, k3]`; unfitted terms stay zero.
fn fit_distortion(
    k: &Matrix3<f64>,
    views: &[View<'_>],
    homographies: &[Matrix3<f64>],
    opts: &PlanarSolverOptions,
) -> Result<Vec<f64>, SolverError> {
    let pinhole = CameraModel {
        k: *k,
        distortion: vec![0.0; 5],
    };
    let n_params = 2 + usize::from(opts.fit_k3) + if opts.fit_tangential { 2 } else { 0 };
    let total: usize = views.iter().map(|v| v.board.len()).sum();

    let mut a = DMatrix::<f64>::zeros(2 * total, n_params);
    let mut b = DVector::<f64>::zeros(2 * total);
    let mut row = 0;
    let mut max_r2 = 0.0_f64;

    for (view, h) in views.iter().zip(homographies) {
        let h = groundmap_core::Homography::new(*h);
        for (bp, obs) in view.board.iter().zip(view.pixels) {
            let ideal = pinhole.pixel_to_normalized(h.apply(*bp));
            let observed = pinhole.pixel_to_normalized(*obs);
            let (x, y) = (ideal.x, ideal.y);
            let r2 = x * x + y * y;
            max_r2 = max_r2.max(r2);

            let mut col = 0;
            for rk in [r2, r2 * r2] {
                a[(row, col)] = x * rk;
                a[(row + 1, col)] = y * rk;
                col += 1;
            }
            if opts.fit_tangential {
                a[(row, col)] = 2.0 * x * y;
                a[(row + 1, col)] = r2 + 2.0 * y * y;
                a[(row, col + 1)] = r2 + 2.0 * x * x;
                a[(row + 1, col + 1)] = 2.0 * x * y;
                col += 2;
            }
            if opts.fit_k3 {
                let r6 = r2 * r2 * r2;
                a[(row, col)] = x * r6;
                a[(row + 1, col)] = y * r6;
            }
            b[row] = observed.x - x;
            b[row + 1] = observed.y - y;
            row += 2;
        }
    }

    if max_r2 < 1e-6 {
        return Err(SolverError::Degenerate("all corners near the principal point"));
    }

    let x = a
        .svd(true, true)
        .solve(&b, 1e-12)
        .map_err(|_| SolverError::Degenerate("distortion fit"))?;

    let mut coeffs = vec![x[0], x[1], 0.0, 0.0, 0.0];
    let mut col = 2;
    if opts.fit_tangential {
        coeffs[2] = x[2];
        coeffs[3] = x[3];
        col += 2;
    }
    if opts.fit_k3 {
        coeffs[4] = x[col];
    }
    if coeffs.iter().any(|c| !c.is_finite()) {
        return Err(SolverError::Degenerate("distortion fit"));
    }
    Ok(coeffs)
}

fn homographies_for(
    views: &[View<'_>],
    model: Option<&CameraModel>,
) -> Result<Vec<Matrix3<f64>>, SolverError> {
    views
        .iter()
        .enumerate()
        .map(|(i, v)| {
            let pixels: Vec<Point2<f64>> = match model {
                Some(m) => v.pixels.iter().map(|&p| m.undistort_pixel(p)).collect(),
                None => v.pixels.to_vec(),
            };
            estimate_homography(&v.board, &pixels)
                .map(|h| h.h)
                .ok_or(SolverError::Homography(i))
        })
        .collect()
}

fn rms_error(
    model: &CameraModel,
    object: &[Vec<Point3<f64>>],
    image: &[Vec<Point2<f64>>],
    poses: &[Isometry3<f64>],
) -> f64 {
    let mut sum = 0.0;
    let mut n = 0usize;
    for ((obj, img), pose) in object.iter().zip(image).zip(poses) {
        for (proj, obs) in model.project(obj, pose).iter().zip(img) {
            sum += (proj - obs).norm_squared();
            n += 1;
        }
    }
    if n == 0 {
        return 0.0;
    }
    (sum / n as f64).sqrt()
}

impl CameraSolver for PlanarSolver {
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip_all, fields(views = object_points.len())))]
    fn calibrate(
        &self,
        object_points: &[Vec<Point3<f64>>],
        image_points: &[Vec<Point2<f64>>],
        image_size: (usize, usize),
    ) -> Result<SolverOutput, SolverError> {
        if image_size.0 == 0 || image_size.1 == 0 {
            return Err(SolverError::EmptyImageSize);
        }
        let found = object_points.len().min(image_points.len());
        if found < MIN_SOLVER_VIEWS {
            return Err(SolverError::NotEnoughViews {
                found,
                required: MIN_SOLVER_VIEWS,
            });
        }

        let mut views = Vec::with_capacity(found);
        for (i, (obj, img)) in object_points.iter().zip(image_points).enumerate() {
            if obj.len() != img.len() || obj.len() < 4 {
                return Err(SolverError::MismatchedView {
                    view: i,
                    object: obj.len(),
                    image: img.len(),
                });
            }
            if obj.iter().any(|p| p.z.abs() > 1e-9) {
                return Err(SolverError::NonPlanar(i));
            }
            views.push(View {
                board: obj.iter().map(|p| Point2::new(p.x, p.y)).collect(),
                pixels: img,
            });
        }
        let object_points = &object_points[..found];
        let image_points = &image_points[..found];

        let mut homographies = homographies_for(&views, None)?;
        let mut model = CameraModel {
            k: intrinsics_from_homographies(&homographies, image_size)?,
            distortion: vec![0.0; 5],
        };

        for iter in 0..self.options.iterations {
            model.distortion = fit_distortion(&model.k, &views, &homographies, &self.options)?;
            homographies = homographies_for(&views, Some(&model))?;
            model.k = intrinsics_from_homographies(&homographies, image_size)?;
            log::debug!(
                "planar solver iteration {iter}: fx={:.2} fy={:.2} cx={:.2} cy={:.2} dist={:?}",
                model.fx(),
                model.fy(),
                model.cx(),
                model.cy(),
                model.distortion
            );
        }

        let poses = homographies
            .iter()
            .map(|h| pose_from_homography(&model.k, h))
            .collect::<Result<Vec<_>, _>>()?;
        let rms = rms_error(&model, object_points, image_points, &poses);

        Ok(SolverOutput { model, poses, rms })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn board() -> Vec<Point3<f64>> {
        (0..6)
            .flat_map(|i| (0..8).map(move |j| Point3::new(j as f64 * 0.03, i as f64 * 0.03, 0.0)))
            .collect()
    }

    fn pose(rx: f64, ry: f64, rz: f64, t: [f64; 3]) -> Isometry3<f64> {
        Isometry3::from_parts(
            Translation3::new(t[0], t[1], t[2]),
            UnitQuaternion::from_euler_angles(rx, ry, rz),
        )
    }

    fn views(cam: &CameraModel) -> (Vec<Vec<Point3<f64>>>, Vec<Vec<Point2<f64>>>) {
        let poses = [
            pose(0.2, -0.1, 0.05, [-0.1, -0.07, 0.6]),
            pose(-0.25, 0.15, -0.1, [-0.12, -0.05, 0.55]),
            pose(0.1, 0.3, 0.2, [-0.08, -0.1, 0.7]),
            pose(-0.3, -0.25, 0.0, [-0.1, -0.08, 0.65]),
            pose(0.35, 0.05, -0.15, [-0.11, -0.06, 0.6]),
        ];
        let obj = board();
        let object: Vec<_> = poses.iter().map(|_| obj.clone()).collect();
        let image = poses.iter().map(|p| cam.project(&obj, p)).collect();
        (object, image)
    }

    #[test]
    fn recovers_pinhole_intrinsics() {
        let truth = CameraModel::pinhole(620.0, 610.0, 330.0, 235.0);
        let (object, image) = views(&truth);
        let out = PlanarSolver::default()
            .calibrate(&object, &image, (640, 480))
            .unwrap();
        assert!((out.model.fx() - 620.0).abs() < 1.0, "fx {}", out.model.fx());
        assert!((out.model.fy() - 610.0).abs() < 1.0, "fy {}", out.model.fy());
        assert!((out.model.cx() - 330.0).abs() < 1.0);
        assert!((out.model.cy() - 235.0).abs() < 1.0);
        assert!(out.rms < 0.05, "rms {}", out.rms);
        assert_eq!(out.poses.len(), 5);
        assert!(out.poses.iter().all(|p| p.translation.z > 0.0));
    }

    #[test]
    fn estimates_radial_distortion() {
        let mut truth = CameraModel::pinhole(600.0, 600.0, 320.0, 240.0);
        truth.distortion = vec![-0.12, 0.0, 0.0, 0.0, 0.0];
        let (object, image) = views(&truth);
        let out = PlanarSolver::default()
            .calibrate(&object, &image, (640, 480))
            .unwrap();
        assert!(out.model.distortion[0] < 0.0, "k1 {}", out.model.distortion[0]);
        assert!(out.rms.is_finite());
        assert_eq!(out.model.distortion.len(), 5);
    }

    #[test]
    fn rejects_too_few_views() {
        let truth = CameraModel::pinhole(600.0, 600.0, 320.0, 240.0);
        let (object, image) = views(&truth);
        let err = PlanarSolver::default()
            .calibrate(&object[..2], &image[..2], (640, 480))
            .unwrap_err();
        assert_eq!(
            err,
            SolverError::NotEnoughViews {
                found: 2,
                required: 3
            }
        );
    }

    #[test]
    fn rejects_non_planar_points() {
        let truth = CameraModel::pinhole(600.0, 600.0, 320.0, 240.0);
        let (mut object, image) = views(&truth);
        object[1][3].z = 0.01;
        assert_eq!(
            PlanarSolver::default()
                .calibrate(&object, &image, (640, 480))
                .unwrap_err(),
            SolverError::NonPlanar(1)
        );
    }
}
