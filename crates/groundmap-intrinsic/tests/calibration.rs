use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use groundmap_core::{Frame, GrayImage, Homography};
use groundmap_intrinsic::{
    AddImageError, BoardSpec, CalibrationSession, CameraModel, DetectFlags, PatternDetector,
    PersistenceError, PlanarSolver, SessionConfig, SolveError, SubPixParams,
};
use nalgebra::{Isometry3, Matrix3, Point2, Point3, Translation3, UnitQuaternion, Vector3};

/// Replays known corner positions, one set per detection call.
struct ReplayDetector {
    queue: Mutex<VecDeque<Vec<Point2<f64>>>>,
}

impl ReplayDetector {
    fn new(frames: &[Vec<Point2<f64>>]) -> Self {
        Self {
            queue: Mutex::new(frames.iter().cloned().collect()),
        }
    }
}

impl PatternDetector for ReplayDetector {
    fn detect(&self, _: &GrayImage, _: &BoardSpec, _: DetectFlags) -> Option<Vec<Point2<f64>>> {
        self.queue.lock().unwrap().pop_front()
    }

    fn refine(&self, _: &GrayImage, points: &[Point2<f64>], _: &SubPixParams) -> Vec<Point2<f64>> {
        points.to_vec()
    }
}

fn camera() -> CameraModel {
    CameraModel::pinhole(600.0, 600.0, 320.0, 240.0)
}

fn board() -> BoardSpec {
    BoardSpec::new(8, 5, 0.03).unwrap()
}

fn poses() -> Vec<Isometry3<f64>> {
    let b = board();
    let center = Vector3::new(
        (b.cols - 1) as f64 * b.square_size * 0.5,
        (b.rows - 1) as f64 * b.square_size * 0.5,
        0.0,
    );
    [
        (0.0, 0.0, 0.0),
        (0.3, 0.0, 0.1),
        (-0.25, 0.2, -0.05),
        (0.1, -0.3, 0.2),
        (-0.2, -0.2, -0.15),
        (0.25, 0.25, 0.0),
    ]
    .iter()
    .map(|&(rx, ry, rz)| {
        let rot = UnitQuaternion::from_euler_angles(rx, ry, rz);
        let t = Vector3::new(0.0, 0.0, 0.5) - rot * center;
        Isometry3::from_parts(Translation3::from(t), rot)
    })
    .collect()
}

/// Render the board seen through `pose` (white margin one square wide).
fn render(cam: &CameraModel, pose: &Isometry3<f64>) -> Frame {
    let b = board();
    let s = b.square_size;
    let m = pose.to_homogeneous();
    let plane = Matrix3::new(
        m[(0, 0)], m[(0, 1)], m[(0, 3)], //
        m[(1, 0)], m[(1, 1)], m[(1, 3)], //
        m[(2, 0)], m[(2, 1)], m[(2, 3)],
    );
    let img_from_board = Homography::new(cam.k * plane);
    let board_from_img = img_from_board.inverse().unwrap();

    let (cols, rows) = (b.cols as f64, b.rows as f64);
    let gray = GrayImage::from_fn(640, 480, |x, y| {
        let p = board_from_img.apply(Point2::new(x as f64, y as f64));
        let (u, v) = (p.x / s + 1.0, p.y / s + 1.0);
        if u < -1.0 || v < -1.0 || u >= cols + 2.0 || v >= rows + 2.0 {
            return 90;
        }
        if u < 0.0 || v < 0.0 || u >= cols + 1.0 || v >= rows + 1.0 {
            return 235;
        }
        if (u.floor() as i64 + v.floor() as i64) % 2 == 0 {
            20
        } else {
            235
        }
    });
    Frame::from_gray(gray)
}

fn corners(cam: &CameraModel, pose: &Isometry3<f64>) -> Vec<Point2<f64>> {
    cam.project(&board().object_points(), pose)
}

fn session_for(n: usize) -> (CalibrationSession, Vec<Frame>) {
    let cam = camera();
    let poses: Vec<_> = poses().into_iter().take(n).collect();
    let truth: Vec<_> = poses.iter().map(|p| corners(&cam, p)).collect();
    let frames = poses.iter().map(|p| render(&cam, p)).collect();
    let session = CalibrationSession::with_parts(
        Arc::new(ReplayDetector::new(&truth)),
        Arc::new(PlanarSolver::default()),
        SessionConfig::with_board(board()),
    );
    (session, frames)
}

#[test]
fn six_rendered_views_calibrate_below_one_pixel() {
    let (session, frames) = session_for(6);
    for frame in &frames {
        let metrics = session.add_image(frame).expect("frame accepted");
        assert_eq!(metrics.corner_confidence, 1.0);
    }
    assert_eq!(session.image_count(), 6);

    let report = session.solve().expect("solve");
    assert!(report.reprojection_error < 1.0, "error {}", report.reprojection_error);
    assert!(report.reprojection_error >= 0.0);
    assert_eq!(report.per_view_errors.len(), 6);
    assert!(session.is_calibrated());
    assert_eq!(session.image_count(), 6);

    let model = session.model().unwrap();
    assert!((model.camera.fx() - 600.0).abs() < 2.0);
    assert!((model.camera.cy() - 240.0).abs() < 2.0);

    let objects = session.object_points();
    let images = session.image_points();
    assert_eq!(objects.len(), images.len());
    assert!(images.iter().all(|v| v.len() == 40));
}

#[test]
fn four_images_are_not_enough_but_five_are() {
    let (session, frames) = session_for(5);
    for frame in &frames[..4] {
        session.add_image(frame).unwrap();
    }
    assert_eq!(
        session.solve().unwrap_err(),
        SolveError::NotEnoughImages {
            found: 4,
            required: 5
        }
    );
    assert!(!session.is_calibrated());

    session.add_image(&frames[4]).unwrap();
    let report = session.solve().unwrap();
    assert!(report.reprojection_error >= 0.0);
    assert!(session.is_calibrated());
}

#[test]
fn undistort_is_fail_open_before_calibration() {
    let (session, frames) = session_for(1);
    assert!(matches!(session.undistort(&frames[0]), Cow::Borrowed(_)));
}

#[test]
fn saved_calibration_loads_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("camera.json");

    let (session, frames) = session_for(6);
    assert!(matches!(
        session.save(&path),
        Err(PersistenceError::NotCalibrated)
    ));
    for frame in &frames {
        session.add_image(frame).unwrap();
    }
    session.solve().unwrap();
    session.save(&path).unwrap();
    let solved = session.model().unwrap();

    let (fresh, _) = session_for(0);
    fresh.set_board_spec(9, 6, 0.025).unwrap();
    fresh.load(&path).unwrap();
    assert!(fresh.is_calibrated());
    assert_eq!(fresh.config().board, board());
    let loaded = fresh.model().unwrap();
    for (a, b) in loaded.camera.k.iter().zip(solved.camera.k.iter()) {
        approx::assert_relative_eq!(*a, *b, epsilon = 1e-9);
    }
    assert_eq!(loaded.camera.distortion, solved.camera.distortion);
}

#[test]
fn size_mismatch_and_missing_pattern_are_rejected() {
    let (session, frames) = session_for(2);
    session.add_image(&frames[0]).unwrap();

    let small = Frame::from_gray(GrayImage::new(320, 240));
    assert!(matches!(
        session.add_image(&small),
        Err(AddImageError::ImageSizeMismatch { .. })
    ));

    session.add_image(&frames[1]).unwrap();
    // detector queue is exhausted now
    assert!(matches!(
        session.add_image(&frames[0]),
        Err(AddImageError::PatternNotFound { .. })
    ));
    assert_eq!(session.image_count(), 2);

    let status = session.status();
    assert_eq!(status.image_count, 2);
    assert_eq!(status.image_size, Some((640, 480)));
    assert!(!status.calibrated);

    session.clear_session();
    assert_eq!(session.image_count(), 0);
    assert_eq!(session.config().board, board());
}

#[test]
fn board_points_lie_on_the_plane() {
    let pts = board().object_points();
    assert_eq!(pts[8], Point3::new(0.0, 0.03, 0.0));
}
