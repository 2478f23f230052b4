//! Correspondence accumulator and solve lifecycle for intrinsic calibration.

use std::borrow::Cow;

use groundmap_core::Frame;
use nalgebra::{Isometry3, Point2, Point3};
use serde::{Deserialize, Serialize};

use crate::camera::CameraModel;
use crate::config::SessionConfig;
use crate::detect::{detect_with_ladder, PatternDetector};
use crate::error::{AddImageError, SolveError};
use crate::quality::{evaluate, should_accept, ImageQualityMetrics, QualityCheckLevel};
use crate::solver::{CameraSolver, SolverError};
use crate::undistort::undistort_or_passthrough;
use crate::BoardSpec;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Object and image points of one accepted frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationView {
    pub object_points: Vec<Point3<f64>>,
    pub image_points: Vec<Point2<f64>>,
}

/// Solved (or loaded) lens model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicModel {
    pub camera: CameraModel,
    /// RMS reprojection error in pixels.
    pub reprojection_error: f64,
}

/// Frame that passed detection and the quality gate.
#[derive(Clone, Debug)]
pub struct AcceptedImage {
    pub image_size: (usize, usize),
    pub points: Vec<Point2<f64>>,
    pub metrics: ImageQualityMetrics,
}

/// Result of a successful solve.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SolveReport {
    pub reprojection_error: f64,
    /// RMS per view, same order as the accepted images.
    pub per_view_errors: Vec<f64>,
    /// Error returned by the solver itself.
    pub solver_rms: f64,
    pub image_count: usize,
    /// Views dropped because their corner count did not match the board.
    pub discarded: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub image_count: usize,
    pub calibrated: bool,
    pub reprojection_error: Option<f64>,
    pub image_size: Option<(usize, usize)>,
    pub board: BoardSpec,
    pub quality_level: QualityCheckLevel,
}

/// Snapshot handed to the solver, detached from the session.
#[derive(Clone, Debug)]
pub struct SolveJob {
    generation: u64,
    image_size: (usize, usize),
    object_points: Vec<Vec<Point3<f64>>>,
    image_points: Vec<Vec<Point2<f64>>>,
    discarded: usize,
}

/// Solver result waiting to be published.
#[derive(Clone, Debug)]
pub struct SolveOutcome {
    generation: u64,
    model: IntrinsicModel,
    report: SolveReport,
}

fn new_session_id() -> String {
    chrono::Utc::now()
        .format("calibration_%Y%m%d_%H%M%S_%3f")
        .to_string()
}

/// Detect, refine and score a frame without touching any session.
pub fn analyze_frame(
    frame: &Frame,
    detector: &dyn PatternDetector,
    config: &SessionConfig,
) -> Result<AcceptedImage, AddImageError> {
    config.board.validate()?;
    let gray = frame.to_gray()?;

    let Some(hit) = detect_with_ladder(detector, &gray, &config.board, &config.ladder) else {
        return Err(AddImageError::PatternNotFound {
            strategies: config.ladder.len(),
        });
    };
    let points = detector.refine(&gray, &hit.points, &config.subpix);

    let metrics = evaluate(&gray.view(), &points, &config.board);
    if !should_accept(&metrics, config.quality_level) {
        return Err(AddImageError::QualityRejected {
            threshold: config.quality_level.min_corner_confidence(),
            metrics: Box::new(metrics),
        });
    }

    let expected = config.board.point_count();
    if points.len() != expected {
        return Err(AddImageError::CornerCount {
            found: points.len(),
            expected,
        });
    }

    Ok(AcceptedImage {
        image_size: frame.size(),
        points,
        metrics,
    })
}

/// Per-view and aggregate RMS reprojection error.
pub fn reprojection_errors(
    camera: &CameraModel,
    object_points: &[Vec<Point3<f64>>],
    image_points: &[Vec<Point2<f64>>],
    poses: &[Isometry3<f64>],
) -> (f64, Vec<f64>) {
    let mut total_sq = 0.0;
    let mut total_n = 0usize;
    let mut per_view = Vec::with_capacity(poses.len());
    for ((obj, img), pose) in object_points.iter().zip(image_points).zip(poses) {
        let sq: f64 = camera
            .project(obj, pose)
            .iter()
            .zip(img)
            .map(|(p, o)| (p - o).norm_squared())
            .sum();
        per_view.push(if img.is_empty() {
            0.0
        } else {
            (sq / img.len() as f64).sqrt()
        });
        total_sq += sq;
        total_n += img.len();
    }
    let rms = if total_n == 0 {
        0.0
    } else {
        (total_sq / total_n as f64).sqrt()
    };
    (rms, per_view)
}

impl SolveJob {
    pub fn image_count(&self) -> usize {
        self.image_points.len()
    }

    /// Session generation the snapshot was taken at.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Run the solver; the reported error is recomputed from the returned poses.
    #[cfg_attr(feature = "tracing", instrument(level = "info", skip_all, fields(images = self.image_points.len())))]
    pub fn run(&self, solver: &dyn CameraSolver) -> Result<SolveOutcome, SolveError> {
        let out = solver.calibrate(&self.object_points, &self.image_points, self.image_size)?;
        if out.poses.len() != self.image_points.len() {
            return Err(SolveError::Solver(SolverError::Degenerate(
                "solver returned a pose count that does not match the views",
            )));
        }
        let (rms, per_view_errors) =
            reprojection_errors(&out.model, &self.object_points, &self.image_points, &out.poses);
        if !rms.is_finite() {
            return Err(SolveError::Solver(SolverError::Degenerate(
                "non-finite reprojection error",
            )));
        }
        Ok(SolveOutcome {
            generation: self.generation,
            model: IntrinsicModel {
                camera: out.model,
                reprojection_error: rms,
            },
            report: SolveReport {
                reprojection_error: rms,
                per_view_errors,
                solver_rms: out.rms,
                image_count: self.image_points.len(),
                discarded: self.discarded,
            },
        })
    }
}

/// Accumulated correspondences plus the current model.
///
/// Views own both point lists, so object and image point counts always
/// agree.
#[derive(Clone, Debug)]
pub struct IntrinsicSession {
    session_id: String,
    views: Vec<CalibrationView>,
    image_size: Option<(usize, usize)>,
    model: Option<IntrinsicModel>,
    last_metrics: Option<ImageQualityMetrics>,
    generation: u64,
}

impl Default for IntrinsicSession {
    fn default() -> Self {
        Self::new()
    }
}

impl IntrinsicSession {
    pub fn new() -> Self {
        Self {
            session_id: new_session_id(),
            views: Vec::new(),
            image_size: None,
            model: None,
            last_metrics: None,
            generation: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn image_count(&self) -> usize {
        self.views.len()
    }

    pub fn views(&self) -> &[CalibrationView] {
        &self.views
    }

    pub fn object_points(&self) -> Vec<Vec<Point3<f64>>> {
        self.views.iter().map(|v| v.object_points.clone()).collect()
    }

    pub fn image_points(&self) -> Vec<Vec<Point2<f64>>> {
        self.views.iter().map(|v| v.image_points.clone()).collect()
    }

    pub fn image_size(&self) -> Option<(usize, usize)> {
        self.image_size
    }

    pub fn is_calibrated(&self) -> bool {
        self.model.is_some()
    }

    pub fn model(&self) -> Option<&IntrinsicModel> {
        self.model.as_ref()
    }

    pub fn last_metrics(&self) -> Option<&ImageQualityMetrics> {
        self.last_metrics.as_ref()
    }

    /// Bumped by every change to the accumulated views or the model.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn status(&self, config: &SessionConfig) -> SessionStatus {
        SessionStatus {
            session_id: self.session_id.clone(),
            image_count: self.views.len(),
            calibrated: self.is_calibrated(),
            reprojection_error: self.model.as_ref().map(|m| m.reprojection_error),
            image_size: self.image_size,
            board: config.board,
            quality_level: config.quality_level,
        }
    }

    pub fn check_image_size(&self, frame: &Frame) -> Result<(), AddImageError> {
        match self.image_size {
            Some(expected) if expected != frame.size() => Err(AddImageError::ImageSizeMismatch {
                expected,
                found: frame.size(),
            }),
            _ => Ok(()),
        }
    }

    /// Record the metrics of an analysis attempt for status queries.
    pub fn note_metrics(&mut self, result: &Result<AcceptedImage, AddImageError>) {
        match result {
            Ok(accepted) => self.last_metrics = Some(accepted.metrics.clone()),
            Err(AddImageError::QualityRejected { metrics, .. }) => {
                self.last_metrics = Some((**metrics).clone())
            }
            Err(_) => {}
        }
    }

    /// Append an accepted frame. The first one fixes the session image size.
    pub fn push(
        &mut self,
        accepted: AcceptedImage,
        config: &SessionConfig,
    ) -> Result<(), AddImageError> {
        if let Some(expected) = self.image_size {
            if expected != accepted.image_size {
                return Err(AddImageError::ImageSizeMismatch {
                    expected,
                    found: accepted.image_size,
                });
            }
        }
        let expected = config.board.point_count();
        if accepted.points.len() != expected {
            return Err(AddImageError::CornerCount {
                found: accepted.points.len(),
                expected,
            });
        }

        let template = config.board.object_points();
        self.image_size.get_or_insert(accepted.image_size);
        self.last_metrics = Some(accepted.metrics);
        self.views.push(CalibrationView {
            object_points: template,
            image_points: accepted.points,
        });
        self.generation += 1;
        Ok(())
    }

    /// Detect the board in `frame` and append it when accepted.
    ///
    /// On any error the accumulated views are left unchanged.
    #[cfg_attr(feature = "tracing", instrument(level = "info", skip_all, fields(session = %self.session_id)))]
    pub fn add_image(
        &mut self,
        frame: &Frame,
        detector: &dyn PatternDetector,
        config: &SessionConfig,
    ) -> Result<ImageQualityMetrics, AddImageError> {
        let result = frame
            .validate()
            .map_err(AddImageError::from)
            .and_then(|_| self.check_image_size(frame))
            .and_then(|_| analyze_frame(frame, detector, config));
        self.note_metrics(&result);

        let outcome = result.and_then(|accepted| {
            let metrics = accepted.metrics.clone();
            self.push(accepted, config).map(|_| metrics)
        });
        match &outcome {
            Ok(m) => log::info!(
                "image {} accepted (confidence {:.2}, {:?})",
                self.views.len(),
                m.corner_confidence,
                m.level
            ),
            Err(e) => log::warn!("image rejected: {e}"),
        }
        outcome
    }

    /// Validate the accumulated views and snapshot them for a solve.
    ///
    /// Views whose corner count does not match `config.board` are dropped
    /// here. On an error nothing but that repair has happened.
    pub fn prepare_solve(&mut self, config: &SessionConfig) -> Result<SolveJob, SolveError> {
        if self.views.is_empty() {
            return Err(SolveError::NoImages);
        }
        let Some(image_size) = self.image_size.filter(|&(w, h)| w > 0 && h > 0) else {
            return Err(SolveError::NoImageSize);
        };

        let expected = config.board.point_count();
        let before = self.views.len();
        self.views.retain(|v| v.image_points.len() == expected);
        let discarded = before - self.views.len();
        if discarded > 0 {
            log::warn!("dropped {discarded} views with a corner count other than {expected}");
            self.generation += 1;
        }

        let required = config.min_images.max(1);
        if self.views.len() < required {
            return Err(SolveError::NotEnoughImages {
                found: self.views.len(),
                required,
            });
        }

        let mut regenerated = false;
        for view in &mut self.views {
            if view.object_points.len() != view.image_points.len() {
                view.object_points = config.board.object_points();
                regenerated = true;
            }
        }
        if regenerated {
            self.generation += 1;
        }

        Ok(SolveJob {
            generation: self.generation,
            image_size,
            object_points: self.object_points(),
            image_points: self.image_points(),
            discarded,
        })
    }

    /// Install a solve outcome if the views did not change in the meantime.
    pub fn publish(&mut self, outcome: SolveOutcome) -> Result<SolveReport, SolveError> {
        if outcome.generation != self.generation {
            return Err(SolveError::Stale);
        }
        log::info!(
            "calibration solved: {} images, reprojection error {:.4} px",
            outcome.report.image_count,
            outcome.report.reprojection_error
        );
        self.model = Some(outcome.model);
        self.generation += 1;
        Ok(outcome.report)
    }

    /// Mark the session uncalibrated after a failed solver run on the
    /// snapshot taken at `generation`. Returns `false`, leaving the session
    /// alone, when it changed since the snapshot.
    pub fn invalidate(&mut self, generation: u64) -> bool {
        if generation != self.generation {
            log::debug!("ignoring failure of a stale solve");
            return false;
        }
        if self.model.take().is_some() {
            self.generation += 1;
        }
        true
    }

    /// Run the whole solve synchronously.
    ///
    /// Missing data leaves the current model alone; a solver failure clears it.
    pub fn solve(
        &mut self,
        solver: &dyn CameraSolver,
        config: &SessionConfig,
    ) -> Result<SolveReport, SolveError> {
        let job = self.prepare_solve(config)?;
        match job.run(solver) {
            Ok(outcome) => self.publish(outcome),
            Err(e) => {
                log::warn!("calibration failed: {e}");
                self.invalidate(job.generation());
                Err(e)
            }
        }
    }

    /// Drop all views and the model; configuration is not touched.
    pub fn clear(&mut self) {
        self.views.clear();
        self.image_size = None;
        self.model = None;
        self.last_metrics = None;
        self.generation += 1;
    }

    /// [`IntrinsicSession::clear`] plus a fresh session id.
    pub fn start_new(&mut self) {
        self.clear();
        self.session_id = new_session_id();
        log::info!("started calibration session {}", self.session_id);
    }

    /// Replace the model (e.g. after loading from disk); accumulated views are dropped.
    pub fn install_model(&mut self, model: IntrinsicModel) {
        self.views.clear();
        self.image_size = None;
        self.last_metrics = None;
        self.model = Some(model);
        self.generation += 1;
    }

    /// Undistort with the current model, or return the frame untouched.
    pub fn undistort<'a>(&self, frame: &'a Frame) -> Cow<'a, Frame> {
        undistort_or_passthrough(frame, self.model.as_ref().map(|m| &m.camera))
    }
}
