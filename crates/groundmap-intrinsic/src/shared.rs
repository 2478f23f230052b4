//! Thread-safe calibration session for capture loops and request handlers.
//!
//! Configuration and accumulated state sit behind separate mutexes. Detection
//! and the solver run outside the state lock on snapshots; results are
//! published under a short lock and discarded if the session changed.

use std::borrow::Cow;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use groundmap_core::Frame;
use nalgebra::{Point2, Point3};

use crate::config::SessionConfig;
use crate::detect::PatternDetector;
use crate::error::{AddImageError, PersistenceError, SolveError};
use crate::io::CalibrationFile;
use crate::quality::{ImageQualityMetrics, QualityCheckLevel};
use crate::session::{analyze_frame, IntrinsicModel, IntrinsicSession, SessionStatus, SolveReport};
use crate::solver::{CameraSolver, PlanarSolver};
use crate::undistort::undistort_or_passthrough;
use crate::{BoardError, BoardSpec};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct CalibrationSession {
    config: Mutex<SessionConfig>,
    state: Mutex<IntrinsicSession>,
    detector: Arc<dyn PatternDetector>,
    solver: Arc<dyn CameraSolver>,
}

impl CalibrationSession {
    /// Session with the default configuration and the linear planar solver.
    pub fn new(detector: Arc<dyn PatternDetector>) -> Self {
        Self::with_parts(detector, Arc::new(PlanarSolver::default()), SessionConfig::default())
    }

    pub fn with_parts(
        detector: Arc<dyn PatternDetector>,
        solver: Arc<dyn CameraSolver>,
        config: SessionConfig,
    ) -> Self {
        Self {
            config: Mutex::new(config),
            state: Mutex::new(IntrinsicSession::new()),
            detector,
            solver,
        }
    }

    pub fn config(&self) -> SessionConfig {
        lock(&self.config).clone()
    }

    pub fn set_config(&self, config: SessionConfig) -> Result<(), BoardError> {
        config.board.validate()?;
        *lock(&self.config) = config;
        Ok(())
    }

    /// Geometry for future images; accumulated points are not rescaled.
    pub fn set_board_spec(&self, cols: u32, rows: u32, square_size: f64) -> Result<(), BoardError> {
        let board = BoardSpec::new(cols, rows, square_size)?;
        lock(&self.config).board = board;
        Ok(())
    }

    pub fn set_quality_level(&self, level: QualityCheckLevel) {
        lock(&self.config).quality_level = level;
    }

    pub fn add_image(&self, frame: &Frame) -> Result<ImageQualityMetrics, AddImageError> {
        let config = self.config();
        {
            let state = lock(&self.state);
            frame.validate()?;
            if let Err(e) = state.check_image_size(frame) {
                log::warn!("image rejected: {e}");
                return Err(e);
            }
        }

        let analyzed = analyze_frame(frame, self.detector.as_ref(), &config);

        let mut state = lock(&self.state);
        state.note_metrics(&analyzed);
        let outcome = analyzed.and_then(|accepted| {
            let metrics = accepted.metrics.clone();
            state.push(accepted, &config).map(|_| metrics)
        });
        match &outcome {
            Ok(m) => log::info!(
                "image {} accepted (confidence {:.2}, {:?})",
                state.image_count(),
                m.corner_confidence,
                m.level
            ),
            Err(e) => log::warn!("image rejected: {e}"),
        }
        outcome
    }

    pub fn solve(&self) -> Result<SolveReport, SolveError> {
        let config = self.config();
        let job = lock(&self.state).prepare_solve(&config)?;

        match job.run(self.solver.as_ref()) {
            Ok(outcome) => lock(&self.state).publish(outcome),
            Err(e) => {
                log::warn!("calibration failed: {e}");
                lock(&self.state).invalidate(job.generation());
                Err(e)
            }
        }
    }

    /// Fail-open undistortion with the current model.
    pub fn undistort<'a>(&self, frame: &'a Frame) -> Cow<'a, Frame> {
        let camera = lock(&self.state).model().map(|m| m.camera.clone());
        undistort_or_passthrough(frame, camera.as_ref())
    }

    pub fn is_calibrated(&self) -> bool {
        lock(&self.state).is_calibrated()
    }

    pub fn model(&self) -> Option<IntrinsicModel> {
        lock(&self.state).model().cloned()
    }

    pub fn image_count(&self) -> usize {
        lock(&self.state).image_count()
    }

    pub fn object_points(&self) -> Vec<Vec<Point3<f64>>> {
        lock(&self.state).object_points()
    }

    pub fn image_points(&self) -> Vec<Vec<Point2<f64>>> {
        lock(&self.state).image_points()
    }

    pub fn last_metrics(&self) -> Option<ImageQualityMetrics> {
        lock(&self.state).last_metrics().cloned()
    }

    pub fn status(&self) -> SessionStatus {
        let config = self.config();
        lock(&self.state).status(&config)
    }

    pub fn clear_session(&self) {
        lock(&self.state).clear();
    }

    pub fn start_new_session(&self) {
        lock(&self.state).start_new();
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PersistenceError> {
        let board = self.config().board;
        let file = {
            let state = lock(&self.state);
            let model = state.model().cloned().ok_or(PersistenceError::NotCalibrated)?;
            CalibrationFile::new(model, board, state.image_count())
        };
        file.save(path)
    }

    /// Load a calibration file; on success it replaces the model and board
    /// geometry and drops accumulated images. On error nothing changes.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<(), PersistenceError> {
        let file = CalibrationFile::load(path)?;
        lock(&self.config).board = file.board;
        lock(&self.state).install_model(file.model);
        Ok(())
    }
}
