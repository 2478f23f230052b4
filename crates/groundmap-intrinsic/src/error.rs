use groundmap_core::{FrameError, StorageError};

use crate::board::BoardError;
use crate::camera::ModelError;
use crate::quality::ImageQualityMetrics;
use crate::solver::SolverError;

/// Why a frame was not added to the session. The session is unchanged.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AddImageError {
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),
    #[error("invalid board: {0}")]
    Board(#[from] BoardError),
    #[error("frame is {found:?} but session images are {expected:?}")]
    ImageSizeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("calibration pattern not found after {strategies} detection strategies")]
    PatternNotFound { strategies: usize },
    #[error(
        "corner confidence {confidence:.2} below {threshold:.2}",
        confidence = .metrics.corner_confidence
    )]
    QualityRejected {
        metrics: Box<ImageQualityMetrics>,
        threshold: f64,
    },
    #[error("detector returned {found} corners, board has {expected}")]
    CornerCount { found: usize, expected: usize },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SolveError {
    #[error("no calibration images")]
    NoImages,
    #[error("image size has not been recorded")]
    NoImageSize,
    #[error("need at least {required} valid images, have {found}")]
    NotEnoughImages { found: usize, required: usize },
    #[error("camera solver failed: {0}")]
    Solver(#[from] SolverError),
    #[error("session changed while the solve was running")]
    Stale,
}

#[derive(thiserror::Error, Debug)]
pub enum PersistenceError {
    #[error("camera is not calibrated")]
    NotCalibrated,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("invalid camera model: {0}")]
    Model(#[from] ModelError),
    #[error("invalid board geometry: {0}")]
    Board(#[from] BoardError),
    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigIoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Board(#[from] BoardError),
}
