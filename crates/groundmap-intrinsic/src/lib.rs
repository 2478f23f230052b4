//! Intrinsic camera calibration from chessboard images.
//!
//! Frames go through a pattern detector (fallback ladder plus sub-pixel
//! refinement), a quality gate on corner confidence, and into an
//! [`IntrinsicSession`]. Once enough views are collected the session solves
//! for the camera matrix and distortion, which can then be saved, loaded and
//! used to undistort frames.
//!
//! ```
//! use groundmap_intrinsic::{BoardSpec, IntrinsicSession, SessionConfig};
//!
//! let config = SessionConfig::with_board(BoardSpec::new(8, 5, 0.03).unwrap());
//! let session = IntrinsicSession::new();
//! assert_eq!(session.status(&config).image_count, 0);
//! ```

mod board;
mod camera;
mod config;
mod detect;
mod error;
mod io;
mod preprocess;
mod quality;
mod session;
mod shared;
mod solver;
mod undistort;

pub use board::{BoardError, BoardSpec};
pub use camera::{CameraModel, ModelError, SUPPORTED_DISTORTION_LENGTHS};
pub use config::{SessionConfig, MIN_CALIBRATION_IMAGES};
pub use detect::{
    default_ladder, detect_with_ladder, refine_corners, DetectFlags, DetectionStrategy, LadderHit,
    PatternDetector, SubPixParams,
};
pub use error::{AddImageError, ConfigIoError, PersistenceError, SolveError};
pub use io::CalibrationFile;
pub use preprocess::{equalize_histogram, gaussian_blur, stretch_contrast, Preprocess};
pub use quality::{
    advisories, evaluate, should_accept, Advisory, ImageQualityMetrics, QualityCheckLevel,
    QualityLevel,
};
pub use session::{
    analyze_frame, reprojection_errors, AcceptedImage, CalibrationView, IntrinsicModel,
    IntrinsicSession, SessionStatus, SolveJob, SolveOutcome, SolveReport,
};
pub use shared::CalibrationSession;
pub use solver::{
    CameraSolver, PlanarSolver, PlanarSolverOptions, SolverError, SolverOutput, MIN_SOLVER_VIEWS,
};
pub use undistort::{undistort_frame, undistort_or_passthrough};
