//! Shared primitives for the groundmap calibration crates.
//!
//! Planar homographies (DLT, 4-point solve, RANSAC), 8-bit image buffers,
//! JSON persistence records and a small logger. Nothing here knows about
//! calibration sessions.

mod homography;
mod image;
mod logger;
mod ransac;
mod robust;
pub mod storage;

pub use homography::{
    estimate_homography, has_collinear_triple, homography_from_4pt, transfer_error,
    transform_points, Homography,
};
pub use image::{sample_bilinear, sample_bilinear_u8, Frame, FrameError, GrayImage, GrayImageView};
pub use ransac::{ransac, Consensus, Estimator, RansacParams};
pub use robust::{
    DltHomographySolver, HomographyError, HomographySolver, RansacHomographySolver,
    MIN_HOMOGRAPHY_POINTS,
};
pub use storage::{Document, MatrixRecord, StorageError};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::{init_from_env, init_with_level, level_from_env, LOG_ENV};
