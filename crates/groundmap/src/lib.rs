//! Camera calibration and image-to-ground mapping.
//!
//! This crate provides:
//! - re-exports of the `groundmap-*` crates
//! - (feature `image`) conversion between `image` buffers and [`Frame`]
//! - (feature `tracing`) a subscriber that also carries `log` records
//!
//! ## Quickstart
//!
//! ```no_run
//! use groundmap::extrinsic::GroundMapper;
//! use nalgebra::Point2;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mapper = GroundMapper::default();
//! mapper.load("homography.json")?;
//! let ground = mapper.image_to_ground(Point2::new(320.0, 400.0));
//! println!("ground: ({:.3}, {:.3})", ground.x, ground.y);
//! # Ok(())
//! # }
//! ```
//!
//! ## API map
//! - `groundmap::core`: homographies, RANSAC, frames, JSON records, logger.
//! - `groundmap::intrinsic`: quality gate, detection ladder, camera solver,
//!   calibration sessions, undistortion.
//! - `groundmap::extrinsic`: ground mapping, marker registry, relative and
//!   polar coordinates, overlay geometry.
//! - `groundmap::convert` (feature `image`): `image` crate interop.

pub use groundmap_core as core;
pub use groundmap_extrinsic as extrinsic;
pub use groundmap_intrinsic as intrinsic;

pub use groundmap_core::{Frame, GrayImage, Homography, RansacParams};
pub use groundmap_extrinsic::{
    CoordinateType, GroundMapper, GroundMapping, MappingParams, MarkerDetector, MarkerRegistry,
};
pub use groundmap_intrinsic::{
    BoardSpec, CalibrationSession, CameraModel, PatternDetector, QualityCheckLevel,
    SessionConfig,
};

#[cfg(feature = "image")]
pub mod convert;

/// Install the `groundmap-core` tracing subscriber and route `log` records
/// through it.
///
/// Filtering follows `GROUNDMAP_LOG`, then `RUST_LOG`, then `info`. Later
/// calls are no-ops.
#[cfg(feature = "tracing")]
pub fn init_tracing(json: bool) {
    let _ = tracing_log::LogTracer::init();
    groundmap_core::init_tracing(json);
}
