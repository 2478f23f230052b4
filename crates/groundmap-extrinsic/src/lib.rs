//! Image to ground plane mapping.
//!
//! A [`GroundMapping`] collects pixel/ground point pairs, either clicked by
//! hand or derived from registered fiducial markers, and solves the planar
//! homography between them. Points then map both ways, optionally relative to
//! a chosen origin in Cartesian or polar form.
//!
//! ```
//! use groundmap_extrinsic::{GroundMapping, MappingParams};
//! use nalgebra::Point2;
//!
//! let mut mapping = GroundMapping::new();
//! for (px, g) in [
//!     ((100.0, 400.0), (0.0, 0.0)),
//!     ((540.0, 400.0), (4.0, 0.0)),
//!     ((480.0, 120.0), (4.0, 3.0)),
//!     ((160.0, 120.0), (0.0, 3.0)),
//! ] {
//!     mapping.add_point(Point2::new(px.0, px.1), Point2::new(g.0, g.1));
//! }
//! mapping.solve(&MappingParams::default()).unwrap();
//! let ground = mapping.image_to_ground(Point2::new(540.0, 400.0));
//! assert!((ground.x - 4.0).abs() < 1e-6);
//! ```

mod coords;
mod error;
mod io;
mod mapping;
mod markers;
mod overlay;
mod registry;
mod shared;

pub use coords::{CoordinateSystem, CoordinateType, Polar};
pub use error::{CoordinateError, MappingError, MappingIoError, MarkerCalibrationError};
pub use io::HomographyFile;
pub use mapping::{
    Correspondence, GroundMapping, HomographyPair, InverseMode, MappingJob, MappingOutcome,
    MappingParams, ResidualStats,
};
pub use markers::{
    calibrate_from_markers, detect_registered, match_markers, MarkerDetection, MarkerDetector,
    MarkerMatch, MarkerReport,
};
pub use overlay::{axes, grid_lines, Axes, GridSpec, Segment};
pub use registry::MarkerRegistry;
pub use shared::{GroundMapper, MapperStatus};
