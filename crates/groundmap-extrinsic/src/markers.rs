//! Marker-assisted ground calibration.
//!
//! Detected markers whose id is registered contribute one pair each: the
//! centroid of the four detected corners and the registered ground point.

use groundmap_core::{Frame, GrayImage, HomographySolver, MIN_HOMOGRAPHY_POINTS};
use nalgebra::{Point2, Vector2};

use crate::error::MarkerCalibrationError;
use crate::mapping::{Correspondence, GroundMapping, InverseMode, MappingJob, ResidualStats};
use crate::registry::MarkerRegistry;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// One decoded marker in image pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MarkerDetection {
    pub id: i32,
    pub corners: [Point2<f64>; 4],
}

impl MarkerDetection {
    pub fn centroid(&self) -> Point2<f64> {
        let sum = self
            .corners
            .iter()
            .fold(Vector2::<f64>::zeros(), |acc, c| acc + c.coords);
        Point2::from(sum * 0.25)
    }
}

/// Fiducial marker detection capability.
pub trait MarkerDetector: Send + Sync {
    fn detect(&self, image: &GrayImage) -> Vec<MarkerDetection>;
}

/// Detections split by registry membership.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MarkerMatch {
    pub pairs: Vec<Correspondence>,
    pub matched: Vec<i32>,
    pub unregistered: Vec<i32>,
}

pub fn match_markers(detections: &[MarkerDetection], registry: &MarkerRegistry) -> MarkerMatch {
    let mut out = MarkerMatch::default();
    for d in detections {
        match registry.get(d.id) {
            Some(ground) => {
                out.pairs.push(Correspondence::new(d.centroid(), ground));
                out.matched.push(d.id);
            }
            None => out.unregistered.push(d.id),
        }
    }
    out
}

/// Detect markers in `frame` and keep the registered ones. Fails unless at
/// least four registered markers are visible.
pub fn detect_registered(
    frame: &Frame,
    detector: &dyn MarkerDetector,
    registry: &MarkerRegistry,
) -> Result<MarkerMatch, MarkerCalibrationError> {
    let gray = frame.to_gray()?;
    let detections = detector.detect(&gray);
    if detections.is_empty() {
        return Err(MarkerCalibrationError::NoMarkers);
    }
    let found = match_markers(&detections, registry);
    log::debug!(
        "markers: {} detected, matched {:?}, unregistered {:?}",
        detections.len(),
        found.matched,
        found.unregistered
    );
    if found.pairs.len() < MIN_HOMOGRAPHY_POINTS {
        return Err(MarkerCalibrationError::NotEnoughRegistered {
            found: found.pairs.len(),
            required: MIN_HOMOGRAPHY_POINTS,
        });
    }
    Ok(found)
}

#[derive(Clone, Debug, PartialEq)]
pub struct MarkerReport {
    pub matched: Vec<i32>,
    pub unregistered: Vec<i32>,
    pub residuals: ResidualStats,
}

/// Replace the pairs of `mapping` with the registered markers seen in
/// `frame` and solve. `mapping` is only touched when the solve succeeds.
#[cfg_attr(feature = "tracing", instrument(level = "info", skip_all))]
pub fn calibrate_from_markers(
    mapping: &mut GroundMapping,
    frame: &Frame,
    detector: &dyn MarkerDetector,
    registry: &MarkerRegistry,
    solver: &dyn HomographySolver,
    mode: InverseMode,
) -> Result<MarkerReport, MarkerCalibrationError> {
    let found = detect_registered(frame, detector, registry)?;
    let outcome = MappingJob::detached(found.pairs)?.run(solver, mode)?;
    let residuals = mapping.replace_with(outcome);
    Ok(MarkerReport {
        matched: found.matched,
        unregistered: found.unregistered,
        residuals,
    })
}
