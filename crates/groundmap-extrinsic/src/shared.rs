//! Thread-safe ground mapper for capture loops and request handlers.
//!
//! Point pairs, coordinate system and marker registry share one mutex. Solves
//! and marker detection run on snapshots outside it; a point-pair solve is
//! dropped if the pairs changed meanwhile.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use groundmap_core::{Frame, Homography, HomographySolver};
use nalgebra::Point2;

use crate::coords::{CoordinateSystem, CoordinateType, Polar};
use crate::error::{CoordinateError, MappingError, MappingIoError, MarkerCalibrationError};
use crate::io::HomographyFile;
use crate::mapping::{
    Correspondence, GroundMapping, HomographyPair, InverseMode, MappingJob, MappingParams,
    ResidualStats,
};
use crate::markers::{detect_registered, MarkerDetector, MarkerReport};
use crate::overlay::{self, Axes, GridSpec, Segment};
use crate::registry::MarkerRegistry;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
struct Engine {
    solver: Arc<dyn HomographySolver>,
    mode: InverseMode,
}

#[derive(Default)]
struct MapperState {
    mapping: GroundMapping,
    coords: CoordinateSystem,
    registry: MarkerRegistry,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MapperStatus {
    pub calibrated: bool,
    pub point_count: usize,
    pub marker_count: usize,
    pub coordinate_type: CoordinateType,
    pub origin: Point2<f64>,
    pub residuals: Option<ResidualStats>,
}

pub struct GroundMapper {
    engine: Mutex<Engine>,
    state: Mutex<MapperState>,
}

impl Default for GroundMapper {
    fn default() -> Self {
        Self::new(MappingParams::default())
    }
}

impl GroundMapper {
    /// Mapper solving with [`RansacHomographySolver`](groundmap_core::RansacHomographySolver).
    pub fn new(params: MappingParams) -> Self {
        Self::with_solver(Arc::new(params.solver()), params.inverse)
    }

    pub fn with_solver(solver: Arc<dyn HomographySolver>, mode: InverseMode) -> Self {
        Self {
            engine: Mutex::new(Engine { solver, mode }),
            state: Mutex::new(MapperState::default()),
        }
    }

    /// Parameters for later solves; the current homography is kept.
    pub fn set_params(&self, params: MappingParams) {
        *lock(&self.engine) = Engine {
            solver: Arc::new(params.solver()),
            mode: params.inverse,
        };
    }

    pub fn add_point(&self, image: Point2<f64>, ground: Point2<f64>) {
        lock(&self.state).mapping.add_point(image, ground);
    }

    pub fn remove_last(&self) -> Option<Correspondence> {
        lock(&self.state).mapping.remove_last()
    }

    pub fn clear_points(&self) {
        lock(&self.state).mapping.clear();
    }

    pub fn pairs(&self) -> Vec<Correspondence> {
        lock(&self.state).mapping.pairs().to_vec()
    }

    pub fn point_count(&self) -> usize {
        lock(&self.state).mapping.point_count()
    }

    pub fn is_calibrated(&self) -> bool {
        lock(&self.state).mapping.is_calibrated()
    }

    pub fn homography(&self) -> Option<HomographyPair> {
        lock(&self.state).mapping.homography().copied()
    }

    /// Copy of the mapping, for callers that transform many points at once.
    pub fn mapping(&self) -> GroundMapping {
        lock(&self.state).mapping.clone()
    }

    pub fn solve(&self) -> Result<ResidualStats, MappingError> {
        let engine = lock(&self.engine).clone();
        let job = lock(&self.state).mapping.prepare_solve()?;

        match job.run(engine.solver.as_ref(), engine.mode) {
            Ok(outcome) => lock(&self.state).mapping.publish(outcome),
            Err(e) => {
                log::warn!("ground mapping solve failed: {e}");
                lock(&self.state).mapping.invalidate(job.generation());
                Err(e)
            }
        }
    }

    pub fn set_forward(&self, forward: Homography) -> Result<(), MappingError> {
        lock(&self.state).mapping.set_forward(forward)
    }

    pub fn image_to_ground(&self, p: Point2<f64>) -> Point2<f64> {
        lock(&self.state).mapping.image_to_ground(p)
    }

    pub fn ground_to_image(&self, p: Point2<f64>) -> Point2<f64> {
        lock(&self.state).mapping.ground_to_image(p)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), MappingIoError> {
        let file = HomographyFile::from_mapping(&lock(&self.state).mapping)?;
        file.save(path)
    }

    /// Replace pairs and homography from a file. On error nothing changes.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<(), MappingIoError> {
        let file = HomographyFile::load(path)?;
        file.apply_to(&mut lock(&self.state).mapping)
    }

    pub fn set_marker(&self, id: i32, ground: Point2<f64>) {
        lock(&self.state).registry.set(id, ground);
    }

    pub fn remove_marker(&self, id: i32) -> Option<Point2<f64>> {
        lock(&self.state).registry.remove(id)
    }

    pub fn marker(&self, id: i32) -> Option<Point2<f64>> {
        lock(&self.state).registry.get(id)
    }

    pub fn registry(&self) -> MarkerRegistry {
        lock(&self.state).registry.clone()
    }

    pub fn save_markers(&self, path: impl AsRef<Path>) -> Result<(), MappingIoError> {
        let registry = self.registry();
        registry.save(path)
    }

    /// Replace the registry from a file. On error nothing changes.
    pub fn load_markers(&self, path: impl AsRef<Path>) -> Result<(), MappingIoError> {
        let registry = MarkerRegistry::load(path)?;
        log::info!("loaded {} marker positions", registry.len());
        lock(&self.state).registry = registry;
        Ok(())
    }

    /// Calibrate from the registered markers visible in `frame`. Replaces the
    /// point pairs only when the solve succeeds.
    pub fn calibrate_from_markers(
        &self,
        frame: &Frame,
        detector: &dyn MarkerDetector,
    ) -> Result<MarkerReport, MarkerCalibrationError> {
        let engine = lock(&self.engine).clone();
        let registry = self.registry();

        let result = detect_registered(frame, detector, &registry).and_then(|found| {
            let outcome =
                MappingJob::detached(found.pairs)?.run(engine.solver.as_ref(), engine.mode)?;
            Ok((found.matched, found.unregistered, outcome))
        });
        let (matched, unregistered, outcome) = match result {
            Ok(r) => r,
            Err(e) => {
                log::warn!("marker calibration failed: {e}");
                return Err(e);
            }
        };
        let residuals = lock(&self.state).mapping.replace_with(outcome);
        Ok(MarkerReport {
            matched,
            unregistered,
            residuals,
        })
    }

    pub fn set_origin(&self, image_point: Point2<f64>) -> Result<Point2<f64>, CoordinateError> {
        let mut state = lock(&self.state);
        let MapperState {
            mapping, coords, ..
        } = &mut *state;
        coords.set_origin(mapping, image_point)
    }

    pub fn coordinate_system(&self) -> CoordinateSystem {
        lock(&self.state).coords
    }

    pub fn set_coordinate_type(&self, kind: CoordinateType) {
        lock(&self.state).coords.set_coordinate_type(kind);
    }

    pub fn set_coordinate_type_str(&self, name: &str) -> Result<(), CoordinateError> {
        lock(&self.state).coords.set_coordinate_type_str(name)
    }

    pub fn to_polar(&self, ground: Point2<f64>) -> Polar {
        lock(&self.state).coords.to_polar(ground)
    }

    pub fn to_cartesian(&self, polar: Polar) -> Point2<f64> {
        lock(&self.state).coords.to_cartesian(polar)
    }

    pub fn image_to_ground_relative(
        &self,
        image_point: Point2<f64>,
    ) -> Result<Point2<f64>, CoordinateError> {
        let state = lock(&self.state);
        state.coords.image_to_ground_relative(&state.mapping, image_point)
    }

    pub fn ground_to_image_relative(
        &self,
        relative: Point2<f64>,
    ) -> Result<Point2<f64>, CoordinateError> {
        let state = lock(&self.state);
        state.coords.ground_to_image_relative(&state.mapping, relative)
    }

    pub fn grid_lines(&self, spec: &GridSpec) -> Vec<Segment> {
        overlay::grid_lines(&lock(&self.state).mapping, spec)
    }

    pub fn axes(&self, length: f64) -> Option<Axes> {
        let state = lock(&self.state);
        overlay::axes(&state.mapping, &state.coords, length)
    }

    pub fn status(&self) -> MapperStatus {
        let state = lock(&self.state);
        MapperStatus {
            calibrated: state.mapping.is_calibrated(),
            point_count: state.mapping.point_count(),
            marker_count: state.registry.len(),
            coordinate_type: state.coords.coordinate_type(),
            origin: state.coords.origin(),
            residuals: state.mapping.residuals(),
        }
    }
}
