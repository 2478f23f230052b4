//! Image to ground plane mapping from point correspondences.
//!
//! The forward homography maps pixels to ground coordinates, the inverse maps
//! ground coordinates back to pixels. How the inverse is obtained is selected
//! by [`InverseMode`].

use groundmap_core::{
    transfer_error, Homography, HomographyError, HomographySolver, RansacHomographySolver,
    RansacParams, MIN_HOMOGRAPHY_POINTS,
};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::error::MappingError;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// One clicked or detected pair: a pixel and the ground point it shows.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Correspondence {
    pub image: Point2<f64>,
    pub ground: Point2<f64>,
}

impl Correspondence {
    pub fn new(image: Point2<f64>, ground: Point2<f64>) -> Self {
        Self { image, ground }
    }
}

/// How the ground to image transform is obtained.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InverseMode {
    /// One robust ground to image solve (threshold in pixels); the forward
    /// transform is its matrix inverse, so the pair round-trips exactly.
    #[default]
    Invert,
    /// Two robust solves, one per direction. The matrices are not exact
    /// inverses of each other and the RANSAC threshold applies to both
    /// destination units.
    Independent,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingParams {
    pub ransac: RansacParams,
    pub inverse: InverseMode,
}

impl MappingParams {
    pub fn solver(&self) -> RansacHomographySolver {
        RansacHomographySolver::new(self.ransac.clone())
    }
}

/// Forward (image to ground) and inverse (ground to image) transforms.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HomographyPair {
    pub forward: Homography,
    pub inverse: Homography,
}

impl HomographyPair {
    /// Pair derived from a known forward transform, `None` if it is singular.
    pub fn from_forward(forward: Homography) -> Option<Self> {
        let inverse = forward.inverse()?;
        Some(Self { forward, inverse })
    }
}

/// Image to ground residuals of the forward transform over the point pairs,
/// in ground units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResidualStats {
    pub mean: f64,
    pub max: f64,
}

impl ResidualStats {
    pub fn compute(forward: &Homography, pairs: &[Correspondence]) -> Self {
        if pairs.is_empty() {
            return Self::default();
        }
        let (sum, max) = pairs.iter().fold((0.0, 0.0_f64), |(sum, max), c| {
            let e = transfer_error(forward, c.image, c.ground);
            (sum + e, max.max(e))
        });
        Self {
            mean: sum / pairs.len() as f64,
            max,
        }
    }
}

/// Snapshot of the point pairs, solvable without holding the mapping.
#[derive(Clone, Debug)]
pub struct MappingJob {
    generation: u64,
    pairs: Vec<Correspondence>,
}

/// Result of a [`MappingJob`], applied with [`GroundMapping::publish`].
#[derive(Clone, Debug)]
pub struct MappingOutcome {
    generation: u64,
    pairs: Vec<Correspondence>,
    homography: HomographyPair,
    residuals: ResidualStats,
}

impl MappingOutcome {
    pub fn homography(&self) -> &HomographyPair {
        &self.homography
    }

    pub fn residuals(&self) -> ResidualStats {
        self.residuals
    }
}

impl MappingJob {
    /// Job over pairs that will replace the mapping's own, see
    /// [`GroundMapping::replace_with`].
    pub fn detached(pairs: Vec<Correspondence>) -> Result<Self, MappingError> {
        if pairs.len() < MIN_HOMOGRAPHY_POINTS {
            return Err(MappingError::NotEnoughPoints {
                found: pairs.len(),
                required: MIN_HOMOGRAPHY_POINTS,
            });
        }
        Ok(Self {
            generation: 0,
            pairs,
        })
    }

    pub fn pairs(&self) -> &[Correspondence] {
        &self.pairs
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip_all, fields(pairs = self.pairs.len(), mode = ?mode))
    )]
    pub fn run(
        &self,
        solver: &dyn HomographySolver,
        mode: InverseMode,
    ) -> Result<MappingOutcome, MappingError> {
        let (image, ground): (Vec<_>, Vec<_>) =
            self.pairs.iter().map(|c| (c.image, c.ground)).unzip();

        let homography = match mode {
            InverseMode::Invert => {
                let inverse = solver
                    .solve(&ground, &image)
                    .map_err(MappingError::DegenerateInverse)?;
                let forward = inverse
                    .inverse()
                    .ok_or(MappingError::DegenerateForward(HomographyError::Degenerate))?;
                HomographyPair { forward, inverse }
            }
            InverseMode::Independent => {
                let forward = solver
                    .solve(&image, &ground)
                    .map_err(MappingError::DegenerateForward)?;
                let inverse = solver
                    .solve(&ground, &image)
                    .map_err(MappingError::DegenerateInverse)?;
                if !forward.is_invertible() {
                    return Err(MappingError::DegenerateForward(HomographyError::Degenerate));
                }
                if !inverse.is_invertible() {
                    return Err(MappingError::DegenerateInverse(HomographyError::Degenerate));
                }
                HomographyPair { forward, inverse }
            }
        };

        Ok(MappingOutcome {
            generation: self.generation,
            pairs: self.pairs.clone(),
            residuals: ResidualStats::compute(&homography.forward, &self.pairs),
            homography,
        })
    }
}

/// Point pairs plus the homography solved from them.
///
/// Any change to the pairs drops the homography until the next solve.
#[derive(Clone, Debug, Default)]
pub struct GroundMapping {
    pairs: Vec<Correspondence>,
    homography: Option<HomographyPair>,
    residuals: Option<ResidualStats>,
    generation: u64,
}

impl GroundMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pairs(&self) -> &[Correspondence] {
        &self.pairs
    }

    pub fn point_count(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_calibrated(&self) -> bool {
        self.homography.is_some()
    }

    pub fn homography(&self) -> Option<&HomographyPair> {
        self.homography.as_ref()
    }

    pub fn forward(&self) -> Option<Homography> {
        self.homography.map(|h| h.forward)
    }

    pub fn inverse(&self) -> Option<Homography> {
        self.homography.map(|h| h.inverse)
    }

    /// Residuals of the last solve; `None` for assigned or loaded transforms.
    pub fn residuals(&self) -> Option<ResidualStats> {
        self.residuals
    }

    /// Bumped on every change to pairs or homography.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn touch(&mut self) {
        self.homography = None;
        self.residuals = None;
        self.generation += 1;
    }

    pub fn add_point(&mut self, image: Point2<f64>, ground: Point2<f64>) {
        self.pairs.push(Correspondence::new(image, ground));
        self.touch();
    }

    pub fn remove_last(&mut self) -> Option<Correspondence> {
        let removed = self.pairs.pop();
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
        self.touch();
    }

    /// Replace the pairs without solving.
    pub fn set_pairs(&mut self, pairs: Vec<Correspondence>) {
        self.pairs = pairs;
        self.touch();
    }

    /// Install a known forward transform; the inverse is its matrix inverse.
    pub fn set_forward(&mut self, forward: Homography) -> Result<(), MappingError> {
        let pair = HomographyPair::from_forward(forward)
            .ok_or(MappingError::DegenerateForward(HomographyError::Degenerate))?;
        self.homography = Some(pair);
        self.residuals = None;
        self.generation += 1;
        Ok(())
    }

    /// Replace pairs and homography in one step, as a loader does.
    pub fn restore(&mut self, pairs: Vec<Correspondence>, homography: HomographyPair) {
        self.pairs = pairs;
        self.homography = Some(homography);
        self.residuals = None;
        self.generation += 1;
    }

    /// Snapshot the pairs for a solve. Fewer than four pairs fail without
    /// touching the current homography.
    pub fn prepare_solve(&self) -> Result<MappingJob, MappingError> {
        if self.pairs.len() < MIN_HOMOGRAPHY_POINTS {
            return Err(MappingError::NotEnoughPoints {
                found: self.pairs.len(),
                required: MIN_HOMOGRAPHY_POINTS,
            });
        }
        Ok(MappingJob {
            generation: self.generation,
            pairs: self.pairs.clone(),
        })
    }

    pub fn publish(&mut self, outcome: MappingOutcome) -> Result<ResidualStats, MappingError> {
        if outcome.generation != self.generation {
            return Err(MappingError::Stale);
        }
        log::info!(
            "ground mapping solved from {} pairs, residual mean {:.4} max {:.4}",
            self.pairs.len(),
            outcome.residuals.mean,
            outcome.residuals.max
        );
        self.homography = Some(outcome.homography);
        self.residuals = Some(outcome.residuals);
        self.generation += 1;
        Ok(outcome.residuals)
    }

    /// Install the outcome's pairs and homography regardless of what changed
    /// since the job was taken.
    pub fn replace_with(&mut self, outcome: MappingOutcome) -> ResidualStats {
        log::info!(
            "ground mapping replaced with {} pairs, residual mean {:.4} max {:.4}",
            outcome.pairs.len(),
            outcome.residuals.mean,
            outcome.residuals.max
        );
        self.pairs = outcome.pairs;
        self.homography = Some(outcome.homography);
        self.residuals = Some(outcome.residuals);
        self.generation += 1;
        outcome.residuals
    }

    /// Drop the homography after a failed solve of `generation`.
    pub fn invalidate(&mut self, generation: u64) {
        if generation == self.generation && self.homography.is_some() {
            self.touch();
        }
    }

    pub fn solve_with(
        &mut self,
        solver: &dyn HomographySolver,
        mode: InverseMode,
    ) -> Result<ResidualStats, MappingError> {
        let job = self.prepare_solve()?;
        match job.run(solver, mode) {
            Ok(outcome) => self.publish(outcome),
            Err(e) => {
                log::warn!("ground mapping solve failed: {e}");
                self.invalidate(job.generation);
                Err(e)
            }
        }
    }

    /// Robust solve with [`RansacHomographySolver`].
    pub fn solve(&mut self, params: &MappingParams) -> Result<ResidualStats, MappingError> {
        self.solve_with(&params.solver(), params.inverse)
    }

    /// Ground point for `p`, or `None` when uncalibrated or `p` maps to infinity.
    pub fn try_image_to_ground(&self, p: Point2<f64>) -> Option<Point2<f64>> {
        self.homography.as_ref()?.forward.try_apply(p)
    }

    pub fn try_ground_to_image(&self, p: Point2<f64>) -> Option<Point2<f64>> {
        self.homography.as_ref()?.inverse.try_apply(p)
    }

    /// Ground point for pixel `p`. Without a homography `p` comes back as is.
    pub fn image_to_ground(&self, p: Point2<f64>) -> Point2<f64> {
        match &self.homography {
            Some(h) => h.forward.apply(p),
            None => {
                log::debug!("image_to_ground on an uncalibrated mapping, returning input");
                p
            }
        }
    }

    /// Pixel for ground point `p`. Without a homography `p` comes back as is.
    pub fn ground_to_image(&self, p: Point2<f64>) -> Point2<f64> {
        match &self.homography {
            Some(h) => h.inverse.apply(p),
            None => {
                log::debug!("ground_to_image on an uncalibrated mapping, returning input");
                p
            }
        }
    }
}
