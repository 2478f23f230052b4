//! Robust planar homography fitting behind the [`HomographySolver`] capability.

use nalgebra::Point2;

use crate::homography::{
    estimate_homography, homography_from_4pt, transfer_error, Homography,
};
use crate::ransac::{ransac, Estimator, RansacParams};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Minimum number of correspondences needed to fit a homography.
pub const MIN_HOMOGRAPHY_POINTS: usize = 4;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum HomographyError {
    #[error("need at least {required} correspondences, got {found}")]
    NotEnoughPoints { found: usize, required: usize },
    #[error("source has {src} points but destination has {dst}")]
    LengthMismatch { src: usize, dst: usize },
    #[error("correspondences are degenerate (collinear or coincident)")]
    Degenerate,
    #[error("no consensus: best model had {inliers} inliers, need {required}")]
    NoConsensus { inliers: usize, required: usize },
}

/// Fit `H` with `dst ~ H * src`.
///
/// Implementations must be callable from several threads at once.
pub trait HomographySolver: Send + Sync {
    fn solve(&self, src: &[Point2<f64>], dst: &[Point2<f64>])
        -> Result<Homography, HomographyError>;
}

fn check_input(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Result<(), HomographyError> {
    if src.len() != dst.len() {
        return Err(HomographyError::LengthMismatch {
            src: src.len(),
            dst: dst.len(),
        });
    }
    if src.len() < MIN_HOMOGRAPHY_POINTS {
        return Err(HomographyError::NotEnoughPoints {
            found: src.len(),
            required: MIN_HOMOGRAPHY_POINTS,
        });
    }
    Ok(())
}

/// Plain least-squares DLT over every correspondence.
#[derive(Clone, Copy, Debug, Default)]
pub struct DltHomographySolver;

impl HomographySolver for DltHomographySolver {
    fn solve(
        &self,
        src: &[Point2<f64>],
        dst: &[Point2<f64>],
    ) -> Result<Homography, HomographyError> {
        check_input(src, dst)?;
        estimate_homography(src, dst).ok_or(HomographyError::Degenerate)
    }
}

struct HomographyEstimator;

impl Estimator for HomographyEstimator {
    type Datum = (Point2<f64>, Point2<f64>);
    type Model = Homography;

    const MIN_SAMPLES: usize = MIN_HOMOGRAPHY_POINTS;

    fn fit(data: &[Self::Datum], sample: &[usize]) -> Option<Self::Model> {
        let src = [
            data[sample[0]].0,
            data[sample[1]].0,
            data[sample[2]].0,
            data[sample[3]].0,
        ];
        let dst = [
            data[sample[0]].1,
            data[sample[1]].1,
            data[sample[2]].1,
            data[sample[3]].1,
        ];
        homography_from_4pt(&src, &dst)
    }

    fn residual(model: &Self::Model, datum: &Self::Datum) -> f64 {
        transfer_error(model, datum.0, datum.1)
    }

    fn refit(data: &[Self::Datum], inliers: &[usize]) -> Option<Self::Model> {
        let (src, dst): (Vec<_>, Vec<_>) = inliers.iter().map(|&i| data[i]).unzip();
        estimate_homography(&src, &dst)
    }
}

/// Outlier-tolerant solver: RANSAC over 4-point samples, DLT refit on the consensus set.
///
/// `params.threshold` is measured in destination units.
#[derive(Clone, Debug, Default)]
pub struct RansacHomographySolver {
    pub params: RansacParams,
}

impl RansacHomographySolver {
    pub fn new(params: RansacParams) -> Self {
        Self { params }
    }
}

impl HomographySolver for RansacHomographySolver {
    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip_all, fields(n = src.len())))]
    fn solve(
        &self,
        src: &[Point2<f64>],
        dst: &[Point2<f64>],
    ) -> Result<Homography, HomographyError> {
        check_input(src, dst)?;

        if let (Ok(s), Ok(d)) = (
            <&[Point2<f64>; 4]>::try_from(src),
            <&[Point2<f64>; 4]>::try_from(dst),
        ) {
            return homography_from_4pt(s, d).ok_or(HomographyError::Degenerate);
        }

        let data: Vec<_> = src.iter().copied().zip(dst.iter().copied()).collect();
        let Some(best) = ransac::<HomographyEstimator>(&data, &self.params) else {
            return Err(HomographyError::NoConsensus {
                inliers: 0,
                required: MIN_HOMOGRAPHY_POINTS,
            });
        };
        log::debug!(
            "homography consensus: {}/{} inliers, rms {:.4}, {} iterations",
            best.inliers.len(),
            data.len(),
            best.inlier_rms,
            best.iterations
        );
        Ok(best.model)
    }
}
