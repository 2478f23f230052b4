//! Model-agnostic RANSAC loop.
//!
//! Implement [`Estimator`] for a model and call [`ransac`] with the data and a
//! [`RansacParams`]. The loop never panics: when no consensus is reached it
//! returns `None`.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Tunables for the RANSAC loop.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacParams {
    /// Upper bound on sampling iterations.
    pub max_iters: usize,
    /// Inlier residual threshold, in the estimator's residual units.
    pub threshold: f64,
    /// Desired probability of drawing at least one outlier-free sample.
    pub confidence: f64,
    /// Seed of the sampling RNG; fixed so solves are reproducible.
    pub seed: u64,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            max_iters: 2000,
            threshold: 3.0,
            confidence: 0.995,
            seed: 0x5eed_cafe,
        }
    }
}

/// Minimal-sample model fitting hooks used by [`ransac`].
pub trait Estimator {
    type Datum;
    type Model;

    /// Size of a minimal sample.
    const MIN_SAMPLES: usize;

    /// Fit from the sampled indices; `None` for degenerate samples.
    fn fit(data: &[Self::Datum], sample: &[usize]) -> Option<Self::Model>;

    /// Non-negative residual of one datum, same units as `RansacParams::threshold`.
    fn residual(model: &Self::Model, datum: &Self::Datum) -> f64;

    /// Least-squares refit on the consensus set.
    fn refit(_data: &[Self::Datum], _inliers: &[usize]) -> Option<Self::Model> {
        None
    }
}

/// Best consensus found by [`ransac`].
#[derive(Clone, Debug)]
pub struct Consensus<M> {
    pub model: M,
    pub inliers: Vec<usize>,
    /// RMS residual over `inliers`.
    pub inlier_rms: f64,
    pub iterations: usize,
}

fn rms(vals: &[f64]) -> f64 {
    if vals.is_empty() {
        return f64::INFINITY;
    }
    (vals.iter().map(|v| v * v).sum::<f64>() / vals.len() as f64).sqrt()
}

/// Adaptive iteration bound for the current inlier ratio.
fn required_iterations(params: &RansacParams, inlier_ratio: f64, min_samples: usize) -> usize {
    if params.confidence <= 0.0 || inlier_ratio <= 0.0 {
        return params.max_iters;
    }
    let denom = (1.0 - inlier_ratio.powi(min_samples as i32)).max(1e-12).ln();
    if denom >= 0.0 {
        return params.max_iters;
    }
    let n = ((1.0 - params.confidence.min(1.0 - 1e-12)).ln() / denom).ceil();
    (n.max(1.0) as usize).min(params.max_iters)
}

fn score<E: Estimator>(data: &[E::Datum], model: &E::Model, threshold: f64) -> (Vec<usize>, f64) {
    let mut inliers = Vec::new();
    let mut residuals = Vec::new();
    for (i, datum) in data.iter().enumerate() {
        let r = E::residual(model, datum);
        if r <= threshold {
            inliers.push(i);
            residuals.push(r);
        }
    }
    let rms = rms(&residuals);
    (inliers, rms)
}

/// Run RANSAC; returns the consensus with the most inliers (ties broken by RMS).
#[cfg_attr(feature = "tracing", instrument(level = "debug", skip(data, params), fields(n = data.len())))]
pub fn ransac<E: Estimator>(data: &[E::Datum], params: &RansacParams) -> Option<Consensus<E::Model>> {
    let n = data.len();
    if n < E::MIN_SAMPLES || E::MIN_SAMPLES == 0 {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut best: Option<Consensus<E::Model>> = None;
    let mut budget = params.max_iters;
    let mut iters = 0;

    while iters < budget {
        iters += 1;
        let sample = rand::seq::index::sample(&mut rng, n, E::MIN_SAMPLES).into_vec();
        let Some(model) = E::fit(data, &sample) else {
            continue;
        };

        let (mut inliers, mut inlier_rms) = score::<E>(data, &model, params.threshold);
        if inliers.len() < E::MIN_SAMPLES {
            continue;
        }

        let mut model = model;
        if let Some(refit) = E::refit(data, &inliers) {
            let (refit_inliers, refit_rms) = score::<E>(data, &refit, params.threshold);
            if refit_inliers.len() >= inliers.len() {
                model = refit;
                inliers = refit_inliers;
                inlier_rms = refit_rms;
            }
        }

        let better = match &best {
            None => true,
            Some(b) => {
                inliers.len() > b.inliers.len()
                    || (inliers.len() == b.inliers.len() && inlier_rms < b.inlier_rms)
            }
        };
        if better {
            let ratio = inliers.len() as f64 / n as f64;
            budget = required_iterations(params, ratio, E::MIN_SAMPLES).max(iters);
            best = Some(Consensus {
                model,
                inliers,
                inlier_rms,
                iterations: iters,
            });
            if best.as_ref().is_some_and(|b| b.inliers.len() == n) {
                break;
            }
        }
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Line {
        slope: f64,
        intercept: f64,
    }

    struct LineEstimator;

    impl Estimator for LineEstimator {
        type Datum = (f64, f64);
        type Model = Line;

        const MIN_SAMPLES: usize = 2;

        fn fit(data: &[Self::Datum], sample: &[usize]) -> Option<Self::Model> {
            let p0 = data[sample[0]];
            let p1 = data[sample[1]];
            let dx = p1.0 - p0.0;
            if dx.abs() < 1e-9 {
                return None;
            }
            let slope = (p1.1 - p0.1) / dx;
            Some(Line {
                slope,
                intercept: p0.1 - slope * p0.0,
            })
        }

        fn residual(model: &Self::Model, datum: &Self::Datum) -> f64 {
            let (x, y) = *datum;
            (model.slope * x - y + model.intercept).abs() / (model.slope.powi(2) + 1.0).sqrt()
        }
    }

    fn params() -> RansacParams {
        RansacParams {
            max_iters: 500,
            threshold: 0.05,
            confidence: 0.99,
            seed: 42,
        }
    }

    #[test]
    fn insufficient_data_yields_no_consensus() {
        assert!(ransac::<LineEstimator>(&[(0.0, 0.0)], &params()).is_none());
    }

    #[test]
    fn recovers_line_with_outliers() {
        let mut data: Vec<(f64, f64)> = (0..10)
            .map(|i| {
                let x = i as f64 * 0.5;
                (x, 2.0 * x + 1.0 + if i % 2 == 0 { 0.01 } else { -0.01 })
            })
            .collect();
        data.extend([(5.0, -3.0), (6.0, 10.0), (7.0, -8.0)]);

        let best = ransac::<LineEstimator>(&data, &params()).expect("consensus");
        assert!((best.model.slope - 2.0).abs() < 0.05);
        assert!((best.model.intercept - 1.0).abs() < 0.05);
        assert_eq!(best.inliers.len(), 10);
    }

    #[test]
    fn iteration_bound_shrinks_with_inlier_ratio() {
        let p = params();
        assert_eq!(required_iterations(&p, 1.0, 4), 1);
        assert!(required_iterations(&p, 0.5, 4) > required_iterations(&p, 0.9, 4));
        assert_eq!(required_iterations(&p, 0.0, 4), p.max_iters);
    }
}
