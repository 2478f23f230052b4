//! Pattern detection capability, the fallback ladder and sub-pixel refinement.

use groundmap_core::{sample_bilinear, GrayImage, GrayImageView};
use nalgebra::{Matrix2, Point2, Vector2};
use serde::{Deserialize, Serialize};

use crate::preprocess::Preprocess;
use crate::BoardSpec;

/// Detector hints, mirroring the usual chessboard detector switches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectFlags {
    pub adaptive_threshold: bool,
    pub normalize_image: bool,
    pub filter_quads: bool,
    pub fast_check: bool,
}

/// One rung of the fallback ladder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionStrategy {
    pub name: String,
    pub preprocess: Preprocess,
    pub flags: DetectFlags,
}

impl DetectionStrategy {
    pub fn new(name: impl Into<String>, preprocess: Preprocess, flags: DetectFlags) -> Self {
        Self {
            name: name.into(),
            preprocess,
            flags,
        }
    }
}

/// Strategies tried in order, from plain to aggressive.
pub fn default_ladder() -> Vec<DetectionStrategy> {
    let standard = DetectFlags {
        adaptive_threshold: true,
        normalize_image: true,
        ..DetectFlags::default()
    };
    vec![
        DetectionStrategy::new("standard", Preprocess::None, standard),
        DetectionStrategy::new(
            "equalized",
            Preprocess::Equalize,
            DetectFlags {
                filter_quads: true,
                ..standard
            },
        ),
        DetectionStrategy::new("blurred", Preprocess::Blur { kernel: 5 }, standard),
        DetectionStrategy::new(
            "stretched",
            Preprocess::Stretch,
            DetectFlags {
                adaptive_threshold: true,
                ..DetectFlags::default()
            },
        ),
    ]
}

/// Iterative corner refinement settings.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubPixParams {
    /// Search window is `(2 * half_window + 1)` pixels wide.
    pub half_window: usize,
    pub max_iters: usize,
    /// Stop once a step moves the corner less than this many pixels.
    pub epsilon: f64,
}

impl Default for SubPixParams {
    fn default() -> Self {
        Self {
            half_window: 5,
            max_iters: 30,
            epsilon: 0.1,
        }
    }
}

/// External chessboard corner detector.
///
/// `detect` returns the interior corners row by row, or `None` when the board
/// is not found. `refine` defaults to the gradient-orthogonality refinement in
/// [`refine_corners`].
pub trait PatternDetector: Send + Sync {
    fn detect(
        &self,
        img: &GrayImage,
        board: &BoardSpec,
        flags: DetectFlags,
    ) -> Option<Vec<Point2<f64>>>;

    fn refine(
        &self,
        img: &GrayImage,
        points: &[Point2<f64>],
        params: &SubPixParams,
    ) -> Vec<Point2<f64>> {
        refine_corners(&img.view(), points, params)
    }
}

/// Successful ladder rung.
#[derive(Clone, Debug, PartialEq)]
pub struct LadderHit {
    pub strategy: usize,
    pub points: Vec<Point2<f64>>,
}

/// Try each strategy in order, returning the first detection.
pub fn detect_with_ladder(
    detector: &dyn PatternDetector,
    img: &GrayImage,
    board: &BoardSpec,
    ladder: &[DetectionStrategy],
) -> Option<LadderHit> {
    ladder.iter().enumerate().find_map(|(idx, strategy)| {
        let prepared = match strategy.preprocess {
            Preprocess::None => None,
            step => Some(step.apply(img)),
        };
        let input = prepared.as_ref().unwrap_or(img);
        let points = detector.detect(input, board, strategy.flags)?;
        log::debug!(
            "pattern found with strategy #{idx} `{}` ({} points)",
            strategy.name,
            points.len()
        );
        Some(LadderHit {
            strategy: idx,
            points,
        })
    })
}

fn gradient(img: &GrayImageView<'_>, x: f64, y: f64) -> Vector2<f64> {
    let (x, y) = (x as f32, y as f32);
    let gx = sample_bilinear(img, x + 1.0, y) - sample_bilinear(img, x - 1.0, y);
    let gy = sample_bilinear(img, x, y + 1.0) - sample_bilinear(img, x, y - 1.0);
    Vector2::new(gx as f64 * 0.5, gy as f64 * 0.5)
}

fn refine_one(img: &GrayImageView<'_>, start: Point2<f64>, params: &SubPixParams) -> Point2<f64> {
    let half = params.half_window as i32;
    let sigma2 = (params.half_window.max(1) as f64).powi(2);
    let mut q = start;

    for _ in 0..params.max_iters {
        let mut g = Matrix2::zeros();
        let mut b = Vector2::zeros();
        for dy in -half..=half {
            for dx in -half..=half {
                let p = Vector2::new(q.x + dx as f64, q.y + dy as f64);
                let grad = gradient(img, p.x, p.y);
                let w = (-((dx * dx + dy * dy) as f64) / (2.0 * sigma2)).exp();
                let ggt = grad * grad.transpose() * w;
                g += ggt;
                b += ggt * p;
            }
        }
        let Some(g_inv) = g.try_inverse() else {
            break;
        };
        let next = Point2::from(g_inv * b);
        if !next.x.is_finite() || !next.y.is_finite() {
            break;
        }
        let step = (next - q).norm();
        q = next;
        if step < params.epsilon {
            break;
        }
    }

    let drift = q - start;
    if drift.x.abs() > half as f64 || drift.y.abs() > half as f64 {
        return start;
    }
    q
}

/// Move each corner to the saddle where image gradients in its window are
/// orthogonal to the corner-to-pixel direction.
///
/// Corners that would leave their search window are kept where they were.
pub fn refine_corners(
    img: &GrayImageView<'_>,
    points: &[Point2<f64>],
    params: &SubPixParams,
) -> Vec<Point2<f64>> {
    points.iter().map(|&p| refine_one(img, p, params)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn render_corner(cx: f64, cy: f64) -> GrayImage {
        GrayImage::from_fn(40, 32, |x, y| {
            let mut acc = 0.0_f64;
            for sy in 0..4 {
                for sx in 0..4 {
                    let px = x as f64 + (sx as f64 + 0.5) / 4.0 - 0.5;
                    let py = y as f64 + (sy as f64 + 0.5) / 4.0 - 0.5;
                    acc += if (px - cx) * (py - cy) > 0.0 { 200.0 } else { 30.0 };
                }
            }
            (acc / 16.0).round() as u8
        })
    }

    #[test]
    fn refinement_converges_to_saddle() {
        let img = render_corner(20.37, 15.62);
        let refined = refine_corners(
            &img.view(),
            &[Point2::new(21.4, 14.9)],
            &SubPixParams::default(),
        );
        assert!((refined[0].x - 20.37).abs() < 0.15, "x = {}", refined[0].x);
        assert!((refined[0].y - 15.62).abs() < 0.15, "y = {}", refined[0].y);
    }

    #[test]
    fn flat_window_keeps_point() {
        let img = GrayImage::from_fn(20, 20, |_, _| 128);
        let p = Point2::new(10.0, 10.0);
        assert_eq!(refine_corners(&img.view(), &[p], &SubPixParams::default()), vec![p]);
    }

    #[test]
    fn corners_far_outside_the_image_are_kept() {
        let img = render_corner(20.0, 16.0);
        let far = [
            Point2::new(3.0e9, 10.0),
            Point2::new(10.0, -3.0e9),
            Point2::new(f64::MAX, f64::MAX),
        ];
        assert_eq!(refine_corners(&img.view(), &far, &SubPixParams::default()), far.to_vec());
    }

    struct FailUntil {
        succeed_at: usize,
        calls: AtomicUsize,
    }

    impl PatternDetector for FailUntil {
        fn detect(&self, _: &GrayImage, board: &BoardSpec, _: DetectFlags) -> Option<Vec<Point2<f64>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            (call == self.succeed_at).then(|| vec![Point2::new(1.0, 1.0); board.point_count()])
        }
    }

    #[test]
    fn ladder_stops_at_first_success() {
        let img = GrayImage::new(16, 16);
        let ladder = default_ladder();
        let detector = FailUntil {
            succeed_at: 2,
            calls: AtomicUsize::new(0),
        };
        let hit = detect_with_ladder(&detector, &img, &BoardSpec::default(), &ladder).unwrap();
        assert_eq!(hit.strategy, 2);
        assert_eq!(detector.calls.load(Ordering::SeqCst), 3);

        let never = FailUntil {
            succeed_at: usize::MAX,
            calls: AtomicUsize::new(0),
        };
        assert!(detect_with_ladder(&never, &img, &BoardSpec::default(), &ladder).is_none());
        assert_eq!(never.calls.load(Ordering::SeqCst), ladder.len());
    }
}
