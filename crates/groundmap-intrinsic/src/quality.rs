//! Image quality scoring for calibration frames.
//!
//! Only `corner_confidence` gates acceptance. The other metrics feed the
//! informational score and advisory log lines: at long camera-to-board
//! distances they are too noisy to reject on.

use std::fmt;
use std::str::FromStr;

use groundmap_core::GrayImageView;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::BoardSpec;

const SHARPNESS_FULL: f64 = 100.0;
const SHARPNESS_PARTIAL: f64 = 50.0;
const BRIGHTNESS_FULL: (f64, f64) = (60.0, 200.0);
const BRIGHTNESS_PARTIAL: (f64, f64) = (30.0, 230.0);
const CONTRAST_FULL: f64 = 40.0;
const CONTRAST_PARTIAL: f64 = 20.0;
const MIN_COVERAGE: f64 = 0.1;
const MAX_SKEW_DEG: f64 = 30.0;

/// Strictness profile selecting the minimum accepted corner confidence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityCheckLevel {
    Strict,
    #[default]
    Balanced,
    Permissive,
}

impl QualityCheckLevel {
    pub fn min_corner_confidence(self) -> f64 {
        match self {
            Self::Strict => 0.85,
            Self::Balanced => 0.75,
            Self::Permissive => 0.65,
        }
    }
}

impl FromStr for QualityCheckLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "balanced" => Ok(Self::Balanced),
            "permissive" => Ok(Self::Permissive),
            other => Err(format!("unknown quality level `{other}`")),
        }
    }
}

/// Label derived from the composite score.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Poor,
    Acceptable,
    Good,
    Excellent,
}

impl QualityLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 75.0 {
            Self::Excellent
        } else if score >= 60.0 {
            Self::Good
        } else if score >= 45.0 {
            Self::Acceptable
        } else {
            Self::Poor
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageQualityMetrics {
    /// Variance of the 4-neighbour Laplacian.
    pub sharpness: f64,
    /// Mean intensity, 0..=255.
    pub brightness: f64,
    /// Intensity standard deviation.
    pub contrast: f64,
    /// Fraction of expected corners located inside the image, 0..=1.
    pub corner_confidence: f64,
    /// Corner bounding-box area over image area, 0..=1.
    pub board_coverage: f64,
    /// First board row angle to the horizontal folded into `[0, 45]` degrees;
    /// 90 when it cannot be measured.
    pub skew_angle: f64,
    pub score: f64,
    pub level: QualityLevel,
}

/// Non-blocking quality warnings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Advisory {
    LowSharpness,
    BrightnessOutOfRange,
    LowContrast,
    LowCoverage,
    HighSkew,
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::LowSharpness => "image looks blurred",
            Self::BrightnessOutOfRange => "brightness out of range",
            Self::LowContrast => "low contrast",
            Self::LowCoverage => "board covers a small part of the frame",
            Self::HighSkew => "board is strongly rotated",
        };
        f.write_str(msg)
    }
}

fn intensity_stats(img: &GrayImageView<'_>) -> (f64, f64) {
    if img.data.is_empty() {
        return (0.0, 0.0);
    }
    let n = img.data.len() as f64;
    let mean = img.data.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = img
        .data
        .iter()
        .map(|&v| (v as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    (mean, var.sqrt())
}

fn laplacian_variance(img: &GrayImageView<'_>) -> f64 {
    let (w, h) = (img.width, img.height);
    if w < 3 || h < 3 {
        return 0.0;
    }
    let px = |x: usize, y: usize| img.data[y * w + x] as f64;
    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut n = 0.0;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let l = px(x - 1, y) + px(x + 1, y) + px(x, y - 1) + px(x, y + 1) - 4.0 * px(x, y);
            sum += l;
            sum_sq += l * l;
            n += 1.0;
        }
    }
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

fn in_bounds(p: &Point2<f64>, img: &GrayImageView<'_>) -> bool {
    p.x.is_finite()
        && p.y.is_finite()
        && p.x >= 0.0
        && p.y >= 0.0
        && p.x < img.width as f64
        && p.y < img.height as f64
}

fn coverage(points: &[Point2<f64>], img: &GrayImageView<'_>) -> f64 {
    let area = (img.width * img.height) as f64;
    if points.is_empty() || area <= 0.0 {
        return 0.0;
    }
    let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
    let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
    for p in points.iter().filter(|p| p.x.is_finite() && p.y.is_finite()) {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    if !(max_x > min_x && max_y > min_y) {
        return 0.0;
    }
    ((max_x - min_x) * (max_y - min_y) / area).min(1.0)
}

fn skew_angle(points: &[Point2<f64>], cols: usize) -> f64 {
    if cols < 2 || points.len() < cols {
        return 90.0;
    }
    let d = points[cols - 1] - points[0];
    if d.norm() < f64::EPSILON {
        return 90.0;
    }
    let folded = d.y.atan2(d.x).to_degrees().abs() % 90.0;
    if folded > 45.0 {
        90.0 - folded
    } else {
        folded
    }
}

fn composite_score(m: &ImageQualityMetrics) -> f64 {
    let mut score = 70.0 * m.corner_confidence.clamp(0.0, 1.0);

    score += if m.sharpness >= SHARPNESS_FULL {
        12.0
    } else if m.sharpness >= SHARPNESS_PARTIAL {
        6.0
    } else {
        0.0
    };

    let b = m.brightness;
    score += if (BRIGHTNESS_FULL.0..=BRIGHTNESS_FULL.1).contains(&b) {
        10.0
    } else if (BRIGHTNESS_PARTIAL.0..=BRIGHTNESS_PARTIAL.1).contains(&b) {
        5.0
    } else {
        0.0
    };

    score += if m.contrast >= CONTRAST_FULL {
        8.0
    } else if m.contrast >= CONTRAST_PARTIAL {
        4.0
    } else {
        0.0
    };

    score
}

/// Score a frame and its detected corners (possibly none).
pub fn evaluate(
    img: &GrayImageView<'_>,
    points: &[Point2<f64>],
    board: &BoardSpec,
) -> ImageQualityMetrics {
    let (brightness, contrast) = intensity_stats(img);
    let expected = board.point_count();
    let located = points.iter().filter(|p| in_bounds(p, img)).count();
    let corner_confidence = if expected == 0 {
        0.0
    } else {
        (located as f64 / expected as f64).min(1.0)
    };

    let mut metrics = ImageQualityMetrics {
        sharpness: laplacian_variance(img),
        brightness,
        contrast,
        corner_confidence,
        board_coverage: coverage(points, img),
        skew_angle: skew_angle(points, board.cols as usize),
        score: 0.0,
        level: QualityLevel::Poor,
    };
    metrics.score = composite_score(&metrics);
    metrics.level = QualityLevel::from_score(metrics.score);
    metrics
}

/// Advisory warnings for `m`; these never cause rejection.
pub fn advisories(m: &ImageQualityMetrics) -> Vec<Advisory> {
    let mut out = Vec::new();
    if m.sharpness < SHARPNESS_PARTIAL {
        out.push(Advisory::LowSharpness);
    }
    if !(BRIGHTNESS_PARTIAL.0..=BRIGHTNESS_PARTIAL.1).contains(&m.brightness) {
        out.push(Advisory::BrightnessOutOfRange);
    }
    if m.contrast < CONTRAST_PARTIAL {
        out.push(Advisory::LowContrast);
    }
    if m.board_coverage < MIN_COVERAGE {
        out.push(Advisory::LowCoverage);
    }
    if m.skew_angle > MAX_SKEW_DEG {
        out.push(Advisory::HighSkew);
    }
    out
}

/// Accept iff `corner_confidence` reaches the level's threshold.
pub fn should_accept(m: &ImageQualityMetrics, level: QualityCheckLevel) -> bool {
    for advisory in advisories(m) {
        log::info!("quality advisory: {advisory} ({:?})", m.level);
    }
    m.corner_confidence >= level.min_corner_confidence()
}

#[cfg(test)]
mod tests {
    use super::*;
    use groundmap_core::GrayImage;

    fn checker(w: usize, h: usize, cell: usize) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            if (x / cell + y / cell) % 2 == 0 {
                40
            } else {
                210
            }
        })
    }

    fn grid(board: &BoardSpec, origin: (f64, f64), step: f64) -> Vec<Point2<f64>> {
        (0..board.rows)
            .flat_map(|i| {
                (0..board.cols).map(move |j| {
                    Point2::new(origin.0 + j as f64 * step, origin.1 + i as f64 * step)
                })
            })
            .collect()
    }

    #[test]
    fn full_detection_scores_excellent() {
        let img = checker(320, 240, 20);
        let board = BoardSpec::default();
        let m = evaluate(&img.view(), &grid(&board, (40.0, 40.0), 20.0), &board);
        assert_eq!(m.corner_confidence, 1.0);
        assert!(m.sharpness > SHARPNESS_FULL);
        assert!(m.skew_angle < 1e-9);
        assert!(m.board_coverage > 0.1);
        assert_eq!(m.level, QualityLevel::Excellent);
        assert!(should_accept(&m, QualityCheckLevel::Strict));
    }

    #[test]
    fn thresholds_are_ordered() {
        assert!(
            QualityCheckLevel::Strict.min_corner_confidence()
                >= QualityCheckLevel::Balanced.min_corner_confidence()
        );
        assert!(
            QualityCheckLevel::Balanced.min_corner_confidence()
                >= QualityCheckLevel::Permissive.min_corner_confidence()
        );
    }

    #[test]
    fn gate_only_looks_at_confidence() {
        let img = checker(320, 240, 20);
        let board = BoardSpec::default();
        let mut pts = grid(&board, (40.0, 40.0), 20.0);
        // 40 of 54 in bounds -> 0.74
        for p in pts.iter_mut().skip(40) {
            p.x = -10.0;
        }
        let m = evaluate(&img.view(), &pts, &board);
        assert!((m.corner_confidence - 40.0 / 54.0).abs() < 1e-12);
        assert!(!should_accept(&m, QualityCheckLevel::Strict));
        assert!(!should_accept(&m, QualityCheckLevel::Balanced));
        assert!(should_accept(&m, QualityCheckLevel::Permissive));

        let flat = GrayImage::from_fn(320, 240, |_, _| 5);
        let m = evaluate(&flat.view(), &grid(&board, (40.0, 40.0), 20.0), &board);
        assert!(!advisories(&m).is_empty());
        assert!(should_accept(&m, QualityCheckLevel::Strict));
    }

    #[test]
    fn no_points_means_worst_skew_and_no_coverage() {
        let img = checker(64, 64, 8);
        let m = evaluate(&img.view(), &[], &BoardSpec::default());
        assert_eq!(m.corner_confidence, 0.0);
        assert_eq!(m.board_coverage, 0.0);
        assert_eq!(m.skew_angle, 90.0);
        assert_eq!(m.level, QualityLevel::Poor);
    }

    #[test]
    fn skew_is_folded_into_45_degrees() {
        let pts = [Point2::new(0.0, 0.0), Point2::new(-1.0, 3.0_f64.sqrt())];
        assert!((skew_angle(&pts, 2) - 30.0).abs() < 1e-9);
        let pts = [Point2::new(0.0, 0.0), Point2::new(1.0, 1.0)];
        assert!((skew_angle(&pts, 2) - 45.0).abs() < 1e-9);
    }

    #[test]
    fn level_parses_from_name() {
        assert_eq!("STRICT".parse::<QualityCheckLevel>(), Ok(QualityCheckLevel::Strict));
        assert!("lenient".parse::<QualityCheckLevel>().is_err());
    }
}
