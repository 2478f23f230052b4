//! Overlay geometry for front ends: ground grid lines and coordinate axes in
//! image pixels. Nothing is drawn here.

use groundmap_core::Homography;
use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};

use crate::coords::CoordinateSystem;
use crate::mapping::GroundMapping;

/// Line segment in image pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Segment {
    pub start: Point2<f64>,
    pub end: Point2<f64>,
}

impl Segment {
    pub fn new(start: Point2<f64>, end: Point2<f64>) -> Self {
        Self { start, end }
    }

    fn is_finite(&self) -> bool {
        self.start.coords.iter().chain(self.end.coords.iter()).all(|v| v.is_finite())
    }

    /// Part of the segment inside `[0, width) x [0, height)` (Liang-Barsky).
    pub fn clip(&self, width: f64, height: f64) -> Option<Segment> {
        let d = self.end - self.start;
        let (mut t0, mut t1) = (0.0_f64, 1.0_f64);
        let edges = [
            (-d.x, self.start.x),
            (d.x, width - 1.0 - self.start.x),
            (-d.y, self.start.y),
            (d.y, height - 1.0 - self.start.y),
        ];
        for (p, q) in edges {
            if p == 0.0 {
                if q < 0.0 {
                    return None;
                }
                continue;
            }
            let r = q / p;
            if p < 0.0 {
                t0 = t0.max(r);
            } else {
                t1 = t1.min(r);
            }
            if t0 > t1 {
                return None;
            }
        }
        Some(Segment::new(self.start + d * t0, self.start + d * t1))
    }
}

/// Square ground grid centred on the ground origin.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSpec {
    /// Ground distance between neighbouring lines.
    pub spacing: f64,
    /// Lines per direction; the grid spans `lines / 2` spacings each way.
    pub lines: u32,
}

impl Default for GridSpec {
    fn default() -> Self {
        Self {
            spacing: 50.0,
            lines: 10,
        }
    }
}

/// Ground points whose projective depth falls below this fraction of the
/// reference depth count as lying on the horizon.
const HORIZON_MARGIN: f64 = 1e-3;

/// Homogeneous `w` of ground point `p` under `inverse`.
fn depth(inverse: &Homography, p: Point2<f64>) -> f64 {
    let h = &inverse.h;
    h[(2, 0)] * p.x + h[(2, 1)] * p.y + h[(2, 2)]
}

/// Part of the ground segment `a..b` on the visible side of the horizon.
///
/// `reference` is the depth of a ground point known to be in view.
fn clip_to_horizon(
    inverse: &Homography,
    reference: f64,
    a: Point2<f64>,
    b: Point2<f64>,
) -> Option<(Point2<f64>, Point2<f64>)> {
    let sign = reference.signum();
    let min = HORIZON_MARGIN * reference.abs();
    let (wa, wb) = (sign * depth(inverse, a), sign * depth(inverse, b));
    match (wa >= min, wb >= min) {
        (true, true) => Some((a, b)),
        (false, false) => None,
        (a_visible, _) => {
            // depth is affine along a ground line
            let cut = a + (b - a) * ((min - wa) / (wb - wa));
            Some(if a_visible { (a, cut) } else { (cut, b) })
        }
    }
}

/// Grid lines mapped into the image. Empty when uncalibrated.
///
/// Lines are cut where they reach the horizon, judged against the centroid
/// of the calibration ground points (the ground origin without pairs), so no
/// segment wraps around through infinity.
pub fn grid_lines(mapping: &GroundMapping, spec: &GridSpec) -> Vec<Segment> {
    let Some(inverse) = mapping.inverse() else {
        return Vec::new();
    };
    let pairs = mapping.pairs();
    let anchor = if pairs.is_empty() {
        Point2::origin()
    } else {
        let sum = pairs
            .iter()
            .fold(Vector2::<f64>::zeros(), |acc, c| acc + c.ground.coords);
        Point2::from(sum / pairs.len() as f64)
    };
    let reference = depth(&inverse, anchor);
    if !reference.is_finite() || reference == 0.0 {
        log::debug!("grid skipped: reference ground point lies on the horizon");
        return Vec::new();
    }

    let half = i64::from(spec.lines / 2);
    let extent = half as f64 * spec.spacing;
    let mut out = Vec::with_capacity(2 * (2 * half as usize + 1));
    for i in -half..=half {
        let v = i as f64 * spec.spacing;
        for (a, b) in [
            (Point2::new(-extent, v), Point2::new(extent, v)),
            (Point2::new(v, -extent), Point2::new(v, extent)),
        ] {
            let Some((a, b)) = clip_to_horizon(&inverse, reference, a, b) else {
                continue;
            };
            let seg = Segment::new(inverse.apply(a), inverse.apply(b));
            if seg.is_finite() {
                out.push(seg);
            }
        }
    }
    out
}

/// Origin marker and axis end points in image pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Axes {
    pub origin: Point2<f64>,
    /// End of the ground +x axis (the polar 0 degree ray).
    pub x_end: Point2<f64>,
    /// End of the ground +y axis (the polar 90 degree ray).
    pub y_end: Point2<f64>,
}

impl Axes {
    pub fn origin_in_frame(&self, width: f64, height: f64) -> bool {
        (0.0..width).contains(&self.origin.x) && (0.0..height).contains(&self.origin.y)
    }

    /// Visible parts of both axes.
    pub fn clipped(&self, width: f64, height: f64) -> (Option<Segment>, Option<Segment>) {
        (
            Segment::new(self.origin, self.x_end).clip(width, height),
            Segment::new(self.origin, self.y_end).clip(width, height),
        )
    }
}

/// Axes of `coords` with ground length `length`. `None` when uncalibrated.
pub fn axes(mapping: &GroundMapping, coords: &CoordinateSystem, length: f64) -> Option<Axes> {
    let inverse = mapping.inverse()?;
    let o = coords.origin();
    Some(Axes {
        origin: coords.image_origin(),
        x_end: inverse.apply(Point2::new(o.x + length, o.y)),
        y_end: inverse.apply(Point2::new(o.x, o.y + length)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn mapping() -> GroundMapping {
        let mut m = GroundMapping::new();
        m.set_forward(Homography::from_array([
            [1.0, 0.0, -320.0],
            [0.0, -1.0, 480.0],
            [0.0, 0.0, 1.0],
        ]))
        .unwrap();
        m
    }

    #[test]
    fn grid_has_two_lines_per_step() {
        let lines = grid_lines(&mapping(), &GridSpec::default());
        assert_eq!(lines.len(), 22);
        // first horizontal line: ground y = -250 -> image y = 730
        assert_relative_eq!(lines[0].start.x, 70.0, epsilon = 1e-9);
        assert_relative_eq!(lines[0].start.y, 730.0, epsilon = 1e-9);
        assert_relative_eq!(lines[0].end.x, 570.0, epsilon = 1e-9);
        assert!(grid_lines(&GroundMapping::new(), &GridSpec::default()).is_empty());
    }

    #[test]
    fn grid_stops_at_the_horizon() {
        // ground y = -100 maps to the line at infinity
        let ground_to_image = Homography::from_array([
            [1.0, 0.0, 320.0],
            [0.0, 1.0, 240.0],
            [0.0, 0.01, 1.0],
        ]);
        let mut m = GroundMapping::new();
        m.set_forward(ground_to_image.inverse().unwrap()).unwrap();
        let forward = m.forward().unwrap();

        let lines = grid_lines(&m, &GridSpec::default());
        // horizontal lines at y <= -100 vanish, all 11 vertical ones are cut
        assert_eq!(lines.len(), 7 + 11);
        for seg in &lines {
            for p in [seg.start, seg.end] {
                let g = forward.apply(p);
                assert!(g.y > -100.0, "segment end {p:?} maps behind the horizon");
                assert!(g.y < 250.0 + 1e-6);
            }
        }
    }

    #[test]
    fn axes_follow_the_origin() {
        let m = mapping();
        let mut cs = CoordinateSystem::default();
        cs.set_origin(&m, Point2::new(320.0, 470.0)).unwrap();
        let ax = axes(&m, &cs, 200.0).unwrap();
        assert_eq!(ax.origin, Point2::new(320.0, 470.0));
        assert_relative_eq!(ax.x_end.x, 520.0, epsilon = 1e-9);
        assert_relative_eq!(ax.y_end.y, 270.0, epsilon = 1e-9);
        assert!(ax.origin_in_frame(640.0, 480.0));
        assert!(axes(&GroundMapping::new(), &cs, 200.0).is_none());
    }

    #[test]
    fn clipping_keeps_the_visible_part() {
        let seg = Segment::new(Point2::new(100.0, 600.0), Point2::new(100.0, 200.0));
        let clipped = seg.clip(640.0, 480.0).unwrap();
        assert_relative_eq!(clipped.start.y, 479.0, epsilon = 1e-9);
        assert_relative_eq!(clipped.end.y, 200.0, epsilon = 1e-9);

        let outside = Segment::new(Point2::new(-50.0, -10.0), Point2::new(-5.0, -1.0));
        assert_eq!(outside.clip(640.0, 480.0), None);
    }
}
