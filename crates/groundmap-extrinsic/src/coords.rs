//! Ground coordinates relative to a chosen origin, Cartesian or polar.
//!
//! Polar points are `(radius, angle)` with the angle in degrees,
//! counter-clockwise from the ground x axis, in `[0, 360)`.

use std::fmt;
use std::str::FromStr;

use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};

use crate::error::CoordinateError;
use crate::mapping::GroundMapping;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinateType {
    #[default]
    Cartesian,
    Polar,
}

impl FromStr for CoordinateType {
    type Err = CoordinateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cartesian" => Ok(Self::Cartesian),
            "polar" => Ok(Self::Polar),
            other => Err(CoordinateError::UnknownType(other.to_string())),
        }
    }
}

impl fmt::Display for CoordinateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cartesian => "cartesian",
            Self::Polar => "polar",
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Polar {
    pub radius: f64,
    /// Degrees.
    pub angle: f64,
}

impl Polar {
    pub fn new(radius: f64, angle: f64) -> Self {
        Self { radius, angle }
    }

    /// Polar form of an offset from the origin.
    pub fn from_offset(v: Vector2<f64>) -> Self {
        let angle = v.y.atan2(v.x).to_degrees().rem_euclid(360.0);
        // rem_euclid can round a tiny negative angle up to exactly 360
        let angle = if angle >= 360.0 { 0.0 } else { angle };
        Self {
            radius: v.norm(),
            angle,
        }
    }

    pub fn to_offset(self) -> Vector2<f64> {
        let (sin, cos) = self.angle.to_radians().sin_cos();
        Vector2::new(self.radius * cos, self.radius * sin)
    }
}

impl From<Polar> for Point2<f64> {
    fn from(p: Polar) -> Self {
        Point2::new(p.radius, p.angle)
    }
}

impl From<Point2<f64>> for Polar {
    fn from(p: Point2<f64>) -> Self {
        Polar::new(p.x, p.y)
    }
}

/// Origin and output convention for relative ground coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinateSystem {
    image_origin: Point2<f64>,
    origin: Point2<f64>,
    kind: CoordinateType,
}

impl CoordinateSystem {
    pub fn new(kind: CoordinateType) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// Ground origin.
    pub fn origin(&self) -> Point2<f64> {
        self.origin
    }

    /// Pixel the origin was picked at.
    pub fn image_origin(&self) -> Point2<f64> {
        self.image_origin
    }

    pub fn coordinate_type(&self) -> CoordinateType {
        self.kind
    }

    pub fn set_coordinate_type(&mut self, kind: CoordinateType) {
        log::info!("coordinate type set to {kind}");
        self.kind = kind;
    }

    /// Select the coordinate type by name (`cartesian` or `polar`).
    pub fn set_coordinate_type_str(&mut self, name: &str) -> Result<(), CoordinateError> {
        self.set_coordinate_type(name.parse()?);
        Ok(())
    }

    /// Move the origin to the ground point under pixel `image_point`.
    pub fn set_origin(
        &mut self,
        mapping: &GroundMapping,
        image_point: Point2<f64>,
    ) -> Result<Point2<f64>, CoordinateError> {
        let forward = mapping.forward().ok_or(CoordinateError::NotCalibrated)?;
        let ground = forward.apply(image_point);
        self.image_origin = image_point;
        self.origin = ground;
        log::info!(
            "origin set to pixel ({:.1}, {:.1}), ground ({:.4}, {:.4})",
            image_point.x,
            image_point.y,
            ground.x,
            ground.y
        );
        Ok(ground)
    }

    /// Polar form of an absolute ground point, measured from the origin.
    pub fn to_polar(&self, ground: Point2<f64>) -> Polar {
        Polar::from_offset(ground - self.origin)
    }

    /// Absolute ground point for a polar point around the origin.
    pub fn to_cartesian(&self, polar: Polar) -> Point2<f64> {
        self.origin + polar.to_offset()
    }

    /// Express an absolute ground point in the current convention: the
    /// offset from the origin, or its polar form.
    pub fn relative(&self, ground: Point2<f64>) -> Point2<f64> {
        match self.kind {
            CoordinateType::Cartesian => Point2::from(ground - self.origin),
            CoordinateType::Polar => self.to_polar(ground).into(),
        }
    }

    /// Inverse of [`relative`](Self::relative).
    pub fn absolute(&self, relative: Point2<f64>) -> Point2<f64> {
        match self.kind {
            CoordinateType::Cartesian => self.origin + relative.coords,
            CoordinateType::Polar => self.to_cartesian(relative.into()),
        }
    }

    pub fn image_to_ground_relative(
        &self,
        mapping: &GroundMapping,
        image_point: Point2<f64>,
    ) -> Result<Point2<f64>, CoordinateError> {
        let forward = mapping.forward().ok_or(CoordinateError::NotCalibrated)?;
        Ok(self.relative(forward.apply(image_point)))
    }

    pub fn ground_to_image_relative(
        &self,
        mapping: &GroundMapping,
        relative: Point2<f64>,
    ) -> Result<Point2<f64>, CoordinateError> {
        let inverse = mapping.inverse().ok_or(CoordinateError::NotCalibrated)?;
        Ok(inverse.apply(self.absolute(relative)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use groundmap_core::Homography;

    fn mapping() -> GroundMapping {
        let mut m = GroundMapping::new();
        m.set_forward(Homography::from_array([
            [0.01, 0.0, -3.2],
            [0.0, -0.01, 4.8],
            [0.0, 0.0, 1.0],
        ]))
        .unwrap();
        m
    }

    #[test]
    fn parses_known_names_only() {
        assert_eq!("polar".parse::<CoordinateType>(), Ok(CoordinateType::Polar));
        assert_eq!(
            "cartesian".parse::<CoordinateType>(),
            Ok(CoordinateType::Cartesian)
        );
        assert_eq!(
            "Polar".parse::<CoordinateType>(),
            Err(CoordinateError::UnknownType("Polar".to_string()))
        );
        let mut cs = CoordinateSystem::default();
        assert!(cs.set_coordinate_type_str("spherical").is_err());
        assert_eq!(cs.coordinate_type(), CoordinateType::Cartesian);
    }

    #[test]
    fn angles_are_in_range() {
        let p = Polar::from_offset(Vector2::new(0.0, -2.0));
        assert_relative_eq!(p.angle, 270.0, epsilon = 1e-12);
        assert_relative_eq!(p.radius, 2.0);
        let p = Polar::from_offset(Vector2::new(1.0, -1e-300));
        assert!(p.angle >= 0.0 && p.angle < 360.0);
        assert_relative_eq!(
            Polar::from_offset(Vector2::new(-1.0, 0.0)).angle,
            180.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn polar_round_trip_around_the_origin() {
        let mut cs = CoordinateSystem::new(CoordinateType::Polar);
        cs.set_origin(&mapping(), Point2::new(400.0, 300.0)).unwrap();
        let o = cs.origin();
        for p in [
            Point2::new(3.0, 1.0),
            Point2::new(-2.0, 0.5),
            Point2::new(0.0, -7.25),
            Point2::new(-1.0, -1.0),
        ] {
            let back = cs.to_cartesian(cs.to_polar(p));
            assert_relative_eq!(back.x, p.x, epsilon = 1e-9);
            assert_relative_eq!(back.y, p.y, epsilon = 1e-9);

            let rel = p - o;
            let polar = Polar::from_offset(rel);
            let again = polar.to_offset();
            assert_relative_eq!(again.x, rel.x, epsilon = 1e-9);
            assert_relative_eq!(again.y, rel.y, epsilon = 1e-9);
        }
    }

    #[test]
    fn origin_requires_calibration() {
        let mut cs = CoordinateSystem::default();
        assert_eq!(
            cs.set_origin(&GroundMapping::new(), Point2::new(1.0, 1.0)),
            Err(CoordinateError::NotCalibrated)
        );
        assert_eq!(cs.origin(), Point2::origin());
        assert_eq!(
            cs.image_to_ground_relative(&GroundMapping::new(), Point2::new(1.0, 1.0)),
            Err(CoordinateError::NotCalibrated)
        );
    }

    #[test]
    fn relative_outputs_agree_between_conventions() {
        let m = mapping();
        let mut cs = CoordinateSystem::default();
        let origin = cs.set_origin(&m, Point2::new(320.0, 480.0)).unwrap();
        assert_relative_eq!(origin.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(origin.y, 0.0, epsilon = 1e-12);
        assert_eq!(cs.image_origin(), Point2::new(320.0, 480.0));

        // 100 px right of the origin pixel is 1 m along +x
        let cart = cs.image_to_ground_relative(&m, Point2::new(420.0, 480.0)).unwrap();
        assert_relative_eq!(cart.x, 1.0, epsilon = 1e-9);
        assert_relative_eq!(cart.y, 0.0, epsilon = 1e-9);

        cs.set_coordinate_type(CoordinateType::Polar);
        let polar = cs.image_to_ground_relative(&m, Point2::new(320.0, 280.0)).unwrap();
        assert_relative_eq!(polar.x, 2.0, epsilon = 1e-9);
        assert_relative_eq!(polar.y, 90.0, epsilon = 1e-9);

        let px = cs.ground_to_image_relative(&m, polar).unwrap();
        assert_relative_eq!(px.x, 320.0, epsilon = 1e-6);
        assert_relative_eq!(px.y, 280.0, epsilon = 1e-6);

        cs.set_coordinate_type(CoordinateType::Cartesian);
        let px = cs.ground_to_image_relative(&m, Point2::new(1.0, 0.0)).unwrap();
        assert_relative_eq!(px.x, 420.0, epsilon = 1e-6);
        assert_relative_eq!(px.y, 480.0, epsilon = 1e-6);
    }
}
