//! Homography files.
//!
//! `homography_matrix` holds the image to ground transform as an OpenCV
//! matrix record, followed by `num_points` and the flat
//! `point_{i}_image_x` / `_image_y` / `_ground_x` / `_ground_y` scalars.

use std::path::Path;

use groundmap_core::{Document, Homography};
use nalgebra::Point2;

use crate::error::MappingIoError;
use crate::mapping::{Correspondence, GroundMapping, HomographyPair};

#[derive(Clone, Debug, PartialEq)]
pub struct HomographyFile {
    pub forward: Homography,
    pub pairs: Vec<Correspondence>,
}

fn point_key(i: usize, field: &str) -> String {
    format!("point_{i}_{field}")
}

impl HomographyFile {
    /// Contents of a calibrated mapping.
    pub fn from_mapping(mapping: &GroundMapping) -> Result<Self, MappingIoError> {
        let forward = mapping.forward().ok_or(MappingIoError::NotCalibrated)?;
        Ok(Self {
            forward,
            pairs: mapping.pairs().to_vec(),
        })
    }

    pub fn to_document(&self) -> Result<Document, MappingIoError> {
        let mut doc = Document::new();
        doc.set_matrix3("homography_matrix", &self.forward.h)?;
        doc.set("num_points", self.pairs.len())?;
        for (i, c) in self.pairs.iter().enumerate() {
            doc.set(&point_key(i, "image_x"), c.image.x)?;
            doc.set(&point_key(i, "image_y"), c.image.y)?;
            doc.set(&point_key(i, "ground_x"), c.ground.x)?;
            doc.set(&point_key(i, "ground_y"), c.ground.y)?;
        }
        Ok(doc)
    }

    pub fn from_document(doc: &Document) -> Result<Self, MappingIoError> {
        let forward = Homography::new(doc.matrix3("homography_matrix")?);
        if !forward.is_invertible() {
            return Err(MappingIoError::Singular);
        }
        let count: usize = doc.get("num_points")?;
        let pairs = (0..count)
            .map(|i| -> Result<Correspondence, MappingIoError> {
                Ok(Correspondence::new(
                    Point2::new(
                        doc.real(&point_key(i, "image_x"))?,
                        doc.real(&point_key(i, "image_y"))?,
                    ),
                    Point2::new(
                        doc.real(&point_key(i, "ground_x"))?,
                        doc.real(&point_key(i, "ground_y"))?,
                    ),
                ))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { forward, pairs })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), MappingIoError> {
        self.to_document()?.save(path)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, MappingIoError> {
        Self::from_document(&Document::load(path)?)
    }

    /// Install into `mapping`, regenerating the inverse by matrix inversion.
    pub fn apply_to(self, mapping: &mut GroundMapping) -> Result<(), MappingIoError> {
        let pair = HomographyPair::from_forward(self.forward).ok_or(MappingIoError::Singular)?;
        mapping.restore(self.pairs, pair);
        Ok(())
    }
}

impl GroundMapping {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), MappingIoError> {
        HomographyFile::from_mapping(self)?.save(path)
    }

    /// Replace pairs and homography from a file. On error nothing changes.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<(), MappingIoError> {
        let file = HomographyFile::load(path)?;
        log::info!("homography loaded with {} point pairs", file.pairs.len());
        file.apply_to(self)
    }
}
