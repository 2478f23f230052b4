//! Intrinsic calibration files.
//!
//! Keys: `camera_matrix`, `dist_coeffs` (OpenCV matrix records),
//! `board_width`, `board_height`, `square_size`, `avg_reprojection_error`,
//! plus `calibration_date` and `image_count` on save.

use std::path::Path;

use groundmap_core::Document;

use crate::camera::CameraModel;
use crate::error::PersistenceError;
use crate::session::IntrinsicModel;
use crate::BoardSpec;

/// Contents of an intrinsic calibration file.
#[derive(Clone, Debug, PartialEq)]
pub struct CalibrationFile {
    pub model: IntrinsicModel,
    pub board: BoardSpec,
    pub calibration_date: Option<String>,
    pub image_count: Option<usize>,
}

impl CalibrationFile {
    pub fn new(model: IntrinsicModel, board: BoardSpec, image_count: usize) -> Self {
        Self {
            model,
            board,
            calibration_date: Some(chrono::Utc::now().to_rfc3339()),
            image_count: Some(image_count),
        }
    }

    pub fn to_document(&self) -> Result<Document, PersistenceError> {
        let mut doc = Document::new();
        doc.set_matrix3("camera_matrix", &self.model.camera.k)?;
        doc.set_vector("dist_coeffs", &self.model.camera.distortion)?;
        doc.set("board_width", self.board.cols)?;
        doc.set("board_height", self.board.rows)?;
        doc.set("square_size", self.board.square_size)?;
        doc.set("avg_reprojection_error", self.model.reprojection_error)?;
        if let Some(date) = &self.calibration_date {
            doc.set("calibration_date", date)?;
        }
        if let Some(count) = self.image_count {
            doc.set("image_count", count)?;
        }
        Ok(doc)
    }

    /// Parse and validate; nothing is returned unless every field is sane.
    pub fn from_document(doc: &Document) -> Result<Self, PersistenceError> {
        let camera = CameraModel::new(doc.matrix3("camera_matrix")?, doc.vector("dist_coeffs")?)?;
        let board = BoardSpec::new(
            doc.get("board_width")?,
            doc.get("board_height")?,
            doc.real("square_size")?,
        )?;
        let reprojection_error = doc.real("avg_reprojection_error")?;
        if reprojection_error < 0.0 {
            return Err(PersistenceError::Invalid {
                key: "avg_reprojection_error",
                reason: format!("negative error {reprojection_error}"),
            });
        }
        Ok(Self {
            model: IntrinsicModel {
                camera,
                reprojection_error,
            },
            board,
            calibration_date: doc.get_opt("calibration_date")?,
            image_count: doc.get_opt("image_count")?,
        })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PersistenceError> {
        self.to_document()?.save(path)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        Self::from_document(&Document::load(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use groundmap_core::StorageError;
    use nalgebra::Matrix3;

    fn sample() -> CalibrationFile {
        let camera = CameraModel::new(
            Matrix3::new(612.5, 0.0, 318.2, 0.0, 611.9, 242.7, 0.0, 0.0, 1.0),
            vec![-0.11, 0.04, 0.0005, -0.0002, 0.0],
        )
        .unwrap();
        CalibrationFile::new(
            IntrinsicModel {
                camera,
                reprojection_error: 0.27,
            },
            BoardSpec::new(8, 5, 0.03).unwrap(),
            12,
        )
    }

    #[test]
    fn save_then_load_reproduces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("intrinsics.json");
        let file = sample();
        file.save(&path).unwrap();
        assert_eq!(CalibrationFile::load(&path).unwrap(), file);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"camera_matrix\""));
        assert!(raw.contains("opencv-matrix"));
    }

    #[test]
    fn malformed_files_are_rejected() {
        let file = sample();

        let mut doc = file.to_document().unwrap();
        doc.set_vector("camera_matrix", &[1.0, 2.0]).unwrap();
        assert!(matches!(
            CalibrationFile::from_document(&doc),
            Err(PersistenceError::Storage(StorageError::Shape { .. }))
        ));

        let mut doc = file.to_document().unwrap();
        doc.set_vector("dist_coeffs", &[0.1, 0.2, 0.3]).unwrap();
        assert!(matches!(
            CalibrationFile::from_document(&doc),
            Err(PersistenceError::Model(_))
        ));

        let mut doc = file.to_document().unwrap();
        doc.set("board_width", 0).unwrap();
        assert!(matches!(
            CalibrationFile::from_document(&doc),
            Err(PersistenceError::Board(_))
        ));

        let doc = Document::from_json_str("{}").unwrap();
        assert!(matches!(
            CalibrationFile::from_document(&doc),
            Err(PersistenceError::Storage(StorageError::MissingKey(_)))
        ));
    }

    #[test]
    fn missing_file_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            CalibrationFile::load(dir.path().join("nope.json")),
            Err(PersistenceError::Storage(StorageError::Io { .. }))
        ));
    }
}
