use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::detect::{default_ladder, DetectionStrategy, SubPixParams};
use crate::error::ConfigIoError;
use crate::quality::QualityCheckLevel;
use crate::BoardSpec;

/// Fewest valid images a solve accepts.
pub const MIN_CALIBRATION_IMAGES: usize = 5;

fn default_min_images() -> usize {
    MIN_CALIBRATION_IMAGES
}

/// Settings consumed by `add_image` and `solve`, kept apart from the
/// accumulated correspondences.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub board: BoardSpec,
    #[serde(default)]
    pub quality_level: QualityCheckLevel,
    #[serde(default = "default_ladder")]
    pub ladder: Vec<DetectionStrategy>,
    #[serde(default)]
    pub subpix: SubPixParams,
    #[serde(default = "default_min_images")]
    pub min_images: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            board: BoardSpec::default(),
            quality_level: QualityCheckLevel::default(),
            ladder: default_ladder(),
            subpix: SubPixParams::default(),
            min_images: MIN_CALIBRATION_IMAGES,
        }
    }
}

impl SessionConfig {
    pub fn with_board(board: BoardSpec) -> Self {
        Self {
            board,
            ..Self::default()
        }
    }

    /// Load a JSON config from disk; the board geometry is validated.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, ConfigIoError> {
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.board.validate()?;
        Ok(config)
    }

    /// Write this config to disk as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), ConfigIoError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}
