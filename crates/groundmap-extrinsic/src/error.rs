use groundmap_core::{FrameError, HomographyError, StorageError};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum MappingError {
    #[error("need at least {required} point pairs, have {found}")]
    NotEnoughPoints { found: usize, required: usize },
    #[error("image to ground homography is degenerate: {0}")]
    DegenerateForward(HomographyError),
    #[error("ground to image homography is degenerate: {0}")]
    DegenerateInverse(HomographyError),
    #[error("ground mapping is not calibrated")]
    NotCalibrated,
    #[error("point pairs changed while the solve was running")]
    Stale,
}

#[derive(thiserror::Error, Debug)]
pub enum MappingIoError {
    #[error("ground mapping is not calibrated")]
    NotCalibrated,
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("stored homography is not invertible")]
    Singular,
    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: String, reason: String },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum MarkerCalibrationError {
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),
    #[error("no markers detected")]
    NoMarkers,
    #[error("{found} registered markers detected, need {required}")]
    NotEnoughRegistered { found: usize, required: usize },
    #[error(transparent)]
    Mapping(#[from] MappingError),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CoordinateError {
    #[error("ground mapping is not calibrated")]
    NotCalibrated,
    #[error("unknown coordinate type `{0}`, expected `cartesian` or `polar`")]
    UnknownType(String),
}
