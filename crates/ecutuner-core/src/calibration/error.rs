//! Calibration errors

use thiserror::Error;

/// Errors raised when editing a calibration image
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CalibrationError {
    #[error("No calibration image loaded")]
    NotLoaded,

    #[error("Stage '{stage}' requires a map containing '{map}' in the image metadata")]
    MissingMap { stage: String, map: String },

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Offset {offset:#x} outside image of {len} bytes")]
    OutOfRange { offset: usize, len: usize },
}
