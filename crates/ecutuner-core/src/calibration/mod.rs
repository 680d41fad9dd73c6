//! Calibration Images
//!
//! In-memory ECU firmware stand-in: a flat byte buffer with an untouched
//! original view, optional map metadata, and named tuning stages.

mod error;
mod image;
mod stage;

pub use error::CalibrationError;
pub use image::{CalibrationImage, ImageMetadata, HEADER_LEN, IMAGE_SIZE};
pub use stage::{Stage, StageReport, POPBANG_LEN, POPBANG_OFFSET};

/// Side length of the generated boost grid
pub const BOOST_GRID: usize = 16;
