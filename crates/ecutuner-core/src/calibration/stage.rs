//! Tuning stages
//!
//! A closed set of predefined edits. Stages that touch a map look its address
//! up in the image metadata and fail if the map is absent.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{CalibrationError, CalibrationImage};

/// Bytes of the boost map touched by stage 1
const STAGE1_WINDOW: usize = 256;

/// Stage 1 only raises cells above this value
const STAGE1_THRESHOLD: u8 = 120;

const STAGE1_GAIN: f64 = 1.15;

const EGR_WINDOW: usize = 16;

/// Fixed location of the overrun fuel-cut table
pub const POPBANG_OFFSET: usize = 0x8000;
pub const POPBANG_LEN: usize = 32;

/// A named tuning stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// +15% on the upper boost cells
    Stage1,
    /// Disable exhaust gas recirculation
    EgrOff,
    /// Zero the overrun fuel-cut table
    PopBang,
    /// Back to the loaded original
    Restore,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Stage1, Stage::EgrOff, Stage::PopBang, Stage::Restore];

    pub fn name(self) -> &'static str {
        match self {
            Stage::Stage1 => "stage1",
            Stage::EgrOff => "egroff",
            Stage::PopBang => "popbang",
            Stage::Restore => "restore",
        }
    }

    /// Map-name fragment the stage needs in the metadata, if any
    pub fn required_map(self) -> Option<&'static str> {
        match self {
            Stage::Stage1 => Some("Turbo"),
            Stage::EgrOff => Some("EGR"),
            Stage::PopBang | Stage::Restore => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Stage {
    type Err = CalibrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Stage::ALL
            .into_iter()
            .find(|stage| stage.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| CalibrationError::UnknownStage(wanted.to_string()))
    }
}

/// What a stage changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    /// Start of the edited region (0 for restore)
    pub offset: usize,
    /// Bytes whose value changed
    pub bytes_changed: usize,
}

impl CalibrationImage {
    /// Apply a stage to the current buffer
    pub fn apply_stage(&mut self, stage: Stage) -> Result<StageReport, CalibrationError> {
        if stage == Stage::Restore {
            let bytes_changed = self.changed_bytes();
            self.current.clone_from(&self.original);
            tracing::info!("Restored original image ({} bytes reverted)", bytes_changed);
            return Ok(StageReport {
                stage,
                offset: 0,
                bytes_changed,
            });
        }

        let offset = match stage.required_map() {
            Some(_) if !self.is_loaded() => return Err(CalibrationError::NotLoaded),
            Some(fragment) => self.map_address(stage, fragment)?,
            None => POPBANG_OFFSET,
        };

        let len = self.current.len();
        if offset >= len {
            if stage == Stage::PopBang {
                // Image too short to hold the table: nothing to zero
                tracing::debug!("{} skipped: image is only {} bytes", stage, len);
                return Ok(StageReport {
                    stage,
                    offset,
                    bytes_changed: 0,
                });
            }
            return Err(CalibrationError::OutOfRange { offset, len });
        }

        let window = match stage {
            Stage::Stage1 => STAGE1_WINDOW,
            Stage::EgrOff => EGR_WINDOW,
            _ => POPBANG_LEN,
        };
        let end = offset.saturating_add(window).min(len);
        let region = &mut self.current[offset..end];

        let mut bytes_changed = 0;
        for byte in region.iter_mut() {
            let new = match stage {
                Stage::Stage1 if *byte > STAGE1_THRESHOLD => {
                    (*byte as f64 * STAGE1_GAIN).round().min(255.0) as u8
                }
                Stage::Stage1 => *byte,
                _ => 0,
            };
            if new != *byte {
                *byte = new;
                bytes_changed += 1;
            }
        }

        tracing::info!(
            "Applied {} at {:#x}: {} bytes changed",
            stage,
            offset,
            bytes_changed
        );
        Ok(StageReport {
            stage,
            offset,
            bytes_changed,
        })
    }

    /// Parse a stage name and apply it
    pub fn apply_stage_named(&mut self, name: &str) -> Result<StageReport, CalibrationError> {
        self.apply_stage(name.parse()?)
    }

    fn map_address(&self, stage: Stage, fragment: &str) -> Result<usize, CalibrationError> {
        self.metadata
            .as_ref()
            .and_then(|meta| meta.find_map(fragment))
            .map(|(_, addr)| addr)
            .ok_or_else(|| CalibrationError::MissingMap {
                stage: stage.name().to_string(),
                map: fragment.to_string(),
            })
    }
}
