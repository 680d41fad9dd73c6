//! Application configuration
//!
//! One JSON document with a section per component. Every field is optional;
//! anything missing falls back to its default.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::flash::FlashConfig;
use crate::protocol::SerialConfig;
use crate::sim::SimulatorConfig;
use crate::store::StoreConfig;
use crate::vehicle::{VehicleError, VehicleSpecRegistry};

/// Profile selected when none is configured
pub const DEFAULT_VEHICLE: &str = "golf_gti";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    IoError(#[from] io::Error),

    #[error("Invalid config: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Vehicle registry: {0}")]
    VehicleError(#[from] VehicleError),
}

/// Top-level tuner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    /// Registry id of the profile to simulate at startup
    pub vehicle: String,
    /// Extra vehicle profiles; replaces the built-in table when set
    pub vehicles_file: Option<PathBuf>,
    pub simulator: SimulatorConfig,
    pub flash: FlashConfig,
    pub store: StoreConfig,
    pub serial: SerialConfig,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            vehicle: DEFAULT_VEHICLE.to_string(),
            vehicles_file: None,
            simulator: SimulatorConfig::default(),
            flash: FlashConfig::default(),
            store: StoreConfig::default(),
            serial: SerialConfig::default(),
        }
    }
}

impl TunerConfig {
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    /// Load `path` if it exists, otherwise use defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            tracing::info!("Loading config from {:?}", path);
            Self::from_file(path)
        } else {
            tracing::debug!("No config at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// The vehicle registry this configuration points at
    pub fn registry(&self) -> Result<VehicleSpecRegistry, ConfigError> {
        match &self.vehicles_file {
            Some(path) => Ok(VehicleSpecRegistry::from_file(path)?),
            None => Ok(VehicleSpecRegistry::builtin()),
        }
    }
}
