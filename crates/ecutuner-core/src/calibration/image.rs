//! Calibration image buffer

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::PI;

use super::{CalibrationError, BOOST_GRID};
use crate::vehicle::VehicleProfile;

/// Size of a generated image (1 MiB)
pub const IMAGE_SIZE: usize = 1024 * 1024;

/// Length of the noise-filled header region
pub const HEADER_LEN: usize = 0x1000;

const BOOST_BASE_MBAR: f64 = 1000.0;
const BOOST_PEAK_MBAR: f64 = 2200.0;

/// mbar per stored unit in the boost map
const BOOST_SCALE: f64 = 10.0;

/// Identity and map layout carried alongside an image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub vehicle_name: String,
    pub hardware_id: String,
    #[serde(default)]
    pub software_id: Option<String>,
    #[serde(default)]
    pub map_addresses: BTreeMap<String, usize>,
}

impl ImageMetadata {
    pub fn from_profile(profile: &VehicleProfile) -> Self {
        Self {
            vehicle_name: profile.name.clone(),
            hardware_id: profile.hardware_id.clone(),
            software_id: Some(profile.software_id.clone()),
            map_addresses: profile.map_addresses.clone(),
        }
    }

    /// First map whose name contains `fragment`
    pub fn find_map(&self, fragment: &str) -> Option<(&str, usize)> {
        self.map_addresses
            .iter()
            .find(|(name, _)| name.contains(fragment))
            .map(|(name, addr)| (name.as_str(), *addr))
    }
}

/// A calibration image with its load-time original
#[derive(Debug, Clone, Default)]
pub struct CalibrationImage {
    pub(super) current: Vec<u8>,
    pub(super) original: Vec<u8>,
    loaded: bool,
    filename: Option<String>,
    pub(super) metadata: Option<ImageMetadata>,
}

impl CalibrationImage {
    /// Create an empty, unloaded image
    pub fn new() -> Self {
        Self::default()
    }

    /// Synthesize an image for `profile` with fresh header noise
    pub fn load_generated(&mut self, profile: &VehicleProfile) {
        self.load_generated_with_rng(profile, &mut StdRng::from_entropy());
    }

    /// Synthesize an image for `profile`, drawing header noise from `rng`
    pub fn load_generated_with_rng<R: Rng + ?Sized>(
        &mut self,
        profile: &VehicleProfile,
        rng: &mut R,
    ) {
        let mut data = vec![0u8; IMAGE_SIZE];

        // Noise in the first half of every 16-byte header block
        for block in data[..HEADER_LEN].chunks_mut(16) {
            rng.fill(&mut block[..8]);
        }

        if let Some((name, addr)) = profile.find_map("Turbo") {
            tracing::debug!("Generating boost map '{}' at {:#x}", name, addr);
            write_boost_grid(&mut data, addr);
        }

        let filename = format!("{}_generated.bin", profile.hardware_id);
        self.load_bytes(data, filename, Some(ImageMetadata::from_profile(profile)));
    }

    /// Install `data` as both the current and the original buffer
    pub fn load_bytes(
        &mut self,
        data: Vec<u8>,
        filename: impl Into<String>,
        metadata: Option<ImageMetadata>,
    ) {
        let filename = filename.into();
        tracing::info!("Loaded calibration image '{}' ({} bytes)", filename, data.len());
        self.original = data.clone();
        self.current = data;
        self.loaded = true;
        self.filename = Some(filename);
        self.metadata = metadata;
    }

    /// Drop the loaded image
    pub fn unload(&mut self) {
        *self = Self::default();
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    pub fn metadata(&self) -> Option<&ImageMetadata> {
        self.metadata.as_ref()
    }

    /// Replace the metadata, e.g. after parsing an external description
    pub fn set_metadata(&mut self, metadata: Option<ImageMetadata>) {
        self.metadata = metadata;
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    /// Current (edited) bytes
    pub fn current(&self) -> &[u8] {
        &self.current
    }

    /// Bytes as they were at load time
    pub fn original(&self) -> &[u8] {
        &self.original
    }

    /// `length` bytes from `offset` in both views, zero padded past the end.
    ///
    /// Returns two empty vectors if nothing is loaded.
    pub fn get_window(&self, offset: usize, length: usize) -> (Vec<u8>, Vec<u8>) {
        if !self.loaded {
            return (Vec::new(), Vec::new());
        }
        (
            padded_window(&self.current, offset, length),
            padded_window(&self.original, offset, length),
        )
    }

    /// Overwrite one byte of the current buffer
    pub fn write_byte(&mut self, offset: usize, value: u8) -> Result<(), CalibrationError> {
        if !self.loaded {
            return Err(CalibrationError::NotLoaded);
        }
        let len = self.current.len();
        let byte = self
            .current
            .get_mut(offset)
            .ok_or(CalibrationError::OutOfRange { offset, len })?;
        *byte = value;
        Ok(())
    }

    /// Number of bytes that differ from the original
    pub fn changed_bytes(&self) -> usize {
        self.current
            .iter()
            .zip(&self.original)
            .filter(|(a, b)| a != b)
            .count()
    }

    pub fn is_modified(&self) -> bool {
        self.current != self.original
    }
}

fn padded_window(data: &[u8], offset: usize, length: usize) -> Vec<u8> {
    let mut window = vec![0u8; length];
    if offset < data.len() {
        let end = offset.saturating_add(length).min(data.len());
        window[..end - offset].copy_from_slice(&data[offset..end]);
    }
    window
}

/// Fill a 16x16 boost grid: pressure rises with load (row) and peaks mid-range (column)
fn write_boost_grid(data: &mut [u8], addr: usize) {
    let last = (BOOST_GRID - 1) as f64;
    for row in 0..BOOST_GRID {
        for col in 0..BOOST_GRID {
            let load = row as f64 / last;
            let shape = (col as f64 / last * PI).sin();
            let mbar = BOOST_BASE_MBAR + (BOOST_PEAK_MBAR - BOOST_BASE_MBAR) * load * shape;
            let value = (mbar / BOOST_SCALE).round().clamp(0.0, 255.0) as u8;

            if let Some(byte) = data.get_mut(addr + row * BOOST_GRID + col) {
                *byte = value;
            }
        }
    }
}
