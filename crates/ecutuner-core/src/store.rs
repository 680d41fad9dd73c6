//! Image Library
//!
//! Persists calibration images as a raw payload (`<stem>.bin`) plus a JSON
//! sidecar (`<stem>.json`) describing where the image came from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::calibration::ImageMetadata;

const PAYLOAD_EXT: &str = "bin";
const SIDECAR_EXT: &str = "json";

/// Errors raised by the image store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Image not found: {0}")]
    NotFound(String),

    #[error("Image '{file}' is unreadable: {message}")]
    Unreadable { file: String, message: String },

    #[error("Invalid image file name: {0}")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Whether a stored image is a factory read or an edited one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordType {
    #[serde(rename = "ORI")]
    Original,
    #[serde(rename = "MOD")]
    Modified,
}

/// Sidecar metadata written next to every payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sidecar {
    /// Name the caller saved the image under
    pub original_filename: String,
    pub car_name: String,
    pub ecu_hw: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecu_sw: Option<String>,
    #[serde(rename = "type")]
    pub record_type: RecordType,
    /// RFC 3339 save time
    pub date: String,
    pub size: usize,
    /// Map layout, so library images can still take stages
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub maps: BTreeMap<String, usize>,
}

impl Sidecar {
    /// Metadata to attach when loading the payload into an image
    pub fn image_metadata(&self) -> ImageMetadata {
        ImageMetadata {
            vehicle_name: self.car_name.clone(),
            hardware_id: self.ecu_hw.clone(),
            software_id: self.ecu_sw.clone(),
            map_addresses: self.maps.clone(),
        }
    }
}

/// Summary row for one stored image
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredImageRecord {
    /// Payload file name inside the store
    pub filename: String,
    pub vehicle_name: String,
    pub hardware_id: String,
    pub record_type: RecordType,
    pub timestamp: String,
    pub byte_length: usize,
}

/// Image store location
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Store directory; `None` uses [`ImageStore::default_path`]
    pub root: Option<PathBuf>,
}

/// Directory of stored calibration images
pub struct ImageStore {
    path: PathBuf,
}

impl ImageStore {
    /// Default store directory (in app data)
    pub fn default_path() -> io::Result<PathBuf> {
        let base = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "Could not find app data directory")
            })?;
        Ok(base.join("ECUTuner").join("images"))
    }

    /// Open or create the store
    pub fn open(path: Option<&Path>) -> Result<Self, StoreError> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    /// Open the store described by `config`
    pub fn from_config(config: &StoreConfig) -> Result<Self, StoreError> {
        Self::open(config.root.as_deref())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Save a payload and its sidecar. Returns the payload file name.
    pub fn save(
        &self,
        name: &str,
        bytes: &[u8],
        vehicle: &ImageMetadata,
        record_type: RecordType,
    ) -> Result<String, StoreError> {
        let now = Utc::now();
        let stem = self.unique_stem(&sanitize_name(name), &now);
        let payload = self.path.join(format!("{}.{}", stem, PAYLOAD_EXT));
        let sidecar_path = self.path.join(format!("{}.{}", stem, SIDECAR_EXT));

        let sidecar = Sidecar {
            original_filename: name.to_string(),
            car_name: vehicle.vehicle_name.clone(),
            ecu_hw: vehicle.hardware_id.clone(),
            ecu_sw: vehicle.software_id.clone(),
            record_type,
            date: now.to_rfc3339(),
            size: bytes.len(),
            maps: vehicle.map_addresses.clone(),
        };
        let content = serde_json::to_string_pretty(&sidecar)?;

        fs::write(&payload, bytes)?;
        if let Err(e) = fs::write(&sidecar_path, content) {
            // Do not leave a payload without its description
            discard_payload(&payload);
            return Err(e.into());
        }

        let filename = format!("{}.{}", stem, PAYLOAD_EXT);
        tracing::info!(
            "Stored {:?} image '{}' ({} bytes)",
            record_type,
            filename,
            bytes.len()
        );
        Ok(filename)
    }

    /// All payloads with a readable sidecar, newest first
    pub fn list(&self) -> Vec<StoredImageRecord> {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("Cannot list image store {:?}: {}", self.path, e);
                return Vec::new();
            }
        };

        let mut records: Vec<StoredImageRecord> = entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && has_extension(path, PAYLOAD_EXT))
            .filter_map(|path| {
                let filename = path.file_name()?.to_str()?.to_string();
                let sidecar = read_sidecar(&path.with_extension(SIDECAR_EXT)).ok()?;
                Some(StoredImageRecord {
                    filename,
                    vehicle_name: sidecar.car_name,
                    hardware_id: sidecar.ecu_hw,
                    record_type: sidecar.record_type,
                    timestamp: sidecar.date,
                    byte_length: sidecar.size,
                })
            })
            .collect();

        records.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.filename.cmp(&b.filename))
        });
        records
    }

    /// Read a payload and its sidecar
    pub fn load(&self, filename: &str) -> Result<(Vec<u8>, Sidecar), StoreError> {
        let payload = self.payload_path(filename)?;
        if !payload.is_file() {
            return Err(StoreError::NotFound(filename.to_string()));
        }

        let bytes = fs::read(&payload).map_err(|e| StoreError::Unreadable {
            file: filename.to_string(),
            message: e.to_string(),
        })?;

        let sidecar_path = payload.with_extension(SIDECAR_EXT);
        if !sidecar_path.is_file() {
            return Err(StoreError::NotFound(format!("{} (metadata)", filename)));
        }
        let sidecar = read_sidecar(&sidecar_path).map_err(|e| StoreError::Unreadable {
            file: filename.to_string(),
            message: e.to_string(),
        })?;

        Ok((bytes, sidecar))
    }

    /// Remove a payload and its sidecar.
    ///
    /// The sidecar goes first: if removing the payload then fails, the
    /// leftover is invisible to [`ImageStore::list`] and is reclaimed by
    /// [`ImageStore::purge_orphans`].
    pub fn delete(&self, filename: &str) -> Result<(), StoreError> {
        let payload = self.payload_path(filename)?;
        let sidecar = payload.with_extension(SIDECAR_EXT);

        if !payload.is_file() && !sidecar.is_file() {
            return Err(StoreError::NotFound(filename.to_string()));
        }

        if sidecar.is_file() {
            fs::remove_file(&sidecar)?;
        }
        if payload.is_file() {
            fs::remove_file(&payload)?;
        }

        tracing::info!("Deleted stored image '{}'", filename);
        Ok(())
    }

    /// Delete payloads that have no sidecar. Returns the removed file names.
    pub fn purge_orphans(&self) -> Result<Vec<String>, StoreError> {
        let mut removed = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let path = entry?.path();
            if !path.is_file() || !has_extension(&path, PAYLOAD_EXT) {
                continue;
            }
            if path.with_extension(SIDECAR_EXT).exists() {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                        removed.push(name.to_string());
                    }
                }
                Err(e) => tracing::warn!("Failed to purge orphan {:?}: {}", path, e),
            }
        }
        Ok(removed)
    }

    fn payload_path(&self, filename: &str) -> Result<PathBuf, StoreError> {
        let bare = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n == filename);
        if !bare || filename.is_empty() || !has_extension(Path::new(filename), PAYLOAD_EXT) {
            return Err(StoreError::InvalidName(filename.to_string()));
        }
        Ok(self.path.join(filename))
    }

    fn unique_stem(&self, base: &str, now: &DateTime<Utc>) -> String {
        let stamp = now.format("%Y%m%d_%H%M%S_%3f");
        let mut stem = format!("{}_{}", base, stamp);
        let mut n = 1;
        while self.path.join(format!("{}.{}", stem, PAYLOAD_EXT)).exists()
            || self.path.join(format!("{}.{}", stem, SIDECAR_EXT)).exists()
        {
            stem = format!("{}_{}_{}", base, stamp, n);
            n += 1;
        }
        stem
    }
}

/// Reduce a display name to a filesystem-safe token
fn sanitize_name(name: &str) -> String {
    let stem = name
        .strip_suffix(&format!(".{}", PAYLOAD_EXT))
        .unwrap_or(name)
        .trim();
    let safe: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if safe.is_empty() {
        "image".to_string()
    } else {
        safe
    }
}

/// Remove a payload whose sidecar could not be written.
/// Returns false (and logs) if the payload is left behind as an orphan.
fn discard_payload(payload: &Path) -> bool {
    match fs::remove_file(payload) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(
                "Left orphan payload {:?} (reclaim with purge_orphans): {}",
                payload,
                e
            );
            false
        }
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

fn read_sidecar(path: &Path) -> Result<Sidecar, StoreError> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vehicle() -> ImageMetadata {
        ImageMetadata {
            vehicle_name: "VW Golf GTI Mk7".to_string(),
            hardware_id: "06K907425B".to_string(),
            software_id: Some("SC800H6300000".to_string()),
            map_addresses: [("Turbo_Boost_Map".to_string(), 0x1_C000)].into_iter().collect(),
        }
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("VW Golf/GTI:Mk7"), "VW_Golf_GTI_Mk7");
        assert_eq!(sanitize_name("stock.bin"), "stock");
        assert_eq!(sanitize_name("../../etc"), "______etc");
        assert_eq!(sanitize_name("  "), "image");
    }

    #[test]
    fn test_sidecar_field_names() {
        let sidecar = Sidecar {
            original_filename: "stock".to_string(),
            car_name: "Car".to_string(),
            ecu_hw: "HW".to_string(),
            ecu_sw: None,
            record_type: RecordType::Modified,
            date: "2024-01-01T00:00:00+00:00".to_string(),
            size: 4,
            maps: BTreeMap::new(),
        };
        let json = serde_json::to_value(&sidecar).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "original_filename": "stock",
                "car_name": "Car",
                "ecu_hw": "HW",
                "type": "MOD",
                "date": "2024-01-01T00:00:00+00:00",
                "size": 4,
            })
        );
    }

    #[test]
    fn test_save_names_are_unique() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::open(Some(dir.path())).unwrap();

        let a = store.save("same", &[1], &vehicle(), RecordType::Original).unwrap();
        let b = store.save("same", &[2], &vehicle(), RecordType::Original).unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with("same_") && a.ends_with(".bin"));
        assert_eq!(store.list().len(), 2);
    }

    #[test]
    fn test_discard_payload_reports_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("partial.bin");
        fs::write(&payload, [1u8, 2, 3]).unwrap();

        assert!(discard_payload(&payload));
        assert!(!payload.exists());
        assert!(!discard_payload(&payload));

        // A directory in the payload's place cannot be removed as a file
        let blocked = dir.path().join("blocked.bin");
        fs::create_dir(&blocked).unwrap();
        assert!(!discard_payload(&blocked));
        assert!(blocked.exists());
    }

    #[test]
    fn test_rejects_path_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = ImageStore::open(Some(dir.path())).unwrap();

        for name in ["../x.bin", "sub/x.bin", "", "x.json"] {
            assert!(matches!(store.load(name), Err(StoreError::InvalidName(_))), "{}", name);
            assert!(matches!(store.delete(name), Err(StoreError::InvalidName(_))), "{}", name);
        }
    }
}
