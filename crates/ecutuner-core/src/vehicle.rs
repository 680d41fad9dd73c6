//! Vehicle profiles
//!
//! Static table of vehicle definitions the simulator and calibration
//! generator draw from. Profiles are immutable once built; the selected one
//! is shared as `Arc<VehicleProfile>`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Gear index used for reverse in [`VehicleProfile::gear_ratios`]
pub const REVERSE_GEAR: i8 = -1;

/// Errors raised while building or querying the registry
#[derive(Error, Debug)]
pub enum VehicleError {
    #[error("Unknown vehicle profile: {0}")]
    UnknownProfile(String),

    #[error("Invalid profile '{id}': {message}")]
    InvalidProfile { id: String, message: String },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Immutable description of one vehicle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleProfile {
    /// Display name
    pub name: String,

    /// ECU hardware part number
    pub hardware_id: String,

    /// ECU software version
    pub software_id: String,

    pub mass_kg: f64,

    pub max_torque_nm: f64,

    pub max_rpm: f64,

    /// Gear index to ratio. Forward gears start at 1, reverse is -1.
    pub gear_ratios: BTreeMap<i8, f64>,

    pub final_drive_ratio: f64,

    /// Calibration map name to byte offset inside the image
    pub map_addresses: BTreeMap<String, usize>,

    /// Normalised torque curve as (rpm, factor) points. Empty means flat.
    #[serde(default)]
    pub torque_curve: Vec<(f64, f64)>,
}

impl VehicleProfile {
    /// Highest forward gear index (at least 1)
    pub fn top_gear(&self) -> i8 {
        self.gear_ratios
            .keys()
            .copied()
            .filter(|g| *g > 0)
            .max()
            .unwrap_or(1)
    }

    /// Ratio for a gear, falling back to first gear for unknown indices
    pub fn gear_ratio(&self, gear: i8) -> f64 {
        self.gear_ratios
            .get(&gear)
            .or_else(|| self.gear_ratios.get(&1))
            .copied()
            .unwrap_or(1.0)
    }

    /// Torque factor in `[0, 1]` at the given RPM.
    ///
    /// Linear interpolation between curve points, held flat past either end.
    pub fn torque_factor(&self, rpm: f64) -> f64 {
        let curve = &self.torque_curve;
        let (first, last) = match (curve.first(), curve.last()) {
            (Some(f), Some(l)) => (*f, *l),
            _ => return 1.0,
        };

        if rpm <= first.0 {
            return first.1.clamp(0.0, 1.0);
        }
        if rpm >= last.0 {
            return last.1.clamp(0.0, 1.0);
        }

        for pair in curve.windows(2) {
            let (x0, y0) = pair[0];
            let (x1, y1) = pair[1];
            if rpm >= x0 && rpm <= x1 {
                let span = x1 - x0;
                if span <= f64::EPSILON {
                    return y1.clamp(0.0, 1.0);
                }
                return (y0 + (y1 - y0) * (rpm - x0) / span).clamp(0.0, 1.0);
            }
        }
        1.0
    }

    /// Find the first map whose name contains `fragment`
    pub fn find_map(&self, fragment: &str) -> Option<(&str, usize)> {
        self.map_addresses
            .iter()
            .find(|(name, _)| name.contains(fragment))
            .map(|(name, addr)| (name.as_str(), *addr))
    }

    fn validate(&self, id: &str) -> Result<(), VehicleError> {
        let invalid = |message: &str| VehicleError::InvalidProfile {
            id: id.to_string(),
            message: message.to_string(),
        };

        if self.mass_kg <= 0.0 {
            return Err(invalid("mass must be positive"));
        }
        if self.max_rpm <= 0.0 {
            return Err(invalid("max_rpm must be positive"));
        }
        if !self.gear_ratios.contains_key(&1) {
            return Err(invalid("first gear ratio missing"));
        }
        if self.final_drive_ratio <= 0.0 {
            return Err(invalid("final drive ratio must be positive"));
        }
        Ok(())
    }
}

/// Registry of vehicle profiles keyed by short identifier
#[derive(Debug, Clone, Default)]
pub struct VehicleSpecRegistry {
    profiles: BTreeMap<String, Arc<VehicleProfile>>,
}

impl VehicleSpecRegistry {
    /// Registry with the built-in profiles
    pub fn builtin() -> Self {
        let mut profiles = BTreeMap::new();
        for (id, profile) in builtin_profiles() {
            profiles.insert(id.to_string(), Arc::new(profile));
        }
        Self { profiles }
    }

    /// Parse a registry from JSON: an object of id -> profile
    pub fn from_json_str(json: &str) -> Result<Self, VehicleError> {
        let raw: BTreeMap<String, VehicleProfile> = serde_json::from_str(json)?;
        let mut profiles = BTreeMap::new();
        for (id, profile) in raw {
            profile.validate(&id)?;
            profiles.insert(id, Arc::new(profile));
        }
        Ok(Self { profiles })
    }

    /// Load a registry from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, VehicleError> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Serialize the registry back to pretty JSON
    pub fn to_json(&self) -> Result<String, VehicleError> {
        let raw: BTreeMap<&String, &VehicleProfile> =
            self.profiles.iter().map(|(k, v)| (k, v.as_ref())).collect();
        Ok(serde_json::to_string_pretty(&raw)?)
    }

    /// Look up a profile by id
    pub fn get(&self, id: &str) -> Result<Arc<VehicleProfile>, VehicleError> {
        self.profiles
            .get(id)
            .cloned()
            .ok_or_else(|| VehicleError::UnknownProfile(id.to_string()))
    }

    /// All profile ids, sorted
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

fn ratios(reverse: f64, forward: &[f64]) -> BTreeMap<i8, f64> {
    let mut map = BTreeMap::new();
    map.insert(REVERSE_GEAR, reverse);
    for (i, r) in forward.iter().enumerate() {
        map.insert(i as i8 + 1, *r);
    }
    map
}

fn maps(entries: &[(&str, usize)]) -> BTreeMap<String, usize> {
    entries
        .iter()
        .map(|(name, addr)| (name.to_string(), *addr))
        .collect()
}

fn builtin_profiles() -> Vec<(&'static str, VehicleProfile)> {
    vec![
        (
            "golf_gti",
            VehicleProfile {
                name: "VW Golf GTI Mk7".to_string(),
                hardware_id: "06K907425B".to_string(),
                software_id: "SC800H6300000".to_string(),
                mass_kg: 1350.0,
                max_torque_nm: 350.0,
                max_rpm: 6800.0,
                gear_ratios: ratios(3.99, &[3.46, 2.05, 1.30, 0.90, 0.82, 0.76]),
                final_drive_ratio: 3.65,
                map_addresses: maps(&[
                    ("Turbo_Boost_Map", 0x1_C000),
                    ("EGR_Map", 0x1_E400),
                    ("Torque_Limiter", 0x2_0000),
                ]),
                torque_curve: vec![
                    (1000.0, 0.55),
                    (1500.0, 1.0),
                    (4500.0, 1.0),
                    (6200.0, 0.8),
                    (6800.0, 0.65),
                ],
            },
        ),
        (
            "fiesta_st",
            VehicleProfile {
                name: "Ford Fiesta ST".to_string(),
                hardware_id: "H1BA-12A650".to_string(),
                software_id: "H1BA-14C204-RB".to_string(),
                mass_kg: 1160.0,
                max_torque_nm: 290.0,
                max_rpm: 6500.0,
                gear_ratios: ratios(3.42, &[3.73, 2.05, 1.36, 1.03, 0.82, 0.69]),
                final_drive_ratio: 3.82,
                map_addresses: maps(&[
                    ("Turbo_Boost_Map", 0x2_4000),
                    ("EGR_Valve_Map", 0x2_6800),
                ]),
                torque_curve: Vec::new(),
            },
        ),
        (
            "m3_e46",
            VehicleProfile {
                name: "BMW M3 E46".to_string(),
                hardware_id: "MSS54HP".to_string(),
                software_id: "7831526".to_string(),
                mass_kg: 1570.0,
                max_torque_nm: 365.0,
                max_rpm: 8000.0,
                gear_ratios: ratios(3.68, &[4.23, 2.53, 1.67, 1.23, 1.00, 0.83]),
                final_drive_ratio: 3.62,
                // Naturally aspirated: no boost map
                map_addresses: maps(&[("Ignition_Map", 0x1_0000), ("VANOS_Map", 0x1_2000)]),
                torque_curve: vec![(1000.0, 0.6), (4900.0, 1.0), (8000.0, 0.85)],
            },
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        let registry = VehicleSpecRegistry::builtin();
        assert_eq!(registry.len(), 3);

        let golf = registry.get("golf_gti").unwrap();
        assert_eq!(golf.hardware_id, "06K907425B");
        assert_eq!(golf.top_gear(), 6);
        assert!(golf.gear_ratios.contains_key(&REVERSE_GEAR));

        assert!(matches!(
            registry.get("trabant"),
            Err(VehicleError::UnknownProfile(_))
        ));
    }

    #[test]
    fn test_builtin_forward_ratios_descend() {
        let registry = VehicleSpecRegistry::builtin();
        for id in registry.ids() {
            let profile = registry.get(id).unwrap();
            let forward: Vec<f64> = (1..=profile.top_gear())
                .map(|gear| profile.gear_ratio(gear))
                .collect();
            assert!(
                forward.windows(2).all(|w| w[0] > w[1]),
                "{}: {:?}",
                id,
                forward
            );
        }
    }

    #[test]
    fn test_torque_factor_interpolation() {
        let registry = VehicleSpecRegistry::builtin();
        let golf = registry.get("golf_gti").unwrap();

        assert_eq!(golf.torque_factor(500.0), 0.55);
        assert_eq!(golf.torque_factor(3000.0), 1.0);
        let mid = golf.torque_factor(1250.0);
        assert!((mid - 0.775).abs() < 1e-9, "got {}", mid);

        let fiesta = registry.get("fiesta_st").unwrap();
        assert_eq!(fiesta.torque_factor(4000.0), 1.0);
    }

    #[test]
    fn test_find_map_by_fragment() {
        let registry = VehicleSpecRegistry::builtin();
        let fiesta = registry.get("fiesta_st").unwrap();
        assert_eq!(fiesta.find_map("EGR"), Some(("EGR_Valve_Map", 0x2_6800)));
        assert_eq!(fiesta.find_map("Lambda"), None);
    }

    #[test]
    fn test_json_roundtrip() {
        let registry = VehicleSpecRegistry::builtin();
        let json = registry.to_json().unwrap();
        let parsed = VehicleSpecRegistry::from_json_str(&json).unwrap();

        let ids: Vec<_> = parsed.ids().collect();
        assert_eq!(ids, vec!["fiesta_st", "golf_gti", "m3_e46"]);
        let original = registry.get("m3_e46").unwrap();
        let reparsed = parsed.get("m3_e46").unwrap();
        assert_eq!(reparsed.name, original.name);
        assert_eq!(reparsed.hardware_id, original.hardware_id);
        assert_eq!(reparsed.map_addresses, original.map_addresses);
        assert_eq!(
            reparsed.gear_ratios.keys().collect::<Vec<_>>(),
            original.gear_ratios.keys().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_invalid_profile_rejected() {
        let json = r#"{
            "broken": {
                "name": "Broken", "hardware_id": "X", "software_id": "Y",
                "mass_kg": 0.0, "max_torque_nm": 100.0, "max_rpm": 6000.0,
                "gear_ratios": {"1": 3.0}, "final_drive_ratio": 4.0,
                "map_addresses": {}
            }
        }"#;
        assert!(matches!(
            VehicleSpecRegistry::from_json_str(json),
            Err(VehicleError::InvalidProfile { .. })
        ));
    }
}
