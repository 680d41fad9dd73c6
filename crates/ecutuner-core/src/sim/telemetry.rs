//! Dashboard telemetry snapshot

use serde::{Deserialize, Serialize};

use super::state::{GearSelector, VehicleState};
use crate::vehicle::VehicleProfile;

/// Immutable telemetry copy handed to dashboards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub rpm: u32,
    /// km/h
    pub speed: u32,
    /// `P`, `N`, or the forward gear number
    pub gear: String,
    pub engine_on: bool,
    /// Coolant temperature, °C
    pub temp: i32,
    /// Battery voltage rounded to one decimal
    pub volt: f64,
    /// Throttle percent
    pub throttle: u8,
    /// Vehicle name
    pub car: String,
}

impl Telemetry {
    /// Derive telemetry from a state and the profile it runs against
    pub fn from_state(state: &VehicleState, profile: &VehicleProfile) -> Self {
        Self {
            rpm: state.rpm.round() as u32,
            speed: state.speed_kmh().round() as u32,
            gear: gear_label(state),
            engine_on: state.engine_on,
            temp: state.coolant_temp.round() as i32,
            volt: (state.battery_volts * 10.0).round() / 10.0,
            throttle: (state.throttle * 100.0).round() as u8,
            car: profile.name.clone(),
        }
    }
}

fn gear_label(state: &VehicleState) -> String {
    match state.gear_selector {
        GearSelector::Park => "P".to_string(),
        GearSelector::Neutral => "N".to_string(),
        GearSelector::Drive => state.current_gear.to_string(),
    }
}
