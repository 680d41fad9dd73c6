//! # ECU Tuner Core Library
//!
//! Core functionality for the ECU tuner workbench.
//!
//! This library provides:
//! - A real-time vehicle physics simulator
//! - An ELM327-style OBD-II bridge (virtual and serial adapters)
//! - Calibration images with predefined tuning stages
//! - An on-disk image library with JSON metadata
//! - Simulated ECU read/write jobs with a hardware-id safety gate
//!
//! ## Example
//!
//! ```rust,ignore
//! use ecutuner_core::prelude::*;
//!
//! let registry = VehicleSpecRegistry::builtin();
//! let sim = Simulator::spawn(registry.get("golf_gti")?, SimulatorConfig::default())?;
//!
//! let mut client = ObdClient::new(Box::new(VirtualElm327::new(sim.clone())));
//! let reading = client.poll();
//! println!("RPM: {} speed: {} km/h", reading.rpm, reading.speed);
//! ```

pub mod calibration;
pub mod config;
pub mod flash;
pub mod protocol;
pub mod sim;
pub mod store;
pub mod vehicle;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::calibration::{CalibrationError, CalibrationImage, ImageMetadata, Stage};
    pub use crate::config::TunerConfig;
    pub use crate::flash::{FlashConfig, FlashJob, FlashWorkflow, JobPhase, JobStart};
    pub use crate::protocol::{LiveReading, ObdClient, ObdLink, VirtualElm327};
    pub use crate::sim::{
        ControlInput, GearCommand, GearSelector, IgnitionCommand, Simulator, SimulatorConfig,
        Telemetry,
    };
    pub use crate::store::{ImageStore, RecordType, StoredImageRecord};
    pub use crate::vehicle::{VehicleProfile, VehicleSpecRegistry};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
