//! Adapter links and the polling client

use serde::{Deserialize, Serialize};

use super::bridge::{self, PID_ENGINE_RPM, PID_VEHICLE_SPEED};
use super::serial::{list_ports, SerialConfig, SerialElm327};
use super::ProtocolError;
use crate::sim::Simulator;

/// A request/response channel to an ELM327-style adapter
pub trait ObdLink: Send {
    /// Send one command and return the reply with the prompt stripped
    fn query(&mut self, command: &str) -> Result<String, ProtocolError>;

    /// Human-readable name of the link
    fn description(&self) -> String;

    /// Release the underlying resource
    fn close(&mut self) {}
}

/// Adapter answering from a running simulator
pub struct VirtualElm327 {
    sim: Simulator,
}

impl VirtualElm327 {
    pub fn new(sim: Simulator) -> Self {
        Self { sim }
    }
}

impl ObdLink for VirtualElm327 {
    fn query(&mut self, command: &str) -> Result<String, ProtocolError> {
        Ok(bridge::respond(command, &self.sim.state()))
    }

    fn description(&self) -> String {
        format!("Virtual ECU ({})", self.sim.profile().name)
    }
}

/// Where to connect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkTarget {
    Virtual,
    Serial(String),
}

/// Virtual link first, then every serial port found
pub fn available_links() -> Vec<LinkTarget> {
    std::iter::once(LinkTarget::Virtual)
        .chain(list_ports().into_iter().map(|p| LinkTarget::Serial(p.name)))
        .collect()
}

/// Open a link to `target`
pub fn connect(
    target: &LinkTarget,
    sim: &Simulator,
    serial: &SerialConfig,
) -> Result<Box<dyn ObdLink>, ProtocolError> {
    match target {
        LinkTarget::Virtual => Ok(Box::new(VirtualElm327::new(sim.clone()))),
        LinkTarget::Serial(port) => Ok(Box::new(SerialElm327::open(port, serial)?)),
    }
}

/// One decoded poll of the live data PIDs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveReading {
    pub rpm: u32,
    /// km/h
    pub speed: u32,
    /// Raw RPM reply, or `ERR` if the link failed
    pub raw: String,
}

impl LiveReading {
    fn failed() -> Self {
        Self {
            rpm: 0,
            speed: 0,
            raw: "ERR".to_string(),
        }
    }
}

/// Client side of the wire protocol: polls RPM and speed and decodes them
pub struct ObdClient {
    link: Box<dyn ObdLink>,
}

impl ObdClient {
    pub fn new(link: Box<dyn ObdLink>) -> Self {
        Self { link }
    }

    /// Name of the underlying link
    pub fn description(&self) -> String {
        self.link.description()
    }

    /// Query RPM and speed. Link failures degrade to a zero reading.
    pub fn poll(&mut self) -> LiveReading {
        let raw_rpm = match self.link.query(PID_ENGINE_RPM) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("RPM query failed on {}: {}", self.link.description(), e);
                return LiveReading::failed();
            }
        };
        let raw_speed = match self.link.query(PID_VEHICLE_SPEED) {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("Speed query failed on {}: {}", self.link.description(), e);
                return LiveReading::failed();
            }
        };

        LiveReading {
            rpm: bridge::decode_rpm(&raw_rpm) as u32,
            speed: bridge::decode_speed(&raw_speed) as u32,
            raw: raw_rpm,
        }
    }

    /// Send an arbitrary command
    pub fn query(&mut self, command: &str) -> Result<String, ProtocolError> {
        self.link.query(command)
    }

    pub fn close(mut self) {
        self.link.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ControlInput, GearCommand, GearSelector, IgnitionCommand, SimulatorConfig};
    use crate::vehicle::VehicleSpecRegistry;
    use std::time::Duration;

    struct FlakyLink {
        replies: Vec<Result<String, ProtocolError>>,
    }

    impl ObdLink for FlakyLink {
        fn query(&mut self, _command: &str) -> Result<String, ProtocolError> {
            if self.replies.is_empty() {
                Err(ProtocolError::NotConnected)
            } else {
                self.replies.remove(0)
            }
        }

        fn description(&self) -> String {
            "flaky".to_string()
        }
    }

    #[test]
    fn test_virtual_link_matches_state() {
        let profile = VehicleSpecRegistry::builtin().get("golf_gti").unwrap();
        let sim = Simulator::new(profile, SimulatorConfig::default());
        sim.apply_controls(ControlInput {
            throttle: 0.6,
            gear: GearCommand::Select(GearSelector::Drive),
            ignition: IgnitionCommand::On,
            ..ControlInput::default()
        });
        for _ in 0..200 {
            sim.step(Duration::from_millis(20));
        }

        let state = sim.state();
        let mut client = ObdClient::new(Box::new(VirtualElm327::new(sim.clone())));
        assert_eq!(client.query("ATZ").unwrap(), bridge::ADAPTER_IDENT);

        let reading = client.poll();
        assert_eq!(reading.rpm, ((state.rpm * 4.0).round() / 4.0) as u32);
        assert_eq!(reading.speed, state.speed_kmh().round() as u32);
        assert!(reading.raw.starts_with("41 0C "));
    }

    #[test]
    fn test_poll_degrades_on_link_error() {
        let mut client = ObdClient::new(Box::new(FlakyLink {
            replies: vec![Ok("41 0C 3E 80".to_string()), Err(ProtocolError::Timeout)],
        }));
        assert_eq!(client.poll(), LiveReading::failed());
    }

    #[test]
    fn test_poll_with_garbage_reply() {
        let mut client = ObdClient::new(Box::new(FlakyLink {
            replies: vec![Ok("?".to_string()), Ok("41 0D 64".to_string())],
        }));
        let reading = client.poll();
        assert_eq!(reading.rpm, 0);
        assert_eq!(reading.speed, 100);
    }

    #[test]
    fn test_virtual_is_first_link() {
        assert_eq!(available_links().first(), Some(&LinkTarget::Virtual));
    }
}
