//! Serial port handling
//!
//! Port discovery and a real ELM327 adapter link over `serialport`.

use serde::{Deserialize, Serialize};
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use super::link::ObdLink;
use super::{ProtocolError, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS, PROMPT};

/// Commands sent to a freshly opened adapter: reset, echo off, automatic protocol
const INIT_SEQUENCE: [&str; 3] = ["ATZ", "ATE0", "ATSP0"];

/// Serial link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub baud_rate: u32,
    /// How long to wait for the `>` prompt
    pub timeout_ms: u64,
    /// Pause between initialisation commands
    pub init_delay_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            init_delay_ms: 200,
        }
    }
}

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, product) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => {
                (Some(usb_info.vid), Some(usb_info.pid), usb_info.product)
            }
            _ => (None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            product,
        }
    }
}

/// Sort key putting USB serial adapters (ttyUSB*, then ttyACM*) first,
/// numerically by suffix, then everything else by name
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    if let Some(rest) = basename.strip_prefix("ttyUSB") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (0, num, basename.to_string());
    }
    if let Some(rest) = basename.strip_prefix("ttyACM") {
        let num = rest.parse::<usize>().unwrap_or(usize::MAX);
        return (1, num, basename.to_string());
    }
    (2, 0, basename.to_string())
}

/// List available serial ports in a deterministic order
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // Some USB adapters only show up under /dev
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyUSB") || fname.starts_with("rfcomm") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone()).or_insert_with(|| PortInfo {
                        name: full,
                        vid: None,
                        pid: None,
                        product: None,
                    });
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Open and configure a port for 8N1 without flow control
fn open_port(name: &str, config: &SerialConfig) -> Result<Box<dyn SerialPort>, ProtocolError> {
    // Short read timeout; the prompt deadline is enforced by the caller
    let port = serialport::new(name, config.baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::None)
        .timeout(Duration::from_millis(50))
        .open()
        .map_err(|e| match e.kind() {
            serialport::ErrorKind::NoDevice => ProtocolError::PortNotFound(name.to_string()),
            _ => ProtocolError::SerialError(e.to_string()),
        })?;

    port.clear(serialport::ClearBuffer::All)
        .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
    Ok(port)
}

/// Strip the prompt and line noise from a raw adapter reply
fn clean_reply(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .replace(PROMPT, "")
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// A real ELM327 adapter on a serial port
pub struct SerialElm327 {
    port: Option<Box<dyn SerialPort>>,
    name: String,
    timeout: Duration,
}

impl SerialElm327 {
    /// Open the port and run the adapter initialisation sequence
    pub fn open(name: &str, config: &SerialConfig) -> Result<Self, ProtocolError> {
        tracing::info!("Opening ELM327 on {} at {} baud", name, config.baud_rate);
        let port = open_port(name, config)?;

        let mut link = Self {
            port: Some(port),
            name: name.to_string(),
            timeout: Duration::from_millis(config.timeout_ms),
        };

        for cmd in INIT_SEQUENCE {
            let reply = link
                .query(cmd)
                .map_err(|e| ProtocolError::InitFailed(format!("{}: {}", cmd, e)))?;
            tracing::debug!("init {} -> {:?}", cmd, reply);
            std::thread::sleep(Duration::from_millis(config.init_delay_ms));
        }

        Ok(link)
    }

    fn read_until_prompt(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let port = self.port.as_mut().ok_or(ProtocolError::NotConnected)?;
        let deadline = Instant::now() + self.timeout;
        let mut reply = Vec::new();
        let mut chunk = [0u8; 64];

        loop {
            match port.read(&mut chunk) {
                Ok(0) => {}
                Ok(n) => {
                    reply.extend_from_slice(&chunk[..n]);
                    if reply.contains(&(PROMPT as u8)) {
                        return Ok(reply);
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }

            if Instant::now() >= deadline {
                if reply.is_empty() {
                    return Err(ProtocolError::Timeout);
                }
                tracing::warn!(
                    "{}: prompt not seen before timeout, using partial reply",
                    self.name
                );
                return Ok(reply);
            }
        }
    }
}

impl ObdLink for SerialElm327 {
    fn query(&mut self, command: &str) -> Result<String, ProtocolError> {
        let port = self.port.as_mut().ok_or(ProtocolError::NotConnected)?;
        port.write_all(format!("{}\r", command).as_bytes())?;

        let raw = self.read_until_prompt()?;
        let reply = clean_reply(&raw);
        tracing::debug!("{} TX {:?} RX {:?}", self.name, command, reply);
        Ok(reply)
    }

    fn description(&self) -> String {
        self.name.clone()
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            tracing::info!("Closed ELM327 on {}", self.name);
        }
    }
}
