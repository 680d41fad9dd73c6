//! OBD-II Protocol
//!
//! ELM327-style text protocol: the [`bridge`] translates simulator state to
//! and from the hexadecimal wire format, links carry it over a virtual or a
//! real serial adapter.

pub mod bridge;
mod error;
mod link;
pub mod serial;

pub use error::ProtocolError;
pub use link::{
    available_links, connect, LinkTarget, LiveReading, ObdClient, ObdLink, VirtualElm327,
};
pub use serial::{list_ports, PortInfo, SerialConfig, SerialElm327};

/// Default baud rate for ELM327 adapters
pub const DEFAULT_BAUD_RATE: u32 = 38400;

/// Default timeout waiting for the adapter prompt in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Prompt character terminating every adapter reply
pub const PROMPT: char = '>';
