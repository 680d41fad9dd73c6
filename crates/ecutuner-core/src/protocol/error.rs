//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to an OBD adapter
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Adapter response timeout")]
    Timeout,

    #[error("Not connected to adapter")]
    NotConnected,

    #[error("Adapter initialisation failed: {0}")]
    InitFailed(String),

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
