//! Error types for YantraIO
//!
//! Recovery expectations by variant:
//!
//! - `Serial` / `Io` / `Usb`: transport-level failures. The owning bridge
//!   closes the device and runs its reconnect loop; never fatal to the
//!   process.
//! - `Json`: a malformed telemetry or command line. Logged and dropped;
//!   the connection stays usable.
//! - `HexParse`: the firmware payload is unusable. Fails the upload before
//!   the serial link is touched.
//! - `Protocol` / `Timeout`: the bootloader answered wrongly or not at
//!   all. Aborts the upload; the caller resumes normal link operation.
//! - `NotConnected`: an operation needed an open device. Callers either
//!   retry later or surface the state to the operator.

use thiserror::Error;

/// Errors that can occur in YantraIO
#[derive(Error, Debug)]
pub enum Error {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HEX parse error: {0}")]
    HexParse(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Device not connected")]
    NotConnected,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
