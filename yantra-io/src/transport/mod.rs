//! Byte transport abstraction.
//!
//! Bridges talk to hardware through [`Transport`] so the protocol layers
//! (line framing, STK500, tests) never depend on a physical port.

mod mock;
mod serial;

pub use mock::MockTransport;
pub use serial::SerialTransport;

use crate::error::Result;

/// A bidirectional byte stream to a device.
pub trait Transport: Send {
    /// Read available bytes into `buffer`. A timeout reads as `Ok(0)`.
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize>;

    /// Write bytes, returning how many were accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Block until pending writes reach the device.
    fn flush(&mut self) -> Result<()>;

    /// Bytes waiting in the receive buffer.
    fn available(&mut self) -> Result<usize>;

    /// Drive the DTR line (used to reset the microcontroller into its
    /// bootloader).
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Discard everything buffered on the receive side.
    fn clear_input(&mut self) -> Result<()>;
}

/// Factory producing transports, so the serial link can reopen the device
/// after detachment and tests can substitute [`MockTransport`].
pub type TransportFactory = Box<dyn Fn() -> Result<Box<dyn Transport>> + Send>;
