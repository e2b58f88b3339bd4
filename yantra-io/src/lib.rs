//! YantraIO - hardware bridges for the robot runtime
//!
//! This crate owns every byte that crosses a device boundary:
//!
//! - [`transport`]: byte transport abstraction with serial and mock
//!   implementations
//! - [`link`]: line-framed serial link with a bounded write queue and
//!   auto-reconnect
//! - [`mcu`]: JSON command/telemetry codec for the motor microcontroller
//! - [`firmware`]: Intel-HEX parsing and STK500v1 flash programming
//! - [`thermal`]: raw USB frame parser for the thermal imager

pub mod error;
pub mod firmware;
pub mod link;
pub mod mcu;
pub mod thermal;
pub mod transport;

pub use error::{Error, Result};
