//! Thermal imager driver: raw USB bulk stream in, parsed frames out.
//!
//! The parser is pure ([`frame`]); the USB plumbing ([`usb`]) feeds it
//! and drains the auxiliary endpoints that would otherwise stall the
//! device.

mod frame;
pub mod usb;

pub use frame::{FrameParser, ThermalFrame, FRAME_HEIGHT, FRAME_WIDTH};
pub use usb::{ThermalCamera, ThermalConfig, ThermalEvent};
