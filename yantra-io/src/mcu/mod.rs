//! MCU bridge: JSON-per-line command/telemetry protocol.

mod bridge;
mod protocol;
#[cfg(feature = "sim")]
pub mod sim;

pub use bridge::{BridgeEvent, McuBridge, DIST_SENTINEL_CM};
pub use protocol::{
    is_noteworthy, remap_keys, McuCommand, Telemetry, BOOT_STREAM_PERIOD_MS, BOOT_WATCHDOG_MS,
};
