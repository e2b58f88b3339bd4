//! YantraNav - robot runtime daemon
//!
//! Composes the hardware bridges from `yantra-io` and the mapping stack
//! from `yantra-map` into one long-lived runtime:
//!
//! - [`supervisor::Supervisor`]: owns every bridge, arbitrates modes and
//!   serves remote commands
//! - [`hub`]: WebSocket/HTTP wire hub on a single TCP port
//! - [`control`]: Wander and Explore motion controllers
//! - [`recorder`]: dataset recording
//! - [`intake`]: the seam where the platform feeds poses, IMU samples
//!   and camera frames
//!
//! The binary in `main.rs` is a thin wrapper: load config, start the
//! supervisor, wait for Ctrl-C.

pub mod command;
pub mod config;
pub mod control;
pub mod error;
pub mod hub;
pub mod intake;
pub mod recorder;
pub mod status;
pub mod supervisor;

pub use config::Config;
pub use error::{NavError, Result};
pub use intake::{CameraFrame, ImuSample, PlatformIntake};
pub use supervisor::Supervisor;
