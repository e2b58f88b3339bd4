//! Configuration loading from TOML
//!
//! # Configuration File Format
//!
//! ```toml
//! [serial]
//! port = "/dev/ttyUSB0"
//! baud = 115200
//!
//! [thermal]
//! enabled = true
//! vendor_id = 2507    # 0x09CB
//! product_id = 6550   # 0x1996
//!
//! [network]
//! bind_address = "0.0.0.0:8080"
//!
//! [motion]
//! forward_speed = 150
//! turn_speed = 120
//! obstacle_near_cm = 20
//! half_width_m = 0.15
//! lookahead_m = 0.5
//!
//! [output]
//! map_dir = "maps"
//! dataset_dir = "datasets"
//! ```
//!
//! Every section and field has a default; an absent file yields
//! `Config::default()`.

use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::{NavError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    /// Serial port path for the motor microcontroller.
    #[serde(default = "default_serial_port")]
    pub port: String,

    /// Baud rate. The MCU firmware is fixed at 115200 8-N-1.
    #[serde(default = "default_baud")]
    pub baud: u32,
}

fn default_serial_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud() -> u32 {
    115_200
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud: default_baud(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThermalSectionConfig {
    /// Whether to bring up the thermal camera at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_thermal_vid")]
    pub vendor_id: u16,

    #[serde(default = "default_thermal_pid")]
    pub product_id: u16,
}

fn default_true() -> bool {
    true
}

fn default_thermal_vid() -> u16 {
    0x09CB
}

fn default_thermal_pid() -> u16 {
    0x1996
}

impl Default for ThermalSectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            vendor_id: default_thermal_vid(),
            product_id: default_thermal_pid(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Wire hub bind address.
    ///
    /// **Format**: "host:port"
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MotionConfig {
    /// Signed tank-drive magnitude for forward bursts.
    #[serde(default = "default_forward_speed")]
    pub forward_speed: i32,

    /// Signed tank-drive magnitude for in-place rotation.
    #[serde(default = "default_turn_speed")]
    pub turn_speed: i32,

    /// Ultrasonic distance below which the way ahead counts as blocked.
    #[serde(default = "default_obstacle_near_cm")]
    pub obstacle_near_cm: i32,

    /// Half-width of the clearance corridor checked ahead of the robot.
    #[serde(default = "default_half_width")]
    pub half_width_m: f32,

    /// Clearance look-ahead distance.
    #[serde(default = "default_lookahead")]
    pub lookahead_m: f32,
}

fn default_forward_speed() -> i32 {
    150
}

fn default_turn_speed() -> i32 {
    120
}

fn default_obstacle_near_cm() -> i32 {
    20
}

fn default_half_width() -> f32 {
    0.15
}

fn default_lookahead() -> f32 {
    0.5
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            forward_speed: default_forward_speed(),
            turn_speed: default_turn_speed(),
            obstacle_near_cm: default_obstacle_near_cm(),
            half_width_m: default_half_width(),
            lookahead_m: default_lookahead(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Directory for map snapshots written on `stop_map`.
    #[serde(default = "default_map_dir")]
    pub map_dir: String,

    /// Directory under which dataset recordings are created.
    #[serde(default = "default_dataset_dir")]
    pub dataset_dir: String,
}

fn default_map_dir() -> String {
    "maps".to_string()
}

fn default_dataset_dir() -> String {
    "datasets".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            map_dir: default_map_dir(),
            dataset_dir: default_dataset_dir(),
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub thermal: ThermalSectionConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .map_err(|e| NavError::Config(format!("Failed to read config: {}", e)))?;

        let config: Config = basic_toml::from_str(&content)
            .map_err(|e| NavError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.serial.port.is_empty() {
            return Err(NavError::Config("serial.port must not be empty".into()));
        }
        if self.motion.forward_speed <= 0 || self.motion.turn_speed <= 0 {
            return Err(NavError::Config(
                "motion speeds must be positive; sign is applied per wheel".into(),
            ));
        }
        if self.motion.half_width_m <= 0.0 || self.motion.lookahead_m <= 0.0 {
            return Err(NavError::Config(
                "motion.half_width_m and motion.lookahead_m must be positive".into(),
            ));
        }
        self.network
            .bind_address
            .parse::<std::net::SocketAddr>()
            .map_err(|e| {
                NavError::Config(format!(
                    "network.bind_address '{}' invalid: {}",
                    self.network.bind_address, e
                ))
            })?;
        Ok(())
    }
}
