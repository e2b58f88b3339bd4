//! Wire protocol spoken with the motor microcontroller.
//!
//! Both directions are JSON objects, one per line. Commands carry a
//! numeric opcode in `N` plus `D1`/`D2` arguments. Telemetry arrives with
//! single-letter keys (a firmware-side bandwidth optimisation) and is
//! remapped to readable names before anything downstream sees it.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

/// Watchdog interval configured right after connect.
pub const BOOT_WATCHDOG_MS: u32 = 1000;
/// Telemetry stream period configured right after connect.
pub const BOOT_STREAM_PERIOD_MS: u32 = 200;

/// Commands the bridge can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McuCommand {
    /// Signed tank-drive pair; sign is direction.
    SetMotors { left: i32, right: i32 },
    /// Immediate motor stop.
    Stop,
    /// Motor watchdog interval in milliseconds.
    SetWatchdog { ms: u32 },
    /// Telemetry stream period in milliseconds; 0 turns streaming off.
    SetStreamPeriod { ms: u32 },
    /// Ask for the firmware version string.
    QueryFirmware,
    Ping,
    /// Full state dump for diagnostics.
    StateDump,
}

impl McuCommand {
    pub fn opcode(&self) -> u32 {
        match self {
            McuCommand::SetMotors { .. } => 7,
            McuCommand::Stop => 6,
            McuCommand::SetWatchdog { .. } => 102,
            McuCommand::SetStreamPeriod { .. } => 103,
            McuCommand::QueryFirmware => 105,
            McuCommand::Ping => 1,
            McuCommand::StateDump => 101,
        }
    }

    /// Encode as a single JSON line (no trailing newline; the link adds
    /// the terminator).
    pub fn encode(&self) -> String {
        let value = match *self {
            McuCommand::SetMotors { left, right } => json!({"N": 7, "D1": left, "D2": right}),
            McuCommand::Stop => json!({"N": 6}),
            McuCommand::SetWatchdog { ms } => json!({"N": 102, "D1": ms}),
            McuCommand::SetStreamPeriod { ms } => json!({"N": 103, "D1": ms}),
            McuCommand::QueryFirmware => json!({"N": 105}),
            McuCommand::Ping => json!({"N": 1}),
            McuCommand::StateDump => json!({"N": 101}),
        };
        value.to_string()
    }
}

/// Short telemetry key → readable name. Unknown keys pass through.
const KEY_REMAP: &[(&str, &str)] = &[
    ("t", "ts"),
    ("d", "dist_f"),
    ("l", "line"),
    ("a", "accel"),
    ("g", "gyro"),
    ("tp", "temp"),
    ("b", "battery"),
    ("mv", "mpu_ok"),
    ("fv", "fw_version"),
    ("e", "error"),
    ("k", "ack"),
];

/// Keys whose presence makes a telemetry line worth surfacing to the
/// human log.
const NOTEWORTHY_KEYS: &[&str] = &[
    "tank", "cmd", "ok", "error", "estop", "watchdog", "speed", "safety",
];

/// Apply the fixed key remapping to a telemetry object. Non-objects are
/// returned unchanged.
pub fn remap_keys(value: Value) -> Value {
    let Value::Object(fields) = value else {
        return value;
    };
    let mut remapped = Map::with_capacity(fields.len());
    for (key, v) in fields {
        let name = KEY_REMAP
            .iter()
            .find(|(short, _)| *short == key)
            .map(|(_, long)| (*long).to_string())
            .unwrap_or(key);
        remapped.insert(name, v);
    }
    Value::Object(remapped)
}

/// Whether a (remapped) telemetry line should reach the human log.
pub fn is_noteworthy(value: &Value) -> bool {
    let Value::Object(fields) = value else {
        return false;
    };
    fields.keys().any(|k| NOTEWORTHY_KEYS.contains(&k.as_str()))
}

/// Parsed telemetry fields the rest of the runtime consumes. Every field
/// is optional; the firmware streams what it has.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Telemetry {
    pub ts: Option<u64>,
    /// Forward ultrasonic distance in centimetres; -1 means no reading.
    pub dist_f: Option<i32>,
    /// IR line-sensor array.
    pub line: Option<Vec<i32>>,
    pub accel: Option<[f32; 3]>,
    pub gyro: Option<[f32; 3]>,
    pub temp: Option<f32>,
    pub battery: Option<f32>,
    pub mpu_ok: Option<bool>,
    pub fw_version: Option<String>,
    /// Fields we do not interpret, kept for the wire fan-out.
    pub extra: HashMap<String, Value>,
}

impl Telemetry {
    /// Parse a remapped telemetry object. Returns `None` for non-objects.
    pub fn from_value(value: &Value) -> Option<Self> {
        let fields = value.as_object()?;
        let mut telemetry = Telemetry::default();

        for (key, v) in fields {
            match key.as_str() {
                "ts" => telemetry.ts = v.as_u64(),
                "dist_f" => telemetry.dist_f = v.as_i64().map(|d| d as i32),
                "line" => {
                    telemetry.line = v.as_array().map(|a| {
                        a.iter()
                            .filter_map(|x| x.as_i64())
                            .map(|x| x as i32)
                            .collect()
                    })
                }
                "accel" => telemetry.accel = triple(v),
                "gyro" => telemetry.gyro = triple(v),
                "temp" => telemetry.temp = v.as_f64().map(|t| t as f32),
                "battery" => telemetry.battery = v.as_f64().map(|b| b as f32),
                "mpu_ok" => {
                    telemetry.mpu_ok = v
                        .as_bool()
                        .or_else(|| v.as_i64().map(|b| b != 0))
                }
                "fw_version" => telemetry.fw_version = v.as_str().map(str::to_string),
                _ => {
                    telemetry.extra.insert(key.clone(), v.clone());
                }
            }
        }
        Some(telemetry)
    }
}

fn triple(v: &Value) -> Option<[f32; 3]> {
    let a = v.as_array()?;
    if a.len() != 3 {
        return None;
    }
    Some([
        a[0].as_f64()? as f32,
        a[1].as_f64()? as f32,
        a[2].as_f64()? as f32,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_encoding() {
        assert_eq!(
            McuCommand::SetMotors { left: 120, right: -120 }.encode(),
            r#"{"D1":120,"D2":-120,"N":7}"#
        );
        assert_eq!(McuCommand::Stop.encode(), r#"{"N":6}"#);
        assert_eq!(
            McuCommand::SetWatchdog { ms: 1000 }.encode(),
            r#"{"D1":1000,"N":102}"#
        );
        assert_eq!(
            McuCommand::SetStreamPeriod { ms: 0 }.encode(),
            r#"{"D1":0,"N":103}"#
        );
        assert_eq!(McuCommand::QueryFirmware.opcode(), 105);
        assert_eq!(McuCommand::StateDump.opcode(), 101);
        assert_eq!(McuCommand::Ping.opcode(), 1);
    }

    #[test]
    fn test_key_remap() {
        let raw: Value =
            serde_json::from_str(r#"{"t":123,"d":42,"a":[0.1,0.2,9.8],"fv":"1.4.0","x":1}"#)
                .unwrap();
        let remapped = remap_keys(raw);
        let obj = remapped.as_object().unwrap();
        assert!(obj.contains_key("ts"));
        assert!(obj.contains_key("dist_f"));
        assert!(obj.contains_key("accel"));
        assert!(obj.contains_key("fw_version"));
        // Unknown keys pass through unchanged.
        assert!(obj.contains_key("x"));
        assert!(!obj.contains_key("t"));
    }

    #[test]
    fn test_telemetry_parse() {
        let raw: Value = serde_json::from_str(
            r#"{"t":55,"d":37,"a":[0.0,0.1,9.8],"g":[1.0,2.0,3.0],"b":7.4,"mv":1,"fv":"2.0"}"#,
        )
        .unwrap();
        let telemetry = Telemetry::from_value(&remap_keys(raw)).unwrap();
        assert_eq!(telemetry.ts, Some(55));
        assert_eq!(telemetry.dist_f, Some(37));
        assert_eq!(telemetry.accel, Some([0.0, 0.1, 9.8]));
        assert_eq!(telemetry.gyro, Some([1.0, 2.0, 3.0]));
        assert_eq!(telemetry.battery, Some(7.4));
        assert_eq!(telemetry.mpu_ok, Some(true));
        assert_eq!(telemetry.fw_version.as_deref(), Some("2.0"));
    }

    #[test]
    fn test_telemetry_sentinel_distance() {
        let raw: Value = serde_json::from_str(r#"{"d":-1}"#).unwrap();
        let telemetry = Telemetry::from_value(&remap_keys(raw)).unwrap();
        assert_eq!(telemetry.dist_f, Some(-1));
    }

    #[test]
    fn test_noteworthy_lines() {
        let watchdog: Value = serde_json::from_str(r#"{"watchdog":1000,"ok":true}"#).unwrap();
        assert!(is_noteworthy(&watchdog));
        let estop: Value = serde_json::from_str(r#"{"estop":1}"#).unwrap();
        assert!(is_noteworthy(&estop));
        let plain: Value = serde_json::from_str(r#"{"ts":1,"dist_f":30}"#).unwrap();
        assert!(!is_noteworthy(&plain));
        assert!(!is_noteworthy(&Value::Null));
    }

    #[test]
    fn test_unknown_fields_kept_in_extra() {
        let raw: Value = serde_json::from_str(r#"{"d":10,"custom":"yes"}"#).unwrap();
        let telemetry = Telemetry::from_value(&remap_keys(raw)).unwrap();
        assert_eq!(telemetry.extra.get("custom").unwrap(), "yes");
    }
}
