//! Remote command vocabulary and response shapes.
//!
//! Named commands arrive through the control endpoint (and any other
//! out-of-band intake the platform wires up). Every command is answered
//! with a JSON object echoing the command name plus `ok` or `error`.

use serde_json::{json, Value};

/// Named remote commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCommand {
    StartMap,
    StopMap,
    StartWander,
    StopWander,
    StartExplore,
    StopExplore,
    StartRecording,
    StopRecording,
    RetryArduino,
    RetryFlir,
    Stop,
    GetStatus,
}

impl RemoteCommand {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "start_map" => RemoteCommand::StartMap,
            "stop_map" => RemoteCommand::StopMap,
            "start_wander" => RemoteCommand::StartWander,
            "stop_wander" => RemoteCommand::StopWander,
            "start_explore" => RemoteCommand::StartExplore,
            "stop_explore" => RemoteCommand::StopExplore,
            "start_recording" => RemoteCommand::StartRecording,
            "stop_recording" => RemoteCommand::StopRecording,
            "retry_arduino" => RemoteCommand::RetryArduino,
            "retry_flir" => RemoteCommand::RetryFlir,
            "stop" => RemoteCommand::Stop,
            "get_status" => RemoteCommand::GetStatus,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteCommand::StartMap => "start_map",
            RemoteCommand::StopMap => "stop_map",
            RemoteCommand::StartWander => "start_wander",
            RemoteCommand::StopWander => "stop_wander",
            RemoteCommand::StartExplore => "start_explore",
            RemoteCommand::StopExplore => "stop_explore",
            RemoteCommand::StartRecording => "start_recording",
            RemoteCommand::StopRecording => "stop_recording",
            RemoteCommand::RetryArduino => "retry_arduino",
            RemoteCommand::RetryFlir => "retry_flir",
            RemoteCommand::Stop => "stop",
            RemoteCommand::GetStatus => "get_status",
        }
    }
}

/// `{cmd, ok:true}` plus any extra fields.
pub fn ok_response(cmd: &str, extra: Value) -> String {
    let mut response = json!({"cmd": cmd, "ok": true});
    if let (Some(obj), Some(extra_obj)) = (response.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            obj.insert(k.clone(), v.clone());
        }
    }
    response.to_string()
}

/// `{cmd, ok:false, error}`.
pub fn error_response(cmd: &str, error: impl std::fmt::Display) -> String {
    json!({"cmd": cmd, "ok": false, "error": error.to_string()}).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        for name in [
            "start_map",
            "stop_map",
            "start_wander",
            "stop_wander",
            "start_explore",
            "stop_explore",
            "start_recording",
            "stop_recording",
            "retry_arduino",
            "retry_flir",
            "stop",
            "get_status",
        ] {
            let cmd = RemoteCommand::parse(name).unwrap();
            assert_eq!(cmd.as_str(), name);
        }
        assert!(RemoteCommand::parse("reboot").is_none());
    }

    #[test]
    fn test_ok_response_merges_extra() {
        let response = ok_response("get_status", json!({"uptime": 12}));
        let parsed: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(parsed["cmd"], "get_status");
        assert_eq!(parsed["ok"], true);
        assert_eq!(parsed["uptime"], 12);
    }

    #[test]
    fn test_error_response_shape() {
        let response = error_response("start_wander", "explore mode active");
        let parsed: Value = serde_json::from_str(&response).unwrap();
        assert_eq!(parsed["ok"], false);
        assert_eq!(parsed["error"], "explore mode active");
    }
}
