//! Firmware upload: Intel-HEX in, STK500v1 page programming out.
//!
//! The upload runs on its own thread with exclusive port access. Sequence:
//! parse, quiesce the MCU bridge, pulse DTR into the bootloader, sync,
//! program pages, leave programming mode, resume the bridge. Hex errors
//! abort before the bridge is touched; any later error aborts the upload
//! and the bridge is always resumed.

pub mod hex;
pub mod stk500;

pub use hex::{parse_hex, FirmwareImage, FirmwarePage, PAGE_SIZE};

use std::time::Duration;

use crossbeam_channel::Sender;
use serde_json::json;

use crate::error::{Error, Result};
use crate::mcu::McuBridge;

/// Upload phases reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Parse,
    Acquire,
    Reset,
    Sync,
    Program,
    Resume,
}

impl UploadPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadPhase::Parse => "parse",
            UploadPhase::Acquire => "acquire",
            UploadPhase::Reset => "reset",
            UploadPhase::Sync => "sync",
            UploadPhase::Program => "program",
            UploadPhase::Resume => "resume",
        }
    }
}

/// Progress and completion events, serialisable for the wire hub.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Progress { phase: UploadPhase, percent: u8 },
    Done { success: bool, message: String },
}

impl UploadEvent {
    pub fn to_json(&self) -> String {
        match self {
            UploadEvent::Progress { phase, percent } => {
                json!({"phase": phase.as_str(), "percent": percent}).to_string()
            }
            UploadEvent::Done { success, message } => {
                json!({"done": true, "success": success, "message": message}).to_string()
            }
        }
    }
}

/// Wait after LEAVE_PROGMODE for the fresh firmware to boot.
const REBOOT_WAIT: Duration = Duration::from_secs(2);

/// Run a full firmware upload against the bridge's serial port.
///
/// Emits [`UploadEvent`]s on `events` throughout and always finishes with
/// a `Done` event. The bridge is resumed on every exit path past
/// acquisition.
pub fn upload(bridge: &McuBridge, hex_text: &str, events: &Sender<UploadEvent>) -> Result<()> {
    let emit = |event: UploadEvent| {
        let _ = events.send(event);
    };

    emit(UploadEvent::Progress {
        phase: UploadPhase::Parse,
        percent: 0,
    });

    let image = match parse_hex(hex_text, stk500::TARGET_FLASH_BYTES) {
        Ok(image) => image,
        Err(e) => {
            // The bridge was never disturbed; just report and bail.
            emit(UploadEvent::Done {
                success: false,
                message: format!("hex parse failed: {}", e),
            });
            return Err(e);
        }
    };
    log::info!(
        "firmware image parsed: {} bytes, {} pages",
        image.data_len,
        image.page_count()
    );

    emit(UploadEvent::Progress {
        phase: UploadPhase::Acquire,
        percent: 0,
    });
    let slot = bridge.quiesce();

    let result = (|| -> Result<()> {
        let mut guard = slot.lock();
        let transport = guard.as_mut().ok_or(Error::NotConnected)?;

        emit(UploadEvent::Progress {
            phase: UploadPhase::Reset,
            percent: 0,
        });
        stk500::reset_target(transport.as_mut())?;

        emit(UploadEvent::Progress {
            phase: UploadPhase::Sync,
            percent: 0,
        });
        stk500::sync(transport.as_mut())?;

        stk500::program(transport.as_mut(), &image, &mut |phase, percent| {
            emit(UploadEvent::Progress { phase, percent });
        })?;
        Ok(())
    })();

    emit(UploadEvent::Progress {
        phase: UploadPhase::Resume,
        percent: 0,
    });
    if result.is_ok() {
        // Give the new firmware time to boot before telemetry resumes.
        std::thread::sleep(REBOOT_WAIT);
    }
    bridge.resume();

    match result {
        Ok(()) => {
            let message = format!("{} pages programmed", image.page_count());
            log::info!("firmware upload complete: {}", message);
            emit(UploadEvent::Done {
                success: true,
                message,
            });
            Ok(())
        }
        Err(e) => {
            log::error!("firmware upload failed: {}", e);
            emit(UploadEvent::Done {
                success: false,
                message: e.to_string(),
            });
            Err(e)
        }
    }
}
