//! Tank-drive motor vocabulary shared by the controllers.
//!
//! Every motion is a burst: set the motor pair, hold for a fixed window,
//! stop, settle. The settle window is what makes the next sensor reading
//! trustworthy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use yantra_io::mcu::{McuBridge, McuCommand};

use super::SETTLE_MS;

/// Forward burst duration.
pub const FORWARD_BURST_MS: u64 = 250;
/// In-place rotation step duration.
pub const TURN_STEP_MS: u64 = 200;
/// Escape reverse burst duration.
pub const REVERSE_BURST_MS: u64 = 400;

/// Which way to rotate in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnDirection {
    Left,
    Right,
}

impl TurnDirection {
    pub fn flipped(self) -> Self {
        match self {
            TurnDirection::Left => TurnDirection::Right,
            TurnDirection::Right => TurnDirection::Left,
        }
    }

    /// Heading offset probed when checking whether this side is clear.
    pub fn heading_offset(self) -> f32 {
        match self {
            TurnDirection::Left => std::f32::consts::FRAC_PI_2,
            TurnDirection::Right => -std::f32::consts::FRAC_PI_2,
        }
    }
}

/// Motor command helper bound to one bridge.
pub struct MotorDrive {
    bridge: Arc<McuBridge>,
    forward_speed: i32,
    turn_speed: i32,
    cancel: Arc<AtomicBool>,
}

impl MotorDrive {
    pub fn new(bridge: Arc<McuBridge>, forward_speed: i32, turn_speed: i32, cancel: Arc<AtomicBool>) -> Self {
        Self {
            bridge,
            forward_speed,
            turn_speed,
            cancel,
        }
    }

    /// Drive forward for one burst, then stop and settle.
    pub fn burst_forward(&self) {
        self.burst(self.forward_speed, self.forward_speed, FORWARD_BURST_MS);
    }

    /// Back out of a dead end, then stop and settle.
    pub fn burst_reverse(&self) {
        self.burst(-self.forward_speed, -self.forward_speed, REVERSE_BURST_MS);
    }

    /// One in-place rotation step, then stop and settle.
    pub fn rotate_step(&self, direction: TurnDirection) {
        let (left, right) = match direction {
            TurnDirection::Left => (-self.turn_speed, self.turn_speed),
            TurnDirection::Right => (self.turn_speed, -self.turn_speed),
        };
        self.burst(left, right, TURN_STEP_MS);
    }

    /// Unconditional stop, no settle.
    pub fn stop(&self) {
        self.bridge.send(McuCommand::Stop);
    }

    fn burst(&self, left: i32, right: i32, hold_ms: u64) {
        self.bridge.send(McuCommand::SetMotors { left, right });
        self.sleep_cancellable(hold_ms);
        self.bridge.send(McuCommand::Stop);
        self.sleep_cancellable(SETTLE_MS);
    }

    fn sleep_cancellable(&self, ms: u64) {
        let deadline = Instant::now() + Duration::from_millis(ms);
        while Instant::now() < deadline {
            if self.cancel.load(Ordering::Acquire) {
                // Cut the burst short; the caller's exit path stops again.
                self.bridge.send(McuCommand::Stop);
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
