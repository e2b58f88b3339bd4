//! Motion controllers.
//!
//! Both controllers run as single cooperative threads built from the
//! same primitive: command, sleep, stop, settle, sense, decide. Range
//! readings are only trusted while the robot is stationary, so every
//! motion step ends with a stop and a settle window. A shared cancel
//! flag is checked inside every sleep; on exit an unconditional stop is
//! issued.

mod explore;
mod motor;
mod wander;

pub use explore::run_explore;
pub use motor::{MotorDrive, TurnDirection};
pub use wander::run_wander;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use yantra_io::mcu::McuBridge;
use yantra_map::core::normalize_angle;
use yantra_map::Mapper;

use crate::config::MotionConfig;
use crate::status::RuntimeStatus;

/// How long a controller waits for the mapper's first accepted update.
pub const MAPPER_READY_TIMEOUT: Duration = Duration::from_secs(10);
/// Settle window after every stop, letting the pose and ultrasonic
/// reading catch up with the real world.
pub const SETTLE_MS: u64 = 300;
/// In-place rotation steps are capped so a silent pose source cannot
/// spin the robot forever.
pub const MAX_SCAN_STEPS: u32 = 48;

/// Everything a controller thread needs.
pub struct ControllerCtx {
    pub bridge: Arc<McuBridge>,
    pub mapper: Arc<Mutex<Mapper>>,
    pub status: Arc<RuntimeStatus>,
    pub motion: MotionConfig,
    pub cancel: Arc<AtomicBool>,
}

impl ControllerCtx {
    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Sleep in small slices, returning false if cancelled meanwhile.
    pub fn sleep_ms(&self, ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(ms);
        while Instant::now() < deadline {
            if self.cancelled() {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10.min(ms)));
        }
        !self.cancelled()
    }

    /// Ground position and heading from the mapper's latest pose.
    pub fn pose(&self) -> Option<(yantra_map::WorldPoint, f32)> {
        let mapper = self.mapper.lock();
        mapper.latest_pose().map(|p| (p.ground(), p.heading()))
    }
}

/// Running controller thread.
pub struct ControllerHandle {
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ControllerHandle {
    pub fn spawn(name: &str, ctx: ControllerCtx, body: fn(ControllerCtx)) -> std::io::Result<Self> {
        let cancel = Arc::clone(&ctx.cancel);
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(ctx))?;
        Ok(Self {
            cancel,
            thread: Some(thread),
        })
    }

    /// Signal the stop flag and wait for the controller to unwind.
    pub fn stop(mut self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }
}

/// Block until the mapper has fused at least one update. Returns false
/// on timeout (pose source or MCU absent); callers proceed regardless,
/// they just will not get far.
pub fn wait_for_mapper(ctx: &ControllerCtx) -> bool {
    let deadline = Instant::now() + MAPPER_READY_TIMEOUT;
    while Instant::now() < deadline {
        if ctx.cancelled() {
            return false;
        }
        if ctx.mapper.lock().is_ready() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    log::warn!("mapper produced no update within {:?}", MAPPER_READY_TIMEOUT);
    false
}

/// Rotate roughly 360° in place, recording a scan profile along the way.
///
/// Spin-step, stop, settle, then integrate the heading delta until the
/// accumulated magnitude reaches a full turn. Finishing the recording
/// hands the profile to the mapper for drift correction.
pub fn rotate_full_scan(ctx: &ControllerCtx, drive: &MotorDrive, direction: TurnDirection) {
    ctx.mapper.lock().start_scan_recording();

    let mut accumulated = 0.0f32;
    let mut previous = ctx.pose().map(|(_, h)| h);
    let mut steps = 0u32;

    while accumulated < std::f32::consts::TAU && steps < MAX_SCAN_STEPS {
        if ctx.cancelled() {
            break;
        }
        drive.rotate_step(direction);
        if !ctx.sleep_ms(SETTLE_MS) {
            break;
        }

        if let Some((_, heading)) = ctx.pose() {
            if let Some(prev) = previous {
                accumulated += normalize_angle(heading - prev).abs();
            }
            previous = Some(heading);
        }
        steps += 1;
    }

    let correction = ctx.mapper.lock().stop_scan_recording();
    log::info!(
        "rotation scan finished: {:.0}° over {} steps{}",
        accumulated.to_degrees(),
        steps,
        match correction {
            Some(c) => format!(", drift corrected ({:.3}, {:.3})", c.x, c.z),
            None => String::new(),
        }
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_cancelled_early() {
        let cancel = Arc::new(AtomicBool::new(false));
        let ctx = test_ctx(Arc::clone(&cancel));
        cancel.store(true, Ordering::Release);
        assert!(!ctx.sleep_ms(50));
    }

    #[test]
    fn test_sleep_completes() {
        let ctx = test_ctx(Arc::new(AtomicBool::new(false)));
        let start = Instant::now();
        assert!(ctx.sleep_ms(30));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    fn test_ctx(cancel: Arc<AtomicBool>) -> ControllerCtx {
        use yantra_io::link::{LinkConfig, SerialLink};
        use yantra_io::transport::{MockTransport, Transport};

        let mock = MockTransport::new();
        let link = SerialLink::start(
            Box::new(move || Ok(Box::new(mock.clone()) as Box<dyn Transport>)),
            LinkConfig {
                reconnect_delay: Duration::from_millis(5),
                retry_interval: Duration::from_millis(5),
                max_retries: 1,
                quiescence: Duration::from_millis(1),
            },
        );
        ControllerCtx {
            bridge: Arc::new(McuBridge::new(link)),
            mapper: Arc::new(Mutex::new(Mapper::new())),
            status: Arc::new(RuntimeStatus::new()),
            motion: MotionConfig::default(),
            cancel,
        }
    }
}
