//! Simulated MCU for hardware-free testing.
//!
//! Drives a [`MockTransport`] the way the real microcontroller drives
//! the serial port: it consumes the command lines the runtime writes,
//! integrates a small differential-drive kinematic model inside a square
//! room, and streams telemetry lines back with the forward ultrasonic
//! distance ray-cast against the walls.
//!
//! Enabled with the `sim` feature; the daemon's integration tests and
//! demos run entire control loops against it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

use crate::transport::MockTransport;

/// Simulation parameters.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Half side length of the square room, metres. Walls sit at
    /// ±`room_half_extent` on both axes.
    pub room_half_extent: f32,
    /// Wheel separation, metres.
    pub track_width: f32,
    /// Metres per second per commanded speed unit.
    pub speed_scale: f32,
    /// Physics step.
    pub tick: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            room_half_extent: 1.5,
            track_width: 0.15,
            speed_scale: 0.002,
            tick: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SimState {
    x: f32,
    z: f32,
    heading: f32,
    left_cmd: i32,
    right_cmd: i32,
    stream_ms: u32,
}

/// Simulated microcontroller bound to a mock serial transport.
pub struct SimMcu {
    transport: MockTransport,
    state: Arc<Mutex<SimState>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl SimMcu {
    pub fn start(config: SimConfig) -> Self {
        let transport = MockTransport::new();
        let state = Arc::new(Mutex::new(SimState {
            x: 0.0,
            z: 0.0,
            heading: 0.0,
            left_cmd: 0,
            right_cmd: 0,
            stream_ms: 0,
        }));
        let running = Arc::new(AtomicBool::new(true));

        let worker_transport = transport.clone();
        let worker_state = Arc::clone(&state);
        let worker_running = Arc::clone(&running);
        let worker = thread::Builder::new()
            .name("sim-mcu".to_string())
            .spawn(move || sim_loop(config, worker_transport, worker_state, worker_running))
            .expect("spawn sim mcu");

        Self {
            transport,
            state,
            running,
            worker: Some(worker),
        }
    }

    /// Transport to hand to the serial link factory. Clones share the
    /// same wire.
    pub fn transport(&self) -> MockTransport {
        self.transport.clone()
    }

    /// Ground-truth pose for feeding a pose intake.
    pub fn pose(&self) -> (f32, f32, f32) {
        let state = self.state.lock();
        (state.x, state.z, state.heading)
    }

    /// Cloneable pose accessor for other threads (a stand-in for the
    /// platform's pose tracker).
    pub fn pose_handle(&self) -> SimPose {
        SimPose {
            state: Arc::clone(&self.state),
        }
    }

    pub fn shutdown(mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Shared ground-truth pose view.
#[derive(Clone)]
pub struct SimPose {
    state: Arc<Mutex<SimState>>,
}

impl SimPose {
    pub fn get(&self) -> (f32, f32, f32) {
        let state = self.state.lock();
        (state.x, state.z, state.heading)
    }
}

fn sim_loop(
    config: SimConfig,
    transport: MockTransport,
    state: Arc<Mutex<SimState>>,
    running: Arc<AtomicBool>,
) {
    let started = Instant::now();
    let mut consumed = 0usize;
    let mut last_stream = Instant::now();
    let mut pending = String::new();

    while running.load(Ordering::Acquire) {
        // Consume command lines the runtime has written since last tick.
        {
            let shared = transport.state();
            let written = &shared.lock().written;
            if written.len() > consumed {
                pending.push_str(&String::from_utf8_lossy(&written[consumed..]));
                consumed = written.len();
            }
        }
        while let Some(pos) = pending.find('\n') {
            let line: String = pending.drain(..=pos).collect();
            handle_command(line.trim(), &state, &transport);
        }

        // Integrate differential-drive kinematics, clamped to the room.
        {
            let mut s = state.lock();
            let dt = config.tick.as_secs_f32();
            let v_left = s.left_cmd as f32 * config.speed_scale;
            let v_right = s.right_cmd as f32 * config.speed_scale;
            let v = (v_left + v_right) / 2.0;
            let w = (v_right - v_left) / config.track_width;

            s.heading += w * dt;
            let limit = config.room_half_extent - 0.05;
            s.x = (s.x + v * s.heading.cos() * dt).clamp(-limit, limit);
            s.z = (s.z + v * s.heading.sin() * dt).clamp(-limit, limit);
        }

        // Stream telemetry at the period the runtime configured.
        let stream_ms = state.lock().stream_ms;
        if stream_ms > 0 && last_stream.elapsed() >= Duration::from_millis(stream_ms as u64) {
            last_stream = Instant::now();
            let (dist_cm, ts) = {
                let s = state.lock();
                let dist = wall_distance(s.x, s.z, s.heading, config.room_half_extent);
                ((dist * 100.0).round() as i32, started.elapsed().as_millis())
            };
            transport.feed(format!("{{\"t\":{},\"d\":{},\"b\":7.9}}\n", ts, dist_cm).as_bytes());
        }

        thread::sleep(config.tick);
    }
}

fn handle_command(line: &str, state: &Arc<Mutex<SimState>>, transport: &MockTransport) {
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return;
    };
    let Some(opcode) = value.get("N").and_then(Value::as_u64) else {
        return;
    };
    match opcode {
        6 => {
            let mut s = state.lock();
            s.left_cmd = 0;
            s.right_cmd = 0;
        }
        7 => {
            let mut s = state.lock();
            s.left_cmd = value.get("D1").and_then(Value::as_i64).unwrap_or(0) as i32;
            s.right_cmd = value.get("D2").and_then(Value::as_i64).unwrap_or(0) as i32;
        }
        103 => {
            state.lock().stream_ms = value.get("D1").and_then(Value::as_u64).unwrap_or(0) as u32;
        }
        105 => {
            transport.feed(b"{\"fv\":\"sim-1.0\"}\n");
        }
        1 => {
            transport.feed(b"{\"ok\":true}\n");
        }
        // Watchdog and state dump are accepted silently.
        _ => {}
    }
}

/// Distance along `heading` from (x, z) to the nearest room wall.
fn wall_distance(x: f32, z: f32, heading: f32, half_extent: f32) -> f32 {
    let (sin_h, cos_h) = heading.sin_cos();
    let mut best = f32::MAX;

    if cos_h > 1e-6 {
        best = best.min((half_extent - x) / cos_h);
    } else if cos_h < -1e-6 {
        best = best.min((-half_extent - x) / cos_h);
    }
    if sin_h > 1e-6 {
        best = best.min((half_extent - z) / sin_h);
    } else if sin_h < -1e-6 {
        best = best.min((-half_extent - z) / sin_h);
    }
    best.max(0.0)
}
