//! Supervisor: owns every bridge, arbitrates modes, serves commands.
//!
//! The supervisor is the long-lived runtime the rest of the repository
//! talks to. It owns the MCU bridge, the thermal camera, the mapper and
//! the wire hub as children; inbound control traffic reaches it through
//! channels and it answers through per-client reply handles. Components
//! never hold a pointer back into the supervisor.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde_json::{json, Value};

use yantra_io::firmware::{self, UploadEvent};
use yantra_io::mcu::{BridgeEvent, McuBridge, McuCommand};
use yantra_io::thermal::{ThermalCamera, ThermalConfig, ThermalEvent};
use yantra_map::persist::MapSnapshot;
use yantra_map::Mapper;

use crate::command::{error_response, ok_response, RemoteCommand};
use crate::config::Config;
use crate::control::{run_explore, run_wander, ControllerCtx, ControllerHandle};
use crate::error::Result;
use crate::hub::{ControlRequest, Endpoints, WireHub};
use crate::intake::{platform_channels, PlatformIntake, PlatformStreams};
use crate::recorder::{RecordItem, Recorder};
use crate::status::{LogRing, RuntimeStatus};

struct Inner {
    config: Config,
    bridge: Arc<McuBridge>,
    camera: Option<ThermalCamera>,
    mapper: Arc<Mutex<Mapper>>,
    status: Arc<RuntimeStatus>,
    log_ring: Arc<LogRing>,
    endpoints: Arc<Endpoints>,

    /// Gates grid mutation; pose tracking always runs.
    mapping_enabled: AtomicBool,
    shutdown: AtomicBool,

    wander: Mutex<Option<ControllerHandle>>,
    explore: Mutex<Option<ControllerHandle>>,
    recorder: Mutex<Option<Recorder>>,
    /// Live tap the fan-out threads feed while recording.
    record_tx: Mutex<Option<Sender<RecordItem>>>,
}

/// The composed runtime.
pub struct Supervisor {
    inner: Arc<Inner>,
    hub: WireHub,
    threads: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Bring up every bridge and worker. Returns the runtime handle and
    /// the platform intake for pose/IMU/camera producers.
    pub fn start(config: Config) -> Result<(Self, PlatformIntake)> {
        let status = Arc::new(RuntimeStatus::new());
        let log_ring = Arc::new(LogRing::new());

        let bridge = Arc::new(McuBridge::open_serial(
            &config.serial.port,
            config.serial.baud,
        ));

        let camera = if config.thermal.enabled {
            Some(ThermalCamera::start(ThermalConfig {
                vendor_id: config.thermal.vendor_id,
                product_id: config.thermal.product_id,
                ..ThermalConfig::default()
            }))
        } else {
            None
        };

        let (intake, streams) = platform_channels();
        let (control_tx, control_rx) = unbounded::<ControlRequest>();
        let (firmware_tx, firmware_rx) = unbounded::<String>();

        let bind_address = config.network.bind_address.parse().map_err(|e| {
            crate::error::NavError::Config(format!(
                "network.bind_address '{}' invalid: {}",
                config.network.bind_address, e
            ))
        })?;
        let hub = WireHub::start(bind_address, control_tx, firmware_tx, Arc::clone(&status))?;
        let endpoints = hub.endpoints();

        let inner = Arc::new(Inner {
            config,
            bridge,
            camera,
            mapper: Arc::new(Mutex::new(Mapper::new())),
            status,
            log_ring,
            endpoints,
            mapping_enabled: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            wander: Mutex::new(None),
            explore: Mutex::new(None),
            recorder: Mutex::new(None),
            record_tx: Mutex::new(None),
        });

        let threads = spawn_workers(&inner, streams, control_rx, firmware_rx);

        Ok((
            Self {
                inner,
                hub,
                threads,
            },
            intake,
        ))
    }

    pub fn status(&self) -> Arc<RuntimeStatus> {
        Arc::clone(&self.inner.status)
    }

    pub fn log_ring(&self) -> Arc<LogRing> {
        Arc::clone(&self.inner.log_ring)
    }

    /// Run a named command directly (the out-of-band intake).
    pub fn execute(&self, command: RemoteCommand) -> String {
        execute_command(&self.inner, command)
    }

    /// Stop modes, flush state and tear the runtime down.
    pub fn shutdown(mut self) {
        log::info!("supervisor shutting down");
        self.inner.shutdown.store(true, Ordering::Release);

        stop_controllers(&self.inner);
        if let Some(recorder) = self.inner.recorder.lock().take() {
            *self.inner.record_tx.lock() = None;
            recorder.stop();
        }
        self.inner.bridge.send(McuCommand::Stop);
        self.inner.bridge.send(McuCommand::SetStreamPeriod { ms: 0 });
        thread::sleep(Duration::from_millis(100));

        self.hub.shutdown();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        if let Some(camera) = Arc::get_mut(&mut self.inner)
            .and_then(|inner| inner.camera.take())
        {
            camera.shutdown();
        }
        log::info!("supervisor stopped");
    }
}

fn spawn_workers(
    inner: &Arc<Inner>,
    streams: PlatformStreams,
    control_rx: Receiver<ControlRequest>,
    firmware_rx: Receiver<String>,
) -> Vec<JoinHandle<()>> {
    let mut threads = Vec::new();
    let spawn = |name: &str, f: Box<dyn FnOnce() + Send>| {
        thread::Builder::new()
            .name(name.to_string())
            .spawn(f)
            .expect("spawn supervisor worker")
    };

    // Mapping: poses and telemetry fuse into the grid.
    {
        let inner = Arc::clone(inner);
        let poses = streams.poses;
        let telemetry = inner.bridge.subscribe_telemetry();
        threads.push(spawn(
            "mapping",
            Box::new(move || {
                while !inner.shutdown.load(Ordering::Acquire) {
                    crossbeam_channel::select! {
                        recv(poses) -> pose => match pose {
                            Ok(pose) => {
                                inner.mapper.lock().on_pose(pose);
                                if let Some(tx) = inner.record_tx.lock().as_ref() {
                                    let _ = tx.send(RecordItem::Pose(pose));
                                }
                            }
                            Err(_) => break,
                        },
                        recv(telemetry) -> sample => match sample {
                            Ok(sample) => {
                                if inner.mapping_enabled.load(Ordering::Acquire) {
                                    if let Some(dist) = sample.dist_f {
                                        inner.mapper.lock().on_range(dist);
                                    }
                                }
                            }
                            Err(_) => break,
                        },
                        default(Duration::from_millis(100)) => {}
                    }
                }
            }),
        ));
    }

    // Telemetry lines fan out to the wire hub.
    {
        let inner = Arc::clone(inner);
        let lines = inner.bridge.subscribe_lines();
        threads.push(spawn(
            "arduino-fanout",
            Box::new(move || {
                while !inner.shutdown.load(Ordering::Acquire) {
                    match lines.recv_timeout(Duration::from_millis(100)) {
                        Ok(line) => inner.endpoints.arduino.broadcast_text(line),
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    }
                }
            }),
        ));
    }

    // Noteworthy MCU lines and connection events feed the human log.
    {
        let inner = Arc::clone(inner);
        let log_lines = inner.bridge.subscribe_log_lines();
        let events = inner.bridge.subscribe_events();
        threads.push(spawn(
            "bridge-monitor",
            Box::new(move || {
                while !inner.shutdown.load(Ordering::Acquire) {
                    crossbeam_channel::select! {
                        recv(log_lines) -> line => match line {
                            Ok(line) => inner.log_ring.push(format!("mcu: {}", line)),
                            Err(_) => break,
                        },
                        recv(events) -> event => match event {
                            Ok(BridgeEvent::Connected) => {
                                inner.status.set(&inner.status.arduino_connected, true);
                                inner.log_ring.push("arduino connected".to_string());
                            }
                            Ok(BridgeEvent::Disconnected { message, .. }) => {
                                inner.status.set(&inner.status.arduino_connected, false);
                                inner.log_ring.push(format!("arduino lost: {}", message));
                            }
                            Err(_) => break,
                        },
                        default(Duration::from_millis(100)) => {}
                    }
                }
            }),
        ));
    }

    // Phone IMU → hub + recorder.
    {
        let inner = Arc::clone(inner);
        let imu = streams.imu;
        threads.push(spawn(
            "imu-fanout",
            Box::new(move || {
                while !inner.shutdown.load(Ordering::Acquire) {
                    match imu.recv_timeout(Duration::from_millis(100)) {
                        Ok(sample) => {
                            inner.endpoints.imu.broadcast_text(sample.to_json_line());
                            if let Some(tx) = inner.record_tx.lock().as_ref() {
                                let _ = tx.send(RecordItem::Imu(sample));
                            }
                        }
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    }
                }
            }),
        ));
    }

    // Camera JPEG frames → hub + recorder.
    {
        let inner = Arc::clone(inner);
        let camera_frames = streams.camera;
        threads.push(spawn(
            "camera-fanout",
            Box::new(move || {
                while !inner.shutdown.load(Ordering::Acquire) {
                    match camera_frames.recv_timeout(Duration::from_millis(100)) {
                        Ok(frame) => {
                            inner
                                .endpoints
                                .camera
                                .broadcast_binary(frame.jpeg.clone());
                            if let Some(tx) = inner.record_tx.lock().as_ref() {
                                let _ = tx.send(RecordItem::Camera(frame));
                            }
                        }
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    }
                }
            }),
        ));
    }

    // Thermal frames and events.
    if let Some(camera) = &inner.camera {
        let frames = camera.frames();
        let events = camera.events();
        let inner = Arc::clone(inner);
        threads.push(spawn(
            "flir-fanout",
            Box::new(move || {
                while !inner.shutdown.load(Ordering::Acquire) {
                    crossbeam_channel::select! {
                        recv(frames) -> frame => match frame {
                            Ok(frame) => inner
                                .endpoints
                                .flir
                                .broadcast_binary(frame.to_wire_bytes()),
                            Err(_) => break,
                        },
                        recv(events) -> event => match event {
                            Ok(ThermalEvent::Connected) => {
                                inner.status.set(&inner.status.flir_connected, true);
                                inner.log_ring.push("thermal camera connected".to_string());
                            }
                            Ok(ThermalEvent::Disconnected { message }) => {
                                inner.status.set(&inner.status.flir_connected, false);
                                inner.log_ring.push(format!("thermal camera lost: {}", message));
                            }
                            Ok(ThermalEvent::RetryExhausted) => {
                                inner.status.set(&inner.status.flir_connected, false);
                                inner
                                    .log_ring
                                    .push("thermal camera retries exhausted".to_string());
                            }
                            Err(_) => break,
                        },
                        default(Duration::from_millis(100)) => {}
                    }
                }
            }),
        ));
    }

    // Control endpoint traffic.
    {
        let inner = Arc::clone(inner);
        threads.push(spawn(
            "control",
            Box::new(move || {
                while !inner.shutdown.load(Ordering::Acquire) {
                    match control_rx.recv_timeout(Duration::from_millis(100)) {
                        Ok(request) => handle_control(&inner, request),
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    }
                }
            }),
        ));
    }

    // Firmware uploads, one at a time.
    {
        let inner = Arc::clone(inner);
        threads.push(spawn(
            "firmware",
            Box::new(move || {
                while !inner.shutdown.load(Ordering::Acquire) {
                    match firmware_rx.recv_timeout(Duration::from_millis(100)) {
                        Ok(hex) => run_firmware_upload(&inner, &hex),
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    }
                }
            }),
        ));
    }

    threads
}

/// Run one upload, streaming progress to the firmware endpoint.
fn run_firmware_upload(inner: &Arc<Inner>, hex: &str) {
    // Driving during a flash rewrite would end badly.
    stop_controllers(inner);
    inner.log_ring.push("firmware upload starting".to_string());

    let (event_tx, event_rx) = unbounded::<UploadEvent>();
    let endpoints = Arc::clone(&inner.endpoints);
    let log_ring = Arc::clone(&inner.log_ring);
    let forwarder = thread::Builder::new()
        .name("firmware-progress".to_string())
        .spawn(move || {
            for event in event_rx {
                endpoints.firmware.broadcast_text(event.to_json());
                if let UploadEvent::Done { success, message } = &event {
                    log_ring.push(format!(
                        "firmware upload {}: {}",
                        if *success { "succeeded" } else { "failed" },
                        message
                    ));
                }
            }
        })
        .expect("spawn firmware progress forwarder");

    let _ = firmware::upload(&inner.bridge, hex, &event_tx);
    drop(event_tx);
    let _ = forwarder.join();
}

/// Route one `/control` message.
fn handle_control(inner: &Arc<Inner>, request: ControlRequest) {
    let payload = request.payload;

    match payload.get("target").and_then(Value::as_str) {
        Some("arduino") => {
            // Either an embedded command line or the object itself.
            if let Some(cmd) = payload.get("cmd").and_then(Value::as_str) {
                inner.bridge.send_raw(cmd);
            } else if payload.get("N").is_some() {
                let mut object = payload.clone();
                if let Some(map) = object.as_object_mut() {
                    map.remove("target");
                }
                inner.bridge.send_raw(&object.to_string());
            } else {
                log::debug!("arduino control message without cmd dropped");
            }
        }
        Some("map") => {
            let response = match payload.get("cmd").and_then(Value::as_str) {
                Some("clear") => {
                    inner.mapper.lock().clear();
                    ok_response("clear", json!({}))
                }
                Some("snapshot") => {
                    let snapshot = MapSnapshot::capture(&inner.mapper.lock());
                    match snapshot.to_json() {
                        Ok(body) => body,
                        Err(e) => error_response("snapshot", e),
                    }
                }
                other => error_response("map", format!("unknown map command {:?}", other)),
            };
            let _ = request.reply.send(response);
        }
        Some(other) => {
            let _ = request
                .reply
                .send(error_response(other, "unknown target"));
        }
        None => {
            // Bare named command.
            let Some(name) = payload.get("cmd").and_then(Value::as_str) else {
                log::debug!("control message without target or cmd dropped");
                return;
            };
            let response = match RemoteCommand::parse(name) {
                Some(command) => execute_command(inner, command),
                None => error_response(name, "unknown command"),
            };
            let _ = request.reply.send(response);
        }
    }
}

fn execute_command(inner: &Arc<Inner>, command: RemoteCommand) -> String {
    let name = command.as_str();
    match command {
        RemoteCommand::StartMap => {
            inner.mapping_enabled.store(true, Ordering::Release);
            inner.status.set(&inner.status.mapping, true);
            inner.log_ring.push("mapping started".to_string());
            ok_response(name, json!({}))
        }
        RemoteCommand::StopMap => {
            inner.mapping_enabled.store(false, Ordering::Release);
            inner.status.set(&inner.status.mapping, false);
            let snapshot = MapSnapshot::capture(&inner.mapper.lock());
            match snapshot.save_timestamped(Path::new(&inner.config.output.map_dir)) {
                Ok(path) => {
                    inner
                        .log_ring
                        .push(format!("map saved to {}", path.display()));
                    ok_response(name, json!({"path": path.display().to_string()}))
                }
                Err(e) => error_response(name, format!("map save failed: {}", e)),
            }
        }
        RemoteCommand::StartWander => start_controller(inner, Mode::Wander),
        RemoteCommand::StopWander => stop_controller(inner, Mode::Wander),
        RemoteCommand::StartExplore => start_controller(inner, Mode::Explore),
        RemoteCommand::StopExplore => stop_controller(inner, Mode::Explore),
        RemoteCommand::StartRecording => {
            let mut recorder_slot = inner.recorder.lock();
            if recorder_slot.is_some() {
                return error_response(name, "recording already active");
            }
            match Recorder::start(Path::new(&inner.config.output.dataset_dir)) {
                Ok(recorder) => {
                    *inner.record_tx.lock() = Some(recorder.sender());
                    let dir = recorder.dir().display().to_string();
                    *recorder_slot = Some(recorder);
                    inner.status.set(&inner.status.recording, true);
                    ok_response(name, json!({"dir": dir}))
                }
                Err(e) => error_response(name, format!("recorder start failed: {}", e)),
            }
        }
        RemoteCommand::StopRecording => {
            // Same lock order as start: recorder slot, then the tap.
            match inner.recorder.lock().take() {
                Some(recorder) => {
                    *inner.record_tx.lock() = None;
                    let dir = recorder.dir().display().to_string();
                    recorder.stop();
                    inner.status.set(&inner.status.recording, false);
                    ok_response(name, json!({"dir": dir}))
                }
                None => error_response(name, "recording not active"),
            }
        }
        RemoteCommand::RetryArduino => {
            inner.bridge.request_retry();
            ok_response(name, json!({}))
        }
        RemoteCommand::RetryFlir => match &inner.camera {
            Some(camera) => {
                camera.request_retry();
                ok_response(name, json!({}))
            }
            None => error_response(name, "thermal camera disabled"),
        },
        RemoteCommand::Stop => {
            stop_controllers(inner);
            inner.bridge.send(McuCommand::Stop);
            inner.log_ring.push("all motion stopped".to_string());
            ok_response(name, json!({}))
        }
        RemoteCommand::GetStatus => {
            let stats = inner.mapper.lock().stats();
            let grid_cells = inner.mapper.lock().grid().len();
            let wander_active = inner
                .wander
                .lock()
                .as_ref()
                .is_some_and(|h| !h.is_finished());
            let explore_active = inner
                .explore
                .lock()
                .as_ref()
                .is_some_and(|h| !h.is_finished());
            ok_response(
                name,
                json!({
                    "connections": {
                        "arduino": inner.status.get(&inner.status.arduino_connected),
                        "flir": inner.status.get(&inner.status.flir_connected),
                    },
                    "modes": {
                        "mapping": inner.status.get(&inner.status.mapping),
                        "wander": wander_active,
                        "explore": explore_active,
                        "recording": inner.status.get(&inner.status.recording),
                        "exploration_complete":
                            inner.status.get(&inner.status.exploration_complete),
                    },
                    "mapper": {
                        "updates": stats.updates,
                        "rejected": stats.rejected,
                        "corrections": stats.corrections,
                        "baseline_resets": stats.baseline_resets,
                        "cells": grid_cells,
                    },
                    "fw_version": inner.bridge.firmware_version(),
                    "uptime_secs": inner.status.uptime_secs(),
                }),
            )
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Wander,
    Explore,
}

impl Mode {
    fn name(self) -> &'static str {
        match self {
            Mode::Wander => "start_wander",
            Mode::Explore => "start_explore",
        }
    }

    fn stop_name(self) -> &'static str {
        match self {
            Mode::Wander => "stop_wander",
            Mode::Explore => "stop_explore",
        }
    }
}

fn start_controller(inner: &Arc<Inner>, mode: Mode) -> String {
    let (own, other, other_label) = match mode {
        Mode::Wander => (&inner.wander, &inner.explore, "explore"),
        Mode::Explore => (&inner.explore, &inner.wander, "wander"),
    };

    // Modes are mutually exclusive: exactly one thing commands motors.
    if other.lock().as_ref().is_some_and(|h| !h.is_finished()) {
        return error_response(mode.name(), format!("{} mode active", other_label));
    }
    let mut own_slot = own.lock();
    if own_slot.as_ref().is_some_and(|h| !h.is_finished()) {
        return error_response(mode.name(), "already running");
    }

    let ctx = ControllerCtx {
        bridge: Arc::clone(&inner.bridge),
        mapper: Arc::clone(&inner.mapper),
        status: Arc::clone(&inner.status),
        motion: inner.config.motion.clone(),
        cancel: Arc::new(AtomicBool::new(false)),
    };

    let (thread_name, body, flag) = match mode {
        Mode::Wander => (
            "wander",
            run_wander as fn(ControllerCtx),
            &inner.status.wander_active,
        ),
        Mode::Explore => {
            inner
                .status
                .set(&inner.status.exploration_complete, false);
            (
                "explore",
                run_explore as fn(ControllerCtx),
                &inner.status.explore_active,
            )
        }
    };

    match ControllerHandle::spawn(thread_name, ctx, body) {
        Ok(handle) => {
            *own_slot = Some(handle);
            inner.status.set(flag, true);
            inner.log_ring.push(format!("{} mode started", thread_name));
            ok_response(mode.name(), json!({}))
        }
        Err(e) => error_response(mode.name(), format!("spawn failed: {}", e)),
    }
}

fn stop_controller(inner: &Arc<Inner>, mode: Mode) -> String {
    let (slot, flag, label) = match mode {
        Mode::Wander => (&inner.wander, &inner.status.wander_active, "wander"),
        Mode::Explore => (&inner.explore, &inner.status.explore_active, "explore"),
    };
    match slot.lock().take() {
        Some(handle) => {
            handle.stop();
            inner.status.set(flag, false);
            inner.log_ring.push(format!("{} mode stopped", label));
            ok_response(mode.stop_name(), json!({}))
        }
        None => error_response(mode.stop_name(), "not running"),
    }
}

fn stop_controllers(inner: &Arc<Inner>) {
    if let Some(handle) = inner.wander.lock().take() {
        handle.stop();
        inner.status.set(&inner.status.wander_active, false);
    }
    if let Some(handle) = inner.explore.lock().take() {
        handle.stop();
        inner.status.set(&inner.status.explore_active, false);
    }
}
