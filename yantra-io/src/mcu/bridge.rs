//! Bridge between the serial link and the rest of the runtime.
//!
//! Consumes raw lines from the [`SerialLink`], parses and remaps them,
//! and fans the results out to subscribers: remapped JSON lines for the
//! wire hub, parsed [`Telemetry`] for the mapper and controllers, and
//! noteworthy lines for the human log. Downstream consumers subscribe
//! through channels; the bridge never calls back into them.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde_json::Value;

use crate::link::{LinkConfig, LinkEvent, LinkFailure, LinkSender, SerialLink, TransportSlot};
use crate::transport::{SerialTransport, Transport, TransportFactory};

use super::protocol::{
    is_noteworthy, remap_keys, McuCommand, Telemetry, BOOT_STREAM_PERIOD_MS, BOOT_WATCHDOG_MS,
};

/// Sentinel distance meaning "no reading yet".
pub const DIST_SENTINEL_CM: i32 = -1;

/// Connection-state changes re-published to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    Connected,
    Disconnected {
        failure: LinkFailure,
        message: String,
    },
}

struct BridgeShared {
    running: AtomicBool,
    connected: AtomicBool,
    last_distance_cm: AtomicI32,
    latest: Mutex<Option<Telemetry>>,
    fw_version: Mutex<Option<String>>,

    line_subs: Mutex<Vec<Sender<String>>>,
    telemetry_subs: Mutex<Vec<Sender<Telemetry>>>,
    log_subs: Mutex<Vec<Sender<String>>>,
    event_subs: Mutex<Vec<Sender<BridgeEvent>>>,
}

fn fan_out<T: Clone>(subs: &Mutex<Vec<Sender<T>>>, value: &T) {
    subs.lock().retain(|tx| tx.send(value.clone()).is_ok());
}

/// JSON command/telemetry bridge to the motor microcontroller.
pub struct McuBridge {
    link: SerialLink,
    shared: Arc<BridgeShared>,
    worker: Option<JoinHandle<()>>,
}

impl McuBridge {
    /// Build over an already-started link.
    pub fn new(link: SerialLink) -> Self {
        let shared = Arc::new(BridgeShared {
            running: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            last_distance_cm: AtomicI32::new(DIST_SENTINEL_CM),
            latest: Mutex::new(None),
            fw_version: Mutex::new(None),
            line_subs: Mutex::new(Vec::new()),
            telemetry_subs: Mutex::new(Vec::new()),
            log_subs: Mutex::new(Vec::new()),
            event_subs: Mutex::new(Vec::new()),
        });

        let lines = link.lines();
        let events = link.events();
        let shared_clone = Arc::clone(&shared);
        let sender = link.sender();

        let worker = thread::Builder::new()
            .name("mcu-bridge".to_string())
            .spawn(move || bridge_loop(shared_clone, lines, events, sender))
            .expect("spawn mcu bridge thread");

        Self {
            link,
            shared,
            worker: Some(worker),
        }
    }

    /// Open the hardware serial port and start the bridge.
    pub fn open_serial(path: &str, baud: u32) -> Self {
        let path = path.to_string();
        let factory: TransportFactory = Box::new(move || {
            Ok(Box::new(SerialTransport::open(&path, baud)?) as Box<dyn Transport>)
        });
        Self::new(SerialLink::start(factory, LinkConfig::default()))
    }

    /// Send a typed command.
    pub fn send(&self, command: McuCommand) {
        self.link.send_line(command.encode());
    }

    /// Forward a raw command line (from the control endpoint). Lines that
    /// do not parse as JSON are dropped at this boundary.
    pub fn send_raw(&self, line: &str) {
        match serde_json::from_str::<Value>(line) {
            Ok(_) => self.link.send_line(line.trim().to_string()),
            Err(e) => log::warn!("dropping malformed MCU command: {} ({})", line, e),
        }
    }

    /// Remapped telemetry lines, one JSON object per message.
    pub fn subscribe_lines(&self) -> Receiver<String> {
        let (tx, rx) = unbounded();
        self.shared.line_subs.lock().push(tx);
        rx
    }

    /// Parsed telemetry.
    pub fn subscribe_telemetry(&self) -> Receiver<Telemetry> {
        let (tx, rx) = unbounded();
        self.shared.telemetry_subs.lock().push(tx);
        rx
    }

    /// Lines worth surfacing to the human log.
    pub fn subscribe_log_lines(&self) -> Receiver<String> {
        let (tx, rx) = unbounded();
        self.shared.log_subs.lock().push(tx);
        rx
    }

    /// Connection-state transitions.
    pub fn subscribe_events(&self) -> Receiver<BridgeEvent> {
        let (tx, rx) = unbounded();
        self.shared.event_subs.lock().push(tx);
        rx
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn is_exhausted(&self) -> bool {
        self.link.is_exhausted()
    }

    pub fn request_retry(&self) {
        self.link.request_retry();
    }

    /// Most recent forward ultrasonic distance, [`DIST_SENTINEL_CM`] when
    /// nothing has arrived yet.
    pub fn last_distance_cm(&self) -> i32 {
        self.shared.last_distance_cm.load(Ordering::Acquire)
    }

    pub fn latest_telemetry(&self) -> Option<Telemetry> {
        self.shared.latest.lock().clone()
    }

    pub fn firmware_version(&self) -> Option<String> {
        self.shared.fw_version.lock().clone()
    }

    pub fn dropped_writes(&self) -> u64 {
        self.link.dropped_writes()
    }

    /// Quiesce for an exclusive port takeover: streaming and the watchdog
    /// are disabled, the queue is given time to drain, then reader and
    /// writer are parked.
    pub fn quiesce(&self) -> TransportSlot {
        self.send(McuCommand::SetStreamPeriod { ms: 0 });
        self.send(McuCommand::SetWatchdog { ms: 0 });
        thread::sleep(Duration::from_millis(200));
        self.link.pause_io();
        thread::sleep(Duration::from_millis(100));
        self.link.transport()
    }

    /// Undo [`quiesce`](Self::quiesce) and re-run the boot sequence.
    pub fn resume(&self) {
        self.link.resume_io();
        send_boot_sequence(&self.link.sender());
    }

    /// Best-effort stream shutdown, then stop all threads. Dropping the
    /// link joins its reader/writer/manager.
    pub fn shutdown(mut self) {
        self.send(McuCommand::SetStreamPeriod { ms: 0 });
        thread::sleep(Duration::from_millis(100));
        self.shared.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn send_boot_sequence(sender: &LinkSender) {
    sender.send_line(McuCommand::SetWatchdog { ms: BOOT_WATCHDOG_MS }.encode());
    sender.send_line(McuCommand::SetStreamPeriod { ms: BOOT_STREAM_PERIOD_MS }.encode());
    sender.send_line(McuCommand::QueryFirmware.encode());
    log::info!(
        "MCU boot sequence sent (watchdog {}ms, stream {}ms)",
        BOOT_WATCHDOG_MS,
        BOOT_STREAM_PERIOD_MS
    );
}

fn bridge_loop(
    shared: Arc<BridgeShared>,
    lines: Receiver<String>,
    events: Receiver<LinkEvent>,
    sender: LinkSender,
) {
    while shared.running.load(Ordering::Acquire) {
        crossbeam_channel::select! {
            recv(lines) -> line => match line {
                Ok(line) => handle_line(&shared, &line),
                Err(_) => break,
            },
            recv(events) -> event => match event {
                Ok(LinkEvent::Connected) => {
                    shared.connected.store(true, Ordering::Release);
                    send_boot_sequence(&sender);
                    fan_out(&shared.event_subs, &BridgeEvent::Connected);
                }
                Ok(LinkEvent::Disconnected { failure, message }) => {
                    shared.connected.store(false, Ordering::Release);
                    // Best-effort stream shutdown; the queued command goes
                    // out if the device is still listening or comes back.
                    sender.send_line(McuCommand::SetStreamPeriod { ms: 0 }.encode());
                    fan_out(
                        &shared.event_subs,
                        &BridgeEvent::Disconnected { failure, message },
                    );
                }
                Err(_) => break,
            },
            default(Duration::from_millis(100)) => {}
        }
    }
    log::debug!("MCU bridge worker stopped");
}

fn handle_line(shared: &Arc<BridgeShared>, line: &str) {
    let parsed: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            // The MCU occasionally truncates a line mid-boot; drop it.
            log::debug!("unparseable telemetry line dropped: {} ({})", line, e);
            return;
        }
    };

    let remapped = remap_keys(parsed);
    let rendered = remapped.to_string();
    fan_out(&shared.line_subs, &rendered);

    if is_noteworthy(&remapped) {
        fan_out(&shared.log_subs, &rendered);
    }

    if let Some(telemetry) = Telemetry::from_value(&remapped) {
        if let Some(dist) = telemetry.dist_f {
            shared.last_distance_cm.store(dist, Ordering::Release);
        }
        if let Some(ref version) = telemetry.fw_version {
            let mut fw = shared.fw_version.lock();
            if fw.as_deref() != Some(version.as_str()) {
                log::info!("MCU firmware version: {}", version);
                *fw = Some(version.clone());
            }
        }
        *shared.latest.lock() = Some(telemetry.clone());
        fan_out(&shared.telemetry_subs, &telemetry);
    }
}
