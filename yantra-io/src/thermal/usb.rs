//! USB plumbing for the thermal imager.
//!
//! Two threads per device: the main reader pulls bulk transfers off the
//! frame endpoint and runs them through the [`FrameParser`]; a second
//! thread keeps the auxiliary endpoints drained on short timeouts —
//! leaving them full stalls the frame endpoint on the device side.
//!
//! Reconnect follows the same budget as the serial link: a fixed number
//! of attempts on a fixed cadence, then the driver stays down until a
//! manual retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use rusb::{DeviceHandle, GlobalContext};

use super::frame::{FrameParser, ThermalFrame};

/// Poll timeout for the auxiliary endpoints.
const AUX_DRAIN_TIMEOUT: Duration = Duration::from_millis(50);
/// Bulk read timeout on the frame endpoint.
const FRAME_READ_TIMEOUT: Duration = Duration::from_millis(200);
/// Bulk transfer chunk size.
const READ_CHUNK: usize = 16384;

/// Device identity and endpoint layout.
#[derive(Debug, Clone)]
pub struct ThermalConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Bulk-in endpoint carrying frames.
    pub frame_endpoint: u8,
    /// Bulk-in endpoints that must be kept drained.
    pub aux_endpoints: [u8; 2],
    /// Interfaces to claim.
    pub interfaces: Vec<u8>,
    pub reconnect_interval: Duration,
    pub max_retries: u32,
}

impl Default for ThermalConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0x09CB,
            product_id: 0x1996,
            frame_endpoint: 0x85,
            aux_endpoints: [0x81, 0x83],
            interfaces: vec![0, 1, 2],
            reconnect_interval: Duration::from_secs(3),
            max_retries: 3,
        }
    }
}

/// Connection-state transitions for the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThermalEvent {
    Connected,
    Disconnected { message: String },
    RetryExhausted,
}

struct CameraShared {
    config: ThermalConfig,
    running: AtomicBool,
    connected: AtomicBool,
    exhausted: AtomicBool,
    retry_requested: AtomicBool,
    handle: Mutex<Option<Arc<DeviceHandle<GlobalContext>>>>,
    frame_tx: Sender<ThermalFrame>,
    event_tx: Sender<ThermalEvent>,
}

/// Thermal camera driver handle.
pub struct ThermalCamera {
    shared: Arc<CameraShared>,
    frame_rx: Receiver<ThermalFrame>,
    event_rx: Receiver<ThermalEvent>,
    threads: Vec<JoinHandle<()>>,
}

impl ThermalCamera {
    /// Start the driver threads; connection happens in the background.
    pub fn start(config: ThermalConfig) -> Self {
        let (frame_tx, frame_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();

        let shared = Arc::new(CameraShared {
            config,
            running: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            retry_requested: AtomicBool::new(false),
            handle: Mutex::new(None),
            frame_tx,
            event_tx,
        });

        let mut threads = Vec::with_capacity(2);
        let reader_shared = Arc::clone(&shared);
        threads.push(
            thread::Builder::new()
                .name("thermal-reader".to_string())
                .spawn(move || reader_loop(reader_shared))
                .expect("spawn thermal reader"),
        );
        let drain_shared = Arc::clone(&shared);
        threads.push(
            thread::Builder::new()
                .name("thermal-drain".to_string())
                .spawn(move || drain_loop(drain_shared))
                .expect("spawn thermal drain"),
        );

        Self {
            shared,
            frame_rx,
            event_rx,
            threads,
        }
    }

    pub fn frames(&self) -> Receiver<ThermalFrame> {
        self.frame_rx.clone()
    }

    pub fn events(&self) -> Receiver<ThermalEvent> {
        self.event_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn is_exhausted(&self) -> bool {
        self.shared.exhausted.load(Ordering::Acquire)
    }

    pub fn request_retry(&self) {
        self.shared.retry_requested.store(true, Ordering::Release);
    }

    pub fn shutdown(mut self) {
        self.shared.running.store(false, Ordering::Release);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        *self.shared.handle.lock() = None;
    }
}

fn open_device(config: &ThermalConfig) -> crate::error::Result<DeviceHandle<GlobalContext>> {
    let mut handle = rusb::open_device_with_vid_pid(config.vendor_id, config.product_id)
        .ok_or(crate::error::Error::NotConnected)?;

    let _ = handle.set_auto_detach_kernel_driver(true);
    for &iface in &config.interfaces {
        handle.claim_interface(iface)?;
    }
    Ok(handle)
}

fn reader_loop(shared: Arc<CameraShared>) {
    let mut buf = vec![0u8; READ_CHUNK];

    while shared.running.load(Ordering::Acquire) {
        if shared.exhausted.load(Ordering::Acquire) {
            if shared.retry_requested.swap(false, Ordering::AcqRel) {
                shared.exhausted.store(false, Ordering::Release);
            } else {
                thread::sleep(Duration::from_millis(100));
                continue;
            }
        }

        // Connect with the retry budget.
        let mut opened = false;
        for attempt in 1..=shared.config.max_retries {
            if !shared.running.load(Ordering::Acquire) {
                return;
            }
            match open_device(&shared.config) {
                Ok(handle) => {
                    log::info!(
                        "thermal camera {:04x}:{:04x} opened",
                        shared.config.vendor_id,
                        shared.config.product_id
                    );
                    *shared.handle.lock() = Some(Arc::new(handle));
                    shared.connected.store(true, Ordering::Release);
                    let _ = shared.event_tx.send(ThermalEvent::Connected);
                    opened = true;
                    break;
                }
                Err(e) => {
                    log::warn!(
                        "thermal open attempt {}/{} failed: {}",
                        attempt,
                        shared.config.max_retries,
                        e
                    );
                    if attempt < shared.config.max_retries {
                        thread::sleep(shared.config.reconnect_interval);
                    }
                }
            }
        }
        if !opened {
            shared.exhausted.store(true, Ordering::Release);
            let _ = shared.event_tx.send(ThermalEvent::RetryExhausted);
            continue;
        }

        // Stream frames until the device goes away.
        let mut parser = FrameParser::new();
        loop {
            if !shared.running.load(Ordering::Acquire) {
                return;
            }
            let handle = {
                let guard = shared.handle.lock();
                match guard.as_ref() {
                    Some(h) => Arc::clone(h),
                    None => break,
                }
            };
            match handle.read_bulk(shared.config.frame_endpoint, &mut buf, FRAME_READ_TIMEOUT) {
                Ok(n) => {
                    for frame in parser.push(&buf[..n]) {
                        let _ = shared.frame_tx.send(frame);
                    }
                }
                Err(rusb::Error::Timeout) => {}
                Err(e) => {
                    log::warn!("thermal frame endpoint error: {}", e);
                    shared.connected.store(false, Ordering::Release);
                    *shared.handle.lock() = None;
                    let _ = shared.event_tx.send(ThermalEvent::Disconnected {
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }
    }
}

/// Keep the auxiliary endpoints drained; their content is discarded.
fn drain_loop(shared: Arc<CameraShared>) {
    let mut buf = vec![0u8; READ_CHUNK];
    while shared.running.load(Ordering::Acquire) {
        let handle = {
            let guard = shared.handle.lock();
            guard.as_ref().map(Arc::clone)
        };
        let Some(handle) = handle else {
            thread::sleep(Duration::from_millis(100));
            continue;
        };
        for &endpoint in &shared.config.aux_endpoints {
            match handle.read_bulk(endpoint, &mut buf, AUX_DRAIN_TIMEOUT) {
                Ok(_) | Err(rusb::Error::Timeout) => {}
                Err(e) => {
                    // The reader notices and reconnects; nothing to do here.
                    log::debug!("aux endpoint 0x{:02x} error: {}", endpoint, e);
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }
}
