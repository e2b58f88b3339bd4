//! Line-framed serial link with auto-reconnect.
//!
//! Three threads cooperate around one shared transport:
//!
//! - **reader**: polls the port, splits complete lines (CR stripped) and
//!   publishes them to subscribers
//! - **writer**: drains a bounded queue, terminating every command with a
//!   single newline; on overflow the *oldest* pending command is dropped
//!   (drive commands are idempotent, the newest intent wins)
//! - **manager**: owns the connect/reconnect state machine
//!
//! On any I/O error the worker threads stand down, the manager closes the
//! port and retries on a fixed cadence up to a budget; past that the link
//! stays down until [`SerialLink::request_retry`]. After a successful open
//! the device gets a quiescence window (it may still be in its bootloader)
//! and buffered input is drained before normal operation resumes.
//!
//! The firmware programmer takes the transport over exclusively: the link
//! is paused (threads parked, not destroyed) and resumed afterward.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::error::Error;
use crate::transport::{Transport, TransportFactory};

/// Bounded write queue capacity.
pub const WRITE_QUEUE_CAPACITY: usize = 64;

/// Link timing knobs. Defaults follow the hardware's observed behaviour;
/// tests shrink them.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Wait after a detachment before the first reopen attempt.
    pub reconnect_delay: Duration,
    /// Spacing between reopen attempts.
    pub retry_interval: Duration,
    /// Auto-reopen attempts before the link gives up.
    pub max_retries: u32,
    /// Window after open during which the device may still be booting.
    pub quiescence: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(2),
            retry_interval: Duration::from_secs(3),
            max_retries: 3,
            quiescence: Duration::from_millis(2500),
        }
    }
}

/// Failure kinds surfaced with connection-state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFailure {
    NotFound,
    PermissionDenied,
    OpenFailed,
    IoError,
    RetryExhausted,
}

/// Connection-state transition published to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected {
        failure: LinkFailure,
        message: String,
    },
}

fn classify_open_error(err: &Error) -> LinkFailure {
    match err {
        Error::Serial(e) => match e.kind() {
            serialport::ErrorKind::NoDevice => LinkFailure::NotFound,
            serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => LinkFailure::NotFound,
            serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                LinkFailure::PermissionDenied
            }
            _ => LinkFailure::OpenFailed,
        },
        Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => LinkFailure::NotFound,
        Error::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            LinkFailure::PermissionDenied
        }
        _ => LinkFailure::OpenFailed,
    }
}

struct WriteQueue {
    commands: VecDeque<String>,
}

/// Shared slot holding the open transport, if any. The firmware
/// programmer borrows this exclusively while the link is paused.
pub type TransportSlot = Arc<Mutex<Option<Box<dyn Transport>>>>;

struct LinkShared {
    factory: Mutex<TransportFactory>,
    transport: TransportSlot,
    queue: Mutex<WriteQueue>,
    queue_cv: Condvar,
    config: LinkConfig,

    running: AtomicBool,
    paused: AtomicBool,
    connected: AtomicBool,
    need_reconnect: AtomicBool,
    retry_requested: AtomicBool,
    exhausted: AtomicBool,
    dropped_writes: AtomicU64,

    last_error: Mutex<String>,
    line_tx: Sender<String>,
    event_tx: Sender<LinkEvent>,
}

impl LinkShared {
    fn record_io_error(&self, context: &str, err: &Error) {
        *self.last_error.lock() = format!("{}: {}", context, err);
        self.connected.store(false, Ordering::Release);
        self.need_reconnect.store(true, Ordering::Release);
    }
}

/// Handle to the serial link threads.
pub struct SerialLink {
    shared: Arc<LinkShared>,
    line_rx: Receiver<String>,
    event_rx: Receiver<LinkEvent>,
    handles: Vec<JoinHandle<()>>,
}

impl SerialLink {
    /// Start the link with its worker threads. The factory is invoked for
    /// the initial open and for every reconnect.
    pub fn start(factory: TransportFactory, config: LinkConfig) -> Self {
        let (line_tx, line_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();

        let shared = Arc::new(LinkShared {
            factory: Mutex::new(factory),
            transport: Arc::new(Mutex::new(None)),
            queue: Mutex::new(WriteQueue {
                commands: VecDeque::with_capacity(WRITE_QUEUE_CAPACITY),
            }),
            queue_cv: Condvar::new(),
            config,
            running: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            need_reconnect: AtomicBool::new(true),
            retry_requested: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            dropped_writes: AtomicU64::new(0),
            last_error: Mutex::new(String::new()),
            line_tx,
            event_tx,
        });

        let mut handles = Vec::with_capacity(3);
        for (name, f) in [
            ("serial-manager", manager_loop as fn(Arc<LinkShared>)),
            ("serial-reader", reader_loop as fn(Arc<LinkShared>)),
            ("serial-writer", writer_loop as fn(Arc<LinkShared>)),
        ] {
            let shared_clone = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(name.to_string())
                .spawn(move || f(shared_clone))
                .expect("spawn link thread");
            handles.push(handle);
        }

        Self {
            shared,
            line_rx,
            event_rx,
            handles,
        }
    }

    /// Enqueue one command for transmission. The writer appends the
    /// newline terminator; on a full queue the oldest command is dropped.
    pub fn send_line(&self, line: impl Into<String>) {
        enqueue(&self.shared, line.into());
    }

    /// Cheap cloneable handle for enqueueing commands from other threads.
    pub fn sender(&self) -> LinkSender {
        LinkSender {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Received whole lines, CR stripped.
    pub fn lines(&self) -> Receiver<String> {
        self.line_rx.clone()
    }

    /// Connection-state transitions.
    pub fn events(&self) -> Receiver<LinkEvent> {
        self.event_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// True once the retry budget is spent; cleared by
    /// [`request_retry`](Self::request_retry).
    pub fn is_exhausted(&self) -> bool {
        self.shared.exhausted.load(Ordering::Acquire)
    }

    pub fn dropped_writes(&self) -> u64 {
        self.shared.dropped_writes.load(Ordering::Relaxed)
    }

    /// Ask the manager to try connecting again after exhaustion.
    pub fn request_retry(&self) {
        self.shared.retry_requested.store(true, Ordering::Release);
    }

    /// Park the reader and writer so another owner can use the transport
    /// exclusively.
    pub fn pause_io(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    /// Resume normal reader/writer operation.
    pub fn resume_io(&self) {
        self.shared.paused.store(false, Ordering::Release);
        self.shared.queue_cv.notify_all();
    }

    /// Shared transport slot, for the firmware programmer. Callers must
    /// pause the link first.
    pub fn transport(&self) -> TransportSlot {
        Arc::clone(&self.shared.transport)
    }

    /// Stop all threads and close the port.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.queue_cv.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        *self.shared.transport.lock() = None;
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        if self.shared.running.load(Ordering::Acquire) {
            self.stop();
        }
    }
}

/// Write-queue handle detached from the link's lifetime management.
#[derive(Clone)]
pub struct LinkSender {
    shared: Arc<LinkShared>,
}

impl LinkSender {
    pub fn send_line(&self, line: impl Into<String>) {
        enqueue(&self.shared, line.into());
    }
}

fn enqueue(shared: &LinkShared, line: String) {
    let mut queue = shared.queue.lock();
    if queue.commands.len() >= WRITE_QUEUE_CAPACITY {
        queue.commands.pop_front();
        let dropped = shared.dropped_writes.fetch_add(1, Ordering::Relaxed) + 1;
        log::warn!(
            "serial write queue full, dropped oldest command ({} total)",
            dropped
        );
    }
    queue.commands.push_back(line);
    drop(queue);
    shared.queue_cv.notify_one();
}

fn manager_loop(shared: Arc<LinkShared>) {
    let mut first_attempt = true;

    while shared.running.load(Ordering::Acquire) {
        let needs_work = shared.need_reconnect.load(Ordering::Acquire)
            || shared.retry_requested.load(Ordering::Acquire);
        if !needs_work {
            thread::sleep(Duration::from_millis(100));
            continue;
        }

        if shared.exhausted.load(Ordering::Acquire)
            && !shared.retry_requested.load(Ordering::Acquire)
        {
            thread::sleep(Duration::from_millis(100));
            continue;
        }

        if shared.retry_requested.swap(false, Ordering::AcqRel) {
            log::info!("serial link: manual retry requested");
            shared.exhausted.store(false, Ordering::Release);
        }

        // Tear down whatever is left of the previous connection.
        let had_transport = {
            let mut guard = shared.transport.lock();
            guard.take().is_some()
        };
        if had_transport {
            let message = shared.last_error.lock().clone();
            log::warn!("serial link lost: {}", message);
            let _ = shared.event_tx.send(LinkEvent::Disconnected {
                failure: LinkFailure::IoError,
                message,
            });
        }

        if !first_attempt {
            sleep_while_running(&shared, shared.config.reconnect_delay);
        }
        first_attempt = false;

        let mut opened = false;
        for attempt in 1..=shared.config.max_retries {
            if !shared.running.load(Ordering::Acquire) {
                return;
            }
            log::info!(
                "serial link: open attempt {}/{}",
                attempt,
                shared.config.max_retries
            );

            let result = (shared.factory.lock())();
            match result {
                Ok(transport) => {
                    *shared.transport.lock() = Some(transport);
                    // Device may still be in its bootloader; give it time,
                    // then drop whatever it printed while booting.
                    sleep_while_running(&shared, shared.config.quiescence);
                    if let Some(t) = shared.transport.lock().as_mut() {
                        if let Err(e) = t.clear_input() {
                            log::debug!("post-open input drain failed: {}", e);
                        }
                    }
                    shared.need_reconnect.store(false, Ordering::Release);
                    shared.connected.store(true, Ordering::Release);
                    let _ = shared.event_tx.send(LinkEvent::Connected);
                    log::info!("serial link connected");
                    opened = true;
                    break;
                }
                Err(e) => {
                    let failure = classify_open_error(&e);
                    log::warn!("serial open failed ({:?}): {}", failure, e);
                    let _ = shared.event_tx.send(LinkEvent::Disconnected {
                        failure,
                        message: e.to_string(),
                    });
                    if attempt < shared.config.max_retries {
                        sleep_while_running(&shared, shared.config.retry_interval);
                    }
                }
            }
        }

        if !opened {
            shared.need_reconnect.store(false, Ordering::Release);
            shared.exhausted.store(true, Ordering::Release);
            let _ = shared.event_tx.send(LinkEvent::Disconnected {
                failure: LinkFailure::RetryExhausted,
                message: format!(
                    "gave up after {} attempts; awaiting manual retry",
                    shared.config.max_retries
                ),
            });
        }
    }
}

fn sleep_while_running(shared: &LinkShared, total: Duration) {
    let step = Duration::from_millis(50);
    let mut remaining = total;
    while remaining > Duration::ZERO && shared.running.load(Ordering::Acquire) {
        let chunk = remaining.min(step);
        thread::sleep(chunk);
        remaining = remaining.saturating_sub(chunk);
    }
}

fn reader_loop(shared: Arc<LinkShared>) {
    let mut acc: Vec<u8> = Vec::with_capacity(1024);
    let mut buf = [0u8; 512];

    while shared.running.load(Ordering::Acquire) {
        if shared.paused.load(Ordering::Acquire) || !shared.connected.load(Ordering::Acquire) {
            acc.clear();
            thread::sleep(Duration::from_millis(20));
            continue;
        }

        // Check availability first so the lock is never held across a
        // blocking read.
        let read_result = {
            let mut guard = shared.transport.lock();
            match guard.as_mut() {
                None => None,
                Some(t) => match t.available() {
                    Ok(0) => Some(Ok(0)),
                    Ok(n) => {
                        let want = n.min(buf.len());
                        Some(t.read(&mut buf[..want]))
                    }
                    Err(e) => Some(Err(e)),
                },
            }
        };

        match read_result {
            None => thread::sleep(Duration::from_millis(20)),
            Some(Ok(0)) => thread::sleep(Duration::from_millis(5)),
            Some(Ok(n)) => {
                acc.extend_from_slice(&buf[..n]);
                dispatch_lines(&shared, &mut acc);
            }
            Some(Err(e)) => {
                shared.record_io_error("read", &e);
            }
        }
    }
}

fn dispatch_lines(shared: &LinkShared, acc: &mut Vec<u8>) {
    while let Some(pos) = acc.iter().position(|&b| b == b'\n') {
        let mut line: Vec<u8> = acc.drain(..=pos).collect();
        line.pop(); // the newline
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        if line.is_empty() {
            continue;
        }
        let text = String::from_utf8_lossy(&line).into_owned();
        let _ = shared.line_tx.send(text);
    }
    // Guard against a device spewing garbage with no newlines.
    if acc.len() > 64 * 1024 {
        log::warn!("serial reader: discarding {} unframed bytes", acc.len());
        acc.clear();
    }
}

fn writer_loop(shared: Arc<LinkShared>) {
    while shared.running.load(Ordering::Acquire) {
        if shared.paused.load(Ordering::Acquire) || !shared.connected.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(20));
            continue;
        }

        let command = {
            let mut queue = shared.queue.lock();
            if queue.commands.is_empty() {
                shared
                    .queue_cv
                    .wait_for(&mut queue, Duration::from_millis(100));
            }
            // Re-check after the wait: a pause or disconnect may have
            // landed while we were parked.
            if shared.paused.load(Ordering::Acquire) || !shared.connected.load(Ordering::Acquire) {
                None
            } else {
                queue.commands.pop_front()
            }
        };

        let Some(command) = command else { continue };

        let mut guard = shared.transport.lock();
        let Some(transport) = guard.as_mut() else {
            continue;
        };

        let mut payload = command.into_bytes();
        payload.push(b'\n');
        match transport.write(&payload).and_then(|_| transport.flush()) {
            Ok(()) => {}
            Err(e) => {
                drop(guard);
                shared.record_io_error("write", &e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn test_config() -> LinkConfig {
        LinkConfig {
            reconnect_delay: Duration::from_millis(10),
            retry_interval: Duration::from_millis(10),
            max_retries: 3,
            quiescence: Duration::from_millis(5),
        }
    }

    fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_millis(deadline_ms);
        while std::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn start_with_mock() -> (SerialLink, MockTransport) {
        let mock = MockTransport::new();
        let factory_mock = mock.clone();
        let link = SerialLink::start(
            Box::new(move || Ok(Box::new(factory_mock.clone()) as Box<dyn Transport>)),
            test_config(),
        );
        (link, mock)
    }

    #[test]
    fn test_connects_and_reports_event() {
        let (link, _mock) = start_with_mock();
        let events = link.events();
        assert!(wait_until(1000, || link.is_connected()));
        assert_eq!(events.recv().unwrap(), LinkEvent::Connected);
    }

    #[test]
    fn test_lines_are_framed_and_cr_stripped() {
        let (link, mock) = start_with_mock();
        assert!(wait_until(1000, || link.is_connected()));

        let lines = link.lines();
        mock.feed(b"{\"t\":1}\r\n{\"t\":2}\npartial");
        let first = lines.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = lines.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first, "{\"t\":1}");
        assert_eq!(second, "{\"t\":2}");
        // The partial tail stays buffered until its newline arrives.
        assert!(lines.try_recv().is_err());
        mock.feed(b"\n");
        assert_eq!(lines.recv_timeout(Duration::from_secs(1)).unwrap(), "partial");
    }

    #[test]
    fn test_writes_are_newline_terminated() {
        let (link, mock) = start_with_mock();
        assert!(wait_until(1000, || link.is_connected()));

        link.send_line("{\"N\":6}");
        assert!(wait_until(1000, || mock.written().ends_with(b"{\"N\":6}\n")));
    }

    #[test]
    fn test_queue_drops_oldest_on_overflow() {
        // Pause IO so nothing drains while we overfill the queue.
        let (link, _mock) = start_with_mock();
        link.pause_io();

        for i in 0..(WRITE_QUEUE_CAPACITY + 8) {
            link.send_line(format!("cmd-{}", i));
        }
        assert_eq!(link.dropped_writes(), 8);

        let queue = link.shared.queue.lock();
        assert_eq!(queue.commands.len(), WRITE_QUEUE_CAPACITY);
        // Oldest survivors are the ones after the dropped prefix.
        assert_eq!(queue.commands.front().unwrap(), "cmd-8");
        assert_eq!(
            queue.commands.back().unwrap(),
            &format!("cmd-{}", WRITE_QUEUE_CAPACITY + 7)
        );
    }

    #[test]
    fn test_io_error_triggers_reconnect() {
        let (link, mock) = start_with_mock();
        let events = link.events();
        assert!(wait_until(1000, || link.is_connected()));
        assert_eq!(events.recv().unwrap(), LinkEvent::Connected);

        mock.set_broken(true);
        // Reads return nothing while broken; provoke a write to surface
        // the error.
        link.send_line("{\"N\":1}");

        // Disconnect then reconnect once the transport works again.
        let event = events.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(event, LinkEvent::Disconnected { .. }));
        mock.set_broken(false);
        assert!(wait_until(2000, || link.is_connected()));
    }

    #[test]
    fn test_retry_exhaustion_and_manual_retry() {
        let attempts = Arc::new(AtomicU64::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let mock = MockTransport::new();
        let factory_mock = mock.clone();

        let link = SerialLink::start(
            Box::new(move || {
                let n = attempts_clone.fetch_add(1, Ordering::SeqCst);
                if n < 3 {
                    Err(Error::Other("no device".into()))
                } else {
                    Ok(Box::new(factory_mock.clone()) as Box<dyn Transport>)
                }
            }),
            test_config(),
        );
        let events = link.events();

        // Three failed attempts exhaust the budget.
        assert!(wait_until(2000, || link.is_exhausted()));
        let mut saw_exhausted = false;
        while let Ok(event) = events.try_recv() {
            if matches!(
                event,
                LinkEvent::Disconnected {
                    failure: LinkFailure::RetryExhausted,
                    ..
                }
            ) {
                saw_exhausted = true;
            }
        }
        assert!(saw_exhausted);
        assert!(!link.is_connected());

        // Manual retry succeeds now that the factory cooperates.
        link.request_retry();
        assert!(wait_until(2000, || link.is_connected()));
    }
}
