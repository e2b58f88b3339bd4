//! Process-wide status handle and the human log ring.
//!
//! One [`RuntimeStatus`] is created by the runtime and passed into every
//! component at construction; nothing in the process reaches for a
//! global. UI readers poll snapshots; the log ring keeps the last 100
//! entries and fans new ones out to subscribers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

/// Connection and mode flags readable from any thread.
#[derive(Debug)]
pub struct RuntimeStatus {
    pub arduino_connected: AtomicBool,
    pub flir_connected: AtomicBool,
    pub mapping: AtomicBool,
    pub wander_active: AtomicBool,
    pub explore_active: AtomicBool,
    pub recording: AtomicBool,
    pub exploration_complete: AtomicBool,
    started: Instant,
}

impl Default for RuntimeStatus {
    fn default() -> Self {
        Self {
            arduino_connected: AtomicBool::new(false),
            flir_connected: AtomicBool::new(false),
            mapping: AtomicBool::new(false),
            wander_active: AtomicBool::new(false),
            explore_active: AtomicBool::new(false),
            recording: AtomicBool::new(false),
            exploration_complete: AtomicBool::new(false),
            started: Instant::now(),
        }
    }
}

impl RuntimeStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn set(&self, flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::Release);
    }

    pub fn get(&self, flag: &AtomicBool) -> bool {
        flag.load(Ordering::Acquire)
    }
}

/// Log ring capacity.
pub const LOG_RING_CAPACITY: usize = 100;

/// Bounded human log with subscriber fan-out.
#[derive(Default)]
pub struct LogRing {
    entries: Mutex<VecDeque<String>>,
    subscribers: Mutex<Vec<Sender<String>>>,
}

impl LogRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line, evicting the oldest past capacity, and fan it out.
    pub fn push(&self, line: impl Into<String>) {
        let line = line.into();
        {
            let mut entries = self.entries.lock();
            if entries.len() == LOG_RING_CAPACITY {
                entries.pop_front();
            }
            entries.push_back(line.clone());
        }
        self.subscribers
            .lock()
            .retain(|tx| tx.send(line.clone()).is_ok());
    }

    /// Subscribe to lines pushed after this call.
    pub fn subscribe(&self) -> Receiver<String> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Copy of the retained entries, oldest first.
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().iter().cloned().collect()
    }
}
