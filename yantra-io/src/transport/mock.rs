//! In-memory transport for protocol tests.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::Transport;
use crate::error::{Error, Result};

/// Shared script/capture state so tests keep a handle after the transport
/// is boxed away.
#[derive(Default)]
pub struct MockState {
    /// Bytes the device "sends"; reads drain from the front.
    pub input: VecDeque<u8>,
    /// Everything written to the device.
    pub written: Vec<u8>,
    /// DTR transitions in order.
    pub dtr_levels: Vec<bool>,
    /// When set, every read/write fails (detached device).
    pub broken: bool,
}

/// Scriptable transport backed by [`MockState`].
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Arc<Mutex<MockState>> {
        Arc::clone(&self.state)
    }

    /// Queue bytes for the next reads.
    pub fn feed(&self, bytes: &[u8]) {
        self.state.lock().input.extend(bytes.iter().copied());
    }

    /// Everything written so far.
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    pub fn set_broken(&self, broken: bool) {
        self.state.lock().broken = broken;
    }
}

impl Transport for MockTransport {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock();
        if state.broken {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock transport broken",
            )));
        }
        let mut n = 0;
        while n < buffer.len() {
            match state.input.pop_front() {
                Some(b) => {
                    buffer[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut state = self.state.lock();
        if state.broken {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock transport broken",
            )));
        }
        state.written.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn available(&mut self) -> Result<usize> {
        Ok(self.state.lock().input.len())
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.state.lock().dtr_levels.push(level);
        Ok(())
    }

    fn clear_input(&mut self) -> Result<()> {
        self.state.lock().input.clear();
        Ok(())
    }
}
