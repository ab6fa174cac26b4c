//! Scripted in-memory [`Transport`] for exercising the protocol without hardware.

use crate::serial_terminal::{TerminalError, Transport};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Default)]
struct FakeState {
    responses: HashMap<u8, VecDeque<Vec<u8>>>,
    input: VecDeque<u8>,
    written: Vec<u8>,
    clears: usize,
    chunk_size: Option<usize>,
    fail_writes: bool,
    closed: bool,
}

/// Clones share state, so a test can keep a handle after moving the
/// transport into a device.
#[derive(Clone, Default)]
pub(crate) struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver at most `size` bytes per read.
    pub fn with_chunk_size(self, size: usize) -> Self {
        self.lock().chunk_size = Some(size.max(1));
        self
    }

    /// Queue `bytes` as the reply to the next write of `command`. The last
    /// queued reply for a command is reused for every further write.
    pub fn respond_to(&self, command: u8, bytes: &[u8]) {
        self.lock()
            .responses
            .entry(command)
            .or_default()
            .push_back(bytes.to_vec());
    }

    /// Put bytes on the input side right now.
    pub fn inject(&self, bytes: &[u8]) {
        self.lock().input.extend(bytes.iter().copied());
    }

    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    pub fn pending_input(&self) -> usize {
        self.lock().input.len()
    }

    pub fn clear_count(&self) -> usize {
        self.lock().clears
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for FakeTransport {
    fn bytes_available(&mut self) -> Result<usize, TerminalError> {
        let state = self.lock();
        Ok(state
            .chunk_size
            .map_or(state.input.len(), |chunk| state.input.len().min(chunk)))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TerminalError> {
        let mut state = self.lock();
        let limit = state.chunk_size.unwrap_or(usize::MAX);
        let count = buf.len().min(limit).min(state.input.len());
        for (slot, byte) in buf.iter_mut().zip(state.input.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TerminalError> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down").into());
        }

        for &byte in data {
            state.written.push(byte);
            let reply = match state.responses.get_mut(&byte) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            };
            if let Some(reply) = reply {
                state.input.extend(reply);
            }
        }
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), TerminalError> {
        let mut state = self.lock();
        state.input.clear();
        state.clears += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TerminalError> {
        self.lock().closed = true;
        Ok(())
    }
}

/// Wire image of a capture reply.
pub(crate) fn capture_reply(sample_rate_hz: u32, samples: &[u8], newline: bool) -> Vec<u8> {
    let mut reply = b"DATA:".to_vec();
    reply.extend_from_slice(&(samples.len() as u32).to_le_bytes());
    reply.extend_from_slice(&sample_rate_hz.to_le_bytes());
    if newline {
        reply.push(b'\n');
    }
    reply.extend_from_slice(samples);
    reply
}
