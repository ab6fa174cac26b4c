use serialport::SerialPort;
use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A duplex byte stream with a read timeout.
///
/// The protocol client only ever talks to the device through this trait, so a
/// scripted stream can stand in for the serial port.
pub trait Transport: Send {
    /// Number of bytes that can be read without blocking.
    fn bytes_available(&mut self) -> Result<usize, TerminalError>;

    /// Read up to `buf.len()` bytes. `Ok(0)` means nothing arrived before the
    /// read timeout.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TerminalError>;

    fn write_all(&mut self, data: &[u8]) -> Result<(), TerminalError>;

    /// Drop everything the link has buffered on the input side.
    fn clear_input(&mut self) -> Result<(), TerminalError>;

    fn close(&mut self) -> Result<(), TerminalError> {
        Ok(())
    }
}

/// [`Transport`] over a real serial port.
#[derive(Debug)]
pub struct SerialTransport {
    serial: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open `port` at `baud_rate`; `read_timeout` bounds every single read.
    pub fn open(port: &str, baud_rate: u32, read_timeout: Duration) -> Result<Self, TerminalError> {
        log::debug!("Opening {} at {} baud", port, baud_rate);
        let serial = serialport::new(port, baud_rate)
            .timeout(read_timeout)
            .open()?;

        Ok(Self { serial })
    }

    pub fn name(&self) -> Option<String> {
        self.serial.name()
    }
}

impl Transport for SerialTransport {
    fn bytes_available(&mut self) -> Result<usize, TerminalError> {
        Ok(self.serial.bytes_to_read()? as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TerminalError> {
        match self.serial.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TerminalError> {
        self.serial.write_all(data)?;
        self.serial.flush()?;
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), TerminalError> {
        self.serial.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }
}

/// Command/response terminal on top of a [`Transport`].
///
/// Incoming bytes are collected into one growable buffer. Nothing that has
/// been read is ever thrown away implicitly: callers scan the whole buffer
/// and explicitly [`consume`](Self::consume) or [`clear`](Self::clear) it.
pub struct La8Terminal<T: Transport> {
    transport: T,
    pending: Vec<u8>,
    poll_interval: Duration,
}

impl<T: Transport> La8Terminal<T> {
    pub fn new(transport: T, poll_interval: Duration) -> Self {
        Self {
            transport,
            pending: Vec::new(),
            poll_interval,
        }
    }

    /// Write a single command byte.
    pub fn send(&mut self, command: u8) -> Result<(), TerminalError> {
        log::trace!("-> {:?}", char::from(command));
        self.transport.write_all(&[command])
    }

    /// Move whatever the transport has ready into the pending buffer.
    pub fn poll(&mut self) -> Result<usize, TerminalError> {
        let available = self.transport.bytes_available()?;
        if available == 0 {
            return Ok(0);
        }

        let start = self.pending.len();
        self.pending.resize(start + available, 0);
        let read = match self.transport.read(&mut self.pending[start..]) {
            Ok(n) => n,
            Err(e) => {
                self.pending.truncate(start);
                return Err(e);
            }
        };
        self.pending.truncate(start + read);

        if read > 0 {
            log::trace!("<- {} bytes ({} pending)", read, self.pending.len());
        }
        Ok(read)
    }

    /// Keep polling until `done` accepts the pending buffer or `deadline`
    /// passes. Returns whether `done` was satisfied.
    pub fn fill_until(
        &mut self,
        deadline: Instant,
        mut done: impl FnMut(&[u8]) -> bool,
    ) -> Result<bool, TerminalError> {
        loop {
            self.poll()?;
            if done(&self.pending) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            if self.poll_interval.is_zero() {
                thread::yield_now();
            } else {
                thread::sleep(self.poll_interval);
            }
        }
    }

    /// Read one text line. A partial line still pending at the deadline is
    /// returned as-is; `None` means nothing arrived at all.
    pub fn read_line(&mut self, deadline: Instant) -> Result<Option<String>, TerminalError> {
        self.fill_until(deadline, |buf| buf.contains(&b'\n'))?;

        if self.pending.is_empty() {
            return Ok(None);
        }

        let end = self
            .pending
            .iter()
            .position(|&b| b == b'\n')
            .map_or(self.pending.len(), |pos| pos + 1);
        let line: Vec<u8> = self.pending.drain(..end).collect();

        Ok(Some(String::from_utf8_lossy(&line).trim().to_string()))
    }

    pub fn buffer(&self) -> &[u8] {
        &self.pending
    }

    /// Drop the first `count` pending bytes.
    pub fn consume(&mut self, count: usize) {
        let count = count.min(self.pending.len());
        self.pending.drain(..count);
    }

    /// Forget everything: the pending buffer and the transport's input side.
    pub fn clear(&mut self) -> Result<(), TerminalError> {
        self.pending.clear();
        self.transport.clear_input()
    }

    /// Read and throw away whatever is waiting, then clear. Returns the
    /// number of discarded bytes.
    pub fn discard_input(&mut self) -> Result<usize, TerminalError> {
        self.poll()?;
        let discarded = self.pending.len();
        self.clear()?;
        Ok(discarded)
    }

    pub fn into_transport(self) -> T {
        self.transport
    }
}
