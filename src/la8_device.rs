use crate::capture_frame::{
    decode_frame, finish_frame, peek_frame, Decoded, FrameStage, RawCaptureFrame,
};
use crate::sample_rate::SampleRate;
use crate::serial_terminal::{La8Terminal, TerminalError, Transport};
use std::thread;
use std::time::{Duration, Instant};

const CMD_INFO: u8 = b'I';
const CMD_RESET: u8 = b'R';
const CMD_CAPTURE: u8 = b'C';

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Device did not answer the info query")]
    NoResponse,

    #[error("Device is busy; it has been reset, retry the capture later")]
    Busy,

    #[error("Device reported an error: {0}")]
    Device(String),

    #[error("Timed out waiting for the {stage}")]
    Timeout { stage: FrameStage },

    #[error("Capture payload truncated: expected {expected} samples, received {received}")]
    ShortRead { expected: usize, received: usize },

    #[error("Transport failure: {0}")]
    Transport(#[from] TerminalError),
}

impl ProtocolError {
    /// Whether repeating the same request later can succeed without user
    /// action or a reconnect.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Busy | Self::Timeout { .. } | Self::ShortRead { .. }
        )
    }
}

/// Identity and limits reported by the device during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_name: String,
    pub version: String,
    pub channel_count: usize,
    pub buffer_size: usize,
    pub max_rate_hz: u32,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            device_name: DeviceInfo::DEVICE_NAME.to_string(),
            version: "3.1-UART".to_string(),
            channel_count: 8,
            buffer_size: 2048,
            max_rate_hz: 6_000_000,
        }
    }
}

impl DeviceInfo {
    pub const DEVICE_NAME: &'static str = "STM32-UART-LA8";

    /// Build from the `KEY:value` lines of an info reply. Keys that are
    /// missing or unparseable keep their defaults.
    pub fn from_lines<S: AsRef<str>>(lines: &[S]) -> Self {
        let mut info = Self::default();

        for line in lines.iter().map(AsRef::as_ref) {
            if let Some(version) = field(line, "VERSION:") {
                info.version = version.to_string();
            } else if let Some(channels) = field(line, "CHANNELS:") {
                match channels.parse() {
                    Ok(n) => info.channel_count = n,
                    Err(_) => log::warn!("Ignoring unparseable channel count '{}'", channels),
                }
            } else if let Some(buffer) = field(line, "BUFFER:") {
                match buffer.parse() {
                    Ok(n) => info.buffer_size = n,
                    Err(_) => log::warn!("Ignoring unparseable buffer size '{}'", buffer),
                }
            } else if let Some(max) = field(line, "MAX:") {
                match parse_rate_hz(max) {
                    Some(hz) => info.max_rate_hz = hz,
                    None => log::warn!("Ignoring unparseable max rate '{}'", max),
                }
            }
        }

        info
    }
}

/// Value after `key`, up to the next colon.
fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    let rest = &line[start..];
    Some(rest.split(':').next().unwrap_or(rest).trim())
}

/// `6MHz`, `500kHz`, `100Hz`; a bare number is in MHz.
fn parse_rate_hz(value: &str) -> Option<u32> {
    let value = value.trim();
    let (number, multiplier) = if let Some(n) = value.strip_suffix("MHz") {
        (n, 1_000_000.0)
    } else if let Some(n) = value.strip_suffix("kHz") {
        (n, 1_000.0)
    } else if let Some(n) = value.strip_suffix("Hz") {
        (n, 1.0)
    } else {
        (value, 1_000_000.0)
    };

    let hz = number.trim().parse::<f64>().ok()? * multiplier;
    (hz.is_finite() && hz >= 0.0 && hz <= f64::from(u32::MAX)).then(|| hz.round() as u32)
}

/// Fixed delays of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolTimings {
    /// Between a command and the first look at its reply.
    pub response_delay: Duration,
    /// Between `I` and reading the info lines.
    pub info_delay: Duration,
    /// How long info lines are collected.
    pub info_window: Duration,
    /// Between `R` and draining the input.
    pub reset_settle: Duration,
    /// Extra wait after a busy reset.
    pub busy_backoff: Duration,
    pub poll_interval: Duration,
    /// How long to wait for a rate acknowledgement line.
    pub line_timeout: Duration,
}

impl Default for ProtocolTimings {
    fn default() -> Self {
        Self {
            response_delay: Duration::from_millis(100),
            info_delay: Duration::from_millis(200),
            info_window: Duration::from_secs(1),
            reset_settle: Duration::from_millis(500),
            busy_backoff: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
            line_timeout: Duration::from_millis(500),
        }
    }
}

impl ProtocolTimings {
    /// No fixed delays; reply windows stay short but non-zero.
    pub fn immediate() -> Self {
        Self {
            response_delay: Duration::ZERO,
            info_delay: Duration::ZERO,
            info_window: Duration::from_millis(50),
            reset_settle: Duration::ZERO,
            busy_backoff: Duration::ZERO,
            poll_interval: Duration::ZERO,
            line_timeout: Duration::from_millis(50),
        }
    }
}

/// Protocol client for one connected analyzer.
///
/// Every operation is a blocking command/response exchange; `&mut self`
/// keeps them strictly sequential on the link.
pub struct La8Device<T: Transport> {
    terminal: La8Terminal<T>,
    info: DeviceInfo,
    timings: ProtocolTimings,
    sample_rate: Option<SampleRate>,
}

impl<T: Transport> La8Device<T> {
    pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Take over `transport` and identify the device on the other end.
    pub fn handshake(transport: T, timings: ProtocolTimings) -> Result<Self, ProtocolError> {
        let mut device = Self {
            terminal: La8Terminal::new(transport, timings.poll_interval),
            info: DeviceInfo::default(),
            timings,
            sample_rate: None,
        };

        let info = device.query_info()?;
        log::info!(
            "Connected to {} v{} ({} channels, {} sample buffer, max {} Hz)",
            info.device_name,
            info.version,
            info.channel_count,
            info.buffer_size,
            info.max_rate_hz
        );
        Ok(device)
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn timings(&self) -> &ProtocolTimings {
        &self.timings
    }

    /// Last rate the device acknowledged.
    pub fn sample_rate(&self) -> Option<SampleRate> {
        self.sample_rate
    }

    /// Send `I` and parse the reply lines, stopping at the `MAX:` line.
    pub fn query_info(&mut self) -> Result<DeviceInfo, ProtocolError> {
        self.terminal.clear()?;
        self.terminal.send(CMD_INFO)?;
        thread::sleep(self.timings.info_delay);

        let deadline = Instant::now() + self.timings.info_window;
        let mut lines = Vec::new();
        while let Some(line) = self.terminal.read_line(deadline)? {
            if line.is_empty() {
                continue;
            }
            log::debug!("Info: {}", line);
            let last = line.contains("MAX:");
            lines.push(line);
            if last {
                break;
            }
        }

        if lines.is_empty() {
            return Err(ProtocolError::NoResponse);
        }

        self.info = DeviceInfo::from_lines(&lines);
        Ok(self.info.clone())
    }

    /// Send `R` and drain whatever the device says afterwards. Failures are
    /// logged, never raised.
    pub fn reset(&mut self) -> bool {
        match self.try_reset() {
            Ok(discarded) => {
                log::debug!("Reset complete, discarded {} bytes", discarded);
                true
            }
            Err(e) => {
                log::error!("Reset failed: {}", e);
                false
            }
        }
    }

    fn try_reset(&mut self) -> Result<usize, TerminalError> {
        self.terminal.clear()?;
        self.terminal.send(CMD_RESET)?;
        thread::sleep(self.timings.reset_settle);
        self.terminal.discard_input()
    }

    /// Switch the sample rate. `Ok(false)` means the device did not
    /// acknowledge with `OK:` in time; `Err` only when the serial link
    /// itself failed.
    pub fn set_sample_rate(&mut self, rate: SampleRate) -> Result<bool, ProtocolError> {
        self.terminal.clear()?;
        self.terminal.send(rate.command())?;
        thread::sleep(self.timings.response_delay);

        let deadline = Instant::now() + self.timings.line_timeout;
        let reply = self.terminal.read_line(deadline)?.unwrap_or_default();
        let acknowledged = reply.contains("OK:");

        if acknowledged {
            log::debug!("Sample rate set to {} ({})", rate, reply);
            self.sample_rate = Some(rate);
        } else {
            log::warn!("Sample rate {} not acknowledged: '{}'", rate, reply);
        }
        Ok(acknowledged)
    }

    /// Trigger one capture and decode the reply.
    ///
    /// `timeout` runs from the moment `C` is written. A payload cut off by the
    /// timeout is returned as a short frame rather than an error. A busy
    /// device is reset before [`ProtocolError::Busy`] is returned; the caller
    /// decides when to try again.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn capture(&mut self, timeout: Duration) -> Result<RawCaptureFrame, ProtocolError> {
        self.terminal.clear()?;
        self.terminal.send(CMD_CAPTURE)?;
        let deadline = Instant::now() + timeout;

        thread::sleep(self.timings.response_delay);
        self.terminal.poll()?;
        match peek_frame(self.terminal.buffer()) {
            Decoded::Busy(text) => return Err(self.recover_from_busy(&text)),
            Decoded::DeviceError(text) => return Err(self.device_error(text)),
            _ => {}
        }

        let mut outcome = Decoded::Incomplete(FrameStage::Header);
        let finished = self.terminal.fill_until(deadline, |buf| {
            outcome = decode_frame(buf);
            !matches!(outcome, Decoded::Incomplete(_))
        })?;
        if !finished {
            outcome = finish_frame(self.terminal.buffer());
        }

        match outcome {
            Decoded::Complete { frame, consumed } => {
                self.terminal.consume(consumed);
                if frame.is_short() {
                    log::warn!(
                        "Expected {} samples, got {}",
                        frame.sample_count,
                        frame.received()
                    );
                } else {
                    log::debug!(
                        "Captured {} samples at {} Hz",
                        frame.sample_count,
                        frame.sample_rate_hz
                    );
                }
                Ok(frame)
            }
            Decoded::Busy(text) => Err(self.recover_from_busy(&text)),
            Decoded::DeviceError(text) => Err(self.device_error(text)),
            Decoded::Incomplete(stage) => {
                let received = self.terminal.buffer().len();
                log::error!("Timed out waiting for the {} ({} bytes received)", stage, received);
                self.terminal.consume(received);
                Err(ProtocolError::Timeout { stage })
            }
        }
    }

    fn recover_from_busy(&mut self, text: &str) -> ProtocolError {
        log::warn!("Device is busy ({}), resetting", text);
        self.reset();
        thread::sleep(self.timings.busy_backoff);
        if let Err(e) = self.terminal.clear() {
            log::error!("Failed to clear input after busy reset: {}", e);
        }
        ProtocolError::Busy
    }

    fn device_error(&mut self, text: String) -> ProtocolError {
        log::error!("Device error: {}", text);
        let received = self.terminal.buffer().len();
        self.terminal.consume(received);
        ProtocolError::Device(text)
    }

    /// Close the link.
    pub fn disconnect(self) {
        let mut transport = self.terminal.into_transport();
        if let Err(e) = transport.close() {
            log::warn!("Error while closing the link: {}", e);
        }
        log::debug!("Disconnected from {}", self.info.device_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_transport::{capture_reply, FakeTransport};

    const INFO_REPLY: &[u8] = b"LA8 READY\r\nVERSION:3.2-UART\r\nCHANNELS:8\r\nBUFFER:4096\r\nMAX:6MHz\r\n";

    fn connected(fake: &FakeTransport) -> La8Device<FakeTransport> {
        fake.respond_to(b'I', INFO_REPLY);
        La8Device::handshake(fake.clone(), ProtocolTimings::immediate()).unwrap()
    }

    #[test]
    fn test_handshake_parses_info() {
        let fake = FakeTransport::new();
        let device = connected(&fake);

        let info = device.info();
        assert_eq!(info.device_name, "STM32-UART-LA8");
        assert_eq!(info.version, "3.2-UART");
        assert_eq!(info.channel_count, 8);
        assert_eq!(info.buffer_size, 4096);
        assert_eq!(info.max_rate_hz, 6_000_000);
        assert_eq!(fake.written(), b"I");
    }

    #[test]
    fn test_handshake_without_reply_fails() {
        let fake = FakeTransport::new();
        let result = La8Device::handshake(fake, ProtocolTimings::immediate());
        assert!(matches!(result, Err(ProtocolError::NoResponse)));
    }

    #[test]
    fn test_info_defaults_for_missing_keys() {
        let info = DeviceInfo::from_lines(&["HELLO", "VERSION:4.0"]);
        assert_eq!(info.version, "4.0");
        assert_eq!(info.channel_count, 8);
        assert_eq!(info.buffer_size, 2048);
        assert_eq!(info.max_rate_hz, 6_000_000);
    }

    #[test]
    fn test_info_ignores_garbage_values() {
        let info = DeviceInfo::from_lines(&["CHANNELS:eight", "BUFFER:", "MAX:fast"]);
        assert_eq!(info, DeviceInfo::default());
    }

    #[test]
    fn test_max_rate_suffixes() {
        assert_eq!(parse_rate_hz("6MHz"), Some(6_000_000));
        assert_eq!(parse_rate_hz("2.5 MHz"), Some(2_500_000));
        assert_eq!(parse_rate_hz("500kHz"), Some(500_000));
        assert_eq!(parse_rate_hz("100Hz"), Some(100));
        assert_eq!(parse_rate_hz("6"), Some(6_000_000));
        assert_eq!(parse_rate_hz("-1"), None);
    }

    #[test]
    fn test_reset_sends_r_and_drains() {
        let fake = FakeTransport::new();
        let mut device = connected(&fake);
        fake.respond_to(b'R', b"RESET OK\r\n");

        assert!(device.reset());
        assert_eq!(fake.written(), b"IR");
        assert_eq!(fake.pending_input(), 0);
    }

    #[test]
    fn test_reset_reports_failure_without_error() {
        let fake = FakeTransport::new();
        let mut device = connected(&fake);
        fake.fail_writes(true);
        assert!(!device.reset());
    }

    #[test]
    fn test_set_sample_rate_acknowledged() {
        let fake = FakeTransport::new();
        let mut device = connected(&fake);
        fake.respond_to(b'2', b"OK:2MHz\r\n");

        assert!(device.set_sample_rate(SampleRate::MHz2).unwrap());
        assert_eq!(device.sample_rate(), Some(SampleRate::MHz2));
        assert_eq!(fake.written().last(), Some(&b'2'));
    }

    #[test]
    fn test_set_sample_rate_not_acknowledged() {
        let fake = FakeTransport::new();
        let mut device = connected(&fake);
        fake.respond_to(b'E', b"ERROR:RATE\r\n");

        assert!(!device.set_sample_rate(SampleRate::Hz100).unwrap());
        assert_eq!(device.sample_rate(), None);

        // Silence is a refusal too.
        assert!(!device.set_sample_rate(SampleRate::KHz1).unwrap());
    }

    #[test]
    fn test_capture_full_buffer_of_ones() {
        let fake = FakeTransport::new().with_chunk_size(100);
        let mut device = connected(&fake);
        fake.respond_to(b'C', &capture_reply(1_000_000, &[0xFF; 2048], true));

        let frame = device.capture(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.sample_count, 2048);
        assert_eq!(frame.sample_rate_hz, 1_000_000);
        assert_eq!(frame.sample_period_ns(), 1000);
        assert!(frame.samples.iter().all(|&b| b == 0xFF));
        assert!(!frame.is_short());
    }

    #[test]
    fn test_capture_round_trips_payload() {
        let fake = FakeTransport::new().with_chunk_size(7);
        let mut device = connected(&fake);
        let payload: Vec<u8> = (0..500u32).map(|i| (i * 37 % 256) as u8).collect();
        let mut reply = b"C\r\n".to_vec();
        reply.extend(capture_reply(250_000, &payload, false));
        fake.respond_to(b'C', &reply);

        let frame = device.capture(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.sample_count, 500);
        assert_eq!(frame.sample_rate_hz, 250_000);
        assert_eq!(frame.samples, payload);
        assert_eq!(frame.sample_period_ns(), 4000);
    }

    #[test]
    fn test_capture_busy_resets_device() {
        let fake = FakeTransport::new();
        let mut device = connected(&fake);
        fake.respond_to(b'C', b"ERROR:BUSY\r\n");
        fake.respond_to(b'R', b"READY\r\n");

        let result = device.capture(Duration::from_millis(200));
        assert!(matches!(result, Err(ProtocolError::Busy)));
        assert_eq!(fake.written(), b"ICR");
        assert_eq!(fake.pending_input(), 0);
        assert!(result.is_err_and(|e| e.is_retriable()));
    }

    #[test]
    fn test_capture_unterminated_busy_returns_early() {
        let fake = FakeTransport::new();
        let mut device = connected(&fake);
        fake.respond_to(b'C', b"ERROR:BUSY");
        fake.respond_to(b'R', b"READY\r\n");

        let started = Instant::now();
        let result = device.capture(Duration::from_secs(3));
        assert!(matches!(result, Err(ProtocolError::Busy)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(fake.written(), b"ICR");
    }

    #[test]
    fn test_capture_bare_error_returns_early() {
        let fake = FakeTransport::new();
        let mut device = connected(&fake);
        fake.respond_to(b'C', b"ERROR");

        let started = Instant::now();
        match device.capture(Duration::from_secs(3)) {
            Err(ProtocolError::Device(text)) => assert_eq!(text, "ERROR"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_capture_device_error() {
        let fake = FakeTransport::new();
        let mut device = connected(&fake);
        fake.respond_to(b'C', b"ERROR:TRIGGER\r\n");

        match device.capture(Duration::from_millis(200)) {
            Err(ProtocolError::Device(text)) => assert_eq!(text, "ERROR:TRIGGER"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fake.written(), b"IC");
    }

    #[test]
    fn test_capture_timeout_without_header() {
        let fake = FakeTransport::new();
        let mut device = connected(&fake);
        fake.respond_to(b'C', b"noise");

        let started = Instant::now();
        let result = device.capture(Duration::from_millis(50));
        assert!(matches!(
            result,
            Err(ProtocolError::Timeout {
                stage: FrameStage::Header
            })
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_capture_short_read_is_returned() {
        let fake = FakeTransport::new();
        let mut device = connected(&fake);
        let reply = capture_reply(1_000_000, &[0x0F; 100], true);
        fake.respond_to(b'C', &reply[..reply.len() - 30]);

        let frame = device.capture(Duration::from_millis(50)).unwrap();
        assert_eq!(frame.sample_count, 100);
        assert_eq!(frame.received(), 70);
        assert!(frame.is_short());
    }

    #[test]
    fn test_capture_transport_failure() {
        let fake = FakeTransport::new();
        let mut device = connected(&fake);
        fake.fail_writes(true);

        let result = device.capture(Duration::from_millis(50));
        assert!(matches!(result, Err(ProtocolError::Transport(_))));
        assert!(result.is_err_and(|e| !e.is_retriable()));
    }

    #[test]
    fn test_disconnect_closes_transport() {
        let fake = FakeTransport::new();
        let device = connected(&fake);
        device.disconnect();
        assert!(fake.is_closed());
    }
}
