use crate::la8_device::ProtocolError;
use std::fmt;

pub const DATA_MARKER: &[u8] = b"DATA:";
pub const ERROR_MARKER: &[u8] = b"ERROR";
pub const BUSY_MARKER: &[u8] = b"ERROR:BUSY";

/// Used when the device reports a sample rate of zero.
pub const DEFAULT_SAMPLE_PERIOD_NS: u64 = 1000;

const HEADER_FIELD_LEN: usize = 4;

/// One decoded capture reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCaptureFrame {
    /// Sample count announced in the header.
    pub sample_count: u32,
    pub sample_rate_hz: u32,
    /// One byte per instant, bit `n` is channel `n`. Shorter than
    /// `sample_count` when the payload was cut off.
    pub samples: Vec<u8>,
}

impl RawCaptureFrame {
    pub fn new(sample_rate_hz: u32, samples: Vec<u8>) -> Self {
        Self {
            sample_count: samples.len() as u32,
            sample_rate_hz,
            samples,
        }
    }

    pub fn sample_period_ns(&self) -> u64 {
        sample_period_ns(self.sample_rate_hz)
    }

    pub fn received(&self) -> usize {
        self.samples.len()
    }

    pub fn is_short(&self) -> bool {
        self.samples.len() < self.sample_count as usize
    }

    /// Reject a truncated payload.
    pub fn require_complete(self) -> Result<Self, ProtocolError> {
        if self.is_short() {
            return Err(ProtocolError::ShortRead {
                expected: self.sample_count as usize,
                received: self.samples.len(),
            });
        }
        Ok(self)
    }
}

/// `round(1e9 / rate)`, or [`DEFAULT_SAMPLE_PERIOD_NS`] for a zero rate.
pub fn sample_period_ns(sample_rate_hz: u32) -> u64 {
    if sample_rate_hz == 0 {
        return DEFAULT_SAMPLE_PERIOD_NS;
    }
    let rate = u64::from(sample_rate_hz);
    (1_000_000_000 + rate / 2) / rate
}

/// The part of a capture reply the decoder is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStage {
    Header,
    SampleCount,
    SampleRate,
    Separator,
    Payload,
}

impl fmt::Display for FrameStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Header => "DATA header",
            Self::SampleCount => "sample count",
            Self::SampleRate => "sample rate",
            Self::Separator => "header separator",
            Self::Payload => "sample payload",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Incomplete(FrameStage),
    /// A full frame; `consumed` bytes of the buffer belong to it.
    Complete {
        frame: RawCaptureFrame,
        consumed: usize,
    },
    Busy(String),
    DeviceError(String),
}

/// Decode a capture reply from everything received so far.
///
/// The buffer is always scanned from the start, so it is safe to call again
/// after more bytes were appended. Bytes before `DATA:` are noise. An `ERROR`
/// line before `DATA:` ends the exchange once the line is complete, or as soon
/// as the full `ERROR:BUSY` marker has arrived.
pub fn decode_frame(buf: &[u8]) -> Decoded {
    decode(buf, false)
}

/// Like [`decode_frame`], but any `ERROR` seen before `DATA:` is classified
/// right away, terminated or not. Used for the early look at the reply.
pub fn peek_frame(buf: &[u8]) -> Decoded {
    decode(buf, true)
}

fn decode(buf: &[u8], final_errors: bool) -> Decoded {
    let data_pos = find(buf, DATA_MARKER);

    if let Some(error_pos) = find(buf, ERROR_MARKER) {
        if data_pos.map_or(true, |data| error_pos < data) {
            return classify_error(&buf[error_pos..], final_errors);
        }
    }

    let Some(data_pos) = data_pos else {
        return Decoded::Incomplete(FrameStage::Header);
    };

    let body_start = data_pos + DATA_MARKER.len();
    match parse_body(&buf[body_start..]) {
        Body::Incomplete(stage) => Decoded::Incomplete(stage),
        Body::Frame {
            sample_count,
            sample_rate_hz,
            payload_offset,
            available,
        } => {
            let count = sample_count as usize;
            if available < count {
                return Decoded::Incomplete(FrameStage::Payload);
            }
            let payload_start = body_start + payload_offset;
            Decoded::Complete {
                frame: RawCaptureFrame {
                    sample_count,
                    sample_rate_hz,
                    samples: buf[payload_start..payload_start + count].to_vec(),
                },
                consumed: payload_start + count,
            }
        }
    }
}

/// Best result obtainable from `buf` once no more bytes will arrive.
///
/// A frame whose header is complete comes back with however much payload
/// made it; an unterminated error line is classified as-is.
pub fn finish_frame(buf: &[u8]) -> Decoded {
    let data_pos = find(buf, DATA_MARKER);

    if let Some(error_pos) = find(buf, ERROR_MARKER) {
        if data_pos.map_or(true, |data| error_pos < data) {
            return classify_error(&buf[error_pos..], true);
        }
    }

    let Some(data_pos) = data_pos else {
        return Decoded::Incomplete(FrameStage::Header);
    };

    let body_start = data_pos + DATA_MARKER.len();
    match parse_body(&buf[body_start..]) {
        Body::Incomplete(FrameStage::Separator) => {
            // Header is complete but nothing follows it.
            let body = &buf[body_start..];
            Decoded::Complete {
                frame: RawCaptureFrame {
                    sample_count: read_u32_le(&body[..HEADER_FIELD_LEN]),
                    sample_rate_hz: read_u32_le(&body[HEADER_FIELD_LEN..2 * HEADER_FIELD_LEN]),
                    samples: Vec::new(),
                },
                consumed: buf.len(),
            }
        }
        Body::Incomplete(stage) => Decoded::Incomplete(stage),
        Body::Frame {
            sample_count,
            sample_rate_hz,
            payload_offset,
            available,
        } => {
            let payload_start = body_start + payload_offset;
            let take = available.min(sample_count as usize);
            Decoded::Complete {
                frame: RawCaptureFrame {
                    sample_count,
                    sample_rate_hz,
                    samples: buf[payload_start..payload_start + take].to_vec(),
                },
                consumed: payload_start + take,
            }
        }
    }
}

enum Body {
    Incomplete(FrameStage),
    Frame {
        sample_count: u32,
        sample_rate_hz: u32,
        payload_offset: usize,
        available: usize,
    },
}

fn parse_body(body: &[u8]) -> Body {
    if body.len() < HEADER_FIELD_LEN {
        return Body::Incomplete(FrameStage::SampleCount);
    }
    let sample_count = read_u32_le(&body[..HEADER_FIELD_LEN]);

    if body.len() < 2 * HEADER_FIELD_LEN {
        return Body::Incomplete(FrameStage::SampleRate);
    }
    let sample_rate_hz = read_u32_le(&body[HEADER_FIELD_LEN..2 * HEADER_FIELD_LEN]);

    let mut payload_offset = 2 * HEADER_FIELD_LEN;
    match body.get(payload_offset) {
        // An empty capture needs no separator.
        None if sample_count == 0 => {}
        None => return Body::Incomplete(FrameStage::Separator),
        // The firmware does not always send the newline.
        Some(&b'\n') => payload_offset += 1,
        Some(_) => {}
    }

    Body::Frame {
        sample_count,
        sample_rate_hz,
        payload_offset,
        available: body.len() - payload_offset,
    }
}

fn classify_error(tail: &[u8], final_attempt: bool) -> Decoded {
    let line = match tail.iter().position(|&b| b == b'\n') {
        Some(end) => &tail[..end],
        None if tail.starts_with(BUSY_MARKER) => tail,
        None if !final_attempt && BUSY_MARKER.starts_with(tail) => {
            // Could still turn into ERROR:BUSY.
            return Decoded::Incomplete(FrameStage::Header);
        }
        None => tail,
    };

    let text = String::from_utf8_lossy(line).trim().to_string();
    if find(line, BUSY_MARKER).is_some() {
        Decoded::Busy(text)
    } else {
        Decoded::DeviceError(text)
    }
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    u32::from(bytes[0])
        | u32::from(bytes[1]) << 8
        | u32::from(bytes[2]) << 16
        | u32::from(bytes[3]) << 24
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
