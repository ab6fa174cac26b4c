use crate::capture_frame::RawCaptureFrame;
use polars::prelude::*;
use std::io::Write;
use std::iter::FusedIterator;

pub const TIME_COLUMN_NAME: &str = "time";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CaptureStoreError {
    #[error(
        "Sample period mismatch: store runs at {store_ns} ns, frame at {frame_ns} ns. A rate change needs a new store"
    )]
    RateMismatch { store_ns: u64, frame_ns: u64 },

    #[error("Channel count must be between 1 and 8, got {0}")]
    InvalidChannelCount(usize),
}

/// Split packed samples into one 0/1 sequence per channel: channel `ch`
/// holds bit `ch` of every byte.
pub fn unpack_channels(samples: &[u8], num_channels: usize) -> Vec<Vec<u8>> {
    (0..num_channels)
        .map(|ch| samples.iter().map(|&byte| (byte >> ch) & 1).collect())
        .collect()
}

/// Append-only sequence with cheap removal from the front.
///
/// Dropped elements are only skipped over; the storage is compacted once
/// the dead prefix outgrows the live part, so trimming costs O(1) amortized.
#[derive(Debug, Clone)]
struct RollingVec<T> {
    data: Vec<T>,
    head: usize,
}

impl<T: Copy> RollingVec<T> {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            head: 0,
        }
    }

    fn as_slice(&self) -> &[T] {
        &self.data[self.head..]
    }

    fn len(&self) -> usize {
        self.data.len() - self.head
    }

    fn extend(&mut self, values: impl IntoIterator<Item = T>) {
        self.data.extend(values);
    }

    fn drop_front(&mut self, count: usize) {
        self.head += count.min(self.len());
        if self.head >= self.len() {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }
}

impl<T: Copy + PartialEq> PartialEq for RollingVec<T> {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

/// Unpacked per-channel bits and time axis of one acquisition.
///
/// Every channel sequence and the time axis always have the same length.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureStore {
    num_channels: usize,
    sample_period_ns: u64,
    channels: Vec<RollingVec<u8>>,
    time: RollingVec<f64>,
    /// Index of the next sample to be appended, counted from the first
    /// sample of the acquisition.
    next_index: u64,
}

impl CaptureStore {
    pub const NUM_CHANNELS: usize = 8;
    pub const DEFAULT_MAX_POINTS: usize = 50_000;

    /// Build an 8-channel store from one frame.
    pub fn from_frame(frame: &RawCaptureFrame) -> Self {
        let mut store = Self::empty(Self::NUM_CHANNELS, frame.sample_period_ns());
        store.push_samples(&frame.samples);
        store
    }

    /// Build a store that keeps only the lowest `num_channels` bits.
    pub fn with_channels(
        frame: &RawCaptureFrame,
        num_channels: usize,
    ) -> Result<Self, CaptureStoreError> {
        if !(1..=Self::NUM_CHANNELS).contains(&num_channels) {
            return Err(CaptureStoreError::InvalidChannelCount(num_channels));
        }
        let mut store = Self::empty(num_channels, frame.sample_period_ns());
        store.push_samples(&frame.samples);
        Ok(store)
    }

    fn empty(num_channels: usize, sample_period_ns: u64) -> Self {
        Self {
            num_channels,
            sample_period_ns,
            channels: (0..num_channels).map(|_| RollingVec::new()).collect(),
            time: RollingVec::new(),
            next_index: 0,
        }
    }

    /// Add a frame's samples after the existing ones. The frame must run at
    /// this store's sample period.
    pub fn append(&mut self, frame: &RawCaptureFrame) -> Result<(), CaptureStoreError> {
        let frame_ns = frame.sample_period_ns();
        if frame_ns != self.sample_period_ns {
            log::error!(
                "Refusing to append a {} ns frame to a {} ns capture",
                frame_ns,
                self.sample_period_ns
            );
            return Err(CaptureStoreError::RateMismatch {
                store_ns: self.sample_period_ns,
                frame_ns,
            });
        }

        self.push_samples(&frame.samples);
        Ok(())
    }

    fn push_samples(&mut self, samples: &[u8]) {
        if samples.is_empty() {
            return;
        }

        for (channel, bits) in self
            .channels
            .iter_mut()
            .zip(unpack_channels(samples, self.num_channels))
        {
            channel.extend(bits);
        }

        let period_ns = self.sample_period_ns;
        let first = self.next_index;
        self.time
            .extend((first..first + samples.len() as u64).map(|i| (i * period_ns) as f64 / 1e9));
        self.next_index += samples.len() as u64;

        self.debug_check_lengths();
    }

    /// Remove the `count` oldest samples.
    ///
    /// Never empties a store that holds data: a `count` reaching the sample
    /// count is clamped so the newest sample survives. Returns the number of
    /// samples actually removed.
    pub fn trim_start(&mut self, count: usize) -> usize {
        let available = self.sample_count();
        if count == 0 || available == 0 {
            return 0;
        }

        let count = count.min(available - 1);
        for channel in &mut self.channels {
            channel.drop_front(count);
        }
        self.time.drop_front(count);

        self.debug_check_lengths();
        count
    }

    /// Keep at most `seconds` worth of the newest samples. Returns the number
    /// of samples removed.
    pub fn keep_duration(&mut self, seconds: f64) -> usize {
        if self.is_empty() {
            return 0;
        }

        let max_samples = (seconds.max(0.0) * 1e9 / self.sample_period_ns as f64).floor() as usize;
        let count = self.sample_count();
        if count <= max_samples {
            return 0;
        }

        let trimmed = self.trim_start(count - max_samples);
        log::debug!(
            "Rolling buffer trimmed {} samples, {} retained",
            trimmed,
            self.sample_count()
        );
        trimmed
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn sample_period_ns(&self) -> u64 {
        self.sample_period_ns
    }

    pub fn sample_count(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count() == 0
    }

    pub fn sample_rate_mhz(&self) -> f64 {
        1000.0 / self.sample_period_ns as f64
    }

    /// Time spanned by the retained samples.
    pub fn duration_seconds(&self) -> f64 {
        self.sample_count() as f64 * self.sample_period_ns as f64 / 1e9
    }

    /// Sample timestamps in seconds since the start of the acquisition.
    pub fn time(&self) -> &[f64] {
        self.time.as_slice()
    }

    pub fn channel(&self, ch: usize) -> Option<&[u8]> {
        self.channels.get(ch).map(RollingVec::as_slice)
    }

    pub fn channels(&self) -> impl Iterator<Item = &[u8]> {
        self.channels.iter().map(RollingVec::as_slice)
    }

    /// Every `stride`-th sample, with `stride` chosen so that at most about
    /// `max_points` remain. The store itself is left untouched.
    pub fn decimate(&self, max_points: usize) -> Decimated {
        let stride = (self.sample_count() / max_points.max(1)).max(1);

        Decimated {
            stride,
            time: self.time().iter().copied().step_by(stride).collect(),
            channels: self
                .channels()
                .map(|channel| channel.iter().copied().step_by(stride).collect())
                .collect(),
        }
    }

    /// Columns `time`, `ch0`..`chN`.
    pub fn to_dataframe(&self) -> Result<DataFrame, PolarsError> {
        let mut columns: Vec<Column> = Vec::with_capacity(self.num_channels + 1);
        columns.push(Series::new(TIME_COLUMN_NAME.into(), self.time()).into());

        for (ch, bits) in self.channels().enumerate() {
            let values: Vec<bool> = bits.iter().map(|&bit| bit == 1).collect();
            columns.push(Series::new(format!("ch{}", ch).into(), values).into());
        }

        DataFrame::new(columns)
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), PolarsError> {
        let mut df = self.to_dataframe()?;
        CsvWriter::new(writer).include_header(true).finish(&mut df)
    }

    fn debug_check_lengths(&self) {
        debug_assert!(
            self.channels
                .iter()
                .all(|channel| channel.len() == self.time.len()),
            "channel and time lengths diverged"
        );
    }
}

/// Render-only thinned copy of a [`CaptureStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct Decimated {
    pub stride: usize,
    pub time: Vec<f64>,
    pub channels: Vec<Vec<u8>>,
}

impl Decimated {
    /// Step waveform of one channel, ready to draw.
    pub fn step_channel(&self, ch: usize) -> Option<StepExpand<'_>> {
        self.channels
            .get(ch)
            .map(|bits| step_expand(&self.time, bits))
    }
}

/// Turn sampled levels into a staircase.
///
/// For two or more samples every pair of neighbours `(i, i + 1)` yields
/// `(t[i], b[i])` and `(t[i + 1], b[i])`, so a level holds until the next
/// sample and then jumps vertically: times `t0, t1, t1, t2, t2, ...` against
/// bits `b0, b0, b1, b1, ...`, `2n - 2` points in total. Shorter input is
/// passed through unchanged. Clone the iterator to walk it again.
pub fn step_expand<'a>(times: &'a [f64], bits: &'a [u8]) -> StepExpand<'a> {
    let len = times.len().min(bits.len());
    StepExpand {
        times: &times[..len],
        bits: &bits[..len],
        pos: 0,
    }
}

#[derive(Debug, Clone)]
pub struct StepExpand<'a> {
    times: &'a [f64],
    bits: &'a [u8],
    pos: usize,
}

impl StepExpand<'_> {
    fn total(&self) -> usize {
        match self.times.len() {
            n if n < 2 => n,
            n => 2 * n - 2,
        }
    }
}

impl Iterator for StepExpand<'_> {
    type Item = (f64, u8);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.total() {
            return None;
        }
        let k = self.pos;
        self.pos += 1;

        if self.times.len() < 2 {
            return Some((self.times[k], self.bits[k]));
        }

        let segment = k / 2;
        let t = if k % 2 == 0 {
            self.times[segment]
        } else {
            self.times[segment + 1]
        };
        Some((t, self.bits[segment]))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total() - self.pos;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for StepExpand<'_> {}
impl FusedIterator for StepExpand<'_> {}
