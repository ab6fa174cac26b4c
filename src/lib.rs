//! # LA8 RS
//!
//! A Rust library for driving the STM32-UART-LA8, an 8-channel logic analyzer
//! attached over a serial link, and for turning its captures into per-channel
//! bit streams ready for display.
//!
//! ## Features
//!
//! - **Protocol client**: info query, reset, sample-rate selection and binary
//!   capture decoding with busy/error/timeout handling
//! - **Transport abstraction**: the client talks to a [`Transport`], so any
//!   byte stream can stand in for the serial port
//! - **Capture store**: unpacked channels, a time axis, appends and a rolling
//!   retention window with O(1) amortized trimming
//! - **Rendering helpers**: decimation and step expansion for long captures
//! - **Live mode**: periodic single-flight captures with pause/resume, either
//!   driven by the caller or on a worker thread
//! - **DataFrame output**: uses `polars` for export
//!
//! ## Examples
//!
//! ### Single capture
//!
//! ```rust,no_run
//! use la8_rs::{CaptureStore, ConnectionConfig, La8Connector, SampleRate};
//! use std::time::Duration;
//!
//! let mut device = La8Connector::connect("/dev/ttyUSB0", &ConnectionConfig::default())?;
//! println!("Connected to {} v{}", device.info().device_name, device.info().version);
//!
//! device.set_sample_rate(SampleRate::MHz1)?;
//! let frame = device.capture(Duration::from_secs(5))?;
//! let store = CaptureStore::from_frame(&frame);
//!
//! println!(
//!     "Captured {} samples @ {:.2} MHz",
//!     store.sample_count(),
//!     store.sample_rate_mhz()
//! );
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Live capture on a worker thread
//!
//! ```rust,no_run
//! use la8_rs::{ConnectionConfig, La8Connector, LiveConfig, LiveEvent, LiveWorker};
//! use std::time::Duration;
//!
//! let device = La8Connector::connect("/dev/ttyUSB0", &ConnectionConfig::default())?;
//! let live = LiveWorker::spawn(device, LiveConfig::default().with_interval(Duration::from_millis(250)))?;
//!
//! for event in live.events().iter().take(20) {
//!     match event {
//!         LiveEvent::Captured { total_samples, .. } => println!("{} samples buffered", total_samples),
//!         LiveEvent::Stopped(error) => {
//!             println!("stopped: {:?}", error);
//!             break;
//!         }
//!         _ => {}
//!     }
//! }
//!
//! let (device, store) = live.join()?;
//! device.disconnect();
//! if let Some(store) = store {
//!     let view = store.decimate(la8_rs::CaptureStore::DEFAULT_MAX_POINTS);
//!     let steps = view.step_channel(0).map_or(0, |steps| steps.len());
//!     println!("channel 0 renders as {} points", steps);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Step expansion
//!
//! ```rust
//! use la8_rs::step_expand;
//!
//! let times = [0.0, 1.0, 2.0];
//! let bits = [0, 1, 0];
//! let steps: Vec<(f64, u8)> = step_expand(&times, &bits).collect();
//! assert_eq!(steps, vec![(0.0, 0), (1.0, 0), (1.0, 1), (2.0, 1)]);
//! ```

pub mod capture_frame;
pub mod capture_store;
pub mod la8_connector;
pub mod la8_device;
pub mod live_acquisition;
pub mod sample_rate;
pub mod serial_terminal;

#[cfg(test)]
mod fake_transport;

// Re-export the main types for convenience
pub use capture_frame::{sample_period_ns, FrameStage, RawCaptureFrame};

pub use capture_store::{step_expand, unpack_channels, CaptureStore, CaptureStoreError, Decimated, StepExpand};

pub use la8_connector::{ConnectionConfig, ConnectorError, La8Connector};

pub use la8_device::{DeviceInfo, La8Device, ProtocolError, ProtocolTimings};

pub use live_acquisition::{
    LiveAcquisition, LiveCommand, LiveConfig, LiveError, LiveEvent, LiveHandle, LiveState,
    LiveStats, LiveWorker, TickOutcome,
};

pub use sample_rate::SampleRate;

pub use serial_terminal::{La8Terminal, SerialTransport, TerminalError, Transport};
