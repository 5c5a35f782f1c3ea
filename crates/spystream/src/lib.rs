//! Streaming acquisition core for Airspy R2 and Mini Software Defined Radios.
//!
//! # Overview
//!
//! `spystream` pulls raw 12-bit samples off the Airspy bulk endpoint, hands
//! them from the USB thread to a conversion thread without ever blocking
//! ingestion, and turns them into I/Q or real sample blocks for an
//! application callback.
//!
//! ```text
//! USB --> TransferEngine (16 transfers) --> HandoffQueue (8 slots)
//!     --> ConversionWorker --> [unpack] --> IqConverter --> callback
//! ```
//!
//! # Sample Format
//!
//! Airspy hardware outputs REAL samples from a single ADC. The [`IqConverter`]
//! turns them into Complex I/Q with an Fs/4 translation and a half-band
//! filter (matching libairspy behavior), in `f32` or Q15 `i16`.
//!
//! # Example
//!
//! ```no_run
//! use std::ops::ControlFlow;
//! use spystream::{Airspy, AirspyConfig, StreamController};
//!
//! let device = Airspy::open_first()?;
//! let mut stream = StreamController::new(device.bulk_transport());
//! device.configure(&AirspyConfig::new(100_000_000, 6_000_000), &mut stream)?;
//!
//! device.start_rx(&mut stream, |block| {
//!     println!("{} samples, {} dropped", block.count(), block.dropped_samples());
//!     ControlFlow::Continue(())
//! })?;
//! std::thread::sleep(std::time::Duration::from_secs(2));
//! device.stop_rx(&mut stream)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod error;
pub mod history;
pub mod iqconverter;
pub mod kernels;
pub mod queue;
pub mod reader;
pub mod stream;
pub mod transfer;
pub mod transport;
pub mod unpack;
pub mod worker;

pub use error::{AirspyErrorCode, Error, Result};
pub use iqconverter::{IqConverter, IqConverterF32, IqConverterI16};
pub use queue::RawBuffer;
pub use reader::{AsyncBlockReader, BlockReader};
pub use stream::{StreamConfig, StreamController, StreamState, StreamStats};
pub use transfer::{BulkTransport, Completion, TransferStatus};
pub use transport::{
    Airspy, AirspyConfig, AirspyDeviceInfo, DeviceSelector, Gain, ReceiverMode, RusbBulkTransport,
};
pub use worker::{SampleBlock, SampleType, Samples};

// Airspy device identifiers (USB VID/PID)
pub const AIRSPY_VID: u16 = 0x1d50;
pub const AIRSPY_PID: u16 = 0x60a1;
