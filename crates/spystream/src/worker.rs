//! Conversion worker: raw USB buffers in, sample blocks out.

use std::fmt;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use num_complex::Complex;

use crate::error::{Error, Result};
use crate::iqconverter::{IqConverterF32, IqConverterI16};
use crate::queue::HandoffQueue;
use crate::stream::{StopReason, StreamConfig, StreamFlags};
use crate::unpack::{decode_u16_samples, unpack_bytes};

/// Scale applied to centered 12-bit samples in the float domain.
const FLOAT_SCALE: f32 = 1.0 / 2048.0;

/// Midpoint of the unsigned 12-bit ADC range.
const SAMPLE_CENTER: i32 = 2048;

/// Output format delivered to the application callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleType {
    /// Interleaved `f32` I/Q pairs.
    #[default]
    Float32Iq,
    /// Decimated real `f32` samples.
    Float32Real,
    /// Interleaved Q15 `i16` I/Q pairs.
    Int16Iq,
    /// Decimated real Q15 `i16` samples.
    Int16Real,
    /// Raw 12-bit ADC values, no processing.
    Uint16Real,
}

impl SampleType {
    /// Size of one output sample (one I/Q pair for the I/Q types).
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleType::Float32Iq => 8,
            SampleType::Float32Real => 4,
            SampleType::Int16Iq => 4,
            SampleType::Int16Real | SampleType::Uint16Real => 2,
        }
    }

    pub fn is_iq(self) -> bool {
        matches!(self, SampleType::Float32Iq | SampleType::Int16Iq)
    }

    pub fn name(self) -> &'static str {
        match self {
            SampleType::Float32Iq => "float32-iq",
            SampleType::Float32Real => "float32-real",
            SampleType::Int16Iq => "int16-iq",
            SampleType::Int16Real => "int16-real",
            SampleType::Uint16Real => "uint16-real",
        }
    }
}

impl fmt::Display for SampleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SampleType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "float32-iq" | "float32iq" | "0" => Ok(SampleType::Float32Iq),
            "float32-real" | "float32real" | "1" => Ok(SampleType::Float32Real),
            "int16-iq" | "int16iq" | "2" => Ok(SampleType::Int16Iq),
            "int16-real" | "int16real" | "3" => Ok(SampleType::Int16Real),
            "uint16-real" | "uint16real" | "raw" | "4" => Ok(SampleType::Uint16Real),
            other => Err(Error::invalid_param(format!("unsupported sample type '{}'", other))),
        }
    }
}

/// Borrowed sample data of one block.
#[derive(Debug, Clone, Copy)]
pub enum Samples<'a> {
    Float32(&'a [f32]),
    Int16(&'a [i16]),
    Uint16(&'a [u16]),
}

/// One block handed to the application callback.
///
/// Borrows the worker's output buffer and is only valid during the call.
#[derive(Debug, Clone, Copy)]
pub struct SampleBlock<'a> {
    samples: Samples<'a>,
    count: usize,
    sample_type: SampleType,
    dropped_samples: u64,
}

impl<'a> SampleBlock<'a> {
    pub fn new(samples: Samples<'a>, sample_type: SampleType, dropped_samples: u64) -> Self {
        let scalars = match samples {
            Samples::Float32(s) => s.len(),
            Samples::Int16(s) => s.len(),
            Samples::Uint16(s) => s.len(),
        };
        let count = if sample_type.is_iq() { scalars / 2 } else { scalars };
        Self {
            samples,
            count,
            sample_type,
            dropped_samples,
        }
    }

    /// Interleaved scalar data.
    pub fn samples(&self) -> Samples<'a> {
        self.samples
    }

    /// Number of samples (I/Q pairs for the I/Q types).
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn sample_type(&self) -> SampleType {
        self.sample_type
    }

    /// Samples lost to queue overflow since the previous block.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples
    }

    /// Copy the block out as complex floats.
    ///
    /// I/Q types yield one value per pair, real types one value per sample
    /// with a zero imaginary part. Integer samples are scaled to [-1, 1).
    pub fn to_complex(&self) -> Vec<Complex<f32>> {
        let iq = self.sample_type.is_iq();
        match self.samples {
            Samples::Float32(s) if iq => s.chunks_exact(2).map(|p| Complex::new(p[0], p[1])).collect(),
            Samples::Float32(s) => s.iter().map(|&x| Complex::new(x, 0.0)).collect(),
            Samples::Int16(s) if iq => s
                .chunks_exact(2)
                .map(|p| Complex::new(p[0] as f32 / 32768.0, p[1] as f32 / 32768.0))
                .collect(),
            Samples::Int16(s) => s.iter().map(|&x| Complex::new(x as f32 / 32768.0, 0.0)).collect(),
            Samples::Uint16(s) => s
                .iter()
                .map(|&x| Complex::new(to_float(x), 0.0))
                .collect(),
        }
    }
}

/// Per-stream conversion state. Owned by the worker thread.
pub(crate) struct ConversionWorker {
    sample_type: SampleType,
    packing: bool,
    unpacked: Vec<u16>,
    float_buf: Vec<f32>,
    int_buf: Vec<i16>,
    float_converter: IqConverterF32,
    int_converter: IqConverterI16,
    dropped_seen: u64,
}

impl ConversionWorker {
    pub(crate) fn new(config: &StreamConfig) -> Result<Self> {
        let samples = config.samples_per_buffer();
        let (float_len, int_len) = match config.sample_type {
            SampleType::Float32Iq | SampleType::Float32Real => (samples, 0),
            SampleType::Int16Iq | SampleType::Int16Real => (0, samples),
            SampleType::Uint16Real => (0, 0),
        };
        Ok(Self {
            sample_type: config.sample_type,
            packing: config.packing,
            unpacked: alloc(samples, "unpacking buffer")?,
            float_buf: alloc(float_len, "float conversion buffer")?,
            int_buf: alloc(int_len, "int16 conversion buffer")?,
            float_converter: IqConverterF32::with_kernel(&config.kernel_float32)?,
            int_converter: IqConverterI16::with_kernel(&config.kernel_int16)?,
            dropped_seen: 0,
        })
    }

    /// Spawn the worker thread.
    pub(crate) fn spawn<F>(
        self,
        queue: Arc<HandoffQueue>,
        flags: Arc<StreamFlags>,
        callback: F,
    ) -> Result<JoinHandle<()>>
    where
        F: FnMut(&SampleBlock<'_>) -> ControlFlow<()> + Send + 'static,
    {
        thread::Builder::new()
            .name("spystream-worker".to_string())
            .spawn(move || self.run(&queue, &flags, callback))
            .map_err(Error::Thread)
    }

    fn run<F>(mut self, queue: &HandoffQueue, flags: &StreamFlags, mut callback: F)
    where
        F: FnMut(&SampleBlock<'_>) -> ControlFlow<()>,
    {
        tracing::debug!(
            sample_type = %self.sample_type,
            packing = self.packing,
            "conversion worker started"
        );

        while flags.is_active() {
            let Some(buffer) = queue.take(|| flags.is_active()) else {
                break;
            };
            let dropped_total = queue.dropped_samples();
            let converted = panic::catch_unwind(AssertUnwindSafe(|| {
                self.convert(buffer.as_slice(), dropped_total, &mut callback)
            }));
            queue.release(buffer);
            let Ok(flow) = converted else {
                tracing::warn!("sample callback panicked, ending stream");
                flags.fail(StopReason::Callback);
                queue.wake();
                break;
            };
            flags.record_block();

            if flow.is_break() {
                tracing::debug!("callback requested stop");
                flags.request_stop();
                break;
            }
        }

        tracing::debug!("conversion worker exiting");
    }

    /// Convert one raw buffer and hand the result to `callback`.
    pub(crate) fn convert<F>(
        &mut self,
        raw: &[u8],
        dropped_total: u64,
        callback: &mut F,
    ) -> ControlFlow<()>
    where
        F: FnMut(&SampleBlock<'_>) -> ControlFlow<()>,
    {
        let n = if self.packing {
            unpack_bytes(raw, &mut self.unpacked)
        } else {
            decode_u16_samples(raw, &mut self.unpacked)
        };
        let dropped = dropped_total.saturating_sub(self.dropped_seen);
        self.dropped_seen = dropped_total;
        let input = &self.unpacked[..n];

        match self.sample_type {
            SampleType::Float32Iq | SampleType::Float32Real => {
                let out = &mut self.float_buf[..n];
                for (o, &s) in out.iter_mut().zip(input) {
                    *o = to_float(s);
                }
                let len = if self.sample_type.is_iq() {
                    self.float_converter.process(out) * 2
                } else {
                    self.float_converter.process_real(out)
                };
                callback(&SampleBlock::new(Samples::Float32(&out[..len]), self.sample_type, dropped))
            }
            SampleType::Int16Iq | SampleType::Int16Real => {
                let out = &mut self.int_buf[..n];
                for (o, &s) in out.iter_mut().zip(input) {
                    *o = to_int16(s);
                }
                let len = if self.sample_type.is_iq() {
                    self.int_converter.process(out) * 2
                } else {
                    self.int_converter.process_real(out)
                };
                callback(&SampleBlock::new(Samples::Int16(&out[..len]), self.sample_type, dropped))
            }
            SampleType::Uint16Real => {
                callback(&SampleBlock::new(Samples::Uint16(input), self.sample_type, dropped))
            }
        }
    }
}

/// Center a 12-bit ADC value and scale it to [-1, 1).
#[inline]
fn to_float(sample: u16) -> f32 {
    ((sample & 0xfff) as i32 - SAMPLE_CENTER) as f32 * FLOAT_SCALE
}

/// Center a 12-bit ADC value and shift it to 16-bit full scale.
#[inline]
fn to_int16(sample: u16) -> i16 {
    (((sample & 0xfff) as i32 - SAMPLE_CENTER) << 4) as i16
}

fn alloc<T: Default + Clone>(len: usize, what: &'static str) -> Result<Vec<T>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).map_err(|_| Error::NoMemory(what))?;
    buf.resize(len, T::default());
    Ok(buf)
}
