//! I/Q Converter for Airspy REAL samples.
//!
//! Airspy hardware outputs REAL samples from a single ADC. This module converts
//! those real samples to Complex I/Q format using Fs/4 frequency translation,
//! or decimates them by two as a real stream.
//!
//! ## Processing Steps
//!
//! 1. **DC Removal**: single-pole high-pass, `avg += 0.01 * (x - avg); x -= avg`
//! 2. **Fs/4 Translation**: multiply by the rotation sequence `[-1, -hbc, +1, +hbc]`
//! 3. **Half-band FIR Filter**: folded symmetric FIR on even samples (I channel)
//! 4. **Delay Line**: matches the FIR group delay on odd samples (Q channel)
//!
//! After processing, the interleaved output contains I/Q pairs where:
//! - Even indices (0, 2, 4, ...) are I samples
//! - Odd indices (1, 3, 5, ...) are Q samples
//!
//! The same control flow runs in two numeric domains, `f32` and Q15 `i16`,
//! selected through the [`ConverterSample`] trait.

use num_complex::Complex;

use crate::error::{Error, Result};
use crate::history::HistoryRing;
use crate::kernels::{HB_KERNEL_FLOAT, HB_KERNEL_INT16};

/// DC removal high-pass filter coefficient.
const DC_SCALE: f32 = 0.01;

/// DC removal coefficient in Q15 (0.01 * 32768, rounded).
const DC_SCALE_Q15: i64 = 328;

/// Size factor for the FIR history (allows efficient wrap-around).
const SIZE_FACTOR: usize = 32;

/// Numeric domain of a converter.
///
/// Implementations supply the arithmetic; the filter structure lives in
/// [`IqConverter`] and is shared by every domain.
pub trait ConverterSample: Copy + Default + PartialEq + std::fmt::Debug + Send + 'static {
    /// FIR accumulator.
    type Acc: Copy;
    /// DC tracker state.
    type Dc: Copy + Default + std::fmt::Debug + Send;

    /// Empty accumulator.
    const ACC_ZERO: Self::Acc;

    /// One DC removal step: update the running average, return the corrected sample.
    fn remove_dc(avg: &mut Self::Dc, sample: Self) -> Self;

    /// Running average expressed in sample units.
    fn dc_value(avg: Self::Dc) -> f32;

    fn negate(self) -> Self;

    /// Multiply by a filter tap.
    fn scale(self, tap: Self) -> Self;

    /// `acc + tap * (a + b)`
    fn fold(acc: Self::Acc, tap: Self, a: Self, b: Self) -> Self::Acc;

    fn from_acc(acc: Self::Acc) -> Self;

    fn add(self, other: Self) -> Self;

    /// Tap equality used when checking kernel symmetry.
    fn tap_eq(self, other: Self) -> bool;
}

impl ConverterSample for f32 {
    type Acc = f32;
    type Dc = f32;

    const ACC_ZERO: f32 = 0.0;

    #[inline]
    fn remove_dc(avg: &mut f32, sample: f32) -> f32 {
        *avg += DC_SCALE * (sample - *avg);
        sample - *avg
    }

    fn dc_value(avg: f32) -> f32 {
        avg
    }

    #[inline]
    fn negate(self) -> f32 {
        -self
    }

    #[inline]
    fn scale(self, tap: f32) -> f32 {
        self * tap
    }

    #[inline]
    fn fold(acc: f32, tap: f32, a: f32, b: f32) -> f32 {
        acc + tap * (a + b)
    }

    #[inline]
    fn from_acc(acc: f32) -> f32 {
        acc
    }

    #[inline]
    fn add(self, other: f32) -> f32 {
        self + other
    }

    fn tap_eq(self, other: f32) -> bool {
        (self - other).abs() <= 1e-6 * self.abs().max(other.abs()).max(1.0)
    }
}

impl ConverterSample for i16 {
    type Acc = i64;
    /// Average scaled by 2^15.
    type Dc = i64;

    const ACC_ZERO: i64 = 0;

    #[inline]
    fn remove_dc(avg: &mut i64, sample: i16) -> i16 {
        let delta = ((sample as i64) << 15) - *avg;
        *avg += (DC_SCALE_Q15 * delta) >> 15;
        saturate(sample as i64 - (*avg >> 15))
    }

    fn dc_value(avg: i64) -> f32 {
        avg as f32 / 32768.0
    }

    #[inline]
    fn negate(self) -> i16 {
        self.saturating_neg()
    }

    #[inline]
    fn scale(self, tap: i16) -> i16 {
        saturate((self as i64 * tap as i64) >> 15)
    }

    #[inline]
    fn fold(acc: i64, tap: i16, a: i16, b: i16) -> i64 {
        acc + tap as i64 * (a as i64 + b as i64)
    }

    #[inline]
    fn from_acc(acc: i64) -> i16 {
        saturate(acc >> 15)
    }

    #[inline]
    fn add(self, other: i16) -> i16 {
        self.saturating_add(other)
    }

    fn tap_eq(self, other: i16) -> bool {
        self == other
    }
}

#[inline]
fn saturate(value: i64) -> i16 {
    value.clamp(i16::MIN as i64, i16::MAX as i64) as i16
}

/// I/Q Converter state.
///
/// Maintains internal buffers for FIR filtering and delay line processing.
/// One instance belongs to one stream and is never shared between threads.
#[derive(Debug, Clone)]
pub struct IqConverter<S: ConverterSample> {
    /// Running DC average for removal
    avg: S::Dc,

    /// Center tap value from half-band kernel (0.5)
    hbc: S,

    /// Half the kernel length + 1 (number of non-zero taps on one side)
    len: usize,

    /// Current index into delay line (circular buffer)
    delay_index: usize,

    /// Reduced FIR kernel (only non-zero taps from even indices)
    fir_kernel: Vec<S>,

    /// FIR input history
    history: HistoryRing<S>,

    /// Delay line for Q channel alignment
    delay_line: Vec<S>,
}

/// Floating-point converter.
pub type IqConverterF32 = IqConverter<f32>;

/// Q15 fixed-point converter.
pub type IqConverterI16 = IqConverter<i16>;

impl IqConverter<f32> {
    /// Create a new I/Q converter with the standard 47-tap half-band filter.
    pub fn new() -> Self {
        Self::from_valid_kernel(&HB_KERNEL_FLOAT)
    }

    /// Process REAL samples and output Complex<f32> I/Q pairs.
    ///
    /// This is a convenience method that processes the samples and returns
    /// a vector of Complex samples. The output length is half the input length.
    pub fn process_to_complex(&mut self, real_samples: &mut [f32]) -> Vec<Complex<f32>> {
        let pairs = self.process(real_samples);

        real_samples[..pairs * 2]
            .chunks_exact(2)
            .map(|iq| Complex::new(iq[0], iq[1]))
            .collect()
    }
}

impl Default for IqConverter<f32> {
    fn default() -> Self {
        Self::new()
    }
}

impl IqConverter<i16> {
    /// Create a new fixed-point converter with the standard 47-tap Q15 kernel.
    pub fn new() -> Self {
        Self::from_valid_kernel(&HB_KERNEL_INT16)
    }
}

impl Default for IqConverter<i16> {
    fn default() -> Self {
        Self::new()
    }
}

/// Check that `kernel` has the shape the converter relies on.
///
/// The kernel must be symmetric, with `len % 4 == 3` so that the center tap
/// sits at an odd index and every even index holds a regular tap.
pub fn validate_kernel<S: ConverterSample>(kernel: &[S]) -> Result<()> {
    let n = kernel.len();
    if n < 3 || n % 4 != 3 {
        return Err(Error::invalid_param(format!(
            "half-band kernel length must be 4k + 3, got {}",
            n
        )));
    }
    for k in 0..n / 2 {
        if !kernel[k].tap_eq(kernel[n - 1 - k]) {
            return Err(Error::invalid_param(format!(
                "half-band kernel is not symmetric at tap {}",
                k
            )));
        }
    }
    Ok(())
}

impl<S: ConverterSample> IqConverter<S> {
    /// Create an I/Q converter with a custom half-band kernel.
    ///
    /// Returns `Error::InvalidParam` if the kernel fails [`validate_kernel`].
    pub fn with_kernel(hb_kernel: &[S]) -> Result<Self> {
        validate_kernel(hb_kernel)?;
        Ok(Self::from_valid_kernel(hb_kernel))
    }

    fn from_valid_kernel(hb_kernel: &[S]) -> Self {
        let full_len = hb_kernel.len();
        let len = full_len / 2 + 1;
        let hbc = hb_kernel[full_len / 2];

        // Extract non-zero taps from even indices
        let fir_kernel: Vec<S> = (0..len).map(|i| hb_kernel[i * 2]).collect();

        Self {
            avg: S::Dc::default(),
            hbc,
            len,
            delay_index: 0,
            fir_kernel,
            history: HistoryRing::new(len, SIZE_FACTOR),
            delay_line: vec![S::default(); len / 2],
        }
    }

    /// Reset the converter state (clear all internal buffers).
    pub fn reset(&mut self) {
        self.avg = S::Dc::default();
        self.delay_index = 0;
        self.delay_line.fill(S::default());
        self.history.reset();
    }

    /// Number of folded taps.
    pub fn taps(&self) -> usize {
        self.len
    }

    /// Center tap of the half-band kernel.
    pub fn center_tap(&self) -> S {
        self.hbc
    }

    /// Current DC estimate in sample units.
    pub fn dc_offset(&self) -> f32 {
        S::dc_value(self.avg)
    }

    /// Process a buffer of REAL samples and convert to interleaved I/Q.
    ///
    /// The input buffer is modified in-place:
    /// - Even indices become I samples
    /// - Odd indices become Q samples
    ///
    /// Only the largest prefix whose length is a multiple of 4 is processed.
    /// Returns the number of I/Q pairs written (half that prefix).
    pub fn process(&mut self, samples: &mut [S]) -> usize {
        let n = samples.len() & !3;
        let samples = &mut samples[..n];
        self.remove_dc(samples);
        self.translate_fs_4(samples);
        n / 2
    }

    /// Decimate a buffer of REAL samples by two.
    ///
    /// Runs the same half-band filter without the Fs/4 translation, so the
    /// output is the low half of the spectrum at half the rate. The result is
    /// written to the front of `samples`; returns the number of outputs.
    pub fn process_real(&mut self, samples: &mut [S]) -> usize {
        let n = samples.len() & !1;
        let samples = &mut samples[..n];
        self.remove_dc(samples);
        self.fir_interleaved(samples);
        self.delay_interleaved(samples);

        let hbc = self.hbc;
        for m in 0..n / 2 {
            samples[m] = samples[2 * m].add(samples[2 * m + 1].scale(hbc));
        }
        n / 2
    }

    /// Remove DC offset using a simple high-pass filter.
    fn remove_dc(&mut self, samples: &mut [S]) {
        for sample in samples.iter_mut() {
            *sample = S::remove_dc(&mut self.avg, *sample);
        }
    }

    /// Perform Fs/4 frequency translation.
    fn translate_fs_4(&mut self, samples: &mut [S]) {
        let hbc = self.hbc;

        // Pattern: [-1, -hbc, +1, +hbc]
        for chunk in samples.chunks_exact_mut(4) {
            chunk[0] = chunk[0].negate();
            chunk[1] = chunk[1].scale(hbc).negate();
            chunk[3] = chunk[3].scale(hbc);
        }

        self.fir_interleaved(samples);
        self.delay_interleaved(samples);
    }

    /// Apply the folded FIR to even samples.
    fn fir_interleaved(&mut self, samples: &mut [S]) {
        for i in (0..samples.len()).step_by(2) {
            self.history.push(samples[i]);
            samples[i] = self.folded_fir();
            self.history.advance();
        }
    }

    /// `sum(kernel[j] * (h[j] + h[len - 1 - j]))` over the current window.
    #[inline]
    fn folded_fir(&self) -> S {
        let window = self.history.window();
        let half = self.len / 2;
        let (head, tail) = window.split_at(half);

        let acc = self.fir_kernel[..half]
            .iter()
            .zip(head)
            .zip(tail.iter().rev())
            .fold(S::ACC_ZERO, |acc, ((&k, &a), &b)| S::fold(acc, k, a, b));

        S::from_acc(acc)
    }

    /// Apply delay line to odd samples.
    ///
    /// This aligns the Q channel with the I channel by applying
    /// the same group delay as the FIR filter.
    fn delay_interleaved(&mut self, samples: &mut [S]) {
        let half_len = self.delay_line.len();

        for i in (1..samples.len()).step_by(2) {
            std::mem::swap(&mut self.delay_line[self.delay_index], &mut samples[i]);

            self.delay_index += 1;
            if self.delay_index >= half_len {
                self.delay_index = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Direct convolution with the full (unfolded) kernel.
    fn direct_convolution(kernel: &[f32], input: &[f32]) -> Vec<f32> {
        (0..input.len())
            .map(|n| {
                kernel
                    .iter()
                    .enumerate()
                    .filter(|(k, _)| *k <= n)
                    .map(|(k, h)| h * input[n - k])
                    .sum()
            })
            .collect()
    }

    #[test]
    fn test_iqconverter_creation() {
        let converter = IqConverterF32::new();
        assert_eq!(converter.taps(), 24); // 47/2 + 1 = 24
        assert_eq!(converter.delay_line.len(), 12);
        assert_eq!(converter.history.capacity(), 24 * SIZE_FACTOR);
        assert!((converter.center_tap() - 0.5).abs() < 1e-6);

        let fixed = IqConverterI16::new();
        assert_eq!(fixed.taps(), 24);
        assert_eq!(fixed.center_tap(), 16384);
    }

    #[test]
    fn test_rejects_malformed_kernels() {
        assert!(matches!(
            IqConverterF32::with_kernel(&[0.25, 0.5, 0.25, 0.0]),
            Err(Error::InvalidParam(_))
        ));
        assert!(matches!(
            IqConverterF32::with_kernel(&[0.1, 0.0, 0.5, 0.0, 0.1]),
            Err(Error::InvalidParam(_))
        ));
        assert!(matches!(
            IqConverterI16::with_kernel(&[100, 16384, 99]),
            Err(Error::InvalidParam(_))
        ));
        assert!(IqConverterI16::with_kernel(&[8192, 16384, 8192]).is_ok());
    }

    #[test]
    fn test_dc_removal_convergence() {
        let mut converter = IqConverterF32::new();
        let c = 0.5f32;
        let mut samples = vec![c; 600];

        converter.remove_dc(&mut samples);

        assert!(
            (converter.dc_offset() - c).abs() < 0.01 * c,
            "DC average did not converge: {}",
            converter.dc_offset()
        );
        let tail_avg: f32 = samples[550..].iter().sum::<f32>() / 50.0;
        assert!(tail_avg.abs() < 0.01 * c, "residual DC {}", tail_avg);
    }

    #[test]
    fn test_dc_removal_convergence_fixed_point() {
        let mut converter = IqConverterI16::new();
        let c = 8000i16;
        let mut samples = vec![c; 600];

        converter.remove_dc(&mut samples);

        assert!(
            (converter.dc_offset() - c as f32).abs() < 0.01 * c as f32,
            "DC average did not converge: {}",
            converter.dc_offset()
        );
        assert!(samples[599].abs() < 80, "residual DC {}", samples[599]);
    }

    #[test]
    fn test_dc_state_persists_across_blocks() {
        let mut split = IqConverterF32::new();
        let mut whole = IqConverterF32::new();
        let input: Vec<f32> = (0..512).map(|i| 0.3 + (i as f32 * 0.05).sin()).collect();

        let mut a = input.clone();
        let (first, second) = a.split_at_mut(256);
        split.remove_dc(first);
        split.remove_dc(second);

        let mut b = input;
        whole.remove_dc(&mut b);

        assert_eq!(a, b);
    }

    #[test]
    fn test_output_counts() {
        for len in [4usize, 8, 1000, 4096] {
            let mut converter = IqConverterF32::new();
            let mut samples = vec![0.1f32; len];
            assert_eq!(converter.process(&mut samples), len / 2);

            let mut converter = IqConverterF32::new();
            let mut samples = vec![0.1f32; len];
            assert_eq!(converter.process_real(&mut samples), len / 2);

            let mut converter = IqConverterI16::new();
            let mut samples = vec![100i16; len];
            assert_eq!(converter.process(&mut samples), len / 2);
        }
    }

    #[test]
    fn test_process_to_complex() {
        let mut converter = IqConverterF32::new();

        // 1000 real samples -> 500 complex
        let mut samples: Vec<f32> = (0..1000).map(|i| (i as f32 * 0.01).sin()).collect();

        let complex_samples = converter.process_to_complex(&mut samples);

        assert_eq!(complex_samples.len(), 500);
    }

    #[test]
    fn test_folded_fir_matches_direct_convolution() {
        let mut converter = IqConverterF32::new();

        // Impulse on an even sample, odd samples zero
        let mut samples = vec![0.0f32; 200];
        samples[10] = 1.0;
        let input = samples.clone();

        converter.fir_interleaved(&mut samples);
        let direct = direct_convolution(&HB_KERNEL_FLOAT, &input);

        for n in (0..samples.len()).step_by(2) {
            assert_relative_eq!(samples[n], direct[n], epsilon = 1e-7, max_relative = 1e-5);
        }
        // The impulse response shows every even-indexed tap
        assert_relative_eq!(samples[10], HB_KERNEL_FLOAT[0], max_relative = 1e-5);
        assert_relative_eq!(samples[10 + 22], HB_KERNEL_FLOAT[22], max_relative = 1e-5);
    }

    #[test]
    fn test_folded_fir_matches_direct_convolution_over_wraps() {
        let mut converter = IqConverterF32::new();

        // Long enough to wrap the history several times
        let mut samples: Vec<f32> = (0..8000)
            .map(|n| if n % 2 == 0 { ((n * 7919) % 101) as f32 / 50.0 - 1.0 } else { 0.0 })
            .collect();
        let input = samples.clone();

        converter.fir_interleaved(&mut samples);
        let direct = direct_convolution(&HB_KERNEL_FLOAT, &input);

        for n in (0..samples.len()).step_by(2) {
            assert_relative_eq!(samples[n], direct[n], epsilon = 1e-5, max_relative = 1e-5);
        }
    }

    #[test]
    fn test_delay_line_alignment() {
        let mut converter = IqConverterF32::new();
        let delay = converter.delay_line.len();

        let mut samples: Vec<f32> = (0..100).map(|n| n as f32).collect();
        converter.delay_interleaved(&mut samples);

        // Odd sample 2m + 1 reappears `delay` pairs later
        for m in 0..delay {
            assert_eq!(samples[2 * m + 1], 0.0);
        }
        for m in delay..50 {
            assert_eq!(samples[2 * m + 1], (2 * (m - delay) + 1) as f32);
        }
        // Even samples are untouched
        assert_eq!(samples[40], 40.0);
    }

    #[test]
    fn test_delay_line_circular_behavior() {
        let mut converter = IqConverterF32::new();
        let delay_len = converter.delay_line.len();
        assert_eq!(converter.delay_index, 0);

        // 100 real samples -> 50 odd indices (Q samples)
        let mut samples = vec![0.0f32; 100];
        converter.delay_interleaved(&mut samples);

        assert_eq!(converter.delay_index, 50 % delay_len);
    }

    #[test]
    fn test_real_mode_passband_unity_gain() {
        let mut converter = IqConverterF32::new();

        // Low-frequency tone, well clear of the DC blocker corner
        let freq = 0.02f32;
        let mut samples: Vec<f32> = (0..8192)
            .map(|n| (2.0 * std::f32::consts::PI * freq * n as f32).sin())
            .collect();
        let n = converter.process_real(&mut samples);
        assert_eq!(n, 4096);

        let peak = samples[1000..n].iter().fold(0.0f32, |m, x| m.max(x.abs()));
        assert!(peak > 0.9 && peak < 1.1, "passband gain off: {}", peak);
    }

    #[test]
    fn test_real_mode_rejects_upper_band() {
        let mut converter = IqConverterF32::new();

        // 0.45 * fs aliases after decimation, the half-band must suppress it
        let freq = 0.45f32;
        let mut samples: Vec<f32> = (0..8192)
            .map(|n| (2.0 * std::f32::consts::PI * freq * n as f32).sin())
            .collect();
        let n = converter.process_real(&mut samples);

        let peak = samples[1000..n].iter().fold(0.0f32, |m, x| m.max(x.abs()));
        assert!(peak < 0.05, "stopband leak: {}", peak);
    }

    #[test]
    fn test_fixed_point_tracks_float() {
        let mut float = IqConverterF32::new();
        let mut fixed = IqConverterI16::new();

        let tone: Vec<f32> = (0..4096)
            .map(|n| 0.25 * (2.0 * std::f32::consts::PI * 0.31 * n as f32).cos())
            .collect();
        let mut f_samples = tone.clone();
        let mut i_samples: Vec<i16> = tone.iter().map(|x| (x * 32768.0) as i16).collect();

        float.process(&mut f_samples);
        fixed.process(&mut i_samples);

        for (f, i) in f_samples.iter().zip(i_samples.iter()).skip(200) {
            let i_as_float = *i as f32 / 32768.0;
            assert!(
                (f - i_as_float).abs() < 2e-3,
                "float {} vs fixed {}",
                f,
                i_as_float
            );
        }
    }

    #[test]
    fn test_iq_pair_relationship() {
        let mut converter = IqConverterF32::new();

        // Tone at 0.3 fs lands 0.1 cycles/sample away from Fs/4
        let mut samples: Vec<f32> = (0..4000)
            .map(|i| (2.0 * std::f32::consts::PI * 0.3 * i as f32).sin())
            .collect();

        let complex = converter.process_to_complex(&mut samples);

        // Settled output of an analytic tone has a near-constant envelope
        let mags: Vec<f32> = complex[100..].iter().map(|c| c.norm()).collect();
        let max = mags.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let min = mags.iter().cloned().fold(f32::INFINITY, f32::min);
        assert!(min > 0.0);
        assert!(max / min < 1.1, "envelope ripple too large: {} / {}", max, min);
    }

    #[test]
    fn test_reset_restores_initial_state() {
        let mut converter = IqConverterF32::new();
        let input: Vec<f32> = (0..256).map(|i| (i as f32 * 0.3).cos()).collect();

        let mut first = input.clone();
        converter.process(&mut first);

        converter.reset();
        let mut second = input;
        converter.process(&mut second);

        assert_eq!(first, second);
    }
}
