//! Default half-band conversion kernels.
//!
//! Both kernels are 47 taps long, symmetric, with zeros at every odd offset
//! from the center except the center tap itself (0.5, or 16384 in Q15).
//! The `i16` table is the Q15 rounding of the `f32` one.

/// Length of the default kernels.
pub const HB_KERNEL_LEN: usize = 47;

/// 47-tap half-band FIR kernel, floating point.
#[allow(clippy::excessive_precision)]
pub const HB_KERNEL_FLOAT: [f32; HB_KERNEL_LEN] = [
    -1.975722792229084e-4,
    0.0,
    5.760704520844917e-4,
    0.0,
    -1.350975944268072e-3,
    0.0,
    2.727516389781759e-3,
    0.0,
    -4.986043929625469e-3,
    0.0,
    8.496970950995700e-3,
    0.0,
    -1.378583469426858e-2,
    0.0,
    2.171044581860376e-2,
    0.0,
    -3.397756532486159e-2,
    0.0,
    5.494288268556362e-2,
    0.0,
    -1.006560861576759e-1,
    0.0,
    3.164569315564292e-1,
    5.000000000000000e-1, // center tap (hbc)
    3.164569315564292e-1,
    0.0,
    -1.006560861576759e-1,
    0.0,
    5.494288268556362e-2,
    0.0,
    -3.397756532486159e-2,
    0.0,
    2.171044581860376e-2,
    0.0,
    -1.378583469426858e-2,
    0.0,
    8.496970950995700e-3,
    0.0,
    -4.986043929625469e-3,
    0.0,
    2.727516389781759e-3,
    0.0,
    -1.350975944268072e-3,
    0.0,
    5.760704520844917e-4,
    0.0,
    -1.975722792229084e-4,
];

/// 47-tap half-band FIR kernel, Q15 fixed point.
pub const HB_KERNEL_INT16: [i16; HB_KERNEL_LEN] = [
    -6, 0, 19, 0, -44, 0, 89, 0, -163, 0, 278, 0, -452, 0, 711, 0, -1113, 0, 1800, 0, -3298, 0,
    10370, 16384, 10370, 0, -3298, 0, 1800, 0, -1113, 0, 711, 0, -452, 0, 278, 0, -163, 0, 89, 0,
    -44, 0, 19, 0, -6,
];

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_float_kernel_unity_dc_gain() {
        let sum: f32 = HB_KERNEL_FLOAT.iter().sum();
        assert_relative_eq!(sum, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn test_int16_kernel_is_q15_of_float() {
        for (f, i) in HB_KERNEL_FLOAT.iter().zip(HB_KERNEL_INT16.iter()) {
            let q15 = (f * 32768.0).round() as i32;
            assert!((q15 - *i as i32).abs() <= 1, "{} vs {}", q15, i);
        }
    }

    #[test]
    fn test_half_band_zeros() {
        let center = HB_KERNEL_LEN / 2;
        for (k, tap) in HB_KERNEL_INT16.iter().enumerate() {
            if k != center && (k as isize - center as isize) % 2 == 0 {
                assert_eq!(*tap, 0, "tap {} should be zero", k);
            }
        }
    }
}
