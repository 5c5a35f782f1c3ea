//! 12-bit sample unpacking.
//!
//! With packing enabled the firmware squeezes eight 12-bit samples into three
//! little-endian 32-bit words:
//!
//! ```text
//! word i   : s0[11:0] s1[11:0] s2[11:4]
//! word i+1 : s2[3:0]  s3[11:0] s4[11:0] s5[11:8]
//! word i+2 : s5[7:0]  s6[11:0] s7[11:0]
//! ```

/// Words per packed group.
pub const PACKED_WORDS: usize = 3;

/// Samples per packed group.
pub const PACKED_SAMPLES: usize = 8;

/// Number of 12-bit samples carried by `bytes` packed bytes.
pub fn packed_sample_count(bytes: usize) -> usize {
    (bytes / (PACKED_WORDS * 4)) * PACKED_SAMPLES
}

/// Expand packed words into one 12-bit sample per `u16`.
///
/// Processes `min(input.len() / 3, output.len() / 8)` whole groups and
/// returns the number of samples written. Trailing partial groups are ignored.
pub fn unpack_samples(input: &[u32], output: &mut [u16]) -> usize {
    let mut written = 0;
    for (w, out) in input
        .chunks_exact(PACKED_WORDS)
        .zip(output.chunks_exact_mut(PACKED_SAMPLES))
    {
        out[0] = ((w[0] >> 20) & 0xfff) as u16;
        out[1] = ((w[0] >> 8) & 0xfff) as u16;
        out[2] = (((w[0] & 0xff) << 4) | ((w[1] >> 28) & 0xf)) as u16;
        out[3] = ((w[1] >> 16) & 0xfff) as u16;
        out[4] = ((w[1] >> 4) & 0xfff) as u16;
        out[5] = (((w[1] & 0xf) << 8) | ((w[2] >> 24) & 0xff)) as u16;
        out[6] = ((w[2] >> 12) & 0xfff) as u16;
        out[7] = (w[2] & 0xfff) as u16;
        written += PACKED_SAMPLES;
    }
    written
}

/// Unpack straight from a raw USB buffer.
///
/// Words are read little-endian, independent of host byte order.
pub fn unpack_bytes(input: &[u8], output: &mut [u16]) -> usize {
    let mut written = 0;
    for (group, out) in input
        .chunks_exact(PACKED_WORDS * 4)
        .zip(output.chunks_exact_mut(PACKED_SAMPLES))
    {
        let w = [
            u32::from_le_bytes([group[0], group[1], group[2], group[3]]),
            u32::from_le_bytes([group[4], group[5], group[6], group[7]]),
            u32::from_le_bytes([group[8], group[9], group[10], group[11]]),
        ];
        written += unpack_samples(&w, out);
    }
    written
}

/// Copy unpacked little-endian 16-bit samples out of a raw USB buffer.
pub fn decode_u16_samples(input: &[u8], output: &mut [u16]) -> usize {
    let mut written = 0;
    for (pair, out) in input.chunks_exact(2).zip(output.iter_mut()) {
        *out = u16::from_le_bytes([pair[0], pair[1]]);
        written += 1;
    }
    written
}
