//! Unsigned 8-bit I/Q → `Complex32` conversion.
//!
//! The dongle only ever delivers 256 distinct values, so the centring
//! division is precomputed once into a lookup table.

use std::sync::OnceLock;

use num_complex::Complex32;

/// `table[b] == (b - 128) / 128.0`
pub fn conversion_table() -> &'static [f32; 256] {
    static TABLE: OnceLock<[f32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0f32; 256];
        for (byte, value) in table.iter_mut().enumerate() {
            *value = (byte as f32 - 128.0) / 128.0;
        }
        table
    })
}

/// Convert interleaved `I, Q` bytes, appending to `out`.
///
/// A trailing odd byte is dropped. Returns the number of samples appended.
pub fn convert_into(bytes: &[u8], out: &mut Vec<Complex32>) -> usize {
    let table = conversion_table();
    let pairs = bytes.chunks_exact(2);
    let count = pairs.len();
    out.reserve(count);
    out.extend(pairs.map(|iq| Complex32::new(table[iq[0] as usize], table[iq[1] as usize])));
    count
}

/// Convert interleaved `I, Q` bytes into a fresh vector.
pub fn iq_to_complex(bytes: &[u8]) -> Vec<Complex32> {
    let mut out = Vec::with_capacity(bytes.len() / 2);
    convert_into(bytes, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn table_endpoints() {
        let table = conversion_table();
        assert_relative_eq!(table[0], -1.0);
        assert_relative_eq!(table[128], 0.0);
        assert_relative_eq!(table[255], 127.0 / 128.0);
    }

    #[test]
    fn requantising_recovers_every_byte() {
        let table = conversion_table();
        for byte in 0..=255u8 {
            let back = (table[byte as usize] * 128.0 + 128.0).round() as u8;
            assert_eq!(back, byte);
        }
    }

    #[test]
    fn pairs_map_to_real_and_imaginary() {
        let samples = iq_to_complex(&[0, 255, 128, 64]);
        assert_eq!(samples.len(), 2);
        assert_relative_eq!(samples[0].re, -1.0);
        assert_relative_eq!(samples[0].im, 127.0 / 128.0);
        assert_relative_eq!(samples[1].re, 0.0);
        assert_relative_eq!(samples[1].im, -0.5);
    }

    #[test]
    fn odd_trailing_byte_is_dropped() {
        let mut out = Vec::new();
        let n = convert_into(&[128, 128, 200], &mut out);
        assert_eq!(n, 1);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(iq_to_complex(&[]).is_empty());
    }
}
