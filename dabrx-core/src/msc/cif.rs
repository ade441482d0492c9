//! CIF geometry and the block accumulator.

use serde::{Deserialize, Serialize};

use crate::error::{DabError, Result};

/// Soft bits per capacity unit.
pub const CU_BITS: usize = 64;

/// Capacity units per CIF.
pub const CIF_CUS: usize = 864;

/// Soft bits per CIF, identical in every transmission mode.
pub const CIF_BITS: usize = CIF_CUS * CU_BITS;

/// Leading blocks of a transmission frame that carry no MSC data
/// (null symbol, phase reference and FIC).
pub const MSC_BLOCK_OFFSET: i32 = 4;

/// DAB transmission mode. Only the block geometry matters here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransmissionMode {
    I,
    II,
    IV,
}

impl TransmissionMode {
    /// Modes other than 1, 2 and 4 fall back to mode I.
    pub fn from_number(mode: u8) -> Self {
        match mode {
            2 => TransmissionMode::II,
            4 => TransmissionMode::IV,
            _ => TransmissionMode::I,
        }
    }

    pub fn carriers(self) -> usize {
        match self {
            TransmissionMode::I => 1536,
            TransmissionMode::II => 384,
            TransmissionMode::IV => 768,
        }
    }

    /// Two soft bits (I and Q) per carrier.
    pub fn bits_per_block(self) -> usize {
        2 * self.carriers()
    }

    pub fn blocks_per_cif(self) -> usize {
        CIF_BITS / self.bits_per_block()
    }
}

/// Fixed CIF buffer filled one deinterleaved block at a time.
pub struct CifAccumulator {
    mode: TransmissionMode,
    buffer: Vec<i16>,
    /// Rolling 0..=3 counter, advanced per dispatched CIF.
    cif_count: u8,
}

impl CifAccumulator {
    pub fn new(mode: TransmissionMode) -> Self {
        Self {
            mode,
            buffer: vec![0; CIF_BITS],
            cif_count: 0,
        }
    }

    pub fn mode(&self) -> TransmissionMode {
        self.mode
    }

    pub fn blocks_per_cif(&self) -> usize {
        self.mode.blocks_per_cif()
    }

    pub fn bits_per_block(&self) -> usize {
        self.mode.bits_per_block()
    }

    /// Position of `block_number` inside its CIF. Any `i32` is accepted.
    pub fn logical_index(&self, block_number: i32) -> usize {
        let offset = i64::from(block_number) - i64::from(MSC_BLOCK_OFFSET);
        offset.rem_euclid(self.blocks_per_cif() as i64) as usize
    }

    /// Copy one block into place, returning its logical index.
    ///
    /// # Errors
    /// `DabError::BlockLength` when `bits` is not exactly one block; the
    /// buffer is left untouched.
    pub fn write_block(&mut self, bits: &[i16], block_number: i32) -> Result<usize> {
        let expected = self.bits_per_block();
        if bits.len() != expected {
            return Err(DabError::BlockLength {
                expected,
                actual: bits.len(),
            });
        }
        let index = self.logical_index(block_number);
        let offset = index * expected;
        self.buffer[offset..offset + expected].copy_from_slice(bits);
        Ok(index)
    }

    pub fn is_last(&self, index: usize) -> bool {
        index == self.blocks_per_cif() - 1
    }

    pub fn cif(&self) -> &[i16] {
        &self.buffer
    }

    /// Soft bits of CUs `start..start + length`.
    pub fn cu_range(&self, start: usize, length: usize) -> &[i16] {
        &self.buffer[start * CU_BITS..(start + length) * CU_BITS]
    }

    pub fn cif_count(&self) -> u8 {
        self.cif_count
    }

    pub(crate) fn advance_cif_count(&mut self) -> u8 {
        self.cif_count = (self.cif_count + 1) & 0b11;
        self.cif_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_mode_fills_the_same_cif() {
        for (mode, blocks, bits) in [
            (TransmissionMode::I, 18, 3072),
            (TransmissionMode::II, 72, 768),
            (TransmissionMode::IV, 36, 1536),
        ] {
            assert_eq!(mode.blocks_per_cif(), blocks);
            assert_eq!(mode.bits_per_block(), bits);
            assert_eq!(blocks * bits, CIF_BITS);
        }
        assert_eq!(CIF_BITS, 55_296);
    }

    #[test]
    fn unknown_mode_uses_mode_one_geometry() {
        assert_eq!(TransmissionMode::from_number(3), TransmissionMode::I);
        assert_eq!(TransmissionMode::from_number(0), TransmissionMode::I);
        assert_eq!(TransmissionMode::from_number(4), TransmissionMode::IV);
    }

    #[test]
    fn block_numbers_are_offset_and_wrapped() {
        let acc = CifAccumulator::new(TransmissionMode::I);
        assert_eq!(acc.logical_index(4), 0);
        assert_eq!(acc.logical_index(21), 17);
        assert_eq!(acc.logical_index(22), 0);
        // Below the offset wraps instead of going negative.
        assert_eq!(acc.logical_index(3), 17);
    }

    #[test]
    fn extreme_block_numbers_do_not_overflow() {
        let acc = CifAccumulator::new(TransmissionMode::I);
        assert_eq!(acc.logical_index(i32::MIN), 12);
        assert_eq!(acc.logical_index(i32::MAX), 15);
        let acc = CifAccumulator::new(TransmissionMode::II);
        assert_eq!(acc.logical_index(i32::MIN), 12);
    }

    #[test]
    fn block_lands_at_its_offset() {
        let mut acc = CifAccumulator::new(TransmissionMode::IV);
        let bits = vec![7i16; 1536];
        let index = acc.write_block(&bits, 6).expect("write block");
        assert_eq!(index, 2);
        assert!(acc.cif()[2 * 1536..3 * 1536].iter().all(|&b| b == 7));
        assert!(acc.cif()[..2 * 1536].iter().all(|&b| b == 0));
    }

    #[test]
    fn wrong_length_is_rejected_without_writing() {
        let mut acc = CifAccumulator::new(TransmissionMode::I);
        let err = acc.write_block(&[1i16; 100], 4).unwrap_err();
        assert!(matches!(
            err,
            DabError::BlockLength {
                expected: 3072,
                actual: 100
            }
        ));
        assert!(acc.cif().iter().all(|&b| b == 0));
    }

    #[test]
    fn cif_counter_wraps_at_four() {
        let mut acc = CifAccumulator::new(TransmissionMode::I);
        let seen: Vec<u8> = (0..5).map(|_| acc.advance_cif_count()).collect();
        assert_eq!(seen, vec![1, 2, 3, 0, 1]);
    }
}
