use std::{fs, path::Path};

use anyhow::{Context, Result};
use bitvec::{order::Msb0, vec::BitVec};

/// An append-only, msb-first bit buffer.
///
/// Bit `i` lands in byte `i / 8` at bit position `7 - i % 8`, so the byte
/// view of the buffer matches the network order used by the AFGS1 syntax.
#[derive(Debug, Clone, Default)]
pub struct BitWriter {
    bits: BitVec<u8, Msb0>,
}

impl BitWriter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            bits: BitVec::new(),
        }
    }

    pub fn write_bit(&mut self, bit: bool) {
        self.bits.push(bit);
    }

    /// Appends `value` as a `bits`-wide unsigned literal, msb first.
    ///
    /// `bits` of zero is a permitted no-op. Out-of-range arguments are
    /// programmer errors and panic.
    pub fn write_literal(&mut self, value: u32, bits: usize) {
        assert!(bits <= 31, "literal width {bits} out of range");
        assert!(
            bits == 0 || u64::from(value) < (1u64 << bits),
            "value {value} does not fit in {bits} bits"
        );
        for bit in (0..bits).rev() {
            self.bits.push((value >> bit) & 1 == 1);
        }
    }

    /// Current length in bits.
    #[must_use]
    pub fn position(&self) -> usize {
        self.bits.len()
    }

    /// Returns complete byte `index`. Indexing into a byte that has not been
    /// fully written is a programmer error and panics.
    #[must_use]
    pub fn byte_at(&self, index: usize) -> u8 {
        assert!(
            index < self.bits.len() / 8,
            "byte {index} has not been fully written"
        );
        self.bits.as_raw_slice()[index]
    }

    /// The complete bytes written so far. A trailing sub-byte fragment is
    /// not included.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits.as_raw_slice()[..self.bits.len() / 8]
    }

    /// Resets to empty without releasing capacity.
    pub fn clear(&mut self) {
        self.bits.clear();
    }

    pub fn write_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(&path, self.as_bytes())
            .with_context(|| format!("Unable to write {}", path.as_ref().to_string_lossy()))
    }
}

#[cfg(test)]
mod tests {
    use quickcheck_macros::quickcheck;

    use super::BitWriter;

    #[test]
    fn bit_placement_is_msb_first() {
        let mut writer = BitWriter::new();
        writer.write_bit(true);
        writer.write_bit(false);
        writer.write_bit(true);
        assert_eq!(writer.position(), 3);
        assert!(writer.as_bytes().is_empty());

        writer.write_literal(0, 5);
        assert_eq!(writer.position(), 8);
        assert_eq!(writer.byte_at(0), 0b1010_0000);
    }

    #[test]
    fn literal_spans_byte_boundaries() {
        let mut writer = BitWriter::new();
        writer.write_literal(1, 4);
        writer.write_literal(0xABC, 12);
        assert_eq!(writer.as_bytes(), &[0x1A, 0xBC]);
    }

    #[test]
    fn zero_width_literal_is_a_no_op() {
        let mut writer = BitWriter::new();
        writer.write_literal(0, 0);
        assert_eq!(writer.position(), 0);
    }

    #[test]
    fn clear_resets_position() {
        let mut writer = BitWriter::new();
        writer.write_literal(0xFF, 8);
        writer.clear();
        assert_eq!(writer.position(), 0);
        writer.write_literal(0x5A, 8);
        assert_eq!(writer.as_bytes(), &[0x5A]);
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn oversized_value_panics() {
        let mut writer = BitWriter::new();
        writer.write_literal(4, 2);
    }

    #[quickcheck]
    fn literal_round_trips_through_bytes(value: u32, bits: usize) -> bool {
        let bits = bits % 24 + 8;
        let value = value & ((1 << bits) - 1);
        let mut writer = BitWriter::new();
        writer.write_literal(value, bits);
        // Align so every written bit is byte-addressable.
        writer.write_literal(0, (8 - bits % 8) % 8);

        let mut read_back = 0u32;
        for i in 0..bits {
            let byte = writer.byte_at(i / 8);
            read_back = (read_back << 1) | u32::from((byte >> (7 - i % 8)) & 1);
        }
        read_back == value
    }
}
