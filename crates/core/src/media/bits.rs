//! Byte and bit level helpers shared by the payload parsers.
//!
//! All readers return `Option` instead of panicking so that truncated
//! payloads surface as parse errors in the calling parser.

/// Whether `data` begins with `pattern`.
pub fn starts_with(data: &[u8], pattern: &[u8]) -> bool {
    data.len() >= pattern.len() && &data[..pattern.len()] == pattern
}

/// Whether `data` ends with `pattern`.
pub fn ends_with(data: &[u8], pattern: &[u8]) -> bool {
    data.len() >= pattern.len() && &data[data.len() - pattern.len()..] == pattern
}

/// Index of the first occurrence of `pattern` in `data` at or after `from`.
pub fn index_of(data: &[u8], pattern: &[u8], from: usize) -> Option<usize> {
    if pattern.is_empty() || from >= data.len() {
        return None;
    }
    data[from..]
        .windows(pattern.len())
        .position(|w| w == pattern)
        .map(|pos| pos + from)
}

pub fn read_u16_be(data: &[u8], offset: usize) -> Option<u16> {
    let b = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

pub fn read_u24_be(data: &[u8], offset: usize) -> Option<u32> {
    let b = data.get(offset..offset + 3)?;
    Some(u32::from_be_bytes([0, b[0], b[1], b[2]]))
}

pub fn read_u32_be(data: &[u8], offset: usize) -> Option<u32> {
    let b = data.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

/// MSB-first bit reader over a byte slice.
///
/// Used for Exp-Golomb fields in H.264 headers and for RFC 3640 AU headers.
/// Emulation prevention bytes are not stripped; the fields read here sit at
/// the start of a NAL unit where they cannot occur.
#[derive(Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, bit_pos: 0 }
    }

    /// Bits left to read.
    pub fn remaining(&self) -> usize {
        self.data.len() * 8 - self.bit_pos
    }

    pub fn read_bit(&mut self) -> Option<u32> {
        let byte = *self.data.get(self.bit_pos / 8)?;
        let bit = (byte >> (7 - (self.bit_pos % 8))) & 1;
        self.bit_pos += 1;
        Some(u32::from(bit))
    }

    /// Read `count` bits (at most 32) as an unsigned integer.
    pub fn read_bits(&mut self, count: u32) -> Option<u32> {
        debug_assert!(count <= 32);
        if self.remaining() < count as usize {
            return None;
        }
        let mut value = 0u32;
        for _ in 0..count {
            value = (value << 1) | self.read_bit()?;
        }
        Some(value)
    }

    /// Read an unsigned Exp-Golomb code (`ue(v)`, H.264 §9.1).
    ///
    /// Returns `None` if the data ends before the code does or the prefix is
    /// longer than 31 zero bits.
    pub fn read_ue(&mut self) -> Option<u32> {
        let mut leading_zeros = 0u32;
        while self.read_bit()? == 0 {
            leading_zeros += 1;
            if leading_zeros > 31 {
                return None;
            }
        }
        if leading_zeros == 0 {
            return Some(0);
        }
        let suffix = self.read_bits(leading_zeros)?;
        Some(((1u64 << leading_zeros) - 1 + u64::from(suffix)) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_and_suffix_matching() {
        assert!(starts_with(&[0, 0, 0, 1, 0x65], &[0, 0, 0, 1]));
        assert!(!starts_with(&[0, 0, 1], &[0, 0, 0, 1]));
        assert!(ends_with(&[0x12, 0xFF, 0xD9], &[0xFF, 0xD9]));
        assert!(!ends_with(&[0xD9], &[0xFF, 0xD9]));
    }

    #[test]
    fn index_of_finds_from_offset() {
        let data = [0, 0, 0, 1, 0x67, 0, 0, 0, 1, 0x68];
        assert_eq!(index_of(&data, &[0, 0, 0, 1], 0), Some(0));
        assert_eq!(index_of(&data, &[0, 0, 0, 1], 1), Some(5));
        assert_eq!(index_of(&data, &[0, 0, 0, 1], 6), None);
        assert_eq!(index_of(&data, &[0, 0, 0, 1], 100), None);
    }

    #[test]
    fn big_endian_reads() {
        let data = [0x01, 0x02, 0x03, 0x04];
        assert_eq!(read_u16_be(&data, 1), Some(0x0203));
        assert_eq!(read_u24_be(&data, 0), Some(0x010203));
        assert_eq!(read_u32_be(&data, 0), Some(0x01020304));
        assert_eq!(read_u32_be(&data, 1), None);
    }

    #[test]
    fn exp_golomb_values() {
        // 1 | 010 | 011 | 00100 | 00101 => 0, 1, 2, 3, 4
        let data = [0b1010_0110, 0b0100_0010, 0b1000_0000];
        let mut r = BitReader::new(&data);
        assert_eq!(r.read_ue(), Some(0));
        assert_eq!(r.read_ue(), Some(1));
        assert_eq!(r.read_ue(), Some(2));
        assert_eq!(r.read_ue(), Some(3));
        assert_eq!(r.read_ue(), Some(4));
    }

    #[test]
    fn exp_golomb_truncated() {
        let mut r = BitReader::new(&[0x00]);
        assert_eq!(r.read_ue(), None);
        let mut r = BitReader::new(&[]);
        assert_eq!(r.read_ue(), None);
    }

    #[test]
    fn read_bits_across_bytes() {
        let mut r = BitReader::new(&[0xAB, 0xCD]);
        assert_eq!(r.read_bits(4), Some(0xA));
        assert_eq!(r.read_bits(8), Some(0xBC));
        assert_eq!(r.remaining(), 4);
        assert_eq!(r.read_bits(5), None);
    }
}
