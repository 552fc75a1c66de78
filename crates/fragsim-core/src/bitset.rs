//! Sorted bit-set of fingerprint positions
//!
//! A fingerprint is stored as the ascending list of its on-bit positions.
//! Intersection counting is a linear merge over two sorted slices, which is
//! the only set operation the similarity metric needs.
//!
//! # Wire format
//!
//! ```text
//! [count: varint]
//! [first position: varint]
//! [delta to previous position: varint] × (count - 1)
//! ```
//!
//! Varints are unsigned LEB128. Deltas keep dense fingerprints small.

use std::fmt;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("Truncated bit-set encoding at byte {0}")]
    Truncated(usize),

    #[error("Varint overflows u32 at byte {0}")]
    Overflow(usize),

    #[error("Bit positions not strictly ascending at entry {0}")]
    NotAscending(usize),

    #[error("Trailing bytes after bit-set: {0}")]
    TrailingBytes(usize),
}

/// Immutable set of on-bit positions, kept sorted and deduplicated
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct BitSet {
    bits: Vec<u32>,
}

impl BitSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from positions in any order; duplicates collapse
    pub fn from_positions<I: IntoIterator<Item = u32>>(positions: I) -> Self {
        let mut bits: Vec<u32> = positions.into_iter().collect();
        bits.sort_unstable();
        bits.dedup();
        Self { bits }
    }

    /// Number of on-bits
    #[inline]
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn contains(&self, position: u32) -> bool {
        self.bits.binary_search(&position).is_ok()
    }

    /// Highest on-bit position, if any
    pub fn max_position(&self) -> Option<u32> {
        self.bits.last().copied()
    }

    pub fn positions(&self) -> &[u32] {
        &self.bits
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.bits.iter().copied()
    }

    /// Size of the intersection with `other`
    pub fn intersection_count(&self, other: &BitSet) -> usize {
        let (mut i, mut j, mut count) = (0usize, 0usize, 0usize);
        let (a, b) = (&self.bits, &other.bits);
        while i < a.len() && j < b.len() {
            match a[i].cmp(&b[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    count += 1;
                    i += 1;
                    j += 1;
                }
            }
        }
        count
    }

    /// Encode as count + delta varints
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.bits.len() + 4);
        write_varint(&mut buf, self.bits.len() as u32);
        let mut previous = 0u32;
        for (i, &bit) in self.bits.iter().enumerate() {
            let value = if i == 0 { bit } else { bit - previous };
            write_varint(&mut buf, value);
            previous = bit;
        }
        buf
    }

    /// Decode bytes produced by [`BitSet::encode`]
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut pos = 0usize;
        let count = read_varint(bytes, &mut pos)? as usize;
        // Every entry needs at least one byte.
        if count > bytes.len().saturating_sub(pos) {
            return Err(CodecError::Truncated(bytes.len()));
        }

        let mut bits = Vec::with_capacity(count);
        let mut previous = 0u32;
        for i in 0..count {
            let value = read_varint(bytes, &mut pos)?;
            let bit = if i == 0 {
                value
            } else {
                if value == 0 {
                    return Err(CodecError::NotAscending(i));
                }
                previous.checked_add(value).ok_or(CodecError::Overflow(pos))?
            };
            bits.push(bit);
            previous = bit;
        }

        if pos != bytes.len() {
            return Err(CodecError::TrailingBytes(bytes.len() - pos));
        }
        Ok(Self { bits })
    }
}

impl fmt::Debug for BitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.bits.iter()).finish()
    }
}

impl FromIterator<u32> for BitSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self::from_positions(iter)
    }
}

impl<const N: usize> From<[u32; N]> for BitSet {
    fn from(positions: [u32; N]) -> Self {
        Self::from_positions(positions)
    }
}

fn write_varint(buf: &mut Vec<u8>, mut value: u32) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn read_varint(bytes: &[u8], pos: &mut usize) -> Result<u32, CodecError> {
    let mut result = 0u32;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*pos).ok_or(CodecError::Truncated(*pos))?;
        *pos += 1;
        let chunk = (byte & 0x7F) as u32;
        if shift == 28 && chunk > 0x0F {
            return Err(CodecError::Overflow(*pos));
        }
        result |= chunk << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift > 28 {
            return Err(CodecError::Overflow(*pos));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_positions_sorts_and_dedups() {
        let bs = BitSet::from_positions([8, 1, 4, 1, 2]);
        assert_eq!(bs.positions(), &[1, 2, 4, 8]);
        assert_eq!(bs.len(), 4);
        assert!(bs.contains(4));
        assert!(!bs.contains(3));
        assert_eq!(bs.max_position(), Some(8));
    }

    #[test]
    fn test_intersection_count() {
        let a = BitSet::from([1, 2, 3]);
        let b = BitSet::from([1, 2, 4, 8]);
        assert_eq!(a.intersection_count(&b), 2);
        assert_eq!(b.intersection_count(&a), 2);
        assert_eq!(a.intersection_count(&BitSet::new()), 0);
    }

    #[test]
    fn test_codec_handles_large_positions() {
        let bs = BitSet::from([0, 127, 128, 16_384, u32::MAX]);
        let encoded = bs.encode();
        assert_eq!(BitSet::decode(&encoded).unwrap(), bs);
    }

    #[test]
    fn test_decode_empty() {
        let encoded = BitSet::new().encode();
        assert_eq!(encoded, vec![0]);
        assert!(BitSet::decode(&encoded).unwrap().is_empty());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert_eq!(BitSet::decode(&[]), Err(CodecError::Truncated(0)));
        // claims 3 entries, carries 1
        assert!(matches!(BitSet::decode(&[3, 1]), Err(CodecError::Truncated(_))));
        // zero delta means a duplicate position
        assert_eq!(BitSet::decode(&[2, 5, 0]), Err(CodecError::NotAscending(1)));
        assert_eq!(BitSet::decode(&[1, 5, 9]), Err(CodecError::TrailingBytes(1)));
        assert!(matches!(
            BitSet::decode(&[1, 0xFF, 0xFF, 0xFF, 0xFF, 0x7F]),
            Err(CodecError::Overflow(_))
        ));
    }
}
