//! Fixed-width machine words and their biased byte encoding.
//!
//! Every value that crosses the bus is a signed word of 16, 32 or 64 bits.
//! On the wire a word is stored as `value + 2^(bits-1)` in little-endian
//! order, so the most negative value encodes as all zero bytes.

use std::fmt;
use serde::{Serialize, Deserialize};
use thiserror::Error;

/// Supported word widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum WordLength {
    Bits16,
    Bits32,
    Bits64,
}

impl WordLength {
    /// All supported widths, narrowest first.
    pub const ALL: [WordLength; 3] = [WordLength::Bits16, WordLength::Bits32, WordLength::Bits64];

    /// Width in bits.
    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            WordLength::Bits16 => 16,
            WordLength::Bits32 => 32,
            WordLength::Bits64 => 64,
        }
    }

    /// Width in bytes, i.e. the number of fragments a word occupies.
    #[inline]
    pub const fn bytes(self) -> usize {
        (self.bits() / 8) as usize
    }

    /// Smallest representable value.
    #[inline]
    pub const fn min_value(self) -> i64 {
        match self {
            WordLength::Bits16 => i16::MIN as i64,
            WordLength::Bits32 => i32::MIN as i64,
            WordLength::Bits64 => i64::MIN,
        }
    }

    /// Largest representable value.
    #[inline]
    pub const fn max_value(self) -> i64 {
        match self {
            WordLength::Bits16 => i16::MAX as i64,
            WordLength::Bits32 => i32::MAX as i64,
            WordLength::Bits64 => i64::MAX,
        }
    }

    /// Check whether a value fits in this width.
    #[inline]
    pub fn contains(self, value: i64) -> bool {
        value >= self.min_value() && value <= self.max_value()
    }

    /// Truncate a value to this width with two's complement wraparound.
    pub fn wrap(self, value: i64) -> i64 {
        let shift = 64 - self.bits();
        (value << shift) >> shift
    }

    /// The bias bit, `2^(bits-1)`.
    #[inline]
    fn bias(self) -> u64 {
        1u64 << (self.bits() - 1)
    }

    /// Encode a value into `bytes()` biased little-endian bytes.
    pub fn encode(self, value: i64) -> Result<Vec<u8>, WordError> {
        if !self.contains(value) {
            return Err(WordError::OutOfRange { value, bits: self.bits() });
        }

        // Adding 2^(n-1) modulo 2^n is the same as flipping the top bit.
        let biased = (value as u64) ^ self.bias();
        Ok(biased.to_le_bytes()[..self.bytes()].to_vec())
    }

    /// Decode biased little-endian bytes back into a signed value.
    pub fn decode(self, bytes: &[u8]) -> Result<i64, WordError> {
        if bytes.len() != self.bytes() {
            return Err(WordError::WrongSize {
                expected: self.bytes(),
                found: bytes.len(),
            });
        }

        let mut raw = [0u8; 8];
        raw[..bytes.len()].copy_from_slice(bytes);
        let unbiased = u64::from_le_bytes(raw) ^ self.bias();
        Ok(self.wrap(unbiased as i64))
    }
}

impl Default for WordLength {
    fn default() -> Self {
        WordLength::Bits16
    }
}

impl TryFrom<u32> for WordLength {
    type Error = WordError;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        match bits {
            16 => Ok(WordLength::Bits16),
            32 => Ok(WordLength::Bits32),
            64 => Ok(WordLength::Bits64),
            other => Err(WordError::UnsupportedWidth(other)),
        }
    }
}

impl From<WordLength> for u32 {
    fn from(word: WordLength) -> Self {
        word.bits()
    }
}

impl fmt::Display for WordLength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// Errors produced by word encoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WordError {
    #[error("value {value} does not fit in a {bits}-bit word")]
    OutOfRange { value: i64, bits: u32 },

    #[error("expected {expected} bytes for a word, found {found}")]
    WrongSize { expected: usize, found: usize },

    #[error("unsupported word length {0} (expected 16, 32 or 64)")]
    UnsupportedWidth(u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bias_is_little_endian() {
        // 0 + 2^15 = 0x8000
        assert_eq!(WordLength::Bits16.encode(0).unwrap(), vec![0x00, 0x80]);
        assert_eq!(WordLength::Bits16.encode(i16::MIN as i64).unwrap(), vec![0x00, 0x00]);
        assert_eq!(WordLength::Bits16.encode(i16::MAX as i64).unwrap(), vec![0xFF, 0xFF]);
        assert_eq!(WordLength::Bits32.encode(1).unwrap(), vec![0x01, 0x00, 0x00, 0x80]);
    }

    #[test]
    fn test_extremes_roundtrip() {
        for word in WordLength::ALL {
            for value in [word.min_value(), -1, 0, 1, word.max_value()] {
                let bytes = word.encode(value).unwrap();
                assert_eq!(bytes.len(), word.bytes());
                assert_eq!(word.decode(&bytes).unwrap(), value, "{} value {}", word, value);
            }
        }
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(WordLength::Bits16.encode(40_000).is_err());
        assert!(WordLength::Bits32.encode(i64::from(i32::MAX) + 1).is_err());
    }

    #[test]
    fn test_wrong_size_rejected() {
        assert_eq!(
            WordLength::Bits32.decode(&[0, 0]),
            Err(WordError::WrongSize { expected: 4, found: 2 })
        );
    }

    #[test]
    fn test_wrap() {
        assert_eq!(WordLength::Bits16.wrap(32_768), -32_768);
        assert_eq!(WordLength::Bits16.wrap(-32_769), 32_767);
        assert_eq!(WordLength::Bits64.wrap(i64::MAX), i64::MAX);
    }

    #[test]
    fn test_width_from_bits() {
        assert_eq!(WordLength::try_from(32u32), Ok(WordLength::Bits32));
        assert_eq!(WordLength::try_from(24u32), Err(WordError::UnsupportedWidth(24)));
    }

    proptest! {
        #[test]
        fn roundtrip_16(value in i16::MIN..=i16::MAX) {
            let word = WordLength::Bits16;
            prop_assert_eq!(word.decode(&word.encode(value as i64).unwrap()).unwrap(), value as i64);
        }

        #[test]
        fn roundtrip_32(value in i32::MIN..=i32::MAX) {
            let word = WordLength::Bits32;
            prop_assert_eq!(word.decode(&word.encode(value as i64).unwrap()).unwrap(), value as i64);
        }

        #[test]
        fn roundtrip_64(value in any::<i64>()) {
            let word = WordLength::Bits64;
            prop_assert_eq!(word.decode(&word.encode(value).unwrap()).unwrap(), value);
        }
    }
}
