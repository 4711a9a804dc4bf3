//! Device-native running checksums.
//!
//! All sums are seedable so a device that checks each chunk against the
//! running total of the previous ones can be verified incrementally.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

/// Sum a device computes over a written range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumAlgorithm {
    /// [`sum8`], widened to 16 bits.
    Sum8,
    /// [`sum16`].
    #[default]
    Sum16,
    /// [`sum16w`].
    Sum16W,
}

impl ChecksumAlgorithm {
    /// Run this algorithm over `data` starting from `seed`. For `Sum8`
    /// only the low byte of the seed is used.
    pub fn compute(self, seed: u16, data: &[u8]) -> Result<u16> {
        match self {
            ChecksumAlgorithm::Sum8 => Ok(u16::from(sum8(seed as u8, data))),
            ChecksumAlgorithm::Sum16 => Ok(sum16(seed, data)),
            ChecksumAlgorithm::Sum16W => sum16w(seed, data),
        }
    }
}

/// 8-bit wrapping byte sum.
pub fn sum8(seed: u8, data: &[u8]) -> u8 {
    data.iter().fold(seed, |acc, &b| acc.wrapping_add(b))
}

/// 16-bit wrapping sum of individual bytes.
pub fn sum16(seed: u16, data: &[u8]) -> u16 {
    data.iter().fold(seed, |acc, &b| acc.wrapping_add(u16::from(b)))
}

/// 16-bit wrapping sum of little-endian words. `data` must be word aligned.
pub fn sum16w(seed: u16, data: &[u8]) -> Result<u16> {
    if data.len() % 2 != 0 {
        return Err(Error::InvalidData(format!(
            "word sum needs an even length, got {} bytes",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(2)
        .fold(seed, |acc, w| acc.wrapping_add(LittleEndian::read_u16(w))))
}
