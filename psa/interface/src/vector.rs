// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Sub-vector layout of multi-precision values held in assets.
//!
//! Each component starts with a 4-byte header followed by the value in
//! little-endian order, zero-padded to a 32-bit word boundary:
//!
//! | byte | content                          |
//! |------|----------------------------------|
//! | 0-1  | value size in bits, little-endian |
//! | 2    | sub-vector index                 |
//! | 3    | domain identifier / item count   |

use crate::AssetError;
use crate::AssetResult;

/// Size of a sub-vector header.
pub const SUBVECTOR_HEADER_LEN: usize = 4;

/// Bytes needed to hold `bits`, rounded up to whole 32-bit words.
pub const fn bits_to_word_bytes(bits: usize) -> usize {
    bits.div_ceil(32) * 4
}

/// Bytes needed to hold `bits`.
pub const fn bits_to_bytes(bits: usize) -> usize {
    bits.div_ceil(8)
}

/// Size of one sub-vector (header plus word aligned value) for `bits`.
pub const fn subvector_size(bits: usize) -> usize {
    SUBVECTOR_HEADER_LEN + bits_to_word_bytes(bits)
}

/// Decoded sub-vector header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SubVectorHeader {
    /// Value size in bits.
    pub bits: u16,
    /// Sub-vector index.
    pub index: u8,
    /// Domain identifier and item count.
    pub items: u8,
}

impl SubVectorHeader {
    /// Encodes the header.
    pub fn to_bytes(self) -> [u8; SUBVECTOR_HEADER_LEN] {
        let bits = self.bits.to_le_bytes();
        [bits[0], bits[1], self.index, self.items]
    }

    /// Decodes the header at the start of `data`.
    pub fn from_bytes(data: &[u8]) -> AssetResult<Self> {
        let Some(&[lo, hi, index, items]) = data.first_chunk::<SUBVECTOR_HEADER_LEN>() else {
            return Err(AssetError::InvalidParameter);
        };

        Ok(Self {
            bits: u16::from_le_bytes([lo, hi]),
            index,
            items,
        })
    }
}

/// Returns the value bytes of the sub-vector starting at `data`.
///
/// The returned slice covers `bits_to_bytes(header.bits)` bytes, without the
/// word padding.
pub fn subvector_value(data: &[u8]) -> AssetResult<(SubVectorHeader, &[u8])> {
    let header = SubVectorHeader::from_bytes(data)?;
    let len = bits_to_bytes(header.bits as usize);
    let value = data
        .get(SUBVECTOR_HEADER_LEN..SUBVECTOR_HEADER_LEN + len)
        .ok_or(AssetError::InvalidParameter)?;
    Ok((header, value))
}
