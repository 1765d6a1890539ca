use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{
    hash::{double_sha256, H256},
    u256::U256,
};

pub type Target = U256;
pub type Work = U256;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    /// Block version, now repurposed for soft fork signalling.
    pub version: i32,
    /// Reference to the previous block in the chain.
    pub prev_block_hash: H256,
    /// The root hash of the merkle tree of transactions in the block.
    pub merkle_root: H256,
    /// The timestamp of the block, as claimed by the miner.
    pub time: u32,
    /// The target value below which the blockhash must lie.
    pub bits: u32,
    /// The nonce, selected to obtain a low enough blockhash.
    pub nonce: u32,
}

impl Header {
    /// Serialized length of (version, prev_blockhash, merkle_root, time, bits, nonce).
    pub const SIZE: usize = 4 + 32 + 32 + 4 + 4 + 4; // 80

    /// Computes the target (range [0, T] inclusive) that a blockhash must land in to be valid.
    #[must_use]
    pub fn target(&self) -> Target {
        target_from_bits(self.bits)
    }

    /// Returns the total work of the block: the expected number of hash
    /// evaluations needed to find a block with this target.
    #[must_use]
    pub fn work(&self) -> Work {
        self.target().inverse()
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut raw = [0u8; Self::SIZE];
        raw[0..4].copy_from_slice(&self.version.to_le_bytes());
        raw[4..36].copy_from_slice(&self.prev_block_hash.0);
        raw[36..68].copy_from_slice(&self.merkle_root.0);
        raw[68..72].copy_from_slice(&self.time.to_le_bytes());
        raw[72..76].copy_from_slice(&self.bits.to_le_bytes());
        raw[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        raw
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, DecodeHeaderError> {
        if raw.len() != Self::SIZE {
            return Err(DecodeHeaderError::InvalidLength);
        }
        let word = |range: std::ops::Range<usize>| -> [u8; 4] {
            raw[range].try_into().expect("range is four bytes")
        };
        let mut prev_block_hash = [0u8; 32];
        prev_block_hash.copy_from_slice(&raw[4..36]);
        let mut merkle_root = [0u8; 32];
        merkle_root.copy_from_slice(&raw[36..68]);
        Ok(Header {
            version: i32::from_le_bytes(word(0..4)),
            prev_block_hash: H256(prev_block_hash),
            merkle_root: H256(merkle_root),
            time: u32::from_le_bytes(word(68..72)),
            bits: u32::from_le_bytes(word(72..76)),
            nonce: u32::from_le_bytes(word(76..80)),
        })
    }

    #[must_use]
    pub fn block_hash(&self) -> H256 {
        double_sha256(&self.to_bytes())
    }
}

/// Decodes the compact "bits" representation into a full target.
///
/// This is a floating-point encoding originally used by OpenSSL, which
/// satoshi put into consensus code, so we're stuck with it. The exponent
/// needs to have 3 subtracted from it because of the 3 mantissa bytes.
#[must_use]
pub fn target_from_bits(bits: u32) -> Target {
    let (mant, expt) = {
        let unshifted_expt = bits >> 24;
        if unshifted_expt <= 3 {
            ((bits & 0x00FF_FFFF) >> (8 * (3 - unshifted_expt)), 0)
        } else {
            (bits & 0x00FF_FFFF, 8 * (unshifted_expt - 3))
        }
    };

    // The mantissa is signed but may not be negative.
    if mant > 0x7F_FFFF {
        Target::ZERO
    } else {
        U256::from(mant) << expt
    }
}

/// A header plus the chain position data the store tracks alongside it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ExtendedHeader {
    pub block_header: Header,
    /// Hash of `block_header`, kept to avoid rehashing on every lookup.
    pub block_hash: H256,
    /// Accumulated chain work at this position.
    pub chain_work: Work,
    pub block_height: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum DecodeHeaderError {
    InvalidLength,
}

impl fmt::Display for DecodeHeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeHeaderError::InvalidLength => write!(f, "header must be 80 bytes"),
        }
    }
}

impl std::error::Error for DecodeHeaderError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header {
            version: 0x2000_0000,
            prev_block_hash: double_sha256(b"prev"),
            merkle_root: double_sha256(b"merkle"),
            time: 1_558_000_000,
            bits: 0x1d00_ffff,
            nonce: 0xdead_beef,
        }
    }

    #[test]
    fn bytes_round_trip() {
        let header = sample_header();
        let raw = header.to_bytes();
        assert_eq!(Header::from_bytes(&raw).unwrap(), header);
    }

    #[test]
    fn rejects_truncated_header() {
        assert_eq!(
            Header::from_bytes(&[0u8; 79]),
            Err(DecodeHeaderError::InvalidLength)
        );
    }

    #[test]
    fn hash_covers_all_fields() {
        let header = sample_header();
        let mut tweaked = header;
        tweaked.nonce ^= 1;
        assert_ne!(header.block_hash(), tweaked.block_hash());
        assert_eq!(header.block_hash(), double_sha256(&header.to_bytes()));
    }

    #[test]
    fn negative_mantissa_gives_zero_target() {
        let mut header = sample_header();
        header.bits = 0x1d80_0000;
        assert_eq!(header.target(), Target::ZERO);
    }
}
