//! Wire block, header and proof-of-work arithmetic

use dashu_int::UBig;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    iter::Sum,
    ops::{Add, AddAssign},
};

use crate::hash::{BlockHash, MerkleRoot};

/// Block header, the part of the block covered by its hash.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode,
)]
pub struct BlockHeader {
    #[n(0)]
    pub version: u32,
    #[n(1)]
    pub previous_block_hash: BlockHash,
    #[n(2)]
    pub merkle_root: MerkleRoot,
    #[n(3)]
    pub timestamp: u32,
    /// Compact encoding of the proof-of-work target
    #[n(4)]
    pub bits: u32,
    #[n(5)]
    pub nonce: u32,
}

impl BlockHeader {
    /// Double SHA-256 of the header's canonical CBOR encoding.
    pub fn hash(&self) -> BlockHash {
        let encoded = minicbor::to_vec(self).expect("infallible");
        BlockHash::sha256d(&encoded)
    }

    /// Expanded proof-of-work target, `None` if `bits` is negative, zero or
    /// overflows 256 bits.
    pub fn target(&self) -> Option<UBig> {
        compact_to_target(self.bits)
    }

    pub fn work(&self) -> Work {
        Work::from_bits(self.bits)
    }

    /// True if the header hash, read as a little-endian number, does not
    /// exceed the target.
    pub fn meets_target(&self) -> bool {
        match self.target() {
            Some(target) => UBig::from_le_bytes(self.hash().as_ref()) <= target,
            None => false,
        }
    }
}

/// A block as received from the wire.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, minicbor::Encode, minicbor::Decode,
)]
pub struct Block {
    #[n(0)]
    pub header: BlockHeader,
    #[n(1)]
    pub transactions: Vec<Vec<u8>>,
}

impl Block {
    /// A block with no parent and no transactions.
    pub fn genesis(timestamp: u32, bits: u32, nonce: u32) -> Self {
        Self {
            header: BlockHeader {
                version: 1,
                previous_block_hash: BlockHash::default(),
                merkle_root: MerkleRoot::default(),
                timestamp,
                bits,
                nonce,
            },
            transactions: Vec::new(),
        }
    }

    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    pub fn previous_hash(&self) -> BlockHash {
        self.header.previous_block_hash
    }

    pub fn work(&self) -> Work {
        self.header.work()
    }
}

/// Expand a compact target (`bits`) into the full 256-bit target.
pub fn compact_to_target(bits: u32) -> Option<UBig> {
    let exponent = bits >> 24;
    let mantissa = bits & 0x007f_ffff;
    let negative = bits & 0x0080_0000 != 0;

    if mantissa == 0 || negative {
        return None;
    }
    let overflow = exponent > 34
        || (mantissa > 0xff && exponent > 33)
        || (mantissa > 0xffff && exponent > 32);
    if overflow {
        return None;
    }

    if exponent <= 3 {
        let shifted = mantissa >> (8 * (3 - exponent));
        (shifted != 0).then(|| UBig::from(shifted))
    } else {
        Some(UBig::from(mantissa) << (8 * (exponent - 3)) as usize)
    }
}

/// Cumulative proof-of-work.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Work(UBig);

impl Work {
    pub fn zero() -> Self {
        Self(UBig::ZERO)
    }

    /// Expected number of hashes to meet the target: `2^256 / (target + 1)`.
    pub fn from_bits(bits: u32) -> Self {
        match compact_to_target(bits) {
            Some(target) => Self((UBig::ONE << 256) / (target + UBig::ONE)),
            None => Self::zero(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.0 == UBig::ZERO
    }

    /// `self - other`, or zero if `other` is larger.
    pub fn saturating_sub(&self, other: &Work) -> Work {
        if self.0 > other.0 {
            Work(&self.0 - &other.0)
        } else {
            Work::zero()
        }
    }

    /// Minimal big-endian encoding, for storage keys and values.
    pub fn to_be_bytes(&self) -> Vec<u8> {
        self.0.to_be_bytes().into_vec()
    }

    pub fn from_be_bytes(bytes: &[u8]) -> Self {
        Self(UBig::from_be_bytes(bytes))
    }
}

impl Default for Work {
    fn default() -> Self {
        Self::zero()
    }
}

impl From<u64> for Work {
    fn from(value: u64) -> Self {
        Self(UBig::from(value))
    }
}

impl Add for Work {
    type Output = Work;

    fn add(self, rhs: Work) -> Work {
        Work(self.0 + rhs.0)
    }
}

impl AddAssign for Work {
    fn add_assign(&mut self, rhs: Work) {
        self.0 += rhs.0;
    }
}

impl Sum for Work {
    fn sum<I: Iterator<Item = Work>>(iter: I) -> Self {
        iter.fold(Work::zero(), |acc, w| acc + w)
    }
}

impl fmt::Display for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_genesis_bits_give_known_work() {
        // 0x1d00ffff is the easiest mainnet difficulty
        assert_eq!(Work::from_bits(0x1d00_ffff), Work::from(4_295_032_833));
    }

    #[test]
    fn regtest_bits_give_two_units_of_work() {
        assert_eq!(Work::from_bits(0x207f_ffff), Work::from(2));
        assert_eq!(Work::from_bits(0x1f7f_ffff), Work::from(512));
    }

    #[test]
    fn invalid_compact_targets_have_no_work() {
        // zero mantissa
        assert!(Work::from_bits(0x1d00_0000).is_zero());
        // sign bit set
        assert!(Work::from_bits(0x1d80_ffff).is_zero());
        // overflows 256 bits
        assert!(Work::from_bits(0x2300_ffff).is_zero());
        // small exponent shifts everything out
        assert!(Work::from_bits(0x0100_00ff).is_zero());
    }

    #[test]
    fn small_exponent_shifts_right() {
        assert_eq!(compact_to_target(0x0301_2345), Some(UBig::from(0x01_2345u32)));
        assert_eq!(compact_to_target(0x0201_2345), Some(UBig::from(0x0123u32)));
    }

    #[test]
    fn work_sums_and_compares() {
        let total: Work = [Work::from(2), Work::from(3), Work::from(5)].into_iter().sum();
        assert_eq!(total, Work::from(10));
        assert!(Work::from(11) > total);

        let mut acc = Work::zero();
        acc += Work::from(7);
        assert_eq!(acc.to_string(), "7");
    }

    #[test]
    fn work_subtracts_and_survives_byte_encoding() {
        let big = Work::from_bits(0x1d00_ffff) + Work::from(u64::MAX);
        assert_eq!(Work::from_be_bytes(&big.to_be_bytes()), big);
        assert_eq!(Work::from_be_bytes(&[]), Work::zero());

        assert_eq!(big.saturating_sub(&Work::from(u64::MAX)), Work::from_bits(0x1d00_ffff));
        assert!(Work::from(3).saturating_sub(&Work::from(5)).is_zero());
    }

    #[test]
    fn header_hash_depends_on_every_field() {
        let genesis = Block::genesis(1_231_006_505, 0x207f_ffff, 2);
        let mut other = genesis.clone();
        other.header.nonce += 1;
        assert_ne!(genesis.hash(), other.hash());
        assert_eq!(genesis.hash(), genesis.clone().hash());
    }

    #[test]
    fn cbor_round_trip_preserves_block() {
        let mut block = Block::genesis(10, 0x207f_ffff, 0);
        block.transactions.push(vec![1, 2, 3]);
        let bytes = minicbor::to_vec(&block).unwrap();
        let decoded: Block = minicbor::decode(&bytes).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());
    }

    #[test]
    fn easy_target_is_met_after_a_few_nonces() {
        let mut block = Block::genesis(0, 0x207f_ffff, 0);
        while !block.header.meets_target() {
            block.header.nonce += 1;
        }
        assert!(block.header.nonce < 64);

        let impossible = Block::genesis(0, 0x0100_00ff, 0);
        assert!(!impossible.header.meets_target());
    }
}
