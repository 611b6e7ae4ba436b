/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions for the composite block type, its embedded child-chain headers, and their
//! digest computation.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};
pub use sha2::Sha256 as CryptoHasher;
use sha2::Digest;

use crate::types::data_types::*;

/// A header harvested from an external child blockchain and anchored inside a composite
/// block. Opaque to the core beyond these five fields.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct ChildHeader {
    pub blockchain: ChainName,
    pub height: BlockHeight,
    pub hash: String,
    pub merkle_root: String,
    pub timestamp: Timestamp,
}

/// The only on-chain unit: one block of the parent chain, anchoring an ordered mapping of
/// child-chain headers.
///
/// `total_distance` accumulates the per-block `distance` along the chain:
/// `total_distance_i = total_distance_{i-1} + distance_i`. Both are monotone along any legal
/// chain, as is `height`.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct CompositeBlock {
    pub hash: BlockHash,
    pub previous_hash: BlockHash,
    pub height: BlockHeight,
    pub timestamp: Timestamp,
    pub difficulty: Distance,
    pub distance: Distance,
    pub total_distance: Distance,
    pub blockchain_headers: BTreeMap<ChainName, Vec<ChildHeader>>,
    pub blockchain_headers_count: u32,
    pub miner_key: MinerKey,
}

impl CompositeBlock {
    /// Assemble a block from its fields, computing `hash` and the cached header count.
    pub fn new(
        previous_hash: BlockHash,
        height: BlockHeight,
        timestamp: Timestamp,
        difficulty: Distance,
        distance: Distance,
        total_distance: Distance,
        blockchain_headers: BTreeMap<ChainName, Vec<ChildHeader>>,
        miner_key: MinerKey,
    ) -> CompositeBlock {
        let blockchain_headers_count = blockchain_headers
            .values()
            .map(|headers| headers.len() as u32)
            .sum();
        let hash = Self::hash(
            &previous_hash,
            height,
            timestamp,
            &difficulty,
            &total_distance,
            &blockchain_headers,
            &miner_key,
        );
        CompositeBlock {
            hash,
            previous_hash,
            height,
            timestamp,
            difficulty,
            distance,
            total_distance,
            blockchain_headers,
            blockchain_headers_count,
            miner_key,
        }
    }

    /// Compute the content digest over every identity-bearing field of a block.
    pub fn hash(
        previous_hash: &BlockHash,
        height: BlockHeight,
        timestamp: Timestamp,
        difficulty: &Distance,
        total_distance: &Distance,
        blockchain_headers: &BTreeMap<ChainName, Vec<ChildHeader>>,
        miner_key: &MinerKey,
    ) -> BlockHash {
        let mut hasher = CryptoHasher::new();
        hasher.update(&previous_hash.try_to_vec().unwrap());
        hasher.update(&height.try_to_vec().unwrap());
        hasher.update(&timestamp.try_to_vec().unwrap());
        hasher.update(&difficulty.try_to_vec().unwrap());
        hasher.update(&total_distance.try_to_vec().unwrap());
        hasher.update(&blockchain_headers.try_to_vec().unwrap());
        hasher.update(&miner_key.try_to_vec().unwrap());
        BlockHash::new(hasher.finalize().into())
    }

    /// Recompute this block's digest from its current field values.
    pub fn compute_hash(&self) -> BlockHash {
        Self::hash(
            &self.previous_hash,
            self.height,
            self.timestamp,
            &self.difficulty,
            &self.total_distance,
            &self.blockchain_headers,
            &self.miner_key,
        )
    }

    /// The number of child headers actually present in `blockchain_headers`.
    pub fn count_headers(&self) -> u32 {
        self.blockchain_headers
            .values()
            .map(|headers| headers.len() as u32)
            .sum()
    }

    /// Iterate over all embedded child headers, across every chain.
    pub fn headers(&self) -> impl Iterator<Item = &ChildHeader> {
        self.blockchain_headers.values().flatten()
    }

    /// The immutable first block of the chain. Also doubles as the "unlocked" sentinel value
    /// of the sync lock record.
    pub fn genesis() -> CompositeBlock {
        CompositeBlock::new(
            BlockHash::zero(),
            BlockHeight::genesis(),
            Timestamp::new(1),
            Distance::from_u64(1),
            Distance::from_u64(1),
            Distance::from_u64(1),
            BTreeMap::new(),
            MinerKey::new("genesis"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(chain: &str, height: u64) -> ChildHeader {
        ChildHeader {
            blockchain: ChainName::new(chain),
            height: BlockHeight::new(height),
            hash: format!("{}-{}", chain, height),
            merkle_root: format!("mr-{}-{}", chain, height),
            timestamp: Timestamp::new(1_000_000 + height),
        }
    }

    #[test]
    fn new_counts_headers_and_hashes() {
        let mut headers = BTreeMap::new();
        headers.insert(ChainName::new("btc"), vec![header("btc", 9)]);
        headers.insert(ChainName::new("eth"), vec![header("eth", 20), header("eth", 21)]);
        let block = CompositeBlock::new(
            BlockHash::zero(),
            BlockHeight::new(2),
            Timestamp::new(1_000_100),
            Distance::from_u64(10),
            Distance::from_u64(10),
            Distance::from_u64(20),
            headers,
            MinerKey::new("miner"),
        );
        assert_eq!(block.blockchain_headers_count, 3);
        assert_eq!(block.hash, block.compute_hash());
    }

    #[test]
    fn tampering_changes_digest() {
        let mut block = CompositeBlock::genesis();
        let original = block.hash;
        block.timestamp = block.timestamp + 1;
        assert_ne!(original, block.compute_hash());
    }

    #[test]
    fn borsh_round_trip() {
        let block = CompositeBlock::genesis();
        let bytes = block.try_to_vec().unwrap();
        let back = CompositeBlock::deserialize(&mut bytes.as_slice()).unwrap();
        assert_eq!(block, back);
    }
}
