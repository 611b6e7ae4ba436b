/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Pure predicates over composite blocks.
//!
//! Everything in this module is side-effect free and total: a malformed block makes a
//! predicate return `false` (or a [`ValidationError`]), never panic. Chain-adoption policy
//! lives in [`multiverse`](crate::multiverse); this module only answers questions about
//! blocks themselves.

use std::fmt::{self, Display, Formatter};

use borsh::BorshDeserialize;

use crate::types::{
    block::{ChildHeader, CompositeBlock},
    data_types::{BlockHeight, ChainName},
};

/// Structural validity of a single block: the digest matches the fields, the cached header
/// count is honest, the work quantities are non-zero, and a miner is credited.
pub fn is_valid_block(block: &CompositeBlock) -> bool {
    block.height.int() >= 1
        && block.hash == block.compute_hash()
        && block.blockchain_headers_count == block.count_headers()
        && !block.difficulty.is_zero()
        && !block.total_distance.is_zero()
        && !block.miner_key.is_empty()
}

/// Whether `next`'s accumulated work is consistent with extending `prev`:
/// `next.total_distance` must strictly exceed `prev.total_distance` and equal
/// `prev.total_distance + next.distance`.
pub fn validate_sequence_difficulty(prev: &CompositeBlock, next: &CompositeBlock) -> bool {
    next.total_distance > prev.total_distance
        && next.total_distance == &prev.total_distance + &next.distance
}

/// Whether `blocks`, ordered highest-first, forms one legal run of the chain: hashes link,
/// heights step down by exactly one, and total distance strictly decreases away from the
/// tip.
pub fn validate_block_sequence(blocks: &[CompositeBlock]) -> bool {
    blocks.windows(2).all(|pair| {
        let (child, parent) = (&pair[0], &pair[1]);
        child.previous_hash == parent.hash
            && child.height.int() == parent.height.int() + 1
            && child.total_distance > parent.total_distance
    })
}

/// Whether every child header anchored by `block` has been persisted by its rover with a
/// matching hash.
///
/// `lookup` reads the raw value under `{chain}.block.{height}`. A missing record fails the
/// check, and so does a record that does not decode or decodes to a header with a
/// different hash: an unreadable record cannot confirm anything.
pub fn validate_rovered_sequences(
    block: &CompositeBlock,
    mut lookup: impl FnMut(&ChainName, BlockHeight) -> Option<Vec<u8>>,
) -> bool {
    block.headers().all(|header| {
        match lookup(&header.blockchain, header.height) {
            None => false,
            Some(bytes) => match ChildHeader::deserialize(&mut bytes.as_slice()) {
                Ok(persisted) => persisted.hash == header.hash,
                Err(_) => false,
            },
        }
    })
}

/// The most recently minted child header anchored by `block`, by header timestamp.
pub fn newest_header(block: &CompositeBlock) -> Option<&ChildHeader> {
    block.headers().max_by_key(|header| header.timestamp)
}

/// Sum over child chains of the highest child header height referenced by `block`. The
/// first tiebreaker after height when comparing competing blocks.
pub fn children_height_sum(block: &CompositeBlock) -> u64 {
    block
        .blockchain_headers
        .values()
        .filter_map(|headers| headers.iter().map(|header| header.height.int()).max())
        .sum()
}

/// Error describing why a downloaded block range does not splice onto the local chain.
#[derive(Debug)]
pub enum ValidationError {
    /// The range is empty.
    EmptyRange,
    /// Two adjacent blocks in the range do not link.
    BrokenSequence { at_height: BlockHeight },
    /// The lowest block's parent is persisted locally but has a different hash.
    BoundaryMismatch { boundary_height: BlockHeight },
    /// The lowest block's parent is not persisted locally at all.
    MissingBoundary { boundary_height: BlockHeight },
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::EmptyRange => write!(f, "empty block range"),
            ValidationError::BrokenSequence { at_height } => {
                write!(f, "sequence breaks at height {}", at_height)
            }
            ValidationError::BoundaryMismatch { boundary_height } => {
                write!(
                    f,
                    "range does not link to the persisted block at height {}",
                    boundary_height
                )
            }
            ValidationError::MissingBoundary { boundary_height } => {
                write!(f, "no persisted block at boundary height {}", boundary_height)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use borsh::BorshSerialize;

    use crate::types::data_types::{BlockHash, Distance, MinerKey, Timestamp};

    use super::*;

    fn chain(names_and_heights: &[(&str, &[u64])]) -> BTreeMap<ChainName, Vec<ChildHeader>> {
        names_and_heights
            .iter()
            .map(|(name, heights)| {
                (
                    ChainName::new(*name),
                    heights
                        .iter()
                        .map(|height| ChildHeader {
                            blockchain: ChainName::new(*name),
                            height: BlockHeight::new(*height),
                            hash: format!("{}:{}", name, height),
                            merkle_root: format!("mr:{}:{}", name, height),
                            timestamp: Timestamp::new(1_000 + height),
                        })
                        .collect(),
                )
            })
            .collect()
    }

    fn block(height: u64, previous: BlockHash, total: u64, distance: u64) -> CompositeBlock {
        CompositeBlock::new(
            previous,
            BlockHeight::new(height),
            Timestamp::new(2_000 + height),
            Distance::from_u64(7),
            Distance::from_u64(distance),
            Distance::from_u64(total),
            chain(&[("btc", &[height]), ("eth", &[height * 2])]),
            MinerKey::new("miner"),
        )
    }

    #[test]
    fn valid_block_passes() {
        assert!(is_valid_block(&block(5, BlockHash::zero(), 50, 10)));
    }

    #[test]
    fn tampered_hash_fails() {
        let mut b = block(5, BlockHash::zero(), 50, 10);
        b.total_distance = Distance::from_u64(51);
        assert!(!is_valid_block(&b));
    }

    #[test]
    fn dishonest_header_count_fails() {
        let mut b = block(5, BlockHash::zero(), 50, 10);
        b.blockchain_headers_count = 9;
        b.hash = b.compute_hash();
        assert!(!is_valid_block(&b));
    }

    #[test]
    fn sequence_difficulty_requires_exact_accumulation() {
        let parent = block(5, BlockHash::zero(), 50, 10);
        let child = block(6, parent.hash, 60, 10);
        assert!(validate_sequence_difficulty(&parent, &child));

        let drifting = block(6, parent.hash, 61, 10);
        assert!(!validate_sequence_difficulty(&parent, &drifting));
    }

    #[test]
    fn block_sequence_links_pairwise() {
        let parent = block(5, BlockHash::zero(), 50, 10);
        let child = block(6, parent.hash, 60, 10);
        let grandchild = block(7, child.hash, 70, 10);
        assert!(validate_block_sequence(&[
            grandchild.clone(),
            child.clone(),
            parent.clone()
        ]));
        assert!(!validate_block_sequence(&[grandchild, parent]));
    }

    #[test]
    fn children_height_sum_takes_max_per_chain() {
        let b = CompositeBlock::new(
            BlockHash::zero(),
            BlockHeight::new(3),
            Timestamp::new(2_003),
            Distance::from_u64(7),
            Distance::from_u64(10),
            Distance::from_u64(30),
            chain(&[("btc", &[4, 9, 7]), ("eth", &[21, 20])]),
            MinerKey::new("miner"),
        );
        assert_eq!(children_height_sum(&b), 9 + 21);
        assert_eq!(
            newest_header(&b).unwrap().height,
            BlockHeight::new(21)
        );
    }

    #[test]
    fn rovered_sequences_require_persisted_headers() {
        let b = block(5, BlockHash::zero(), 50, 10);
        // Missing and undecodable records both fail the check.
        assert!(!validate_rovered_sequences(&b, |_, _| None));
        assert!(!validate_rovered_sequences(&b, |_, _| Some(Vec::new())));
    }

    #[test]
    fn rovered_sequences_match_persisted_hashes() {
        let b = block(5, BlockHash::zero(), 50, 10);

        // Records that decode to the anchored headers pass.
        let anchored: Vec<ChildHeader> = b.headers().cloned().collect();
        assert!(validate_rovered_sequences(&b, |chain, height| {
            anchored
                .iter()
                .find(|h| &h.blockchain == chain && h.height == height)
                .map(|h| h.try_to_vec().unwrap())
        }));

        // A decodable record whose hash disagrees fails.
        assert!(!validate_rovered_sequences(&b, |chain, height| {
            let mut persisted = anchored
                .iter()
                .find(|h| &h.blockchain == chain && h.height == height)
                .cloned()?;
            persisted.hash = format!("forked:{}", persisted.hash);
            Some(persisted.try_to_vec().unwrap())
        }));
    }
}
