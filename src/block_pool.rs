/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Buffer for candidate blocks that arrive while a resync is in flight.
//!
//! Blocks gossiped during a sync cannot extend the tip yet; the pool holds them keyed by
//! height and releases them in strict height order once the chain catches up. The pool is
//! bounded: when full, the highest buffered height is evicted first, since the blocks
//! nearest the current tip are the ones needed soonest.

use std::collections::BTreeMap;

use crate::types::{block::CompositeBlock, data_types::BlockHeight};

/// Maximum number of buffered candidates.
pub const BLOCK_POOL_CAP: usize = 4096;

#[derive(Default)]
pub struct BlockPool {
    pending: BTreeMap<BlockHeight, CompositeBlock>,
}

impl BlockPool {
    pub fn new() -> BlockPool {
        BlockPool::default()
    }

    /// Number of buffered candidates.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Buffer `block`. A candidate already buffered at the same height is replaced only by
    /// one carrying strictly more accumulated work.
    pub fn push(&mut self, block: CompositeBlock) {
        match self.pending.get(&block.height) {
            Some(held) if held.total_distance >= block.total_distance => return,
            _ => {}
        }
        self.pending.insert(block.height, block);
        while self.pending.len() > BLOCK_POOL_CAP {
            let highest = *self.pending.keys().next_back().unwrap();
            self.pending.remove(&highest);
        }
    }

    /// Release the buffered candidate that directly extends a tip at `tip_height`, if one
    /// is held.
    pub fn take_next(&mut self, tip_height: BlockHeight) -> Option<CompositeBlock> {
        self.pending.remove(&(tip_height + 1))
    }

    /// Drop every buffered candidate, e.g. when a sync ends or its lock expires.
    pub fn purge(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::data_types::{BlockHash, Distance, MinerKey, Timestamp};
    use std::collections::BTreeMap as Headers;

    fn block(height: u64, total: u64) -> CompositeBlock {
        CompositeBlock::new(
            BlockHash::zero(),
            BlockHeight::new(height),
            Timestamp::new(5_000 + height),
            Distance::from_u64(7),
            Distance::from_u64(total),
            Distance::from_u64(total),
            Headers::new(),
            MinerKey::new("miner"),
        )
    }

    #[test]
    fn releases_in_height_order() {
        let mut pool = BlockPool::new();
        pool.push(block(13, 130));
        pool.push(block(11, 110));
        pool.push(block(12, 120));

        assert!(pool.take_next(BlockHeight::new(9)).is_none());
        assert_eq!(
            pool.take_next(BlockHeight::new(10)).unwrap().height,
            BlockHeight::new(11)
        );
        assert_eq!(
            pool.take_next(BlockHeight::new(11)).unwrap().height,
            BlockHeight::new(12)
        );
        assert_eq!(
            pool.take_next(BlockHeight::new(12)).unwrap().height,
            BlockHeight::new(13)
        );
        assert!(pool.is_empty());
    }

    #[test]
    fn same_height_keeps_the_heavier_candidate() {
        let mut pool = BlockPool::new();
        pool.push(block(11, 110));
        pool.push(block(11, 90));
        assert_eq!(
            pool.take_next(BlockHeight::new(10)).unwrap().total_distance,
            Distance::from_u64(110)
        );

        pool.push(block(11, 90));
        pool.push(block(11, 110));
        assert_eq!(
            pool.take_next(BlockHeight::new(10)).unwrap().total_distance,
            Distance::from_u64(110)
        );
    }

    #[test]
    fn purge_empties_the_pool() {
        let mut pool = BlockPool::new();
        pool.push(block(11, 110));
        pool.purge();
        assert!(pool.is_empty());
    }
}
