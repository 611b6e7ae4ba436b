/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The in-memory best-chain window and the chain-adoption rules.
//!
//! The multiverse holds at most [`WINDOW_LEN`] composite blocks ordered highest-first, and
//! decides, for every arriving block, whether to extend the tip ([`add_next_block`]),
//! replace it in place ([`add_best_block`]), or ask the caller to fetch a historical range
//! from peers ([`add_resync_request`]).
//!
//! Window invariants, maintained by every accepting path:
//! - `window[i].previous_hash == window[i + 1].hash` whenever both are defined,
//! - heights strictly decrease with index,
//! - `total_distance` strictly decreases with index.
//!
//! The window is a cache; the durable tip lives in the chain store and is written by the
//! engine, not here. Rejections are silent towards the sender: the block is dropped and the
//! reason logged.
//!
//! [`add_next_block`]: Multiverse::add_next_block
//! [`add_best_block`]: Multiverse::add_best_block
//! [`add_resync_request`]: Multiverse::add_resync_request

use std::collections::HashMap;

use crate::store::{
    chain_store::ChainStore,
    KVStore,
};
use crate::types::{
    block::CompositeBlock,
    data_types::{BlockHash, BlockHeight, Timestamp},
};
use crate::validation::{
    children_height_sum, is_valid_block, newest_header, validate_block_sequence,
    validate_rovered_sequences, validate_sequence_difficulty, ValidationError,
};

/// Maximum number of blocks held in the window.
pub const WINDOW_LEN: usize = 7;

/// A block more than this many heights above the tip cannot extend it; the caller must
/// resync instead.
pub const MAX_HEIGHT_JUMP: u64 = 6;

/// A block may be at most this many seconds older than the tip it extends.
pub const TIP_TIMESTAMP_TOLERANCE_SECS: u64 = 3;

/// A block older than this relative to the local clock is too stale to extend the tip.
pub const BLOCK_MAX_AGE_SECS: u64 = 27;

/// A sync lock older than this is considered abandoned and reset.
pub const SYNC_LOCK_TTL_SECS: u64 = 18;

/// A tip that has not advanced for this long is stale enough to justify a resync towards
/// any heavier chain.
pub const STALE_TIP_AGE_SECS: u64 = 32;

/// Above this height, resync candidates must carry a near-current timestamp.
pub const HIGH_CHAIN_HEIGHT: u64 = 100_000;

/// Allowed clock skew for resync candidates above [`HIGH_CHAIN_HEIGHT`].
pub const HIGH_CHAIN_MAX_SKEW_SECS: u64 = 15;

/// Tunables for the adoption rules. These should not change after construction.
#[derive(Clone)]
pub struct MultiverseConfig {
    /// Whether tip extension additionally requires the extending pair to pass the full
    /// inline sequence check. Off by default: the check subsumes the per-rule gates and in
    /// practice shunts every extension into same-height replacement.
    pub strict_sequence_check: bool,
}

impl Default for MultiverseConfig {
    fn default() -> MultiverseConfig {
        MultiverseConfig {
            strict_sequence_check: false,
        }
    }
}

pub struct Multiverse<K: KVStore> {
    window: Vec<CompositeBlock>,
    store: ChainStore<K>,
    config: MultiverseConfig,
    validity_cache: HashMap<BlockHash, bool>,
}

impl<K: KVStore> Multiverse<K> {
    pub fn new(store: ChainStore<K>, config: MultiverseConfig) -> Multiverse<K> {
        Multiverse {
            window: Vec::with_capacity(WINDOW_LEN),
            store,
            config,
            validity_cache: HashMap::new(),
        }
    }

    /// The current window, highest-first.
    pub fn window(&self) -> &[CompositeBlock] {
        &self.window
    }

    /// The highest block of the window, or none.
    pub fn get_highest(&self) -> Option<&CompositeBlock> {
        self.window.first()
    }

    /// The block at index 1, i.e. the parent of the highest block.
    pub fn get_parent_highest(&self) -> Option<&CompositeBlock> {
        self.window.get(1)
    }

    /// The lowest block of the window.
    pub fn get_lowest(&self) -> Option<&CompositeBlock> {
        self.window.last()
    }

    /// Whether a block with `block`'s hash is in the window.
    pub fn has_block(&self, block: &CompositeBlock) -> bool {
        self.window.iter().any(|held| held.hash == block.hash)
    }

    /// Empty the window and the validity cache, e.g. after a completed resync replaced the
    /// durable tip.
    pub fn purge(&mut self) {
        self.window.clear();
        self.validity_cache.clear();
    }

    /// Same-height replacement of the tip. Succeeds when the window is empty (seeding it
    /// with `block`), or when the block at index 1 is `block`'s parent and `block` carries
    /// strictly more accumulated work than the current highest.
    pub fn add_best_block(&mut self, block: CompositeBlock) -> bool {
        if self.window.is_empty() {
            self.window.push(block);
            return true;
        }
        let links_to_parent = self
            .get_parent_highest()
            .map(|parent| parent.hash == block.previous_hash)
            .unwrap_or(false);
        let heavier = block.total_distance > self.window[0].total_distance;
        if links_to_parent && heavier {
            log::info!(
                "replacing tip at height {} with heavier block",
                block.height
            );
            self.window[0] = block;
            true
        } else {
            log::debug!(
                "rejecting same-height replacement at height {}: links_to_parent={} heavier={}",
                block.height,
                links_to_parent,
                heavier
            );
            false
        }
    }

    /// The main acceptance rule: try to make `block` the new tip of the window.
    ///
    /// Exactly one invocation may be in flight at a time; the engine thread guarantees this
    /// by construction.
    pub fn add_next_block(&mut self, block: CompositeBlock) -> bool {
        if self.window.is_empty() {
            self.window.insert(0, block);
            return true;
        }

        let tip = match self.store.latest_block() {
            Ok(tip) => tip,
            Err(err) => {
                log::warn!("cannot read tip while evaluating block: {}", err);
                return false;
            }
        };
        let tip = match tip {
            Some(tip) => tip,
            None => {
                self.window.insert(0, block);
                self.trim_window();
                return true;
            }
        };

        // A persisted parent that does not match the tip's ancestry means the local tip is
        // corrupt; a same-height block with more work and consistent accumulation may
        // replace it in place.
        if let Some(parent) = self.store.parent_block() {
            if parent.hash != tip.previous_hash
                && tip.height == block.height
                && validate_sequence_difficulty(&parent, &block)
                && block.total_distance > tip.total_distance
                && block.timestamp >= tip.timestamp
            {
                log::info!("hotswapping corrupt tip at height {}", tip.height);
                self.window[0] = block;
                return true;
            }
        }

        if block.height == BlockHeight::genesis() {
            log::debug!("rejecting block: genesis is immutable");
            return false;
        }
        if block.height.int().saturating_sub(1) != tip.height.int() {
            log::debug!(
                "rejecting block at height {}: not a direct child of tip at height {}",
                block.height,
                tip.height
            );
            return false;
        }
        let block_weight = children_height_sum(&block);
        let tip_weight = children_height_sum(&tip);
        if block_weight < tip_weight {
            log::debug!(
                "rejecting block: child-chain weight {} below tip's {}",
                block_weight,
                tip_weight
            );
            return false;
        }
        if block_weight == tip_weight {
            let block_newest = newest_header(&block).map(|h| h.timestamp);
            let tip_newest = newest_header(&tip).map(|h| h.timestamp);
            if block_newest < tip_newest {
                log::debug!("rejecting block: equal weight but older child headers");
                return false;
            }
        }
        if block.height.int() > tip.height.int() + MAX_HEIGHT_JUMP {
            log::debug!("rejecting block: too far ahead of tip, resync required");
            return false;
        }
        if block.hash == tip.hash
            || block.total_distance < tip.total_distance
            || block.height < tip.height
        {
            log::debug!("rejecting block: no more work than the tip");
            return false;
        }
        if block.blockchain_headers_count == 0 {
            log::debug!("rejecting block: anchors no child headers");
            return false;
        }
        if block.timestamp + TIP_TIMESTAMP_TOLERANCE_SECS <= tip.timestamp {
            log::debug!("rejecting block: older than the tip");
            return false;
        }
        if block.timestamp + BLOCK_MAX_AGE_SECS < Timestamp::now() {
            log::debug!("rejecting block: too old relative to local clock");
            return false;
        }

        if block.previous_hash != tip.hash {
            return self.add_best_block(block);
        }
        if self.config.strict_sequence_check
            && block.height.int() > 2
            && !validate_block_sequence(&[block.clone(), tip])
        {
            return self.add_best_block(block);
        }

        self.window.insert(0, block);
        self.trim_window();
        true
    }

    /// Decide whether the node should pause mining and fetch a historical range from
    /// peers. Rules are evaluated in order; the first match wins. A `true` result only
    /// permits the protocol engine to issue range requests; it does not guarantee sync
    /// success.
    ///
    /// With `strict` set, candidate evaluation also requires the candidate's child headers
    /// to be persisted locally where the rules consult them.
    pub fn add_resync_request(&mut self, block: &CompositeBlock, strict: bool) -> bool {
        let now = Timestamp::now();

        if let Some(lock) = self.store.sync_lock() {
            if lock.height > BlockHeight::genesis() {
                if lock.timestamp + SYNC_LOCK_TTL_SECS < now {
                    log::warn!("resetting stale sync lock from height {}", lock.height);
                    if let Err(err) = self.store.release_sync_lock() {
                        log::warn!("failed to reset sync lock: {}", err);
                        return false;
                    }
                } else {
                    return false;
                }
            }
        }

        let tip = match self.store.latest_block() {
            Ok(tip) => tip,
            Err(err) => {
                log::warn!("cannot read tip while evaluating resync: {}", err);
                return false;
            }
        };

        if let Some(tip) = &tip {
            if !self.is_valid_block_cached(tip) && is_valid_block(block) {
                log::warn!("local tip at height {} is invalid, resyncing", tip.height);
                return true;
            }
        }
        if self.window.is_empty() || tip.is_none() {
            return true;
        }
        let tip = tip.unwrap();
        if tip.height == BlockHeight::genesis() && block.height > BlockHeight::genesis() {
            return true;
        }
        if block.hash == tip.hash {
            return false;
        }
        if block.height.int() > HIGH_CHAIN_HEIGHT
            && block.timestamp.abs_diff(now) > HIGH_CHAIN_MAX_SKEW_SECS
        {
            log::debug!("rejecting resync: high-chain candidate with skewed clock");
            return false;
        }
        if tip.timestamp + STALE_TIP_AGE_SECS < now && block.total_distance > tip.total_distance {
            log::info!("tip is stale, resyncing towards heavier chain");
            return true;
        }
        if self.window.len() < 2
            && block.total_distance > tip.total_distance
            && children_height_sum(block) > children_height_sum(&tip)
            && (!strict || self.validate_rovered_blocks(block))
        {
            return true;
        }
        if block.total_distance < tip.total_distance {
            return false;
        }
        if children_height_sum(block) <= children_height_sum(&tip) {
            return self.validate_rovered_blocks(block) && !self.validate_rovered_blocks(&tip);
        }
        false
    }

    /// Verify that a downloaded range, ordered highest-first, links internally and splices
    /// onto a persisted boundary block.
    pub fn validate_block_sequence_inline(
        &self,
        blocks: &[CompositeBlock],
    ) -> Result<(), ValidationError> {
        if blocks.is_empty() {
            return Err(ValidationError::EmptyRange);
        }
        if let Some(pair) = blocks
            .windows(2)
            .find(|pair| !validate_block_sequence(pair))
        {
            return Err(ValidationError::BrokenSequence {
                at_height: pair[0].height,
            });
        }
        let lowest = blocks.last().unwrap();
        if lowest.height.int() <= 2 {
            // The range bottoms out at the immutable genesis boundary.
            return Ok(());
        }
        let boundary_height = BlockHeight::new(lowest.height.int() - 1);
        match self.store.block_at_height(boundary_height) {
            Ok(Some(boundary)) if boundary.hash == lowest.previous_hash => Ok(()),
            Ok(Some(_)) => Err(ValidationError::BoundaryMismatch { boundary_height }),
            Ok(None) => Err(ValidationError::MissingBoundary { boundary_height }),
            Err(err) => {
                log::warn!("cannot read boundary block: {}", err);
                Err(ValidationError::MissingBoundary { boundary_height })
            }
        }
    }

    /// Whether every child header anchored by `block` has been persisted by its rover.
    pub fn validate_rovered_blocks(&self, block: &CompositeBlock) -> bool {
        let store = &self.store;
        validate_rovered_sequences(block, |chain, height| store.child_block(chain, height))
    }

    /// [`is_valid_block`] memoized by block hash. The tip is re-validated on every arriving
    /// block; caching keeps that O(1) after the first check.
    pub fn is_valid_block_cached(&mut self, block: &CompositeBlock) -> bool {
        if let Some(&validity) = self.validity_cache.get(&block.hash) {
            return validity;
        }
        let validity = is_valid_block(block);
        self.validity_cache.insert(block.hash, validity);
        validity
    }

    fn trim_window(&mut self) {
        if self.window.len() > WINDOW_LEN {
            self.window.truncate(WINDOW_LEN);
        }
    }
}
