/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Typed access to the chain's key namespace.
//!
//! Every key the core touches is built and read here; no other module forms raw keys. Reads
//! deserialize with borsh and surface [`StoreError::Corrupt`] on decode failure, except for
//! the soft-fail reads ([`ChainStore::parent_block`], [`ChainStore::sync_lock`]) which log a
//! warning and return `None` instead.
//!
//! [`ChainStoreCamera`] hands out read-only [snapshots](ChainStoreSnapshot) so the protocol
//! thread can serve range requests without touching the writable facade.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::store::{KVGet, KVStore, WriteBatch, WriteError};
use crate::types::{
    block::CompositeBlock,
    data_types::{BlockHeight, ChainName},
};

/// Key constructors for the chain namespace.
pub mod keys {
    use super::*;

    pub const LATEST_BLOCK: &[u8] = b"bc.block.latest";
    pub const PARENT_BLOCK: &[u8] = b"bc.block.parent";
    pub const DHT_QUORUM: &[u8] = b"bc.dht.quorum";
    pub const SYNC_LOCK: &[u8] = b"synclock";

    pub fn block_at_height(height: BlockHeight) -> Vec<u8> {
        format!("bc.block.{}", height).into_bytes()
    }

    pub fn pending_block(height: BlockHeight) -> Vec<u8> {
        format!("pending.bc.block.{}", height).into_bytes()
    }

    pub fn child_block(chain: &ChainName, height: BlockHeight) -> Vec<u8> {
        format!("{}.block.{}", chain, height).into_bytes()
    }
}

/// The writable chain-store facade handed to the engine thread.
#[derive(Clone)]
pub struct ChainStore<K: KVStore> {
    kv: K,
}

impl<K: KVStore> ChainStore<K> {
    pub fn new(kv: K) -> ChainStore<K> {
        ChainStore { kv }
    }

    /// A read-only camera over the same underlying store.
    pub fn camera(&self) -> ChainStoreCamera<K> {
        ChainStoreCamera::new(self.kv.clone())
    }

    /// The persisted chain tip, if any.
    pub fn latest_block(&self) -> Result<Option<CompositeBlock>, StoreError> {
        get_block(&self.kv, keys::LATEST_BLOCK, Key::LatestBlock)
    }

    /// The tip's parent. Soft-fail: a missing or undecodable record reads as `None`.
    pub fn parent_block(&self) -> Option<CompositeBlock> {
        match get_block(&self.kv, keys::PARENT_BLOCK, Key::ParentBlock) {
            Ok(block) => block,
            Err(err) => {
                log::warn!("soft-fail read: {}", err);
                None
            }
        }
    }

    /// The block persisted at `height`, if any.
    pub fn block_at_height(&self, height: BlockHeight) -> Result<Option<CompositeBlock>, StoreError> {
        get_block(
            &self.kv,
            &keys::block_at_height(height),
            Key::BlockAtHeight { height },
        )
    }

    /// The pending candidate persisted at `height`, if any.
    pub fn pending_block(&self, height: BlockHeight) -> Result<Option<CompositeBlock>, StoreError> {
        get_block(
            &self.kv,
            &keys::pending_block(height),
            Key::PendingBlock { height },
        )
    }

    /// Persist a pending candidate under its height.
    pub fn put_pending_block(&mut self, block: &CompositeBlock) -> Result<(), StoreError> {
        let mut wb = K::WriteBatch::new();
        wb.set(
            &keys::pending_block(block.height),
            &block.try_to_vec().unwrap(),
        );
        self.kv.write(wb).map_err(|source| StoreError::WriteFailed {
            key: Key::PendingBlock {
                height: block.height,
            },
            source,
        })
    }

    /// Drop the pending candidate at `height`, once that height is settled.
    pub fn delete_pending_block(&mut self, height: BlockHeight) -> Result<(), StoreError> {
        let mut wb = K::WriteBatch::new();
        wb.delete(&keys::pending_block(height));
        self.kv.write(wb).map_err(|source| StoreError::WriteFailed {
            key: Key::PendingBlock { height },
            source,
        })
    }

    /// A child-chain header block persisted by a rover. Read-only from the core.
    pub fn child_block(&self, chain: &ChainName, height: BlockHeight) -> Option<Vec<u8>> {
        self.kv.get(&keys::child_block(chain, height))
    }

    /// Make `block` the durable chain tip: writes `bc.block.latest`, demotes the previous
    /// tip to `bc.block.parent`, and records the block under its height, atomically.
    ///
    /// A failure here is fatal to the caller; the previous tip remains intact.
    pub fn commit_tip(&mut self, block: &CompositeBlock) -> Result<(), StoreError> {
        let bytes = block.try_to_vec().unwrap();
        let mut wb = K::WriteBatch::new();
        if let Some(old_tip) = self.latest_block()? {
            wb.set(keys::PARENT_BLOCK, &old_tip.try_to_vec().unwrap());
        }
        wb.set(keys::LATEST_BLOCK, &bytes);
        wb.set(&keys::block_at_height(block.height), &bytes);
        self.kv.write(wb).map_err(|source| StoreError::WriteFailed {
            key: Key::LatestBlock,
            source,
        })
    }

    /// Persist a historical block under its height only, leaving the tip untouched.
    pub fn put_block_at_height(&mut self, block: &CompositeBlock) -> Result<(), StoreError> {
        let mut wb = K::WriteBatch::new();
        wb.set(
            &keys::block_at_height(block.height),
            &block.try_to_vec().unwrap(),
        );
        self.kv.write(wb).map_err(|source| StoreError::WriteFailed {
            key: Key::BlockAtHeight {
                height: block.height,
            },
            source,
        })
    }

    /// The persisted peer quorum, a string-encoded integer.
    pub fn quorum(&self) -> Result<Option<u64>, StoreError> {
        match self.kv.get(keys::DHT_QUORUM) {
            None => Ok(None),
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Some)
                .ok_or(StoreError::Corrupt {
                    key: Key::DhtQuorum,
                    source: None,
                }),
        }
    }

    pub fn put_quorum(&mut self, quorum: u64) -> Result<(), StoreError> {
        let mut wb = K::WriteBatch::new();
        wb.set(keys::DHT_QUORUM, quorum.to_string().as_bytes());
        self.kv.write(wb).map_err(|source| StoreError::WriteFailed {
            key: Key::DhtQuorum,
            source,
        })
    }

    /// The sync-lock record. Soft-fail; `None` means no lock was ever taken. A record with
    /// height 1 means unlocked.
    pub fn sync_lock(&self) -> Option<CompositeBlock> {
        match get_block(&self.kv, keys::SYNC_LOCK, Key::SyncLock) {
            Ok(block) => block,
            Err(err) => {
                log::warn!("soft-fail read: {}", err);
                None
            }
        }
    }

    /// Take the sync lock by recording the block that motivated the resync. The record's
    /// timestamp should be the lock time; staleness is judged against it.
    pub fn lock_sync(&mut self, block: &CompositeBlock) -> Result<(), StoreError> {
        let mut wb = K::WriteBatch::new();
        wb.set(keys::SYNC_LOCK, &block.try_to_vec().unwrap());
        self.kv.write(wb).map_err(|source| StoreError::WriteFailed {
            key: Key::SyncLock,
            source,
        })
    }

    /// Release the sync lock by resetting the record to the genesis sentinel.
    pub fn release_sync_lock(&mut self) -> Result<(), StoreError> {
        self.lock_sync(&CompositeBlock::genesis())
    }
}

/// Read-only handle over the store, cheap to clone into other threads.
#[derive(Clone)]
pub struct ChainStoreCamera<K: KVStore> {
    kv: K,
}

impl<K: KVStore> ChainStoreCamera<K> {
    pub fn new(kv: K) -> ChainStoreCamera<K> {
        ChainStoreCamera { kv }
    }

    /// A consistent snapshot of the chain state.
    pub fn snapshot(&self) -> ChainStoreSnapshot<K::Snapshot<'_>> {
        ChainStoreSnapshot(self.kv.snapshot())
    }
}

/// Snapshot-scoped reads used to serve protocol requests.
pub struct ChainStoreSnapshot<S: KVGet>(S);

impl<S: KVGet> ChainStoreSnapshot<S> {
    /// The persisted chain tip, if any.
    pub fn latest_block(&self) -> Result<Option<CompositeBlock>, StoreError> {
        get_block(&self.0, keys::LATEST_BLOCK, Key::LatestBlock)
    }

    /// Bulk-fetch persisted blocks with heights in `[max(2, low), high]`. Missing heights
    /// shorten the result; they are not an error. Blocks are returned height-ascending.
    pub fn blocks_in_range(
        &self,
        low: BlockHeight,
        high: BlockHeight,
    ) -> Result<Vec<CompositeBlock>, StoreError> {
        let low = low.int().max(2);
        let mut blocks = Vec::new();
        for height in low..=high.int() {
            let height = BlockHeight::new(height);
            if let Some(block) = get_block(
                &self.0,
                &keys::block_at_height(height),
                Key::BlockAtHeight { height },
            )? {
                blocks.push(block);
            }
        }
        Ok(blocks)
    }
}

fn get_block(
    kv: &impl KVGet,
    raw_key: &[u8],
    key: Key,
) -> Result<Option<CompositeBlock>, StoreError> {
    match kv.get(raw_key) {
        None => Ok(None),
        Some(bytes) => CompositeBlock::deserialize(&mut bytes.as_slice())
            .map(Some)
            .map_err(|err| StoreError::Corrupt {
                key,
                source: Some(err),
            }),
    }
}

/// Error when reading or writing the chain namespace.
#[derive(Debug)]
pub enum StoreError {
    /// The value under `key` exists but does not deserialize to its expected type.
    Corrupt {
        key: Key,
        source: Option<std::io::Error>,
    },
    /// The store rejected a write to `key`.
    WriteFailed { key: Key, source: WriteError },
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Corrupt { key, source } => match source {
                Some(source) => write!(f, "corrupt value under {}: {}", key, source),
                None => write!(f, "corrupt value under {}", key),
            },
            StoreError::WriteFailed { key, source } => {
                write!(f, "write to {} failed: {}", key, source)
            }
        }
    }
}

/// The typed keys of the chain namespace, for error reporting. Child-chain records are
/// absent: the core reads them as raw bytes and never reports errors against them.
#[derive(Debug)]
pub enum Key {
    LatestBlock,
    ParentBlock,
    BlockAtHeight { height: BlockHeight },
    PendingBlock { height: BlockHeight },
    DhtQuorum,
    SyncLock,
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Key::LatestBlock => write!(f, "Latest Block"),
            Key::ParentBlock => write!(f, "Parent Block"),
            Key::BlockAtHeight { height } => write!(f, "Block at height {}", height),
            Key::PendingBlock { height } => write!(f, "Pending block at height {}", height),
            Key::DhtQuorum => write!(f, "DHT Quorum"),
            Key::SyncLock => write!(f, "Sync Lock"),
        }
    }
}
