//! Traits for pluggable persistence, and the typed chain-store facade built on them.
//!
//! The concrete embedded key-value store is a collaborator: the core only requires the
//! [`KVStore`]/[`KVGet`]/[`WriteBatch`] trait surface below. The facade in
//! [`chain_store`] confines every key the core reads or writes to one module.

pub mod chain_store;

/// A key-value store usable as the node's durable state. Writes are atomic per
/// [`WriteBatch`]; reads go through [`KVGet`], either live or via a [`Snapshot`](KVStore::Snapshot).
pub trait KVStore: KVGet + Clone + Send + 'static {
    type WriteBatch: WriteBatch;
    type Snapshot<'a>: 'a + KVGet;

    fn write(&mut self, wb: Self::WriteBatch) -> Result<(), WriteError>;
    fn clear(&mut self);
    fn snapshot<'b>(&'b self) -> Self::Snapshot<'_>;
}

pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
}

pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

/// The store failed to apply a write batch.
#[derive(Debug)]
pub struct WriteError(pub String);

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "key-value store write failed: {}", self.0)
    }
}
