/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The consensus-and-gossip core of a multi-chain block node.
//!
//! A node of this kind maintains a local best chain of *composite blocks*, each of which
//! cryptographically anchors headers from several external child blockchains. Nodes gossip
//! blocks over a peer-to-peer overlay, adopt the best chain by a weighted distance metric,
//! and coordinate a pool of mining worker processes that search for the next block.
//!
//! This crate implements the three tightly coupled subsystems at the heart of such a node,
//! plus their immediate collaborator seams:
//!
//! - The [multiverse]: the in-memory best-chain window with the accept / replace / resync
//!   decision logic.
//! - The [protocol] engine and [codec]: a tag-framed request/response protocol for
//!   propagating the tip, requesting block ranges, and announcing new blocks, running over
//!   a pluggable [overlay] transport.
//! - The [worker_pool]: supervised, heartbeat-guarded miner child processes with durable
//!   crash recovery.
//!
//! The [engine] owns all of them and routes [events] between them; [store] defines the
//! pluggable persistence the node lives on. Rovers (the per-child-chain harvesters), the
//! concrete key-value store, and the concrete overlay library are collaborators provided
//! by the embedding application.

pub mod block_pool;

pub mod codec;

pub mod config;

pub mod engine;

pub mod event_bus;

pub mod events;

pub mod logging;

pub mod multiverse;

pub mod overlay;

pub mod peers;

pub mod protocol;

pub mod store;

pub mod types;

pub mod validation;

pub mod worker_pool;

// Re-exports
pub use engine::Engine;
pub use multiverse::Multiverse;
