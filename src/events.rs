/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Messages routed over the node's internal bus.
//!
//! ## Event enum
//!
//! Every topic of the internal bus is a variant of the [event enum](Event). The first group
//! of variants are the block-exchange topics fed by the protocol engine and consumed by the
//! engine's dispatcher; the rest are lifecycle notifications emitted after the
//! corresponding occurrence has completed (e.g. [`ExtendTipEvent`] fires only after the new
//! tip has been persisted).
//!
//! ## Registering event handlers
//!
//! Library users can register one handler closure per event type when building the engine;
//! default handlers that log each event as a CSV line are enabled via the engine
//! configuration and defined in [logging](crate::logging).

use std::sync::mpsc::Sender;
use std::time::SystemTime;

use crate::types::{
    block::CompositeBlock,
    data_types::{BlockHeight, ConnectionId},
};

/// Where a bus message came from, when it entered over the wire.
#[derive(Clone, Default)]
pub struct EventContext {
    pub remote_host: Option<String>,
    pub remote_port: Option<u16>,
    pub connection_id: Option<ConnectionId>,
}

impl EventContext {
    /// Context for a message that arrived on `conn`.
    pub fn from_connection(conn: ConnectionId) -> EventContext {
        EventContext {
            remote_host: None,
            remote_port: None,
            connection_id: Some(conn),
        }
    }

    /// Context for a message that originated locally.
    pub fn local() -> EventContext {
        EventContext::default()
    }
}

/// Enumerates all topics of the internal bus.
pub enum Event {
    // Block-exchange topics.
    PutBlock(PutBlockEvent),
    PutBlockList(PutBlockListEvent),
    PutMultiverse(PutMultiverseEvent),
    AnnounceNewBlock(AnnounceNewBlockEvent),
    Qsend(QsendEvent),
    GetBlockList(GetBlockListEvent),
    GetMultiverse(GetMultiverseEvent),

    // Lifecycle notifications.
    ExtendTip(ExtendTipEvent),
    StartSync(StartSyncEvent),
    EndSync(EndSyncEvent),
    ReceiveSyncRequest(ReceiveSyncRequestEvent),
    SendSyncResponse(SendSyncResponseEvent),
    MineSolution(MineSolutionEvent),
    WorkerSpawned(WorkerSpawnedEvent),
    WorkerDied(WorkerDiedEvent),
}

impl Event {
    /// Publishes this event on `publisher`, if a channel is defined.
    pub fn publish(self, publisher: &Option<Sender<Event>>) {
        if let Some(publisher) = publisher {
            let _ = publisher.send(self);
        }
    }
}

/// A single block arrived, over the wire or from a local miner, and awaits evaluation.
pub struct PutBlockEvent {
    pub timestamp: SystemTime,
    pub data: CompositeBlock,
    pub context: EventContext,
}

/// A full-sync block range arrived, already sorted height-descending.
pub struct PutBlockListEvent {
    pub timestamp: SystemTime,
    pub data: Vec<CompositeBlock>,
    pub context: EventContext,
}

/// A selective-sync block range arrived, already sorted height-descending.
pub struct PutMultiverseEvent {
    pub timestamp: SystemTime,
    pub data: Vec<CompositeBlock>,
    pub context: EventContext,
}

/// An accepted block should be announced to all peers.
pub struct AnnounceNewBlockEvent {
    pub timestamp: SystemTime,
    pub data: CompositeBlock,
}

/// Raw frame bytes should be written to one connection.
pub struct QsendEvent {
    pub timestamp: SystemTime,
    pub data: Vec<u8>,
    pub context: EventContext,
}

/// A full-sync range should be requested from peers.
pub struct GetBlockListEvent {
    pub timestamp: SystemTime,
    pub low: BlockHeight,
    pub high: BlockHeight,
    pub context: EventContext,
}

/// A selective-sync range should be requested from peers.
pub struct GetMultiverseEvent {
    pub timestamp: SystemTime,
    pub low: BlockHeight,
    pub high: BlockHeight,
    pub context: EventContext,
}

/// A block was adopted as the new tip and persisted.
pub struct ExtendTipEvent {
    pub timestamp: SystemTime,
    pub block: CompositeBlock,
}

/// The node paused mining and began fetching a range from peers.
pub struct StartSyncEvent {
    pub timestamp: SystemTime,
    pub low: BlockHeight,
    pub high: BlockHeight,
}

/// A sync finished (successfully or by lock expiry).
pub struct EndSyncEvent {
    pub timestamp: SystemTime,
    pub blocks_synced: usize,
}

/// A peer asked for a block range.
pub struct ReceiveSyncRequestEvent {
    pub timestamp: SystemTime,
    pub conn: ConnectionId,
    pub low: BlockHeight,
    pub high: BlockHeight,
}

/// A block range was served to a peer.
pub struct SendSyncResponseEvent {
    pub timestamp: SystemTime,
    pub conn: ConnectionId,
    pub blocks: usize,
}

/// A mining worker returned a solved block.
pub struct MineSolutionEvent {
    pub timestamp: SystemTime,
    pub block: CompositeBlock,
    pub iterations: u64,
    pub time_diff: u64,
}

/// A mining worker process came up and passed its first heartbeat.
pub struct WorkerSpawnedEvent {
    pub timestamp: SystemTime,
    pub pid: u32,
}

/// A mining worker process died or was killed.
pub struct WorkerDiedEvent {
    pub timestamp: SystemTime,
    pub pid: u32,
}
