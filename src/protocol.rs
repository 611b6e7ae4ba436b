/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The wire-protocol engine: reassembles chunks into frames, serves read requests from
//! store snapshots, and forwards write frames onto the internal bus.
//!
//! The engine runs on its own thread. It is the only component that polls the overlay, the
//! only writer of the peer book, and it never mutates chain state: accepted blocks flow to
//! the engine dispatcher as [`Event`]s and come back as outbound frames through the
//! [`SenderHandle`].
//!
//! ## Request serving
//!
//! Read requests (`0008R01`, `0006R01`, `0009R01`) are answered directly from a
//! [`ChainStoreSnapshot`](crate::store::chain_store::ChainStoreSnapshot), so a slow disk
//! cannot stall chain adoption. Range replies are height-descending and missing heights
//! simply shorten the reply.
//!
//! ## Failure policy
//!
//! A frame that fails to decode is dropped and logged; the peer behind it accumulates a
//! codec-error count and is disconnected once it exceeds the ban threshold.

use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use threadpool::ThreadPool;

use crate::codec::{Frame, Reassembler, Tag};
use crate::events::{
    Event, EventContext, PutBlockEvent, PutBlockListEvent, PutMultiverseEvent,
    ReceiveSyncRequestEvent, SendSyncResponseEvent,
};
use crate::overlay::{Overlay, OverlayInput};
use crate::peers::{PeerAction, PeerManager};
use crate::store::chain_store::{ChainStore, ChainStoreCamera};
use crate::store::KVStore;
use crate::types::{
    block::CompositeBlock,
    data_types::{BlockHeight, ConnectionId},
};

/// Handle for writing frames to the overlay without blocking the calling thread.
///
/// Serialization and the overlay write happen on a small worker pool, so a peer with a full
/// send buffer cannot stall the protocol or engine threads.
pub struct SenderHandle<N: Overlay> {
    overlay: N,
    workers: ThreadPool,
}

impl<N: Overlay> Clone for SenderHandle<N> {
    fn clone(&self) -> Self {
        SenderHandle {
            overlay: self.overlay.clone(),
            workers: self.workers.clone(),
        }
    }
}

impl<N: Overlay> SenderHandle<N> {
    const N_SENDERS: usize = 4;

    pub fn new(overlay: N) -> SenderHandle<N> {
        SenderHandle {
            overlay,
            workers: ThreadPool::new(Self::N_SENDERS),
        }
    }

    /// Send `frame` to the specified connection.
    pub fn send(&self, conn: ConnectionId, frame: &Frame) {
        self.send_raw(conn, frame.encode())
    }

    /// Send pre-encoded frame bytes to the specified connection.
    pub fn send_raw(&self, conn: ConnectionId, bytes: Vec<u8>) {
        let mut overlay = self.overlay.clone();
        self.workers.execute(move || {
            if let Err(err) = overlay.send(conn, bytes) {
                log::debug!("dropping outbound frame: {}", err);
            }
        });
    }

    /// Send `frame` to every live connection.
    pub fn broadcast(&self, frame: &Frame) {
        let bytes = frame.encode();
        let mut overlay = self.overlay.clone();
        self.workers.execute(move || overlay.broadcast(bytes));
    }
}

pub(crate) struct ProtocolEngine<N: Overlay, K: KVStore> {
    overlay: N,
    sender: SenderHandle<N>,
    camera: ChainStoreCamera<K>,
    store: ChainStore<K>,
    peer_manager: PeerManager,
    reassemblers: HashMap<ConnectionId, Reassembler>,
    event_publisher: Option<Sender<Event>>,
    dispatcher: Sender<Event>,
    shutdown_signal: Receiver<()>,
}

impl<N: Overlay, K: KVStore> ProtocolEngine<N, K> {
    pub(crate) fn new(
        overlay: N,
        sender: SenderHandle<N>,
        camera: ChainStoreCamera<K>,
        store: ChainStore<K>,
        peer_manager: PeerManager,
        dispatcher: Sender<Event>,
        event_publisher: Option<Sender<Event>>,
        shutdown_signal: Receiver<()>,
    ) -> Self {
        Self {
            overlay,
            sender,
            camera,
            store,
            peer_manager,
            reassemblers: HashMap::new(),
            event_publisher,
            dispatcher,
            shutdown_signal,
        }
    }

    pub(crate) fn start(mut self) -> JoinHandle<()> {
        thread::spawn(move || loop {
            match self.shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    unreachable!("the protocol engine's shutdown channel has no senders left")
                }
            }

            match self.overlay.recv() {
                Some(OverlayInput::Chunk { conn, bytes }) => {
                    let message = self
                        .reassemblers
                        .entry(conn)
                        .or_default()
                        .push_chunk(&bytes);
                    if let Some(message) = message {
                        self.on_message(conn, &message);
                    }
                }
                Some(OverlayInput::Connected { conn, peer }) => {
                    let actions = self.peer_manager.on_connect(conn, peer);
                    self.apply(actions);
                }
                Some(OverlayInput::Disconnected { conn }) => {
                    self.reassemblers.remove(&conn);
                    let actions = self.peer_manager.on_disconnect(conn);
                    self.apply(actions);
                }
                Some(OverlayInput::Discovered { peer }) => {
                    let actions = self.peer_manager.on_discovered(peer);
                    self.apply(actions);
                }
                None => thread::yield_now(),
            }
        })
    }

    fn on_message(&mut self, conn: ConnectionId, message: &[u8]) {
        let frame = match Frame::decode(message) {
            Ok(frame) => frame,
            Err(err) => {
                log::warn!("dropping message from {}: {}", conn, err);
                let actions = self.peer_manager.on_codec_error(conn);
                self.apply(actions);
                return;
            }
        };
        match frame {
            Frame::GetHighestBlock => {
                if let Ok(Some(tip)) = self.camera.snapshot().latest_block() {
                    self.sender.send(conn, &Frame::HighestBlock(tip));
                }
            }
            Frame::GetBlockList { low, high } => {
                let blocks = self.serve_range(conn, low, high, Tag::GetBlockList);
                self.sender.send(conn, &Frame::BlockList(blocks));
            }
            Frame::GetMultiverse { low, high } => {
                let blocks = self.serve_range(conn, low, high, Tag::GetMultiverse);
                self.sender.send(conn, &Frame::Multiverse(blocks));
            }
            Frame::BlockList(mut blocks) => {
                sort_height_descending(&mut blocks);
                let _ = self.dispatcher.send(Event::PutBlockList(PutBlockListEvent {
                    timestamp: SystemTime::now(),
                    data: blocks,
                    context: EventContext::from_connection(conn),
                }));
            }
            Frame::Multiverse(mut blocks) => {
                sort_height_descending(&mut blocks);
                let _ = self
                    .dispatcher
                    .send(Event::PutMultiverse(PutMultiverseEvent {
                        timestamp: SystemTime::now(),
                        data: blocks,
                        context: EventContext::from_connection(conn),
                    }));
            }
            Frame::HighestBlock(block) => {
                let local_height = self
                    .camera
                    .snapshot()
                    .latest_block()
                    .ok()
                    .flatten()
                    .map(|tip| tip.height);
                let actions = self.peer_manager.on_peer_tip(conn, block.height, local_height);
                self.apply(actions);
                let _ = self.dispatcher.send(Event::PutBlock(PutBlockEvent {
                    timestamp: SystemTime::now(),
                    data: block,
                    context: EventContext::from_connection(conn),
                }));
            }
            Frame::Intro {
                host,
                port,
                peer_id,
            } => {
                self.peer_manager
                    .on_intro(conn, peer_id, format!("{}:{}", host, port));
            }
            Frame::ListServices { services } => {
                if services.is_empty() {
                    let listing = Tag::ALL.iter().map(|tag| tag.as_str().to_string()).collect();
                    self.sender
                        .send(conn, &Frame::ListServices { services: listing });
                }
            }
        }
    }

    fn serve_range(
        &mut self,
        conn: ConnectionId,
        low: BlockHeight,
        high: BlockHeight,
        tag: Tag,
    ) -> Vec<CompositeBlock> {
        Event::ReceiveSyncRequest(ReceiveSyncRequestEvent {
            timestamp: SystemTime::now(),
            conn,
            low,
            high,
        })
        .publish(&self.event_publisher);

        // Replies are served in full: for any range, every persisted block inside it goes
        // back to the requester.
        let mut blocks = match self.camera.snapshot().blocks_in_range(low, high) {
            Ok(blocks) => blocks,
            Err(err) => {
                log::warn!("cannot serve {} range request: {}", tag.as_str(), err);
                Vec::new()
            }
        };
        sort_height_descending(&mut blocks);

        Event::SendSyncResponse(SendSyncResponseEvent {
            timestamp: SystemTime::now(),
            conn,
            blocks: blocks.len(),
        })
        .publish(&self.event_publisher);
        blocks
    }

    fn apply(&mut self, actions: Vec<PeerAction>) {
        for action in actions {
            match action {
                PeerAction::PersistQuorum(quorum) => {
                    if let Err(err) = self.store.put_quorum(quorum) {
                        log::warn!("failed to persist quorum: {}", err);
                    }
                }
                PeerAction::RequestTip(conn) => self.sender.send(conn, &Frame::GetHighestBlock),
                PeerAction::PushTip(conn) => {
                    if let Ok(Some(tip)) = self.camera.snapshot().latest_block() {
                        self.sender.send(conn, &Frame::HighestBlock(tip));
                    }
                }
                PeerAction::RestartDiscovery => self.overlay.start_discovery(),
                PeerAction::StopDiscovery => self.overlay.stop_discovery(),
                PeerAction::Disconnect(conn) => {
                    self.reassemblers.remove(&conn);
                    self.overlay.disconnect(conn);
                }
            }
        }
    }
}

/// Sort blocks by height, highest first, as range consumers expect.
pub fn sort_height_descending(blocks: &mut [CompositeBlock]) {
    blocks.sort_by(|a, b| b.height.cmp(&a.height));
}
