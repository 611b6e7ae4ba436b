/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that [initialize](Engine::initialize) and [start](Engine::start) the node
//! core, as well as [the type](Engine) which keeps it alive.
//!
//! The engine owns every component and the internal bus. Four threads run under it:
//!
//! 1. The **protocol engine** polls the overlay, decodes frames, serves read requests and
//!    forwards write frames to the dispatcher (see [protocol](crate::protocol)).
//! 2. The **dispatcher** is the single logical core thread: it owns the
//!    [multiverse](crate::multiverse), the [block pool](crate::block_pool) and the chain
//!    store's write path, so chain adoption is serialized by construction.
//! 3. The **pool supervisor** drives the [worker pool](crate::worker_pool) and feeds mined
//!    solutions back into the dispatcher.
//! 4. The optional **event bus** fires logging and user handlers (see
//!    [event_bus](crate::event_bus)).
//!
//! Components hold channel senders into each other, never back-references; dropping the
//! `Engine` shuts the threads down in dependency order.

use std::collections::{BTreeMap, HashSet};
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::SystemTime;

use crate::block_pool::BlockPool;
use crate::codec::Frame;
use crate::config::Configuration;
use crate::event_bus::{start_event_bus, EventHandlers, UserHandlers};
use crate::events::*;
use crate::multiverse::Multiverse;
use crate::overlay::Overlay;
use crate::peers::PeerManager;
use crate::protocol::{ProtocolEngine, SenderHandle};
use crate::store::chain_store::{ChainStore, ChainStoreCamera, StoreError};
use crate::store::KVStore;
use crate::types::{
    block::{ChildHeader, CompositeBlock},
    data_types::{BlockHeight, ChainName},
};
use crate::worker_pool::{
    backend::MinerBackend,
    messages::WorkAssignment,
    PoolNotice, WorkerError, WorkerPool,
};

/// Commands the dispatcher sends to the pool supervisor thread.
pub(crate) enum PoolCommand {
    Work(WorkAssignment),
    AbortAll,
    DismissAll,
}

pub struct Engine<K: KVStore, N: Overlay> {
    camera: ChainStoreCamera<K>,
    dispatcher_tx: Sender<Event>,
    rover_tx: Sender<ChildHeader>,
    pool_commands: Sender<PoolCommand>,
    sender: SenderHandle<N>,
    failed: Arc<AtomicBool>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
    dispatcher: Option<JoinHandle<()>>,
    dispatcher_shutdown: Sender<()>,
    pool_supervisor: Option<JoinHandle<()>>,
    pool_shutdown: Sender<()>,
    protocol: Option<JoinHandle<()>>,
    protocol_shutdown: Sender<()>,
}

impl<K: KVStore, N: Overlay> Engine<K, N> {
    /// Seed the durable state of a fresh node: a genesis tip and a released sync lock.
    /// Idempotent; an existing chain is left untouched.
    pub fn initialize(kv: K) -> Result<(), StoreError> {
        let mut store = ChainStore::new(kv);
        if store.latest_block()?.is_none() {
            store.commit_tip(&CompositeBlock::genesis())?;
        }
        store.release_sync_lock()
    }

    /// Bring the node up: recover and rise the worker pool, then start the protocol,
    /// dispatcher, pool supervisor and event bus threads.
    ///
    /// Fails if pool initialization fails; that error is fatal by policy and the caller
    /// should exit non-zero.
    pub fn start<B: MinerBackend>(
        kv: K,
        overlay: N,
        backend: B,
        config: Configuration,
        handlers: UserHandlers,
        rovers: HashSet<ChainName>,
    ) -> Result<Engine<K, N>, EngineError> {
        let store = ChainStore::new(kv.clone());
        let camera = store.camera();
        let sender = SenderHandle::new(overlay.clone());
        let failed = Arc::new(AtomicBool::new(false));

        // Seed the window with the persisted tip so the empty-window fast path only ever
        // applies to a chain with no history at all. Read before any thread is spawned: a
        // failure here must abort startup cleanly.
        let mut multiverse = Multiverse::new(store.clone(), config.multiverse.clone());
        match store.latest_block() {
            Ok(Some(tip)) => {
                multiverse.add_next_block(tip);
            }
            Ok(None) => (),
            Err(err) => return Err(EngineError::Store(err)),
        }

        // The bus is only started when there is something for it to do.
        let event_handlers = EventHandlers::new(config.log_events, handlers);
        let (bus_tx, event_bus, event_bus_shutdown) = if event_handlers.is_empty() {
            (None, None, None)
        } else {
            let (bus_tx, bus_rx) = mpsc::channel();
            let (shutdown_tx, shutdown_rx) = mpsc::channel();
            let bus = start_event_bus(event_handlers, bus_rx, shutdown_rx);
            (Some(bus_tx), Some(bus), Some(shutdown_tx))
        };

        // The pool must be up before anything can be mined; its failure aborts startup.
        let mut pool = WorkerPool::new(config.worker_pool.clone(), backend);
        pool.init().map_err(EngineError::PoolInit)?;
        pool.all_rise(config.miner_key.clone(), rovers)
            .map_err(EngineError::PoolInit)?;
        for (pid, _) in pool.heartbeats() {
            Event::WorkerSpawned(WorkerSpawnedEvent {
                timestamp: SystemTime::now(),
                pid,
            })
            .publish(&bus_tx);
        }

        let (dispatcher_tx, dispatcher_rx) = mpsc::channel();
        let (rover_tx, rover_rx) = mpsc::channel();
        let (pool_cmd_tx, pool_cmd_rx) = mpsc::channel();
        let pool_cmd_tx_for_engine = pool_cmd_tx.clone();

        let (protocol_shutdown, protocol_shutdown_rx) = mpsc::channel();
        let protocol = ProtocolEngine::new(
            overlay,
            sender.clone(),
            store.camera(),
            store.clone(),
            PeerManager::new(config.quorum_size, config.low_health_net),
            dispatcher_tx.clone(),
            bus_tx.clone(),
            protocol_shutdown_rx,
        )
        .start();

        let (pool_shutdown, pool_shutdown_rx) = mpsc::channel();
        let pool_supervisor = start_pool_supervisor(
            pool,
            pool_cmd_rx,
            dispatcher_tx.clone(),
            bus_tx.clone(),
            failed.clone(),
            pool_shutdown_rx,
        );

        let (dispatcher_shutdown, dispatcher_shutdown_rx) = mpsc::channel();
        let dispatcher = Dispatcher {
            multiverse,
            store,
            block_pool: BlockPool::new(),
            sender: sender.clone(),
            pool_commands: pool_cmd_tx,
            bus: bus_tx,
            config,
            latest_headers: BTreeMap::new(),
            syncing: false,
            failed: failed.clone(),
            inbox: dispatcher_rx,
            rover_inbox: rover_rx,
            shutdown_signal: dispatcher_shutdown_rx,
        }
        .start();

        Ok(Engine {
            camera,
            dispatcher_tx,
            rover_tx,
            pool_commands: pool_cmd_tx_for_engine,
            sender,
            failed,
            event_bus,
            event_bus_shutdown,
            dispatcher: Some(dispatcher),
            dispatcher_shutdown,
            pool_supervisor: Some(pool_supervisor),
            pool_shutdown,
            protocol: Some(protocol),
            protocol_shutdown,
        })
    }

    /// Read-only access to the chain state.
    pub fn camera(&self) -> &ChainStoreCamera<K> {
        &self.camera
    }

    /// Publisher onto the internal bus, e.g. for injecting blocks from a local source.
    pub fn event_publisher(&self) -> Sender<Event> {
        self.dispatcher_tx.clone()
    }

    /// Where rover collaborators push freshly harvested child headers.
    pub fn rover_handle(&self) -> Sender<ChildHeader> {
        self.rover_tx.clone()
    }

    /// Handle for writing frames to the overlay.
    pub fn sender(&self) -> &SenderHandle<N> {
        &self.sender
    }

    /// Whether an irrecoverable failure (tip write failure or a worker respawn storm) has
    /// been flagged. The caller should shut down and exit non-zero.
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    /// Tear the mining session down without stopping the node, e.g. after an unhealthy
    /// guard divergence.
    pub fn dismiss_pool(&self) {
        let _ = self.pool_commands.send(PoolCommand::DismissAll);
    }
}

impl<K: KVStore, N: Overlay> Drop for Engine<K, N> {
    fn drop(&mut self) {
        // Safety: the order of thread shutdown in this function is important. Publishers
        // ignore send errors, so consumers can go first; the protocol engine is shut down
        // last because every other thread may still emit outbound frames through it.

        if let (Some(shutdown), Some(bus)) =
            (self.event_bus_shutdown.take(), self.event_bus.take())
        {
            let _ = shutdown.send(());
            let _ = bus.join();
        }

        let _ = self.dispatcher_shutdown.send(());
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.join();
        }

        let _ = self.pool_shutdown.send(());
        if let Some(pool_supervisor) = self.pool_supervisor.take() {
            let _ = pool_supervisor.join();
        }

        let _ = self.protocol_shutdown.send(());
        if let Some(protocol) = self.protocol.take() {
            let _ = protocol.join();
        }
    }
}

/// The single logical core thread: consumes bus events and applies them to the multiverse,
/// the block pool and the store.
struct Dispatcher<K: KVStore, N: Overlay> {
    multiverse: Multiverse<K>,
    store: ChainStore<K>,
    block_pool: BlockPool,
    sender: SenderHandle<N>,
    pool_commands: Sender<PoolCommand>,
    bus: Option<Sender<Event>>,
    config: Configuration,
    latest_headers: BTreeMap<ChainName, ChildHeader>,
    syncing: bool,
    failed: Arc<AtomicBool>,
    inbox: Receiver<Event>,
    rover_inbox: Receiver<ChildHeader>,
    shutdown_signal: Receiver<()>,
}

impl<K: KVStore, N: Overlay> Dispatcher<K, N> {
    fn start(mut self) -> JoinHandle<()> {
        thread::spawn(move || loop {
            match self.shutdown_signal.try_recv() {
                Ok(()) => return,
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => {
                    unreachable!("the dispatcher's shutdown channel has no senders left")
                }
            }

            let mut worked = false;
            while let Ok(header) = self.rover_inbox.try_recv() {
                self.on_rovered_header(header);
                worked = true;
            }
            if let Ok(event) = self.inbox.try_recv() {
                self.handle_event(event);
                worked = true;
            }
            if !worked {
                thread::yield_now();
            }
        })
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::PutBlock(event) => {
                let context = event.context.clone();
                self.republish(|| {
                    Event::PutBlock(PutBlockEvent {
                        timestamp: event.timestamp,
                        data: event.data.clone(),
                        context: event.context.clone(),
                    })
                });
                self.on_block(event.data, context);
            }
            Event::MineSolution(event) => {
                self.republish(|| {
                    Event::MineSolution(MineSolutionEvent {
                        timestamp: event.timestamp,
                        block: event.block.clone(),
                        iterations: event.iterations,
                        time_diff: event.time_diff,
                    })
                });
                self.on_block(event.block, EventContext::local());
            }
            Event::PutBlockList(event) => {
                self.republish(|| {
                    Event::PutBlockList(PutBlockListEvent {
                        timestamp: event.timestamp,
                        data: event.data.clone(),
                        context: event.context.clone(),
                    })
                });
                self.on_block_list(event.data);
            }
            Event::PutMultiverse(event) => {
                self.republish(|| {
                    Event::PutMultiverse(PutMultiverseEvent {
                        timestamp: event.timestamp,
                        data: event.data.clone(),
                        context: event.context.clone(),
                    })
                });
                self.on_block_list(event.data);
            }
            Event::AnnounceNewBlock(event) => {
                self.sender
                    .broadcast(&Frame::HighestBlock(event.data.clone()));
                self.republish(|| Event::AnnounceNewBlock(event));
            }
            Event::GetBlockList(event) => {
                let frame = Frame::GetBlockList {
                    low: event.low,
                    high: event.high,
                };
                match event.context.connection_id {
                    Some(conn) => self.sender.send(conn, &frame),
                    None => self.sender.broadcast(&frame),
                }
                self.republish(|| Event::GetBlockList(event));
            }
            Event::GetMultiverse(event) => {
                let frame = Frame::GetMultiverse {
                    low: event.low,
                    high: event.high,
                };
                match event.context.connection_id {
                    Some(conn) => self.sender.send(conn, &frame),
                    None => self.sender.broadcast(&frame),
                }
                self.republish(|| Event::GetMultiverse(event));
            }
            Event::Qsend(event) => {
                if let Some(conn) = event.context.connection_id {
                    self.sender.send_raw(conn, event.data.clone());
                }
                self.republish(|| Event::Qsend(event));
            }
            // Notifications pass straight through to the bus.
            other => other.publish(&self.bus),
        }
    }

    // Republishing keeps the bus getting one copy of each routed event without requiring
    // `Event` to be `Clone`.
    fn republish(&self, event: impl FnOnce() -> Event) {
        if self.bus.is_some() {
            event().publish(&self.bus);
        }
    }

    /// Evaluate one arriving block: extend the tip, or fall back to a resync request, or
    /// buffer it while a sync is in flight.
    fn on_block(&mut self, block: CompositeBlock, context: EventContext) {
        if self.multiverse.has_block(&block) {
            return;
        }
        if self.multiverse.add_next_block(block.clone()) {
            self.commit_and_announce(&block);
            self.drain_block_pool();
            self.dispatch_work();
            return;
        }
        if self.multiverse.add_resync_request(&block, true) {
            self.begin_sync(&block, context);
            return;
        }
        if self.syncing {
            self.buffer_candidate(block);
        }
    }

    // Candidates that cannot be evaluated yet are buffered in memory and recorded under
    // their pending key, so a restart mid-sync does not lose them.
    fn buffer_candidate(&mut self, block: CompositeBlock) {
        if let Err(err) = self.store.put_pending_block(&block) {
            log::warn!("failed to persist pending candidate: {}", err);
        }
        self.block_pool.push(block);
    }

    fn commit_and_announce(&mut self, block: &CompositeBlock) {
        if let Err(err) = self.store.commit_tip(block) {
            // The durable tip could not be advanced; by policy this is irrecoverable.
            log::error!("fatal: {}", err);
            self.failed.store(true, Ordering::Relaxed);
            return;
        }
        Event::ExtendTip(ExtendTipEvent {
            timestamp: SystemTime::now(),
            block: block.clone(),
        })
        .publish(&self.bus);
        self.sender.broadcast(&Frame::HighestBlock(block.clone()));
        self.republish(|| {
            Event::AnnounceNewBlock(AnnounceNewBlockEvent {
                timestamp: SystemTime::now(),
                data: block.clone(),
            })
        });
    }

    fn begin_sync(&mut self, block: &CompositeBlock, context: EventContext) {
        let low = match self.store.latest_block() {
            Ok(Some(tip)) => tip.height,
            _ => BlockHeight::new(2),
        };
        let high = block.height;
        if let Err(err) = self.store.lock_sync(block) {
            log::warn!("cannot take sync lock: {}", err);
            return;
        }
        self.syncing = true;
        let _ = self.pool_commands.send(PoolCommand::AbortAll);
        Event::StartSync(StartSyncEvent {
            timestamp: SystemTime::now(),
            low,
            high,
        })
        .publish(&self.bus);

        let frame = Frame::GetBlockList { low, high };
        match context.connection_id {
            Some(conn) => self.sender.send(conn, &frame),
            None => self.sender.broadcast(&frame),
        }
        self.buffer_candidate(block.clone());
    }

    /// A downloaded range arrived. If it splices onto the persisted chain, adopt its top as
    /// the new tip, release the sync lock and resume mining.
    fn on_block_list(&mut self, blocks: Vec<CompositeBlock>) {
        if blocks.is_empty() {
            return;
        }
        if let Err(err) = self.multiverse.validate_block_sequence_inline(&blocks) {
            log::warn!("discarding downloaded range: {}", err);
            return;
        }
        for block in blocks.iter().rev() {
            if let Err(err) = self.store.put_block_at_height(block) {
                log::warn!("failed to persist synced block: {}", err);
                return;
            }
        }
        let top = blocks.first().unwrap();
        let adopt = match self.store.latest_block() {
            Ok(Some(tip)) => top.total_distance > tip.total_distance,
            Ok(None) => true,
            Err(err) => {
                log::warn!("cannot compare synced range against tip: {}", err);
                false
            }
        };
        if adopt {
            if let Err(err) = self.store.commit_tip(top) {
                log::error!("fatal: {}", err);
                self.failed.store(true, Ordering::Relaxed);
                return;
            }
            self.multiverse.purge();
            self.multiverse.add_next_block(top.clone());
            Event::ExtendTip(ExtendTipEvent {
                timestamp: SystemTime::now(),
                block: top.clone(),
            })
            .publish(&self.bus);
        }
        if let Err(err) = self.store.release_sync_lock() {
            log::warn!("cannot release sync lock: {}", err);
        }
        self.syncing = false;
        Event::EndSync(EndSyncEvent {
            timestamp: SystemTime::now(),
            blocks_synced: blocks.len(),
        })
        .publish(&self.bus);
        self.drain_block_pool();
        self.dispatch_work();
    }

    fn drain_block_pool(&mut self) {
        loop {
            let tip_height = match self.multiverse.get_highest() {
                Some(tip) => tip.height,
                None => return,
            };
            match self.block_pool.take_next(tip_height) {
                Some(block) => {
                    let height = block.height;
                    if self.multiverse.add_next_block(block.clone()) {
                        self.commit_and_announce(&block);
                    }
                    if let Err(err) = self.store.delete_pending_block(height) {
                        log::warn!("failed to drop settled pending candidate: {}", err);
                    }
                }
                None => return,
            }
        }
    }

    fn on_rovered_header(&mut self, header: ChildHeader) {
        let advanced = match self.latest_headers.get(&header.blockchain) {
            Some(held) => header.height > held.height,
            None => true,
        };
        if advanced {
            self.latest_headers
                .insert(header.blockchain.clone(), header);
            self.dispatch_work();
        }
    }

    /// Hand the pool a fresh assignment built from the current tip and the newest child
    /// headers. No-op while syncing or before any header has been rovered.
    fn dispatch_work(&mut self) {
        if self.syncing || self.latest_headers.is_empty() {
            return;
        }
        let tip = match self.store.latest_block() {
            Ok(Some(tip)) => tip,
            _ => return,
        };
        let work = WorkAssignment {
            difficulty: tip.difficulty.clone(),
            previous_block: tip,
            headers: self.latest_headers.values().cloned().collect(),
            miner_key: self.config.miner_key.clone(),
        };
        let _ = self.pool_commands.send(PoolCommand::Work(work));
    }
}

/// Runs the worker pool on its own thread: executes dispatcher commands, pumps
/// supervision, and feeds solutions back to the dispatcher.
fn start_pool_supervisor<B: MinerBackend>(
    mut pool: WorkerPool<B>,
    commands: Receiver<PoolCommand>,
    dispatcher: Sender<Event>,
    bus: Option<Sender<Event>>,
    failed: Arc<AtomicBool>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => {
                pool.all_dismissed();
                return;
            }
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                pool.all_dismissed();
                return;
            }
        }

        while let Ok(command) = commands.try_recv() {
            match command {
                PoolCommand::Work(work) => pool.send_work(&work),
                PoolCommand::AbortAll => pool.abort_all(),
                PoolCommand::DismissAll => pool.all_dismissed(),
            }
        }

        match pool.pump() {
            Ok(notices) => {
                for notice in notices {
                    match notice {
                        PoolNotice::Solution {
                            block,
                            iterations,
                            time_diff,
                            ..
                        } => {
                            let _ = dispatcher.send(Event::MineSolution(MineSolutionEvent {
                                timestamp: SystemTime::now(),
                                block,
                                iterations,
                                time_diff,
                            }));
                        }
                        PoolNotice::WorkerRespawned { old_pid, new_pid } => {
                            Event::WorkerDied(WorkerDiedEvent {
                                timestamp: SystemTime::now(),
                                pid: old_pid,
                            })
                            .publish(&bus);
                            Event::WorkerSpawned(WorkerSpawnedEvent {
                                timestamp: SystemTime::now(),
                                pid: new_pid,
                            })
                            .publish(&bus);
                        }
                        PoolNotice::WorkerErrored { pid, description } => {
                            log::warn!("worker {} errored: {}", pid, description);
                        }
                    }
                }
            }
            Err(err) => {
                // Escalated supervision failure; treated like a pool-init failure.
                log::error!("fatal: {}", err);
                failed.store(true, Ordering::Relaxed);
                pool.all_dismissed();
                return;
            }
        }

        thread::yield_now();
    })
}

/// Error that aborts [`Engine::start`].
#[derive(Debug)]
pub enum EngineError {
    /// The worker pool could not be initialized or risen.
    PoolInit(WorkerError),
    /// Durable state could not be read or seeded.
    Store(StoreError),
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::PoolInit(source) => write!(f, "worker pool failed to start: {}", source),
            EngineError::Store(source) => write!(f, "chain store failure: {}", source),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(value: StoreError) -> Self {
        EngineError::Store(value)
    }
}

impl From<WorkerError> for EngineError {
    fn from(value: WorkerError) -> Self {
        EngineError::PoolInit(value)
    }
}
