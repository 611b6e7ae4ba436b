/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Supervision of the mining worker processes.
//!
//! The pool brings up `N = min(cpu_count, configured_max)` isolated workers
//! ([`all_rise`](WorkerPool::all_rise)), keeps them alive with heartbeats, records their
//! pids in a durable [guard file](guard) so a crashed node can kill orphans on restart,
//! and routes solved blocks back to the engine.
//!
//! ## Failure policy
//!
//! A single worker dying is routine: it is killed, removed from the guard, and replaced.
//! Three respawns within [`WorkerPoolConfig::respawn_window`] escalate to
//! [`WorkerError::RespawnStorm`], which the engine treats as a pool-init failure and
//! therefore fatal. Losing the guard file itself is also fatal: without it a crash could
//! leak miner processes.

pub mod backend;

pub mod guard;

pub mod messages;

use std::collections::{HashSet, VecDeque};
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use rand::RngCore;

use crate::types::data_types::{ChainName, MinerKey, MsgId, Timestamp};

use self::backend::{MinerBackend, MinerWorker};
use self::guard::{Guard, GuardFile, GuardWorker};
use self::messages::{PoolMessage, WorkAssignment, WorkerMessage};

/// Parameters that configure pool supervision. These should not change after
/// [`init`](WorkerPool::init).
#[derive(Clone)]
pub struct WorkerPoolConfig {
    /// Upper bound on the worker count; the effective count is
    /// `min(cpu_count, max_workers)`.
    pub max_workers: usize,
    /// Where the guard file lives, under the node's data directory.
    pub guard_path: PathBuf,
    /// How often each worker is probed with a heartbeat.
    pub heartbeat_interval: Duration,
    /// A worker silent for this long is killed and replaced.
    pub heartbeat_timeout: Duration,
    /// How long [`all_rise`](WorkerPool::all_rise) waits for every worker's first
    /// heartbeat.
    pub ready_timeout: Duration,
    /// A worker that does not acknowledge an abort within this window is killed.
    pub abort_timeout: Duration,
    /// Respawns within this window count towards the storm escalation.
    pub respawn_window: Duration,
    /// Respawn count at which supervision gives up and reports a pool failure.
    pub max_respawns: usize,
}

impl WorkerPoolConfig {
    pub fn new(guard_path: PathBuf, max_workers: usize) -> WorkerPoolConfig {
        WorkerPoolConfig {
            max_workers,
            guard_path,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            ready_timeout: Duration::from_secs(10),
            abort_timeout: Duration::from_secs(5),
            respawn_window: Duration::from_secs(60),
            max_respawns: 3,
        }
    }

    fn effective_workers(&self) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cpus.min(self.max_workers).max(1)
    }
}

/// Lifecycle state of one worker, as tracked by the supervisor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Spawned, first heartbeat not yet seen.
    Starting,
    /// Alive and idle.
    Ready,
    /// Alive with a work assignment in flight.
    Busy,
    /// Gone; awaiting replacement or dismissal.
    Dead,
}

/// What an outstanding request was for, so its resolution can drive the status machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RequestKind {
    Heartbeat,
    Work,
    Abort,
}

struct OutstandingRequest {
    msg_id: MsgId,
    kind: RequestKind,
    sent: Instant,
}

/// Supervisor-side bookkeeping for one worker.
pub struct WorkerState {
    pub pid: u32,
    last_heartbeat: Instant,
    last_probe: Instant,
    outstanding: VecDeque<OutstandingRequest>,
    pub status: WorkerStatus,
}

struct WorkerSlot<W: MinerWorker> {
    worker: W,
    state: WorkerState,
}

/// One mining session: a fresh 256-bit id, the identity being credited, the rovers whose
/// headers feed the candidates, and the live workers.
pub struct WorkSession<W: MinerWorker> {
    pub session_id: [u8; 32],
    pub started_at: Timestamp,
    pub miner_key: MinerKey,
    pub rovers: HashSet<ChainName>,
    workers: IndexMap<u32, WorkerSlot<W>>,
}

/// Something the supervisor observed that the engine should act on.
pub enum PoolNotice {
    /// A worker solved its assignment.
    Solution {
        pid: u32,
        block: crate::types::block::CompositeBlock,
        iterations: u64,
        time_diff: u64,
    },
    /// A worker was replaced after dying or going silent.
    WorkerRespawned { old_pid: u32, new_pid: u32 },
    /// A worker reported an error it could not recover from.
    WorkerErrored { pid: u32, description: String },
}

pub struct WorkerPool<B: MinerBackend> {
    config: WorkerPoolConfig,
    backend: B,
    guard: Guard,
    session: Option<WorkSession<B::Worker>>,
    respawns: VecDeque<Instant>,
}

impl<B: MinerBackend> WorkerPool<B> {
    pub fn new(config: WorkerPoolConfig, backend: B) -> WorkerPool<B> {
        let guard = Guard::open(config.guard_path.clone());
        WorkerPool {
            config,
            backend,
            guard,
            session: None,
            respawns: VecDeque::new(),
        }
    }

    /// Recover from any previous session: kill every pid the guard recorded, then clear
    /// it. Killing an already-dead pid is a no-op at the OS level.
    pub fn init(&mut self) -> Result<(), WorkerError> {
        if let Some(record) = self.guard.read()? {
            log::warn!(
                "found stale mining session {} with {} workers, reaping",
                record.session,
                record.workers.len()
            );
            for worker in &record.workers {
                self.backend.reap(worker.pid);
            }
            self.guard.clear()?;
        }
        Ok(())
    }

    /// Bring up the full worker complement and wait until every worker has answered its
    /// first heartbeat. Fails with [`WorkerError::ReadyTimeout`] if any worker stays
    /// silent past the configured deadline, dismissing whatever did come up.
    pub fn all_rise(
        &mut self,
        miner_key: MinerKey,
        rovers: HashSet<ChainName>,
    ) -> Result<usize, WorkerError> {
        let mut session_id = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut session_id);
        let started_at = Timestamp::now();
        self.guard.write(&GuardFile {
            session: hex(&session_id),
            timestamp: started_at.int(),
            workers: Vec::new(),
        })?;

        let mut session: WorkSession<B::Worker> = WorkSession {
            session_id,
            started_at,
            miner_key,
            rovers,
            workers: IndexMap::new(),
        };
        let target = self.config.effective_workers();
        for _ in 0..target {
            let mut worker = self.backend.spawn()?;
            let pid = worker.pid();
            let msg_id = MsgId::generate(pid);
            let now = Instant::now();
            let mut state = WorkerState {
                pid,
                last_heartbeat: now,
                last_probe: now,
                outstanding: VecDeque::new(),
                status: WorkerStatus::Starting,
            };
            if worker.send(&PoolMessage::Heartbeat { msg_id: msg_id.clone() }).is_err() {
                worker.kill();
                for (_, slot) in session.workers.iter_mut() {
                    slot.worker.kill();
                }
                self.guard.clear()?;
                return Err(WorkerError::ChannelClosed { pid });
            }
            state.outstanding.push_back(OutstandingRequest {
                msg_id,
                kind: RequestKind::Heartbeat,
                sent: now,
            });
            session.workers.insert(pid, WorkerSlot { worker, state });
            self.write_guard_for(&session)?;
        }
        self.session = Some(session);

        let deadline = Instant::now() + self.config.ready_timeout;
        loop {
            self.drain_worker_messages();
            let session = self.session.as_ref().unwrap();
            if session
                .workers
                .values()
                .all(|slot| slot.state.status == WorkerStatus::Ready)
            {
                log::info!("mining session up with {} workers", session.workers.len());
                return Ok(session.workers.len());
            }
            if Instant::now() >= deadline {
                self.all_dismissed();
                return Err(WorkerError::ReadyTimeout);
            }
            std::thread::yield_now();
        }
    }

    /// The live session, if one is up.
    pub fn session(&self) -> Option<&WorkSession<B::Worker>> {
        self.session.as_ref()
    }

    /// Heartbeat map of the live session: pid to last-heartbeat age.
    pub fn heartbeats(&self) -> IndexMap<u32, Duration> {
        match &self.session {
            None => IndexMap::new(),
            Some(session) => session
                .workers
                .values()
                .map(|slot| (slot.state.pid, slot.state.last_heartbeat.elapsed()))
                .collect(),
        }
    }

    /// Hand `work` to every idle worker.
    pub fn send_work(&mut self, work: &WorkAssignment) {
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };
        for slot in session.workers.values_mut() {
            if slot.state.status != WorkerStatus::Ready {
                continue;
            }
            let msg_id = MsgId::generate(slot.state.pid);
            if slot
                .worker
                .send(&PoolMessage::Work {
                    msg_id: msg_id.clone(),
                    work: work.clone(),
                })
                .is_err()
            {
                slot.state.status = WorkerStatus::Dead;
                continue;
            }
            slot.state.outstanding.push_back(OutstandingRequest {
                msg_id,
                kind: RequestKind::Work,
                sent: Instant::now(),
            });
            slot.state.status = WorkerStatus::Busy;
        }
    }

    /// Cancel every assignment in flight. Workers must acknowledge within the abort
    /// timeout or be killed by the next [`pump`](Self::pump).
    pub fn abort_all(&mut self) {
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };
        for slot in session.workers.values_mut() {
            if slot.state.status != WorkerStatus::Busy {
                continue;
            }
            let msg_id = MsgId::generate(slot.state.pid);
            if slot
                .worker
                .send(&PoolMessage::Abort { msg_id: msg_id.clone() })
                .is_err()
            {
                slot.state.status = WorkerStatus::Dead;
                continue;
            }
            slot.state.outstanding.push_back(OutstandingRequest {
                msg_id,
                kind: RequestKind::Abort,
                sent: Instant::now(),
            });
        }
    }

    /// One supervision turn: drain worker messages, enforce heartbeat and abort deadlines,
    /// replace the dead, and probe the quiet. Returns what the engine should act on.
    pub fn pump(&mut self) -> Result<Vec<PoolNotice>, WorkerError> {
        let mut notices = self.drain_worker_messages();

        let (dead, to_probe) = {
            let session = match &mut self.session {
                Some(session) => session,
                None => return Ok(notices),
            };
            let mut dead = Vec::new();
            let mut to_probe = Vec::new();
            for slot in session.workers.values_mut() {
                let state = &mut slot.state;
                if state.status == WorkerStatus::Dead || !slot.worker.is_alive() {
                    dead.push(state.pid);
                    continue;
                }
                if state.last_heartbeat.elapsed() > self.config.heartbeat_timeout {
                    log::warn!("worker {} missed its heartbeat window", state.pid);
                    dead.push(state.pid);
                    continue;
                }
                let abort_expired = state.outstanding.iter().any(|req| {
                    req.kind == RequestKind::Abort && req.sent.elapsed() > self.config.abort_timeout
                });
                if abort_expired {
                    log::warn!("worker {} did not acknowledge abort", state.pid);
                    dead.push(state.pid);
                    continue;
                }
                if state.last_probe.elapsed() >= self.config.heartbeat_interval {
                    to_probe.push(state.pid);
                }
            }
            (dead, to_probe)
        };

        for pid in to_probe {
            self.probe(pid);
        }
        for pid in dead {
            let new_pid = self.respawn(pid)?;
            notices.push(PoolNotice::WorkerRespawned {
                old_pid: pid,
                new_pid,
            });
        }
        Ok(notices)
    }

    /// Whether the guard's worker list matches the live pid set. Divergence means the pool
    /// is unhealthy and should be torn down and re-risen by the engine.
    pub fn health_check(&self) -> Result<bool, WorkerError> {
        let recorded: HashSet<u32> = match self.guard.read()? {
            None => HashSet::new(),
            Some(record) => record.workers.iter().map(|w| w.pid).collect(),
        };
        let live: HashSet<u32> = match &self.session {
            None => HashSet::new(),
            Some(session) => session.workers.keys().copied().collect(),
        };
        Ok(recorded == live)
    }

    /// Kill one worker and forget it. Idempotent: dismissing an unknown pid is a no-op.
    pub fn dismiss(&mut self, pid: u32) {
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };
        if let Some(mut slot) = session.workers.shift_remove(&pid) {
            slot.worker.kill();
            if let Err(err) = self.write_guard_for_current() {
                log::warn!("failed to update guard after dismissing {}: {}", pid, err);
            }
        }
    }

    /// Tear the whole session down and clear the guard. Idempotent.
    pub fn all_dismissed(&mut self) {
        if let Some(mut session) = self.session.take() {
            for (_, slot) in session.workers.iter_mut() {
                slot.worker.kill();
            }
        }
        if let Err(err) = self.guard.clear() {
            log::warn!("failed to clear guard on dismissal: {}", err);
        }
    }

    fn probe(&mut self, pid: u32) {
        let session = match &mut self.session {
            Some(session) => session,
            None => return,
        };
        if let Some(slot) = session.workers.get_mut(&pid) {
            let msg_id = MsgId::generate(pid);
            if slot
                .worker
                .send(&PoolMessage::Heartbeat { msg_id: msg_id.clone() })
                .is_err()
            {
                slot.state.status = WorkerStatus::Dead;
                return;
            }
            slot.state.last_probe = Instant::now();
            slot.state.outstanding.push_back(OutstandingRequest {
                msg_id,
                kind: RequestKind::Heartbeat,
                sent: slot.state.last_probe,
            });
        }
    }

    fn respawn(&mut self, pid: u32) -> Result<u32, WorkerError> {
        self.respawns.push_back(Instant::now());
        while let Some(first) = self.respawns.front() {
            if first.elapsed() > self.config.respawn_window {
                self.respawns.pop_front();
            } else {
                break;
            }
        }
        if self.respawns.len() >= self.config.max_respawns {
            log::error!("respawn storm: {} respawns inside the window", self.respawns.len());
            self.all_dismissed();
            return Err(WorkerError::RespawnStorm);
        }

        let session = self.session.as_mut().expect("respawn without a session");
        if let Some(mut slot) = session.workers.shift_remove(&pid) {
            slot.worker.kill();
        }
        let mut worker = self.backend.spawn()?;
        let new_pid = worker.pid();
        let msg_id = MsgId::generate(new_pid);
        let now = Instant::now();
        let mut state = WorkerState {
            pid: new_pid,
            last_heartbeat: now,
            last_probe: now,
            outstanding: VecDeque::new(),
            status: WorkerStatus::Starting,
        };
        if worker.send(&PoolMessage::Heartbeat { msg_id: msg_id.clone() }).is_ok() {
            state.outstanding.push_back(OutstandingRequest {
                msg_id,
                kind: RequestKind::Heartbeat,
                sent: now,
            });
        }
        let session = self.session.as_mut().unwrap();
        session.workers.insert(new_pid, WorkerSlot { worker, state });
        self.write_guard_for_current()?;
        log::info!("replaced worker {} with {}", pid, new_pid);
        Ok(new_pid)
    }

    fn drain_worker_messages(&mut self) -> Vec<PoolNotice> {
        let mut notices = Vec::new();
        let session = match &mut self.session {
            Some(session) => session,
            None => return notices,
        };
        for slot in session.workers.values_mut() {
            loop {
                let msg = match slot.worker.try_recv() {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(_) => {
                        slot.state.status = WorkerStatus::Dead;
                        break;
                    }
                };
                let state = &mut slot.state;
                state.last_heartbeat = Instant::now();
                let resolved = msg
                    .msg_id()
                    .and_then(|id| {
                        state
                            .outstanding
                            .iter()
                            .position(|req| &req.msg_id == id)
                    })
                    .map(|at| state.outstanding.remove(at).unwrap());
                match msg {
                    WorkerMessage::Heartbeat { .. } => match resolved.map(|req| req.kind) {
                        Some(RequestKind::Abort) => state.status = WorkerStatus::Ready,
                        Some(RequestKind::Heartbeat) | None => {
                            if state.status == WorkerStatus::Starting {
                                state.status = WorkerStatus::Ready;
                            }
                        }
                        Some(RequestKind::Work) => {
                            // Work acknowledged; the worker stays busy until it solves or
                            // aborts.
                        }
                    },
                    WorkerMessage::Solution {
                        block,
                        iterations,
                        time_diff,
                        ..
                    } => {
                        state.status = WorkerStatus::Ready;
                        notices.push(PoolNotice::Solution {
                            pid: state.pid,
                            block,
                            iterations,
                            time_diff,
                        });
                    }
                    WorkerMessage::Error { description, .. } => {
                        log::warn!("worker {} reported: {}", state.pid, description);
                        notices.push(PoolNotice::WorkerErrored {
                            pid: state.pid,
                            description,
                        });
                    }
                }
            }
        }
        notices
    }

    fn write_guard_for(&self, session: &WorkSession<B::Worker>) -> Result<(), WorkerError> {
        self.guard.write(&GuardFile {
            session: hex(&session.session_id),
            timestamp: session.started_at.int(),
            workers: session
                .workers
                .keys()
                .map(|&pid| GuardWorker { pid })
                .collect(),
        })
    }

    fn write_guard_for_current(&self) -> Result<(), WorkerError> {
        match &self.session {
            Some(session) => self.write_guard_for(session),
            None => self.guard.clear(),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Error raised by pool supervision.
#[derive(Debug)]
pub enum WorkerError {
    /// The backend could not bring a worker up.
    SpawnFailed(std::io::Error),
    /// The worker's message channel is gone; the process is dead or wedged.
    ChannelClosed { pid: u32 },
    /// The guard file could not be read or written.
    GuardIo(std::io::Error),
    /// The guard file exists but is not a valid session record.
    GuardCorrupt(serde_json::Error),
    /// Not every worker answered its first heartbeat in time.
    ReadyTimeout,
    /// Too many respawns in too short a window; supervision gave up.
    RespawnStorm,
}

impl Display for WorkerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::SpawnFailed(source) => write!(f, "failed to spawn worker: {}", source),
            WorkerError::ChannelClosed { pid } => {
                write!(f, "channel to worker {} is closed", pid)
            }
            WorkerError::GuardIo(source) => write!(f, "guard file I/O failed: {}", source),
            WorkerError::GuardCorrupt(source) => {
                write!(f, "guard file is not a session record: {}", source)
            }
            WorkerError::ReadyTimeout => {
                write!(f, "workers did not become ready before the deadline")
            }
            WorkerError::RespawnStorm => {
                write!(f, "too many worker respawns in too short a window")
            }
        }
    }
}
