//! An in-memory miner backend: workers are scripted mailboxes, no processes are forked.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use multiverse_node::worker_pool::{
    backend::{MinerBackend, MinerWorker},
    messages::{PoolMessage, WorkerMessage},
    WorkerError,
};

#[derive(Clone, Default)]
pub struct MockBackend {
    next_pid: Arc<Mutex<u32>>,
    /// Pids the backend was asked to reap from a previous session's guard.
    pub reaped: Arc<Mutex<Vec<u32>>>,
    /// Workers in this list swallow probes without answering.
    pub silent: Arc<Mutex<Vec<u32>>>,
    /// Queued solutions handed to the next worker that receives work.
    pub solutions: Arc<Mutex<VecDeque<WorkerMessage>>>,
}

impl MockBackend {
    pub fn new() -> MockBackend {
        MockBackend::default()
    }

    /// Make every worker spawned from here on silent, so readiness times out.
    pub fn silence_next(&self, pid: u32) {
        self.silent.lock().unwrap().push(pid);
    }

    /// Pid the next spawn will receive.
    pub fn upcoming_pid(&self) -> u32 {
        1000 + *self.next_pid.lock().unwrap() + 1
    }
}

impl MinerBackend for MockBackend {
    type Worker = MockWorker;

    fn spawn(&mut self) -> Result<MockWorker, WorkerError> {
        let mut next_pid = self.next_pid.lock().unwrap();
        *next_pid += 1;
        Ok(MockWorker {
            pid: 1000 + *next_pid,
            alive: true,
            inbox: VecDeque::new(),
            silent: self.silent.clone(),
            solutions: self.solutions.clone(),
        })
    }

    fn reap(&mut self, pid: u32) {
        self.reaped.lock().unwrap().push(pid);
    }
}

pub struct MockWorker {
    pid: u32,
    alive: bool,
    inbox: VecDeque<WorkerMessage>,
    silent: Arc<Mutex<Vec<u32>>>,
    solutions: Arc<Mutex<VecDeque<WorkerMessage>>>,
}

impl MinerWorker for MockWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn send(&mut self, msg: &PoolMessage) -> Result<(), WorkerError> {
        if !self.alive {
            return Err(WorkerError::ChannelClosed { pid: self.pid });
        }
        if self.silent.lock().unwrap().contains(&self.pid) {
            return Ok(());
        }
        // Probes and aborts are acknowledged immediately. Work is acknowledged too, and
        // additionally produces a queued solution when the test scripted one.
        let msg_id = Some(msg.msg_id().clone());
        self.inbox.push_back(WorkerMessage::Heartbeat { msg_id });
        if matches!(msg, PoolMessage::Work { .. }) {
            if let Some(solution) = self.solutions.lock().unwrap().pop_front() {
                self.inbox.push_back(solution);
            }
        }
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Option<WorkerMessage>, WorkerError> {
        if !self.alive {
            return Err(WorkerError::ChannelClosed { pid: self.pid });
        }
        Ok(self.inbox.pop_front())
    }

    fn is_alive(&mut self) -> bool {
        self.alive
    }

    fn kill(&mut self) {
        self.alive = false;
    }
}
