/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait for pluggable worker spawning, and the OS-process backend used in production.
//!
//! Mining runs in isolated child processes so a crashed or wedged search cannot take the
//! node down; the pool only ever talks to a worker through the typed channel of
//! [`messages`](super::messages). Tests plug in an in-memory backend instead of forking.

use std::io::Write;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

use super::messages::{read_frame, write_frame, PoolMessage, WorkerMessage};
use super::WorkerError;

/// Trait for pluggable worker spawning.
pub trait MinerBackend: Send + 'static {
    type Worker: MinerWorker;

    /// Bring up one worker and open its message channel.
    fn spawn(&mut self) -> Result<Self::Worker, WorkerError>;

    /// Kill a process recorded by a previous session. The pid is not one of our children,
    /// so this goes through the operating system rather than a worker handle.
    fn reap(&mut self, pid: u32);
}

/// One live worker as seen by the pool supervisor.
pub trait MinerWorker: Send + 'static {
    /// The worker's process id, as recorded in the guard file.
    fn pid(&self) -> u32;

    /// Send a message down the worker channel.
    fn send(&mut self, msg: &PoolMessage) -> Result<(), WorkerError>;

    /// Receive the next worker message, if one has arrived.
    fn try_recv(&mut self) -> Result<Option<WorkerMessage>, WorkerError>;

    /// Whether the underlying process is still running.
    fn is_alive(&mut self) -> bool;

    /// Kill the worker. Idempotent.
    fn kill(&mut self);
}

/// Spawns miner executables as child processes, with the message channel over stdio.
pub struct ProcessBackend {
    /// Path of the miner executable.
    pub program: std::path::PathBuf,
    /// Arguments passed to every worker.
    pub args: Vec<String>,
}

impl MinerBackend for ProcessBackend {
    type Worker = ProcessWorker;

    fn spawn(&mut self) -> Result<ProcessWorker, WorkerError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(WorkerError::SpawnFailed)?;
        let pid = child.id();
        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");

        // Reader thread: drains length-prefixed frames off the child's stdout and hands
        // them to the supervisor through a channel. Dies quietly with the child; the dead
        // channel is how the supervisor notices.
        let (to_supervisor, inbox) = mpsc::sync_channel(Self::READER_CHANNEL_BUFFER_LEN);
        let reader = thread::spawn(move || {
            let mut stdout = stdout;
            while let Ok(msg) = read_frame::<WorkerMessage>(&mut stdout) {
                if to_supervisor.send(msg).is_err() {
                    break;
                }
            }
        });

        Ok(ProcessWorker {
            pid,
            child,
            stdin: Some(stdin),
            inbox,
            _reader: reader,
        })
    }

    fn reap(&mut self, pid: u32) {
        // Not our child, so signal through the OS. Failure means the pid is already gone.
        let _ = Command::new("kill")
            .args(["-KILL", &pid.to_string()])
            .status();
    }
}

impl ProcessBackend {
    const READER_CHANNEL_BUFFER_LEN: usize = 64;
}

pub struct ProcessWorker {
    pid: u32,
    child: Child,
    stdin: Option<ChildStdin>,
    inbox: Receiver<WorkerMessage>,
    _reader: thread::JoinHandle<()>,
}

impl MinerWorker for ProcessWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn send(&mut self, msg: &PoolMessage) -> Result<(), WorkerError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or(WorkerError::ChannelClosed { pid: self.pid })?;
        write_frame(stdin, msg).map_err(|_| WorkerError::ChannelClosed { pid: self.pid })
    }

    fn try_recv(&mut self) -> Result<Option<WorkerMessage>, WorkerError> {
        match self.inbox.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(WorkerError::ChannelClosed { pid: self.pid }),
        }
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn kill(&mut self) {
        // Dropping stdin closes the channel so a well-behaved worker can exit on its own;
        // the KILL below covers the rest.
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.flush();
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

