/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Typed messages exchanged between the pool supervisor and its mining workers, and the
//! length-prefixed framing they travel in.
//!
//! The channel carries borsh-serialized messages prefixed with a little-endian `u32`
//! length. In the process backend this runs over the child's stdio; the framing is
//! transport-independent so tests can run it over in-memory pipes.

use std::io::{self, Read, Write};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::{
    block::{ChildHeader, CompositeBlock},
    data_types::{Distance, MinerKey, MsgId},
};

/// One unit of mining work: search for the block extending `previous_block`.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub struct WorkAssignment {
    pub previous_block: CompositeBlock,
    pub headers: Vec<ChildHeader>,
    pub difficulty: Distance,
    pub miner_key: MinerKey,
}

/// Messages sent by the pool supervisor to a worker.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub enum PoolMessage {
    /// Liveness probe; the worker must reply with its own heartbeat echoing `msg_id`.
    Heartbeat { msg_id: MsgId },
    /// Start searching on this assignment.
    Work { msg_id: MsgId, work: WorkAssignment },
    /// Abandon the assignment in flight. Must be acknowledged by a heartbeat.
    Abort { msg_id: MsgId },
}

impl PoolMessage {
    pub fn msg_id(&self) -> &MsgId {
        match self {
            PoolMessage::Heartbeat { msg_id } => msg_id,
            PoolMessage::Work { msg_id, .. } => msg_id,
            PoolMessage::Abort { msg_id } => msg_id,
        }
    }
}

/// Messages sent by a worker to the pool supervisor.
#[derive(Clone, BorshSerialize, BorshDeserialize)]
pub enum WorkerMessage {
    /// Liveness signal. `msg_id` echoes the probe being answered, when there is one.
    Heartbeat { msg_id: Option<MsgId> },
    /// The worker found a block satisfying its assignment.
    Solution {
        msg_id: Option<MsgId>,
        block: CompositeBlock,
        iterations: u64,
        time_diff: u64,
    },
    /// The worker hit an error it could not recover from.
    Error {
        msg_id: Option<MsgId>,
        description: String,
    },
}

impl WorkerMessage {
    pub fn msg_id(&self) -> Option<&MsgId> {
        match self {
            WorkerMessage::Heartbeat { msg_id } => msg_id.as_ref(),
            WorkerMessage::Solution { msg_id, .. } => msg_id.as_ref(),
            WorkerMessage::Error { msg_id, .. } => msg_id.as_ref(),
        }
    }
}

/// Write one length-prefixed message frame.
pub fn write_frame(writer: &mut impl Write, msg: &impl BorshSerialize) -> io::Result<()> {
    let bytes = msg.try_to_vec()?;
    writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
    writer.write_all(&bytes)?;
    writer.flush()
}

/// Read one length-prefixed message frame. Blocks until a full frame is available.
pub fn read_frame<T: BorshDeserialize>(reader: &mut impl Read) -> io::Result<T> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let mut bytes = vec![0u8; u32::from_le_bytes(len) as usize];
    reader.read_exact(&mut bytes)?;
    T::deserialize(&mut bytes.as_slice())
}
