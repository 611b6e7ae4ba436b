/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The durable guard file that lets a restarted node find and kill miners orphaned by a
//! crash.
//!
//! The guard is a JSON document `{session, timestamp, workers: [{pid}, …]}` rewritten on
//! every spawn and kill, only ever by the pool supervisor.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::WorkerError;

/// The guard document as persisted.
#[derive(Clone, Serialize, Deserialize)]
pub struct GuardFile {
    /// Hex encoding of the 256-bit work session id.
    pub session: String,
    /// Unix seconds at which the session started.
    pub timestamp: u64,
    pub workers: Vec<GuardWorker>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct GuardWorker {
    pub pid: u32,
}

/// Handle on the guard file at a fixed path.
pub struct Guard {
    path: PathBuf,
}

impl Guard {
    pub fn open(path: PathBuf) -> Guard {
        Guard { path }
    }

    /// The recorded session, or `None` when no guard exists (first run or after
    /// [`clear`](Self::clear)).
    pub fn read(&self) -> Result<Option<GuardFile>, WorkerError> {
        match fs::read(&self.path) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(WorkerError::GuardIo(err)),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(WorkerError::GuardCorrupt),
        }
    }

    /// Replace the guard with `record`.
    pub fn write(&self, record: &GuardFile) -> Result<(), WorkerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(WorkerError::GuardIo)?;
        }
        let bytes = serde_json::to_vec_pretty(record).expect("guard record serializes");
        fs::write(&self.path, bytes).map_err(WorkerError::GuardIo)
    }

    /// Delete the guard. Missing-file is not an error.
    pub fn clear(&self) -> Result<(), WorkerError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(WorkerError::GuardIo(err)),
        }
    }
}
