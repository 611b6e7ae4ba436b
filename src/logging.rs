/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the engine's
//! [config](crate::config::Configuration).
//!
//! This crate logs using the [log](https://docs.rs/log/latest/log/) crate. To get these
//! messages printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two
//! values are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as
//!    constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following
//! snippet is how a [PutBlock](crate::events::PutBlockEvent) is printed:
//!
//! ```text
//! PutBlock, 1701329264, Id5u7f6, 412
//! ```
//!
//! In the snippet:
//! - The third value is the first seven characters of the Base64 encoding of the block's
//!   hash.
//! - The fourth value is the height of the block.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use log;
use std::time::SystemTime;

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const PUT_BLOCK: &str = "PutBlock";
pub const PUT_BLOCK_LIST: &str = "PutBlockList";
pub const PUT_MULTIVERSE: &str = "PutMultiverse";
pub const ANNOUNCE_NEW_BLOCK: &str = "AnnounceNewBlock";
pub const QSEND: &str = "Qsend";
pub const GET_BLOCK_LIST: &str = "GetBlockList";
pub const GET_MULTIVERSE: &str = "GetMultiverse";

pub const EXTEND_TIP: &str = "ExtendTip";
pub const START_SYNC: &str = "StartSync";
pub const END_SYNC: &str = "EndSync";
pub const RECEIVE_SYNC_REQUEST: &str = "ReceiveSyncRequest";
pub const SEND_SYNC_RESPONSE: &str = "SendSyncResponse";
pub const MINE_SOLUTION: &str = "MineSolution";
pub const WORKER_SPAWNED: &str = "WorkerSpawned";
pub const WORKER_DIED: &str = "WorkerDied";

/// Implemented by event types. Used to get a closure that logs the event.
pub trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for PutBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &PutBlockEvent| {
            log::info!(
                "{}, {}, {}, {}",
                PUT_BLOCK,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.data.hash.bytes()),
                event.data.height
            )
        })
    }
}

impl Logger for PutBlockListEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &PutBlockListEvent| {
            log::info!(
                "{}, {}, {}",
                PUT_BLOCK_LIST,
                secs_since_unix_epoch(event.timestamp),
                event.data.len()
            )
        })
    }
}

impl Logger for PutMultiverseEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &PutMultiverseEvent| {
            log::info!(
                "{}, {}, {}",
                PUT_MULTIVERSE,
                secs_since_unix_epoch(event.timestamp),
                event.data.len()
            )
        })
    }
}

impl Logger for AnnounceNewBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &AnnounceNewBlockEvent| {
            log::info!(
                "{}, {}, {}, {}",
                ANNOUNCE_NEW_BLOCK,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.data.hash.bytes()),
                event.data.height
            )
        })
    }
}

impl Logger for QsendEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &QsendEvent| {
            log::info!(
                "{}, {}, {}",
                QSEND,
                secs_since_unix_epoch(event.timestamp),
                event.data.len()
            )
        })
    }
}

impl Logger for GetBlockListEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &GetBlockListEvent| {
            log::info!(
                "{}, {}, {}, {}",
                GET_BLOCK_LIST,
                secs_since_unix_epoch(event.timestamp),
                event.low,
                event.high
            )
        })
    }
}

impl Logger for GetMultiverseEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &GetMultiverseEvent| {
            log::info!(
                "{}, {}, {}, {}",
                GET_MULTIVERSE,
                secs_since_unix_epoch(event.timestamp),
                event.low,
                event.high
            )
        })
    }
}

impl Logger for ExtendTipEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ExtendTipEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                EXTEND_TIP,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.block.hash.bytes()),
                event.block.height,
                event.block.total_distance
            )
        })
    }
}

impl Logger for StartSyncEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &StartSyncEvent| {
            log::info!(
                "{}, {}, {}, {}",
                START_SYNC,
                secs_since_unix_epoch(event.timestamp),
                event.low,
                event.high
            )
        })
    }
}

impl Logger for EndSyncEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &EndSyncEvent| {
            log::info!(
                "{}, {}, {}",
                END_SYNC,
                secs_since_unix_epoch(event.timestamp),
                event.blocks_synced
            )
        })
    }
}

impl Logger for ReceiveSyncRequestEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &ReceiveSyncRequestEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_SYNC_REQUEST,
                secs_since_unix_epoch(event.timestamp),
                event.conn,
                event.low,
                event.high
            )
        })
    }
}

impl Logger for SendSyncResponseEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &SendSyncResponseEvent| {
            log::info!(
                "{}, {}, {}, {}",
                SEND_SYNC_RESPONSE,
                secs_since_unix_epoch(event.timestamp),
                event.conn,
                event.blocks
            )
        })
    }
}

impl Logger for MineSolutionEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &MineSolutionEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                MINE_SOLUTION,
                secs_since_unix_epoch(event.timestamp),
                first_seven_base64_chars(&event.block.hash.bytes()),
                event.block.height,
                event.iterations
            )
        })
    }
}

impl Logger for WorkerSpawnedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &WorkerSpawnedEvent| {
            log::info!(
                "{}, {}, {}",
                WORKER_SPAWNED,
                secs_since_unix_epoch(event.timestamp),
                event.pid
            )
        })
    }
}

impl Logger for WorkerDiedEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        Box::new(|event: &WorkerDiedEvent| {
            log::info!(
                "{}, {}, {}",
                WORKER_DIED,
                secs_since_unix_epoch(event.timestamp),
                event.pid
            )
        })
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the
// first 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Event occured before the Unix Epoch.")
        .as_secs()
}
