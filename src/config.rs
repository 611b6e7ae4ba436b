/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Configuration as specified by the operator. This is split up into smaller, subsystem
//! specific config structs before being passed to components.
//!
//! Nothing in this crate reads the process environment; every knob enters through
//! [`Configuration`], built with [`ConfigurationBuilder`].

use std::path::PathBuf;

use crate::multiverse::MultiverseConfig;
use crate::types::data_types::MinerKey;
use crate::worker_pool::WorkerPoolConfig;

/// The quorum used on networks large enough to bootstrap organically.
pub const DEFAULT_QUORUM_SIZE: u64 = 3;

#[derive(Clone)]
pub struct Configuration {
    /// Directory holding the node's durable files (the worker guard lives here).
    pub data_dir: PathBuf,
    /// Identity credited on locally mined blocks.
    pub miner_key: MinerKey,
    /// Minimum connected peer count above which discovery is paused.
    pub quorum_size: u64,
    /// Forces the persisted quorum to `quorum_size` on every connect, for nets too small
    /// to bootstrap organically.
    pub low_health_net: bool,
    /// Whether the default CSV logging handlers are attached to the event bus.
    pub log_events: bool,
    pub multiverse: MultiverseConfig,
    pub worker_pool: WorkerPoolConfig,
}

impl Configuration {
    pub fn builder() -> ConfigurationBuilder {
        ConfigurationBuilder::default()
    }
}

/// Builder for [`Configuration`]. `data_dir` and `miner_key` are required; everything else
/// has a sensible default.
#[derive(Default)]
pub struct ConfigurationBuilder {
    data_dir: Option<PathBuf>,
    miner_key: Option<MinerKey>,
    quorum_size: Option<u64>,
    low_health_net: bool,
    log_events: bool,
    max_workers: Option<usize>,
    multiverse: Option<MultiverseConfig>,
}

impl ConfigurationBuilder {
    pub fn data_dir(mut self, data_dir: PathBuf) -> Self {
        self.data_dir = Some(data_dir);
        self
    }

    pub fn miner_key(mut self, miner_key: MinerKey) -> Self {
        self.miner_key = Some(miner_key);
        self
    }

    pub fn quorum_size(mut self, quorum_size: u64) -> Self {
        self.quorum_size = Some(quorum_size);
        self
    }

    pub fn low_health_net(mut self, low_health_net: bool) -> Self {
        self.low_health_net = low_health_net;
        self
    }

    pub fn log_events(mut self, log_events: bool) -> Self {
        self.log_events = log_events;
        self
    }

    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = Some(max_workers);
        self
    }

    pub fn multiverse(mut self, multiverse: MultiverseConfig) -> Self {
        self.multiverse = Some(multiverse);
        self
    }

    /// Panics if `data_dir` or `miner_key` was not provided.
    pub fn build(self) -> Configuration {
        let data_dir = self.data_dir.expect("Configuration requires a data_dir");
        let miner_key = self.miner_key.expect("Configuration requires a miner_key");
        let guard_path = data_dir.join("worker_guard.json");
        let quorum_size = if self.low_health_net {
            1
        } else {
            self.quorum_size.unwrap_or(DEFAULT_QUORUM_SIZE)
        };
        Configuration {
            data_dir,
            miner_key,
            quorum_size,
            low_health_net: self.low_health_net,
            log_events: self.log_events,
            multiverse: self.multiverse.unwrap_or_default(),
            worker_pool: WorkerPoolConfig::new(guard_path, self.max_workers.unwrap_or(usize::MAX)),
        }
    }
}
