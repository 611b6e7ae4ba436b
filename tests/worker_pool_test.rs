//! Worker-pool supervision scenarios: readiness, guard-file recovery, respawn, and
//! solution routing back into the engine.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{blocks::*, mem_db::MemDB, mock_miner::MockBackend, mock_overlay::MockOverlay, scratch_dir};
use multiverse_node::config::Configuration;
use multiverse_node::engine::Engine;
use multiverse_node::event_bus::UserHandlers;
use multiverse_node::store::chain_store::ChainStore;
use multiverse_node::types::data_types::{MinerKey, Timestamp};
use multiverse_node::worker_pool::{
    guard::{Guard, GuardFile, GuardWorker},
    messages::{WorkAssignment, WorkerMessage},
    PoolNotice, WorkerError, WorkerPool, WorkerPoolConfig,
};

fn test_config(name: &str) -> WorkerPoolConfig {
    let mut config = WorkerPoolConfig::new(
        scratch_dir(name).join("worker_guard.json"),
        2,
    );
    // Keep the timing-sensitive knobs short so failure paths resolve quickly under test.
    config.ready_timeout = Duration::from_millis(300);
    config.heartbeat_interval = Duration::from_millis(20);
    config.heartbeat_timeout = Duration::from_millis(120);
    config.abort_timeout = Duration::from_millis(120);
    config
}

#[test]
fn all_rise_resolves_once_every_worker_heartbeats() {
    let config = test_config("rise");
    let guard_path = config.guard_path.clone();
    let mut pool = WorkerPool::new(config, MockBackend::new());
    pool.init().unwrap();

    let risen = pool
        .all_rise(MinerKey::new("miner"), HashSet::new())
        .unwrap();
    assert!(risen >= 1 && risen <= 2);
    assert_eq!(pool.heartbeats().len(), risen);

    // Exactly the live pids are recorded in the guard.
    let guard = Guard::open(guard_path);
    let recorded: Vec<u32> = guard
        .read()
        .unwrap()
        .unwrap()
        .workers
        .iter()
        .map(|w| w.pid)
        .collect();
    let live: Vec<u32> = pool.heartbeats().keys().copied().collect();
    assert_eq!(recorded, live);
    assert!(pool.health_check().unwrap());

    pool.all_dismissed();
    assert!(guard.read().unwrap().is_none());
}

#[test]
fn stale_session_is_reaped_on_init() {
    let config = test_config("reap");
    let guard = Guard::open(config.guard_path.clone());
    guard
        .write(&GuardFile {
            session: "dead".to_string(),
            timestamp: 1_700_000_000,
            workers: vec![GuardWorker { pid: 4101 }, GuardWorker { pid: 4102 }],
        })
        .unwrap();

    let backend = MockBackend::new();
    let mut pool = WorkerPool::new(config, backend.clone());
    pool.init().unwrap();

    assert_eq!(*backend.reaped.lock().unwrap(), vec![4101, 4102]);
    assert!(guard.read().unwrap().is_none());
}

#[test]
fn silent_workers_fail_readiness() {
    let config = test_config("silent");
    let guard = Guard::open(config.guard_path.clone());
    let backend = MockBackend::new();
    // Every pid this backend will hand out stays silent.
    for pid in backend.upcoming_pid()..backend.upcoming_pid() + 8 {
        backend.silence_next(pid);
    }

    let mut pool = WorkerPool::new(config, backend);
    pool.init().unwrap();
    match pool.all_rise(MinerKey::new("miner"), HashSet::new()) {
        Err(WorkerError::ReadyTimeout) => {}
        other => panic!("expected ReadyTimeout, got {:?}", other.map(|_| ())),
    }
    // The failed session was dismissed and the guard cleared.
    assert!(guard.read().unwrap().is_none());
}

#[test]
fn scripted_solution_is_pumped_back() {
    let now = Timestamp::now();
    let tip = root(10, 100, now - 4);
    let solved = child_of(&tip, 10, now);

    let backend = MockBackend::new();
    backend
        .solutions
        .lock()
        .unwrap()
        .push_back(WorkerMessage::Solution {
            msg_id: None,
            block: solved.clone(),
            iterations: 41_217,
            time_diff: 12,
        });

    let mut pool = WorkerPool::new(test_config("solution"), backend);
    pool.init().unwrap();
    pool.all_rise(MinerKey::new("miner"), HashSet::new())
        .unwrap();
    pool.send_work(&WorkAssignment {
        previous_block: tip.clone(),
        headers: Vec::new(),
        difficulty: tip.difficulty.clone(),
        miner_key: MinerKey::new("miner"),
    });

    let notices = pool.pump().unwrap();
    let found = notices.iter().any(|notice| {
        matches!(notice, PoolNotice::Solution { block, iterations, .. }
            if block.hash == solved.hash && *iterations == 41_217)
    });
    assert!(found, "the scripted solution was not routed back");
    pool.all_dismissed();
}

#[test]
fn mined_solution_flows_to_announcement() {
    let now = Timestamp::now();
    let kv = MemDB::new();
    let mut store = ChainStore::new(kv.clone());
    let tip = root(10, 100, now - 4);
    store.commit_tip(&tip).unwrap();
    let solved = child_of(&tip, 10, now);

    let backend = MockBackend::new();
    backend
        .solutions
        .lock()
        .unwrap()
        .push_back(WorkerMessage::Solution {
            msg_id: None,
            block: solved.clone(),
            iterations: 1,
            time_diff: 1,
        });

    let overlay = MockOverlay::new();
    let config = Configuration::builder()
        .data_dir(scratch_dir("mined"))
        .miner_key(MinerKey::new("miner"))
        .quorum_size(1)
        .max_workers(2)
        .build();
    let engine = Engine::start(
        kv.clone(),
        overlay.clone(),
        backend,
        config,
        UserHandlers::default(),
        HashSet::new(),
    )
    .unwrap();

    // A rovered header advancing a child chain triggers a work dispatch; the mock worker
    // answers with the scripted solution, which must come back out as an announcement.
    engine
        .rover_handle()
        .send(header("btc", 11, now))
        .unwrap();

    let announce =
        overlay.wait_for_broadcast(Duration::from_secs(5), |bytes| bytes.starts_with(b"0008W01"));
    match multiverse_node::codec::Frame::decode(&announce).unwrap() {
        multiverse_node::codec::Frame::HighestBlock(block) => {
            assert_eq!(block.hash, solved.hash)
        }
        other => panic!("expected a block announcement, got {:?}", other.tag()),
    }
    let store = ChainStore::new(kv);
    assert_eq!(store.latest_block().unwrap().unwrap().hash, solved.hash);
}
