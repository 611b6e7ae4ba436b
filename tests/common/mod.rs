pub mod blocks;

pub mod mem_db;

pub mod mock_miner;

pub mod mock_overlay;

use std::path::PathBuf;

/// A scratch directory for one test's durable files (the worker guard lives there).
pub fn scratch_dir(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "multiverse-node-test-{}-{}",
        name,
        std::process::id()
    ));
    let _ = std::fs::create_dir_all(&path);
    path
}
