//! Builders for structurally valid composite blocks.

use std::collections::BTreeMap;

use multiverse_node::types::{
    block::{ChildHeader, CompositeBlock},
    data_types::{BlockHash, BlockHeight, ChainName, Distance, MinerKey, Timestamp},
};

/// A child header of `chain` at `height`, minted at `timestamp`.
pub fn header(chain: &str, height: u64, timestamp: Timestamp) -> ChildHeader {
    ChildHeader {
        blockchain: ChainName::new(chain),
        height: BlockHeight::new(height),
        hash: format!("{}:{}", chain, height),
        merkle_root: format!("mr:{}:{}", chain, height),
        timestamp,
    }
}

/// An anchored header mapping with one header per named chain.
pub fn headers(
    chains: &[(&str, u64)],
    timestamp: Timestamp,
) -> BTreeMap<ChainName, Vec<ChildHeader>> {
    chains
        .iter()
        .map(|(chain, height)| {
            (
                ChainName::new(*chain),
                vec![header(chain, *height, timestamp)],
            )
        })
        .collect()
}

/// A structurally valid root block, suitable for seeding a chain under test.
pub fn root(height: u64, total_distance: u64, timestamp: Timestamp) -> CompositeBlock {
    CompositeBlock::new(
        BlockHash::zero(),
        BlockHeight::new(height),
        timestamp,
        Distance::from_u64(7),
        Distance::from_u64(total_distance),
        Distance::from_u64(total_distance),
        headers(&[("btc", height), ("eth", height)], timestamp),
        MinerKey::new("miner"),
    )
}

/// A valid direct child of `parent`: height + 1, linked hash, exact distance accumulation.
/// Child-chain heights advance by one on each chain, so the child outweighs its parent.
pub fn child_of(parent: &CompositeBlock, distance: u64, timestamp: Timestamp) -> CompositeBlock {
    let chains: Vec<(String, u64)> = parent
        .blockchain_headers
        .iter()
        .filter_map(|(chain, headers)| {
            headers
                .iter()
                .map(|h| h.height.int())
                .max()
                .map(|height| (chain.as_str().to_string(), height + 1))
        })
        .collect();
    let chain_refs: Vec<(&str, u64)> = chains
        .iter()
        .map(|(chain, height)| (chain.as_str(), *height))
        .collect();
    CompositeBlock::new(
        parent.hash,
        parent.height + 1,
        timestamp,
        parent.difficulty.clone(),
        Distance::from_u64(distance),
        &parent.total_distance + &Distance::from_u64(distance),
        headers(&chain_refs, timestamp),
        MinerKey::new("miner"),
    )
}

/// A linked run of `len` blocks on top of `parent`, height-ascending.
pub fn chain_on(parent: &CompositeBlock, len: usize, start_ts: Timestamp) -> Vec<CompositeBlock> {
    let mut blocks = Vec::with_capacity(len);
    let mut prev = parent.clone();
    for i in 0..len {
        let block = child_of(&prev, 10, start_ts + i as u64);
        prev = block.clone();
        blocks.push(block);
    }
    blocks
}
