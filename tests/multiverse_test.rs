//! Chain-adoption scenarios for the multiverse: extending the tip, rejecting stale or
//! detached blocks, hotswapping a corrupt tip, and granting resyncs.

mod common;

use common::{blocks::*, mem_db::MemDB};
use multiverse_node::multiverse::{Multiverse, MultiverseConfig, WINDOW_LEN};
use multiverse_node::store::chain_store::ChainStore;
use multiverse_node::types::data_types::{BlockHeight, Distance, Timestamp};
use multiverse_node::validation::children_height_sum;

fn seeded(tip: &multiverse_node::types::block::CompositeBlock) -> (Multiverse<MemDB>, ChainStore<MemDB>) {
    let mut store = ChainStore::new(MemDB::new());
    store.commit_tip(tip).unwrap();
    let mut multiverse = Multiverse::new(store.clone(), MultiverseConfig::default());
    assert!(multiverse.add_next_block(tip.clone()));
    (multiverse, store)
}

#[test]
fn accept_next_block() {
    let now = Timestamp::now();
    let tip = root(10, 100, now - 4);
    let (mut multiverse, _store) = seeded(&tip);

    let next = child_of(&tip, 10, now);
    assert!(children_height_sum(&next) > children_height_sum(&tip));
    assert!(multiverse.add_next_block(next.clone()));
    assert_eq!(multiverse.get_highest().unwrap().hash, next.hash);
    assert_eq!(multiverse.get_parent_highest().unwrap().hash, tip.hash);
}

#[test]
fn reject_stale_block() {
    let now = Timestamp::now();
    let tip = root(10, 100, now - 60);
    let (mut multiverse, _store) = seeded(&tip);

    // One second older than the tip, and long past the wall-clock age gate.
    let stale = child_of(&tip, 10, tip.timestamp - 1);
    assert!(!multiverse.add_next_block(stale));
    assert_eq!(multiverse.get_highest().unwrap().hash, tip.hash);
}

#[test]
fn reject_genesis_replacement_and_detached_heights() {
    let now = Timestamp::now();
    let tip = root(10, 100, now - 4);
    let (mut multiverse, _store) = seeded(&tip);

    // Genesis is immutable.
    let genesis_again = root(1, 200, now);
    assert!(!multiverse.add_next_block(genesis_again));

    // Not a direct child by height.
    let skipping = {
        let mid = child_of(&tip, 10, now);
        child_of(&mid, 10, now)
    };
    assert!(!multiverse.add_next_block(skipping));
}

#[test]
fn reject_lighter_child_chain_weight() {
    let now = Timestamp::now();
    let tip = root(10, 100, now - 4);
    let (mut multiverse, _store) = seeded(&tip);

    // Valid linkage and distance, but the anchored child chains went backwards.
    let mut lighter = child_of(&tip, 10, now);
    lighter.blockchain_headers = headers(&[("btc", 1), ("eth", 1)], now);
    lighter.blockchain_headers_count = lighter.count_headers();
    lighter.hash = lighter.compute_hash();
    assert!(!multiverse.add_next_block(lighter));
}

#[test]
fn hotswap_replaces_corrupt_tip() {
    let now = Timestamp::now();
    let parent = root(9, 90, now - 10);
    // A tip whose ancestry does not match the persisted parent.
    let corrupt_tip = root(10, 100, now - 5);

    let mut store = ChainStore::new(MemDB::new());
    store.commit_tip(&parent).unwrap();
    store.commit_tip(&corrupt_tip).unwrap();
    let mut multiverse = Multiverse::new(store.clone(), MultiverseConfig::default());
    assert!(multiverse.add_next_block(corrupt_tip.clone()));

    // Same height as the tip, correctly accumulated on the persisted parent, heavier.
    let replacement = child_of(&parent, 20, now);
    assert_eq!(replacement.height, corrupt_tip.height);
    assert!(replacement.total_distance > corrupt_tip.total_distance);

    assert!(multiverse.add_next_block(replacement.clone()));
    assert_eq!(multiverse.get_highest().unwrap().hash, replacement.hash);
}

#[test]
fn too_far_ahead_rejects_then_grants_resync() {
    let now = Timestamp::now();
    let tip = root(10, 100, now - 4);
    let (mut multiverse, _store) = seeded(&tip);

    let far_ahead = root(20, 200, now);
    assert!(!multiverse.add_next_block(far_ahead.clone()));
    assert!(multiverse.add_resync_request(&far_ahead, false));
}

#[test]
fn strict_resync_requires_persisted_child_headers() {
    let now = Timestamp::now();
    let tip = root(10, 100, now - 4);
    let (mut multiverse, _store) = seeded(&tip);

    let far_ahead = root(20, 200, now);
    // No rover persisted the candidate's child headers locally.
    assert!(!multiverse.add_resync_request(&far_ahead, true));
    assert!(multiverse.add_resync_request(&far_ahead, false));
}

#[test]
fn stale_sync_lock_resets_fresh_lock_blocks() {
    let now = Timestamp::now();
    let tip = root(10, 100, now - 4);
    let (mut multiverse, mut store) = seeded(&tip);
    let candidate = root(20, 200, now);

    // A lock taken 30 seconds ago is past its ttl: reset and grant.
    store.lock_sync(&root(15, 150, now - 30)).unwrap();
    assert!(multiverse.add_resync_request(&candidate, false));
    // The reset wrote back the unlocked sentinel.
    assert_eq!(store.sync_lock().unwrap().height, BlockHeight::genesis());

    // A fresh lock blocks any further resync.
    store.lock_sync(&root(15, 150, now)).unwrap();
    assert!(!multiverse.add_resync_request(&candidate, false));
}

#[test]
fn same_hash_never_triggers_resync() {
    let now = Timestamp::now();
    let tip = root(10, 100, now - 4);
    let (mut multiverse, _store) = seeded(&tip);
    assert!(!multiverse.add_resync_request(&tip, false));
}

#[test]
fn window_invariants_hold_along_a_long_chain() {
    let now = Timestamp::now();
    let tip = root(10, 100, now - 4);
    let (mut multiverse, mut store) = seeded(&tip);

    let mut weight_watermark = children_height_sum(&tip);
    let mut prev = tip;
    for i in 0..20u64 {
        let next = child_of(&prev, 10 + (i % 3), now + i);
        assert!(multiverse.add_next_block(next.clone()));
        store.commit_tip(&next).unwrap();
        prev = next;

        let window = multiverse.window();
        assert!(window.len() <= WINDOW_LEN);
        for pair in window.windows(2) {
            assert_eq!(pair[0].previous_hash, pair[1].hash);
            assert_eq!(pair[0].height.int(), pair[1].height.int() + 1);
            assert!(pair[0].total_distance > pair[1].total_distance);
        }

        // Child-chain weight of the head is monotone non-decreasing outside resyncs.
        let head_weight = children_height_sum(multiverse.get_highest().unwrap());
        assert!(head_weight >= weight_watermark);
        weight_watermark = head_weight;
    }
}

#[test]
fn inline_sequence_validation_links_to_persisted_boundary() {
    let now = Timestamp::now();
    let boundary = root(10, 100, now - 4);
    let (multiverse, _store) = seeded(&boundary);

    // chain_on returns height-ascending; the multiverse expects highest-first.
    let mut range = chain_on(&boundary, 4, now);
    range.reverse();
    assert!(multiverse.validate_block_sequence_inline(&range).is_ok());

    // A range whose lowest block does not link to anything persisted is refused.
    let mut detached = chain_on(&root(20, 400, now), 3, now);
    detached.reverse();
    assert!(multiverse.validate_block_sequence_inline(&detached).is_err());

    // A broken interior link is refused.
    let mut broken = chain_on(&boundary, 4, now);
    broken.reverse();
    broken[1].total_distance = Distance::from_u64(1);
    assert!(multiverse.validate_block_sequence_inline(&broken).is_err());
}

#[test]
fn soft_fail_parent_read_does_not_poison_acceptance() {
    let now = Timestamp::now();
    let parent = root(9, 90, now - 10);
    let tip = root(10, 100, now - 4);

    let kv = MemDB::new();
    let mut store = ChainStore::new(kv.clone());
    store.commit_tip(&parent).unwrap();
    store.commit_tip(&tip).unwrap();
    let mut multiverse = Multiverse::new(store, MultiverseConfig::default());
    assert!(multiverse.add_next_block(tip.clone()));

    // Corrupt the parent record; the hotswap probe soft-fails and ordinary extension
    // still works.
    kv.corrupt(b"bc.block.parent");
    let next = child_of(&tip, 10, now);
    assert!(multiverse.add_next_block(next));
}
