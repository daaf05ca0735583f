//! MOESI protocol tests over the event-driven engine.
//!
//! The engine models coherence state only; data correctness is covered by
//! the emulation-side suites. These tests pin down the protocol's state
//! transitions, directory bookkeeping, eviction write-back, and retry
//! behavior under lock contention.

use mcsim_core::cache::BlockState;

use crate::common::{init, tiny_l1, two_level};

// ══════════════════════════════════════════════════════════
// 1. Store then remote load (MOESI scenario)
// ══════════════════════════════════════════════════════════

/// CPU0 stores a line; CPU1 then loads it.
///
/// Pre-store both L1s are I. Post-store CPU0's L1 is M with the L2
/// directory recording CPU0 as owner. After CPU1's load, CPU0 is
/// downgraded to S, CPU1 installs S, and the L2 directory lists both as
/// sharers with no owner.
#[test]
fn store_then_remote_load() {
    init();
    let (mut engine, l1s, l2, _mem) = two_level(2);
    let line = 0x1000u32;

    assert_eq!(engine.block_state(l1s[0], line), BlockState::Invalid);
    assert_eq!(engine.block_state(l1s[1], line), BlockState::Invalid);

    // CPU0 store.
    let access = engine.store(l1s[0], line);
    engine.run_until_idle().unwrap();
    assert!(engine.take_finished(access));

    assert_eq!(engine.block_state(l1s[0], line), BlockState::Modified);
    let entry = engine.dir_entry(l2, line).expect("line resident at l2");
    assert_eq!(entry.owner, Some(engine.sharer_index(l1s[0])));
    assert!(entry.is_sharer(engine.sharer_index(l1s[0])));
    assert_eq!(entry.num_sharers(), 1);

    // CPU1 load.
    let access = engine.load(l1s[1], line);
    engine.run_until_idle().unwrap();
    assert!(engine.take_finished(access));

    assert_eq!(engine.block_state(l1s[0], line), BlockState::Shared);
    assert_eq!(engine.block_state(l1s[1], line), BlockState::Shared);
    let entry = engine.dir_entry(l2, line).unwrap();
    assert!(entry.is_sharer(engine.sharer_index(l1s[0])));
    assert!(entry.is_sharer(engine.sharer_index(l1s[1])));
    assert_eq!(entry.num_sharers(), 2);
    assert_eq!(entry.owner, None, "shared line has no single owner");
}

/// A lone load installs E (no other sharer), and a repeat load hits.
#[test]
fn exclusive_install_and_hit() {
    init();
    let (mut engine, l1s, _l2, _mem) = two_level(2);
    let line = 0x2000u32;

    let access = engine.load(l1s[0], line);
    engine.run_until_idle().unwrap();
    assert!(engine.take_finished(access));
    assert_eq!(engine.block_state(l1s[0], line), BlockState::Exclusive);

    let hits_before = engine.mods[l1s[0]].stats.read_hits;
    let access = engine.load(l1s[0], line);
    engine.run_until_idle().unwrap();
    assert!(engine.take_finished(access));
    assert_eq!(engine.mods[l1s[0]].stats.read_hits, hits_before + 1);
}

/// A second load from another CPU forces install-as-S on both sides
/// (shared reply), never E.
#[test]
fn shared_reply_prevents_exclusive() {
    init();
    let (mut engine, l1s, l2, _mem) = two_level(2);
    let line = 0x3000u32;

    let a = engine.load(l1s[0], line);
    engine.run_until_idle().unwrap();
    assert!(engine.take_finished(a));
    let b = engine.load(l1s[1], line);
    engine.run_until_idle().unwrap();
    assert!(engine.take_finished(b));

    assert_eq!(engine.block_state(l1s[0], line), BlockState::Shared);
    assert_eq!(engine.block_state(l1s[1], line), BlockState::Shared);
    assert_eq!(engine.dir_entry(l2, line).unwrap().num_sharers(), 2);
}

/// A store invalidates the other sharer and leaves a unique owner.
#[test]
fn store_invalidates_peers() {
    init();
    let (mut engine, l1s, l2, _mem) = two_level(2);
    let line = 0x4000u32;

    for &l1 in &l1s {
        let a = engine.load(l1, line);
        engine.run_until_idle().unwrap();
        assert!(engine.take_finished(a));
    }
    let a = engine.store(l1s[1], line);
    engine.run_until_idle().unwrap();
    assert!(engine.take_finished(a));

    assert_eq!(engine.block_state(l1s[0], line), BlockState::Invalid);
    assert_eq!(engine.block_state(l1s[1], line), BlockState::Modified);
    let entry = engine.dir_entry(l2, line).unwrap();
    assert_eq!(entry.owner, Some(engine.sharer_index(l1s[1])));
    assert_eq!(entry.num_sharers(), 1);
}

// ══════════════════════════════════════════════════════════
// 2. Eviction write-back
// ══════════════════════════════════════════════════════════

/// Two-set one-way L1: a third conflicting address evicts the dirty first
/// line, which must write back and land M at the level below, leaving the
/// evicted L1 slot I with no directory residue.
#[test]
fn eviction_writes_back_dirty_line() {
    init();
    let (mut engine, l1, mem) = tiny_l1(2, 1);
    let a0 = 0x000u32; // set 0
    let a1 = 0x040u32; // set 1
    let a2 = 0x080u32; // set 0, conflicts with a0

    let s = engine.store(l1, a0);
    engine.run_until_idle().unwrap();
    assert!(engine.take_finished(s));
    assert_eq!(engine.block_state(l1, a0), BlockState::Modified);

    let s = engine.store(l1, a1);
    engine.run_until_idle().unwrap();
    assert!(engine.take_finished(s));

    let evictions_before = engine.mods[l1].stats.evictions;
    let s = engine.store(l1, a2);
    engine.run_until_idle().unwrap();
    assert!(engine.take_finished(s));

    assert_eq!(engine.mods[l1].stats.evictions, evictions_before + 1);
    assert_eq!(engine.block_state(l1, a0), BlockState::Invalid);
    assert_eq!(engine.block_state(l1, a1), BlockState::Modified);
    assert_eq!(engine.block_state(l1, a2), BlockState::Modified);

    // The dirty data is visible below: memory holds a0 as M.
    assert_eq!(engine.block_state(mem, a0), BlockState::Modified);

    // No sharer/owner residue for the evicted line at the lower level.
    let entry = engine.dir_entry(mem, a0).unwrap();
    assert_eq!(entry.num_sharers(), 0);
    assert_eq!(entry.owner, None);
}

/// Evicting a clean line sends no write-back: the lower level keeps its
/// state, and the L1 slot is freed.
#[test]
fn clean_eviction_no_writeback() {
    init();
    let (mut engine, l1, mem) = tiny_l1(2, 1);
    let a0 = 0x000u32;
    let a2 = 0x080u32;

    let a = engine.load(l1, a0);
    engine.run_until_idle().unwrap();
    assert!(engine.take_finished(a));
    assert_eq!(engine.block_state(l1, a0), BlockState::Exclusive);

    let a = engine.load(l1, a2);
    engine.run_until_idle().unwrap();
    assert!(engine.take_finished(a));

    assert_eq!(engine.block_state(l1, a0), BlockState::Invalid);
    assert_eq!(engine.block_state(l1, a2), BlockState::Exclusive);
    // Memory materialised the block E and keeps it (no dirty promotion).
    assert_eq!(engine.block_state(mem, a0), BlockState::Exclusive);
}

// ══════════════════════════════════════════════════════════
// 3. Contention and retry
// ══════════════════════════════════════════════════════════

/// Concurrent stores to the same line from both CPUs: the directory lock
/// serialises them (at least one retries), both complete, and exactly one
/// L1 ends up with the line in M.
#[test]
fn conflicting_stores_serialise_with_retry() {
    init();
    let (mut engine, l1s, l2, _mem) = two_level(2);
    let line = 0x5000u32;

    let a = engine.store(l1s[0], line);
    let b = engine.store(l1s[1], line);
    engine.run_until_idle().unwrap();
    assert!(engine.take_finished(a));
    assert!(engine.take_finished(b));

    let s0 = engine.block_state(l1s[0], line);
    let s1 = engine.block_state(l1s[1], line);
    let modified = [s0, s1]
        .iter()
        .filter(|s| **s == BlockState::Modified)
        .count();
    assert_eq!(modified, 1, "exactly one winner holds M (got {:?}/{:?})", s0, s1);

    let retries =
        engine.mods[l1s[0]].stats.write_retries + engine.mods[l1s[1]].stats.write_retries;
    assert!(retries >= 1, "the loser must have retried at least once");

    let entry = engine.dir_entry(l2, line).unwrap();
    assert_eq!(entry.num_sharers(), 1);
}

/// Interleaved load/store traffic across both CPUs settles into a
/// directory-consistent state: M/E/O imply an owner below, I implies no
/// sharer bits anywhere.
#[test]
fn directory_state_consistency_sweep() {
    init();
    let (mut engine, l1s, l2, _mem) = two_level(2);

    let lines = [0x1000u32, 0x1040, 0x9000, 0x9040];
    let mut pending = Vec::new();
    for (i, &line) in lines.iter().enumerate() {
        pending.push(engine.load(l1s[i % 2], line));
        pending.push(engine.store(l1s[(i + 1) % 2], line));
    }
    engine.run_until_idle().unwrap();
    for access in pending {
        assert!(engine.take_finished(access), "all accesses complete");
    }

    for &line in &lines {
        for &l1 in &l1s {
            let state = engine.block_state(l1, line);
            let node = engine.sharer_index(l1);
            let entry = engine.dir_entry(l2, line);
            match state {
                BlockState::Modified | BlockState::Exclusive | BlockState::Owned => {
                    let entry = entry.expect("owned line resident below");
                    assert_eq!(entry.owner, Some(node), "owner recorded at {:#x}", line);
                    assert!(entry.is_sharer(node));
                }
                BlockState::Invalid => {
                    if let Some(entry) = entry {
                        assert!(!entry.is_sharer(node), "stale sharer bit at {:#x}", line);
                        assert_ne!(entry.owner, Some(node), "stale owner at {:#x}", line);
                    }
                }
                BlockState::Shared => {
                    let entry = entry.expect("shared line resident below");
                    assert!(entry.is_sharer(node));
                }
            }
        }
    }
}

// ══════════════════════════════════════════════════════════
// 4. Non-coherent store
// ══════════════════════════════════════════════════════════

/// nc-store takes the store path but leaves the line clean, so a later
/// eviction sends no write-back.
#[test]
fn nc_store_leaves_line_clean() {
    init();
    let (mut engine, l1, _mem) = tiny_l1(2, 1);

    let a = engine.nc_store(l1, 0x000);
    engine.run_until_idle().unwrap();
    assert!(engine.take_finished(a));
    assert_eq!(engine.block_state(l1, 0x000), BlockState::Exclusive);
}
