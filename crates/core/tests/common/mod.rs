//! Test harness: logging setup, guest ELF synthesis, and miniature
//! assemblers for MIPS and x86 guest programs.
#![allow(dead_code)]

pub mod elf;
pub mod mips_asm;
pub mod x86_asm;

use mcsim_core::coherence::{Engine, ModId};
use mcsim_core::config::HierarchyConfig;

/// Initialises logging once per test process.
pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Builds the default two-level hierarchy (N L1s over a shared L2 over
/// main memory) and returns (engine, l1 ids, l2 id, mem id).
pub fn two_level(cpus: usize) -> (Engine, Vec<ModId>, ModId, ModId) {
    let mut engine = Engine::new();
    let ids = HierarchyConfig::two_level(cpus).build(&mut engine).unwrap();
    let find = |name: &str| {
        ids.iter()
            .find(|(n, _)| n == name)
            .map(|(_, id)| *id)
            .unwrap()
    };
    let l1s = (0..cpus).map(|i| find(&format!("l1-{}", i))).collect();
    (engine, l1s, find("l2"), find("mem"))
}

/// A small single-L1 hierarchy with explicit geometry, for eviction
/// tests.
pub fn tiny_l1(sets: u32, assoc: u32) -> (Engine, ModId, ModId) {
    let mut engine = Engine::new();
    let mem = engine.add_main_memory("mem", 256, 8, 64, 50);
    let l1 = engine.add_cache("l1", sets, assoc, 64, 1);
    let net = engine.add_net("net", 8, 1, 8);
    engine.connect_levels(net, mem, &[l1]);
    (engine, l1, mem)
}
