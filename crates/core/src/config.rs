//! Configuration for the emulator and the memory hierarchy.
//!
//! This module defines the structures used to parameterize a run:
//! 1. **Defaults:** Baseline constants for the hierarchy (block sizes,
//!    latencies, geometry, link parameters).
//! 2. **Run options:** Program, arguments, redirection, instruction budget.
//! 3. **Hierarchy description:** Modules and their nesting, loadable from
//!    JSON.

use serde::Deserialize;

use crate::coherence::{Engine, ModId};

/// Default configuration constants.
mod defaults {
    /// Cache line size in bytes.
    pub const BLOCK_SIZE: u32 = 64;
    /// First-level cache sets.
    pub const L1_SETS: u32 = 64;
    /// First-level associativity.
    pub const L1_ASSOC: u32 = 2;
    /// First-level tag latency in cycles.
    pub const L1_LATENCY: u64 = 1;
    /// Second-level cache sets.
    pub const L2_SETS: u32 = 256;
    /// Second-level associativity.
    pub const L2_ASSOC: u32 = 4;
    /// Second-level tag latency in cycles.
    pub const L2_LATENCY: u64 = 4;
    /// Main-memory sets (directory capacity, not data capacity).
    pub const MEM_SETS: u32 = 1024;
    /// Main-memory associativity.
    pub const MEM_ASSOC: u32 = 8;
    /// Main-memory latency in cycles.
    pub const MEM_LATENCY: u64 = 100;
    /// Link width in bytes per cycle.
    pub const NET_WIDTH: u32 = 8;
    /// Link base latency in cycles.
    pub const NET_LATENCY: u64 = 2;
    /// Messages in flight per link before senders defer.
    pub const NET_CAPACITY: usize = 8;

    pub fn block_size() -> u32 {
        BLOCK_SIZE
    }
    pub fn net_width() -> u32 {
        NET_WIDTH
    }
    pub fn net_latency() -> u64 {
        NET_LATENCY
    }
    pub fn net_capacity() -> usize {
        NET_CAPACITY
    }
}

/// One cache or main-memory module.
#[derive(Clone, Debug, Deserialize)]
pub struct ModuleConfig {
    /// Module name (unique in the hierarchy).
    pub name: String,
    /// Set count (power of two).
    pub sets: u32,
    /// Ways per set.
    pub assoc: u32,
    /// Block size in bytes.
    #[serde(default = "defaults::block_size")]
    pub block_size: u32,
    /// Tag/directory latency.
    pub latency: u64,
    /// Names of the modules directly above (empty for L1s).
    #[serde(default)]
    pub uppers: Vec<String>,
    /// True for the main-memory endpoint.
    #[serde(default)]
    pub main_memory: bool,
}

/// Description of a whole hierarchy.
#[derive(Clone, Debug, Deserialize)]
pub struct HierarchyConfig {
    /// Modules, listed leaves (memory) first or in any order; nesting
    /// comes from the `uppers` lists.
    pub modules: Vec<ModuleConfig>,
    /// Link width in bytes per cycle.
    #[serde(default = "defaults::net_width")]
    pub net_width: u32,
    /// Link base latency.
    #[serde(default = "defaults::net_latency")]
    pub net_latency: u64,
    /// Link occupancy limit.
    #[serde(default = "defaults::net_capacity")]
    pub net_capacity: usize,
}

impl HierarchyConfig {
    /// A two-level hierarchy: per-CPU L1s over a shared L2 over memory.
    pub fn two_level(cpus: usize) -> Self {
        let mut modules = vec![
            ModuleConfig {
                name: "mem".into(),
                sets: defaults::MEM_SETS,
                assoc: defaults::MEM_ASSOC,
                block_size: defaults::BLOCK_SIZE,
                latency: defaults::MEM_LATENCY,
                uppers: vec!["l2".into()],
                main_memory: true,
            },
            ModuleConfig {
                name: "l2".into(),
                sets: defaults::L2_SETS,
                assoc: defaults::L2_ASSOC,
                block_size: defaults::BLOCK_SIZE,
                latency: defaults::L2_LATENCY,
                uppers: (0..cpus).map(|i| format!("l1-{}", i)).collect(),
                main_memory: false,
            },
        ];
        for i in 0..cpus {
            modules.push(ModuleConfig {
                name: format!("l1-{}", i),
                sets: defaults::L1_SETS,
                assoc: defaults::L1_ASSOC,
                block_size: defaults::BLOCK_SIZE,
                latency: defaults::L1_LATENCY,
                uppers: Vec::new(),
                main_memory: false,
            });
        }
        Self {
            modules,
            net_width: defaults::NET_WIDTH,
            net_latency: defaults::NET_LATENCY,
            net_capacity: defaults::NET_CAPACITY,
        }
    }

    /// Builds the hierarchy into an engine. Returns the module ids by
    /// name, so callers can attach contexts to their L1s.
    pub fn build(&self, engine: &mut Engine) -> Result<Vec<(String, ModId)>, String> {
        let mut ids = Vec::new();
        for m in &self.modules {
            let id = if m.main_memory {
                engine.add_main_memory(&m.name, m.sets, m.assoc, m.block_size, m.latency)
            } else {
                engine.add_cache(&m.name, m.sets, m.assoc, m.block_size, m.latency)
            };
            ids.push((m.name.clone(), id));
        }
        let lookup = |name: &str| -> Result<ModId, String> {
            ids.iter()
                .find(|(n, _)| n == name)
                .map(|(_, id)| *id)
                .ok_or_else(|| format!("unknown module '{}'", name))
        };
        for m in &self.modules {
            if m.uppers.is_empty() {
                continue;
            }
            let low = lookup(&m.name)?;
            let uppers: Result<Vec<ModId>, String> =
                m.uppers.iter().map(|u| lookup(u)).collect();
            let net = engine.add_net(
                &format!("net-{}", m.name),
                self.net_width,
                self.net_latency,
                self.net_capacity,
            );
            engine.connect_levels(net, low, &uppers?);
        }
        Ok(ids)
    }
}

/// Root configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Hierarchy to simulate; None runs the emulator untimed.
    #[serde(default)]
    pub hierarchy: Option<HierarchyConfig>,
    /// Stop after this many guest instructions (0 = unlimited).
    #[serde(default)]
    pub max_instructions: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hierarchy: None,
            max_instructions: 0,
        }
    }
}

impl Config {
    /// Parses a JSON configuration.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// JSON hierarchy configs deserialize with defaults filled in.
    #[test]
    fn hierarchy_from_json() {
        let cfg = Config::from_json(
            r#"{
                "hierarchy": {
                    "modules": [
                        {"name": "mem", "sets": 128, "assoc": 4, "latency": 80,
                         "uppers": ["l1"], "main_memory": true},
                        {"name": "l1", "sets": 16, "assoc": 2, "latency": 1}
                    ]
                },
                "max_instructions": 500
            }"#,
        )
        .unwrap();
        let h = cfg.hierarchy.unwrap();
        assert_eq!(h.modules.len(), 2);
        assert_eq!(h.modules[0].block_size, 64, "default applied");
        assert_eq!(cfg.max_instructions, 500);
    }

    /// The built-in two-level hierarchy wires every L1 above the L2.
    #[test]
    fn two_level_builds() {
        let cfg = HierarchyConfig::two_level(2);
        let mut engine = Engine::new();
        let ids = cfg.build(&mut engine).unwrap();
        assert_eq!(ids.len(), 4);
        assert_eq!(engine.mods.len(), 4);
        assert_eq!(engine.nets.len(), 2);
    }
}
