//! Simulation statistics collection and reporting.
//!
//! Tracks emulation-side counters (instructions, syscalls, context
//! lifecycle, futex activity); per-module cache counters live on the
//! hierarchy modules and are folded into the report.

use std::time::Instant;

use crate::coherence::Engine;

/// Run-wide counters.
#[derive(Clone)]
pub struct SimStats {
    start_time: Instant,
    /// Guest instructions emulated.
    pub instructions: u64,
    /// System calls translated.
    pub syscalls: u64,
    /// Contexts created (initial load included).
    pub contexts_created: u64,
    /// Contexts freed after finishing.
    pub contexts_finished: u64,
    /// Futex wakeups performed.
    pub futex_wakes: u64,
}

impl Default for SimStats {
    fn default() -> Self {
        Self {
            start_time: Instant::now(),
            instructions: 0,
            syscalls: 0,
            contexts_created: 0,
            contexts_finished: 0,
            futex_wakes: 0,
        }
    }
}

impl SimStats {
    /// Emulated instructions per host second.
    pub fn mips(&self) -> f64 {
        let secs = self.start_time.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.instructions as f64 / secs / 1e6
        } else {
            0.0
        }
    }

    /// Renders the end-of-run report, including per-module hierarchy
    /// counters when a hierarchy is present.
    pub fn report(&self, engine: &Engine) -> String {
        let mut out = String::new();
        out.push_str("; Simulation statistics\n");
        out.push_str(&format!("instructions = {}\n", self.instructions));
        out.push_str(&format!("syscalls = {}\n", self.syscalls));
        out.push_str(&format!("contexts_created = {}\n", self.contexts_created));
        out.push_str(&format!("contexts_finished = {}\n", self.contexts_finished));
        out.push_str(&format!("futex_wakes = {}\n", self.futex_wakes));
        out.push_str(&format!("host_mips = {:.2}\n", self.mips()));

        for m in &engine.mods {
            let s = &m.stats;
            if s.accesses == 0 {
                continue;
            }
            out.push_str(&format!("\n[ {} ]\n", m.name));
            out.push_str(&format!("accesses = {}\n", s.accesses));
            out.push_str(&format!("hits = {}\n", s.hits));
            out.push_str(&format!("reads = {}\n", s.reads));
            out.push_str(&format!("read_hits = {}\n", s.read_hits));
            out.push_str(&format!("writes = {}\n", s.writes));
            out.push_str(&format!("write_hits = {}\n", s.write_hits));
            out.push_str(&format!("read_retries = {}\n", s.read_retries));
            out.push_str(&format!("write_retries = {}\n", s.write_retries));
            out.push_str(&format!("evictions = {}\n", s.evictions));
        }
        out
    }
}
