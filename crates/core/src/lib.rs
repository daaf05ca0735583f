//! Userspace multi-ISA emulator and coherent memory-hierarchy engine.
//!
//! This crate implements the two core subsystems of the simulator:
//! 1. **Guest-process emulation:** ELF loading, sparse virtual memory, a
//!    Linux-ABI syscall translator, signal delivery, and cooperative
//!    scheduling of guest threads (contexts) that can suspend across
//!    host-blocking events.
//! 2. **Memory hierarchy:** An event-driven model of a multi-level cache
//!    hierarchy running a MOESI directory-based coherence protocol over a
//!    simulated interconnect, with non-blocking accesses, victim eviction,
//!    write-back, invalidation, and retry under lock contention.

/// Shared types: errors, guest errno values, and flag string maps.
pub mod common;
/// Simulator configuration (defaults, hierarchy description, run options).
pub mod config;
/// Event simulator kernel: simulated clock and event queue.
pub mod esim;
/// Interconnect message transport between hierarchy modules.
pub mod net;
/// Cache tag arrays, LRU bookkeeping, and coherence directories.
pub mod cache;
/// MOESI coherence protocol engine.
pub mod coherence;
/// Guest virtual memory image and speculative mirror.
pub mod mem;
/// ELF loader and stack/auxiliary-vector builder.
pub mod loader;
/// Guest thread contexts, state lists, and signal delivery.
pub mod context;
/// ISA decoders and instruction executors (MIPS32, x86).
pub mod isa;
/// Linux-ABI syscall translator.
pub mod syscall;
/// Global simulator environment and run loop.
pub mod emu;
/// Simulation statistics collection and reporting.
pub mod stats;

/// Top-level emulator environment; construct with `Emu::new`.
pub use crate::emu::Emu;
/// Root configuration type; use `Config::default()` or deserialize from JSON.
pub use crate::config::Config;
