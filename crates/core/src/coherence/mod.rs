//! MOESI coherence protocol engine.
//!
//! Every top-level access (load, store, nc-store) begins at a cache module
//! and descends through a chain of events. The protocol is directory-based:
//! ownership of an upper level's line lives in the module below it. Each
//! in-flight access is tracked by a heap-allocated frame in an arena,
//! threaded by parent links; the "return" step posts results to the parent
//! frame and schedules its continuation event.
//!
//! Lock contention on a directory entry never blocks a non-blocking caller;
//! the error propagates up the chain and the initiator retries the whole
//! access after a randomised latency.

use std::collections::HashMap;

use crate::cache::{BlockState, Cache, Directory};
use crate::common::SimError;
use crate::esim::EventQueue;
use crate::net::{MsgId, Network, NodeId};

/// Index of a module in the hierarchy.
pub type ModId = usize;
/// Index of a network in the hierarchy.
pub type NetId = usize;

/// Protocol event kinds. One enum value per step of each flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Load,
    LoadLock,
    LoadAction,
    LoadMiss,
    LoadFinish,

    Store,
    StoreLock,
    StoreAction,
    StoreFinish,

    FindAndLock,
    FindAndLockAction,
    FindAndLockFinish,

    Evict,
    EvictInvalid,
    EvictAction,
    EvictReceive,
    EvictWriteback,
    EvictWritebackExclusive,
    EvictWritebackFinish,
    EvictProcess,
    EvictReply,
    EvictReplyReceive,
    EvictFinish,

    ReadRequest,
    ReadRequestReceive,
    ReadRequestAction,
    ReadRequestUpDown,
    ReadRequestUpDownMiss,
    ReadRequestUpDownFinish,
    ReadRequestDownUp,
    ReadRequestDownUpFinish,
    ReadRequestReply,
    ReadRequestFinish,

    WriteRequest,
    WriteRequestReceive,
    WriteRequestAction,
    WriteRequestExclusive,
    WriteRequestUpDown,
    WriteRequestUpDownFinish,
    WriteRequestDownUp,
    WriteRequestReply,
    WriteRequestFinish,

    Invalidate,
    InvalidateFinish,
}

/// Module kinds: a cache level, or the main-memory endpoint of the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleKind {
    Cache,
    MainMemory,
}

/// Per-module access counters.
#[derive(Clone, Debug, Default)]
pub struct ModStats {
    pub accesses: u64,
    pub hits: u64,
    pub reads: u64,
    pub read_hits: u64,
    pub writes: u64,
    pub write_hits: u64,
    pub blocking_reads: u64,
    pub non_blocking_reads: u64,
    pub blocking_writes: u64,
    pub non_blocking_writes: u64,
    pub read_retries: u64,
    pub write_retries: u64,
    pub no_retry_accesses: u64,
    pub no_retry_hits: u64,
    pub no_retry_reads: u64,
    pub no_retry_read_hits: u64,
    pub no_retry_writes: u64,
    pub no_retry_write_hits: u64,
    pub evictions: u64,
}

/// A node of the memory hierarchy: a cache level or main memory, attached
/// to a network toward the CPU (high) and one toward memory (low).
pub struct Module {
    /// Module name, for trace output.
    pub name: String,
    pub kind: ModuleKind,
    /// Line size in bytes.
    pub block_size: u32,
    /// Tag/directory access latency in cycles.
    pub latency: u64,
    pub cache: Cache,
    pub dir: Directory<EventKind>,
    /// Network toward memory, and this module's node on it.
    pub low_net: Option<NetId>,
    pub low_net_node: NodeId,
    /// Network toward the CPU, and this module's node on it (always 0).
    pub high_net: Option<NetId>,
    pub high_net_node: NodeId,
    /// The single module directly below, if any.
    pub low_mod: Option<ModId>,
    pub stats: ModStats,
    /// In-flight accesses by block address, for coalescing bookkeeping.
    access_list: HashMap<u32, Vec<u64>>,
}

/// The per-request record threaded through every coherence event.
///
/// Frames live in the engine's arena; `ret` is the parent frame's id and
/// `ret_event` the continuation scheduled on it when this frame returns.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Arena id of this frame.
    pub id: u64,
    /// Arena id of the initiating access (shared by all sub-frames).
    pub access_id: u64,
    pub mod_id: ModId,
    pub target_mod: Option<ModId>,
    pub addr: u32,
    pub set: u32,
    pub way: u32,
    pub tag: u32,
    pub state: BlockState,
    pub ret: Option<u64>,
    pub ret_event: EventKind,
    pub blocking: bool,
    pub read: bool,
    pub nc: bool,
    pub retried: bool,
    pub err: bool,
    pub shared: bool,
    pub hit: bool,
    pub eviction: bool,
    pub writeback: bool,
    pub pending: u32,
    pub reply_size: u32,
    pub msg: Option<(NetId, MsgId)>,
    pub except_mod: Option<ModId>,
    pub src_set: u32,
    pub src_way: u32,
    pub src_tag: u32,
    /// (module, set, way) of the directory lock this frame holds.
    pub dir_lock: Option<(ModId, u32, u32)>,
}

impl Frame {
    fn new(id: u64, access_id: u64, mod_id: ModId, addr: u32) -> Self {
        Self {
            id,
            access_id,
            mod_id,
            target_mod: None,
            addr,
            set: 0,
            way: 0,
            tag: 0,
            state: BlockState::Invalid,
            ret: None,
            ret_event: EventKind::LoadFinish,
            blocking: false,
            read: false,
            nc: false,
            retried: false,
            err: false,
            shared: false,
            hit: false,
            eviction: false,
            writeback: false,
            pending: 0,
            reply_size: 0,
            msg: None,
            except_mod: None,
            src_set: 0,
            src_way: 0,
            src_tag: 0,
            dir_lock: None,
        }
    }
}

/// The coherence engine: event queue, networks, modules, and the access
/// frame arena.
pub struct Engine {
    pub queue: EventQueue<EventKind>,
    pub nets: Vec<Network>,
    /// Per network, node index to module id.
    node_mods: Vec<Vec<ModId>>,
    pub mods: Vec<Module>,
    frames: HashMap<u64, Frame>,
    next_frame: u64,
    finished: Vec<u64>,
    /// Minimum block size across all modules; directory granularity.
    pub min_block_size: u32,
    lfsr: u64,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            queue: EventQueue::new(),
            nets: Vec::new(),
            node_mods: Vec::new(),
            mods: Vec::new(),
            frames: HashMap::new(),
            next_frame: 0,
            finished: Vec::new(),
            min_block_size: u32::MAX,
            lfsr: 0x2545_f491_4f6c_dd1d,
        }
    }

    /// Adds a network and returns its id.
    pub fn add_net(&mut self, name: &str, width: u32, latency: u64, capacity: usize) -> NetId {
        self.nets.push(Network::new(name, width, latency, capacity));
        self.node_mods.push(Vec::new());
        self.nets.len() - 1
    }

    /// Adds a cache module with an empty tag array and directory.
    pub fn add_cache(
        &mut self,
        name: &str,
        num_sets: u32,
        assoc: u32,
        block_size: u32,
        latency: u64,
    ) -> ModId {
        self.add_module(ModuleKind::Cache, name, num_sets, assoc, block_size, latency)
    }

    /// Adds a main-memory module. Main memory terminates the chain: a
    /// directory miss there is never a data miss, and blocks materialise
    /// as E on demand.
    pub fn add_main_memory(
        &mut self,
        name: &str,
        num_sets: u32,
        assoc: u32,
        block_size: u32,
        latency: u64,
    ) -> ModId {
        self.add_module(ModuleKind::MainMemory, name, num_sets, assoc, block_size, latency)
    }

    fn add_module(
        &mut self,
        kind: ModuleKind,
        name: &str,
        num_sets: u32,
        assoc: u32,
        block_size: u32,
        latency: u64,
    ) -> ModId {
        self.min_block_size = self.min_block_size.min(block_size);
        // Directory zsize is fixed up in `connect_levels` once the global
        // minimum block size is known.
        self.mods.push(Module {
            name: name.to_string(),
            kind,
            block_size,
            latency,
            cache: Cache::new(num_sets, assoc, block_size),
            dir: Directory::new(num_sets, assoc, 1),
            low_net: None,
            low_net_node: 0,
            high_net: None,
            high_net_node: 0,
            low_mod: None,
            stats: ModStats::default(),
            access_list: HashMap::new(),
        });
        self.mods.len() - 1
    }

    /// Wires a network between a lower module and the upper modules above
    /// it. The lower module takes node 0 on the net; directory sharer bits
    /// at the lower module are indexed by the upper modules' node ids.
    pub fn connect_levels(&mut self, net: NetId, low: ModId, uppers: &[ModId]) {
        let low_node = self.nets[net].add_node(&self.mods[low].name.clone());
        debug_assert_eq!(low_node, 0, "lower module must be node 0");
        self.node_mods[net].push(low);
        self.mods[low].high_net = Some(net);
        self.mods[low].high_net_node = low_node;

        for &up in uppers {
            let node = self.nets[net].add_node(&self.mods[up].name.clone());
            self.node_mods[net].push(up);
            self.mods[up].low_net = Some(net);
            self.mods[up].low_net_node = node;
            self.mods[up].low_mod = Some(low);
        }

        // Re-derive directory granularity now that the hierarchy grew.
        for m in &mut self.mods {
            let zsize = m.block_size / self.min_block_size;
            m.dir = Directory::new(m.cache.num_sets, m.cache.assoc, zsize);
        }
    }

    // ------------------------------------------------------------------
    // Access entry points
    // ------------------------------------------------------------------

    /// Starts a load at `module`. Returns the access id; completion is
    /// observable through `take_finished`.
    pub fn load(&mut self, module: ModId, addr: u32) -> u64 {
        let id = self.new_frame(None, module, addr);
        {
            let f = self.frame_mut(id);
            f.read = true;
        }
        self.queue.schedule(EventKind::Load, id, 0);
        id
    }

    /// Starts a store at `module`.
    pub fn store(&mut self, module: ModId, addr: u32) -> u64 {
        let id = self.new_frame(None, module, addr);
        self.queue.schedule(EventKind::Store, id, 0);
        id
    }

    /// Starts a non-coherent store: same flow as a store, but the block is
    /// left clean (E) so it will not be written back.
    pub fn nc_store(&mut self, module: ModId, addr: u32) -> u64 {
        let id = self.new_frame(None, module, addr);
        {
            let f = self.frame_mut(id);
            f.nc = true;
        }
        self.queue.schedule(EventKind::Store, id, 0);
        id
    }

    /// Collects a completed access, if it has finished.
    pub fn take_finished(&mut self, access: u64) -> bool {
        if let Some(pos) = self.finished.iter().position(|&id| id == access) {
            self.finished.swap_remove(pos);
            true
        } else {
            false
        }
    }

    /// Dispatches every pending event, advancing the clock batch by batch,
    /// until the queue drains.
    pub fn run_until_idle(&mut self) -> Result<(), SimError> {
        loop {
            while let Some(ev) = self.queue.pop_due() {
                self.dispatch(ev.kind, ev.stack)?;
            }
            if !self.queue.advance() {
                return Ok(());
            }
        }
    }

    /// State of the block holding `addr` at `module`, I if absent.
    pub fn block_state(&self, module: ModId, addr: u32) -> BlockState {
        let m = &self.mods[module];
        match m.cache.find_block(addr, &|s, w| m.dir.is_locked(s, w)) {
            Some((_, _, state)) => state,
            None => BlockState::Invalid,
        }
    }

    /// Directory entry for `addr`'s first sub-block at `module`, if the
    /// block is resident.
    pub fn dir_entry(&self, module: ModId, addr: u32) -> Option<crate::cache::DirEntry> {
        let m = &self.mods[module];
        let (set, way, _) = m.cache.find_block(addr, &|s, w| m.dir.is_locked(s, w))?;
        let z = (addr % m.block_size) / self.min_block_size;
        Some(m.dir.entry(set, way, z))
    }

    /// Node id a module uses on the network below it; this is its sharer
    /// bit index in the lower module's directory.
    pub fn sharer_index(&self, module: ModId) -> usize {
        self.mods[module].low_net_node
    }

    // ------------------------------------------------------------------
    // Frame arena
    // ------------------------------------------------------------------

    fn new_frame(&mut self, parent: Option<u64>, mod_id: ModId, addr: u32) -> u64 {
        let id = self.next_frame;
        self.next_frame += 1;
        let access_id = parent
            .and_then(|p| self.frames.get(&p))
            .map(|p| p.access_id)
            .unwrap_or(id);
        let mut f = Frame::new(id, access_id, mod_id, addr);
        f.ret = parent;
        self.frames.insert(id, f);
        id
    }

    fn child(&mut self, parent: u64, mod_id: ModId, addr: u32, ret_event: EventKind) -> u64 {
        let id = self.new_frame(Some(parent), mod_id, addr);
        self.frame_mut(id).ret_event = ret_event;
        id
    }

    fn frame(&self, id: u64) -> &Frame {
        self.frames.get(&id).expect("live frame")
    }

    fn frame_mut(&mut self, id: u64) -> &mut Frame {
        self.frames.get_mut(&id).expect("live frame")
    }

    /// Posts results to the parent and schedules its continuation; root
    /// frames complete the access instead. The frame is reclaimed either
    /// way (root frames stay until collected).
    fn stack_return(&mut self, id: u64) {
        let f = self.frames.remove(&id).expect("live frame");
        match f.ret {
            Some(parent) => self.queue.schedule(f.ret_event, parent, 0),
            None => self.finished.push(f.id),
        }
    }

    fn retry_latency(&mut self, module: ModId) -> u64 {
        let lat = self.mods[module].latency.max(1);
        let mut x = self.lfsr;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.lfsr = x;
        lat + x % lat
    }

    fn low_mod(&self, module: ModId) -> ModId {
        self.mods[module]
            .low_mod
            .unwrap_or_else(|| panic!("module {} has no lower level", self.mods[module].name))
    }

    /// True when the request from `mod_id` to `target` travels toward
    /// memory (up-down); false for toward-CPU (down-up).
    fn is_updown(&self, mod_id: ModId, target: ModId) -> Result<bool, SimError> {
        if self.mods[mod_id].low_mod == Some(target) {
            Ok(true)
        } else if self.mods[target].low_mod == Some(mod_id) {
            Ok(false)
        } else {
            Err(SimError::CoherenceInconsistency(format!(
                "request between unrelated modules {} and {}",
                self.mods[mod_id].name, self.mods[target].name
            )))
        }
    }

    fn unlock_dir(&mut self, lock: Option<(ModId, u32, u32)>) {
        if let Some((m, set, way)) = lock {
            // Directory lives in the module; the waiter wakeup goes through
            // the shared event queue.
            let dir = &mut self.mods[m].dir;
            dir.unlock(&mut self.queue, set, way);
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Runs one event handler. Handlers never block: each either finishes
    /// the frame or schedules the next event of its flow.
    pub fn dispatch(&mut self, kind: EventKind, stack: u64) -> Result<(), SimError> {
        use EventKind::*;
        match kind {
            Load | LoadLock | LoadAction | LoadMiss | LoadFinish => self.handle_load(kind, stack),
            Store | StoreLock | StoreAction | StoreFinish => self.handle_store(kind, stack),
            FindAndLock | FindAndLockAction | FindAndLockFinish => {
                self.handle_find_and_lock(kind, stack)
            }
            Evict | EvictInvalid | EvictAction | EvictReceive | EvictWriteback
            | EvictWritebackExclusive | EvictWritebackFinish | EvictProcess | EvictReply
            | EvictReplyReceive | EvictFinish => self.handle_evict(kind, stack),
            ReadRequest | ReadRequestReceive | ReadRequestAction | ReadRequestUpDown
            | ReadRequestUpDownMiss | ReadRequestUpDownFinish | ReadRequestDownUp
            | ReadRequestDownUpFinish | ReadRequestReply | ReadRequestFinish => {
                self.handle_read_request(kind, stack)
            }
            WriteRequest | WriteRequestReceive | WriteRequestAction | WriteRequestExclusive
            | WriteRequestUpDown | WriteRequestUpDownFinish | WriteRequestDownUp
            | WriteRequestReply | WriteRequestFinish => self.handle_write_request(kind, stack),
            Invalidate | InvalidateFinish => self.handle_invalidate(kind, stack),
        }
    }

    // ------------------------------------------------------------------
    // Load
    // ------------------------------------------------------------------

    fn handle_load(&mut self, kind: EventKind, stack: u64) -> Result<(), SimError> {
        use EventKind::*;
        let f = self.frame(stack).clone();
        let mod_id = f.mod_id;

        match kind {
            Load => {
                log::trace!(
                    "{} {} {:#x} {} load",
                    self.queue.now(),
                    f.access_id,
                    f.addr,
                    self.mods[mod_id].name
                );
                let tag = self.mods[mod_id].cache.tag_of(f.addr);
                self.mods[mod_id]
                    .access_list
                    .entry(tag)
                    .or_default()
                    .push(stack);
                self.queue.schedule(LoadLock, stack, 0);
            }
            LoadLock => {
                let child = self.child(stack, mod_id, f.addr, LoadAction);
                let c = self.frame_mut(child);
                c.blocking = false;
                c.read = true;
                c.retried = f.retried;
                self.queue.schedule(FindAndLock, child, 0);
            }
            LoadAction => {
                if f.err {
                    self.mods[mod_id].stats.read_retries += 1;
                    let lat = self.retry_latency(mod_id);
                    log::trace!("  lock error, retrying in {} cycles", lat);
                    self.frame_mut(stack).retried = true;
                    self.frame_mut(stack).err = false;
                    self.queue.schedule(LoadLock, stack, lat);
                    return Ok(());
                }
                if f.state.is_valid() {
                    self.queue.schedule(LoadFinish, stack, 0);
                    return Ok(());
                }
                // Miss: fetch from the level below.
                let low = self.low_mod(mod_id);
                let child = self.child(stack, mod_id, f.tag, LoadMiss);
                self.frame_mut(child).target_mod = Some(low);
                self.queue.schedule(ReadRequest, child, 0);
            }
            LoadMiss => {
                if f.err {
                    self.mods[mod_id].stats.read_retries += 1;
                    let lat = self.retry_latency(mod_id);
                    self.unlock_dir(f.dir_lock);
                    log::trace!("  lock error, retrying in {} cycles", lat);
                    let fm = self.frame_mut(stack);
                    fm.retried = true;
                    fm.err = false;
                    fm.dir_lock = None;
                    self.queue.schedule(LoadLock, stack, lat);
                    return Ok(());
                }
                let state = if f.shared {
                    BlockState::Shared
                } else {
                    BlockState::Exclusive
                };
                self.mods[mod_id].cache.set_block(f.set, f.way, f.tag, state);
                self.queue.schedule(LoadFinish, stack, 0);
            }
            LoadFinish => {
                log::trace!(
                    "{} {} {:#x} {} load finish",
                    self.queue.now(),
                    f.access_id,
                    f.tag,
                    self.mods[mod_id].name
                );
                self.unlock_dir(f.dir_lock);
                self.access_extract(mod_id, stack);
                self.stack_return(stack);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Store
    // ------------------------------------------------------------------

    fn handle_store(&mut self, kind: EventKind, stack: u64) -> Result<(), SimError> {
        use EventKind::*;
        let f = self.frame(stack).clone();
        let mod_id = f.mod_id;

        match kind {
            Store => {
                log::trace!(
                    "{} {} {:#x} {} store",
                    self.queue.now(),
                    f.access_id,
                    f.addr,
                    self.mods[mod_id].name
                );
                let tag = self.mods[mod_id].cache.tag_of(f.addr);
                self.mods[mod_id]
                    .access_list
                    .entry(tag)
                    .or_default()
                    .push(stack);
                self.queue.schedule(StoreLock, stack, 0);
            }
            StoreLock => {
                let child = self.child(stack, mod_id, f.addr, StoreAction);
                let c = self.frame_mut(child);
                c.blocking = false;
                c.read = false;
                c.retried = f.retried;
                self.queue.schedule(FindAndLock, child, 0);
            }
            StoreAction => {
                if f.err {
                    self.mods[mod_id].stats.write_retries += 1;
                    let lat = self.retry_latency(mod_id);
                    log::trace!("  lock error, retrying in {} cycles", lat);
                    let fm = self.frame_mut(stack);
                    fm.retried = true;
                    fm.err = false;
                    self.queue.schedule(StoreLock, stack, lat);
                    return Ok(());
                }
                // M/E hit: the line is already exclusive here.
                if matches!(f.state, BlockState::Modified | BlockState::Exclusive) {
                    self.queue.schedule(StoreFinish, stack, 0);
                    return Ok(());
                }
                // O/S/I: gain exclusivity from the level below.
                let low = self.low_mod(mod_id);
                let child = self.child(stack, mod_id, f.tag, StoreFinish);
                self.frame_mut(child).target_mod = Some(low);
                self.queue.schedule(WriteRequest, child, 0);
            }
            StoreFinish => {
                if f.err {
                    self.mods[mod_id].stats.write_retries += 1;
                    let lat = self.retry_latency(mod_id);
                    self.unlock_dir(f.dir_lock);
                    log::trace!("  lock error, retrying in {} cycles", lat);
                    let fm = self.frame_mut(stack);
                    fm.retried = true;
                    fm.err = false;
                    fm.dir_lock = None;
                    self.queue.schedule(StoreLock, stack, lat);
                    return Ok(());
                }
                let state = if f.nc {
                    BlockState::Exclusive
                } else {
                    BlockState::Modified
                };
                self.mods[mod_id].cache.set_block(f.set, f.way, f.tag, state);
                log::trace!(
                    "{} {} {:#x} {} store finish",
                    self.queue.now(),
                    f.access_id,
                    f.tag,
                    self.mods[mod_id].name
                );
                self.unlock_dir(f.dir_lock);
                self.access_extract(mod_id, stack);
                self.stack_return(stack);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn access_extract(&mut self, mod_id: ModId, stack: u64) {
        let tag = {
            let f = self.frame(stack);
            self.mods[mod_id].cache.tag_of(f.addr)
        };
        if let Some(list) = self.mods[mod_id].access_list.get_mut(&tag) {
            list.retain(|&id| id != stack);
            if list.is_empty() {
                self.mods[mod_id].access_list.remove(&tag);
            }
        }
    }

    // ------------------------------------------------------------------
    // Find and lock
    // ------------------------------------------------------------------

    fn handle_find_and_lock(&mut self, kind: EventKind, stack: u64) -> Result<(), SimError> {
        use EventKind::*;
        let f = self.frame(stack).clone();
        let mod_id = f.mod_id;
        let parent = f.ret.expect("find-and-lock always has a caller");

        match kind {
            FindAndLock => {
                log::trace!(
                    "  {} {} {:#x} {} find and lock (blocking={})",
                    self.queue.now(),
                    f.access_id,
                    f.addr,
                    self.mods[mod_id].name,
                    f.blocking
                );

                {
                    let p = self.frame_mut(parent);
                    p.err = false;
                    p.set = 0;
                    p.way = 0;
                    p.state = BlockState::Invalid;
                    p.tag = 0;
                }

                let lookup = {
                    let m = &self.mods[mod_id];
                    m.cache.find_block(f.addr, &|s, w| m.dir.is_locked(s, w))
                };
                let (set, way, state, hit) = match lookup {
                    Some((set, way, state)) => (set, way, state, state.is_valid()),
                    None => (0, 0, BlockState::Invalid, false),
                };
                let tag = self.mods[mod_id].cache.tag_of(f.addr);

                // Statistics.
                {
                    let s = &mut self.mods[mod_id].stats;
                    s.accesses += 1;
                    if hit {
                        s.hits += 1;
                    }
                    if f.read {
                        s.reads += 1;
                        if f.blocking {
                            s.blocking_reads += 1;
                        } else {
                            s.non_blocking_reads += 1;
                        }
                        if hit {
                            s.read_hits += 1;
                        }
                    } else {
                        s.writes += 1;
                        if f.blocking {
                            s.blocking_writes += 1;
                        } else {
                            s.non_blocking_writes += 1;
                        }
                        if hit {
                            s.write_hits += 1;
                        }
                    }
                    if !f.retried {
                        s.no_retry_accesses += 1;
                        if hit {
                            s.no_retry_hits += 1;
                        }
                        if f.read {
                            s.no_retry_reads += 1;
                            if hit {
                                s.no_retry_read_hits += 1;
                            }
                        } else {
                            s.no_retry_writes += 1;
                            if hit {
                                s.no_retry_write_hits += 1;
                            }
                        }
                    }
                }

                let (set, way, state) = if lookup.is_some() {
                    (set, way, state)
                } else {
                    // Miss: pick the LRU victim.
                    if f.blocking {
                        return Err(SimError::CoherenceInconsistency(format!(
                            "blocking find-and-lock missed at {} for {:#x}",
                            self.mods[mod_id].name, f.addr
                        )));
                    }
                    let vset = self.mods[mod_id].cache.set_of(f.addr);
                    let vway = self.mods[mod_id].cache.replace_block(vset);
                    let (_, vstate) = self.mods[mod_id].cache.get_block(vset, vway);
                    if !vstate.is_valid()
                        && self.mods[mod_id].dir.group_shared_or_owned(vset, vway)
                    {
                        return Err(SimError::CoherenceInconsistency(format!(
                            "invalid victim with sharers at {} set {} way {}",
                            self.mods[mod_id].name, vset, vway
                        )));
                    }
                    log::trace!(
                        "    {} {:#x} {} miss -> lru: set={}, way={}, state={:?}",
                        f.access_id,
                        tag,
                        self.mods[mod_id].name,
                        vset,
                        vway,
                        vstate
                    );
                    (vset, vway, vstate)
                };

                {
                    let fm = self.frame_mut(stack);
                    fm.hit = lookup.map(|(_, _, s)| s.is_valid()).unwrap_or(false);
                    fm.set = set;
                    fm.way = way;
                    fm.state = state;
                    fm.tag = tag;
                }

                // Lock the entry. Non-blocking callers take an error on
                // contention; blocking callers join the FIFO queue.
                if self.mods[mod_id].dir.is_locked(set, way) && !f.blocking {
                    log::trace!(
                        "    {} {:#x} {} block already locked: set={}, way={}",
                        f.access_id,
                        tag,
                        self.mods[mod_id].name,
                        set,
                        way
                    );
                    self.frame_mut(parent).err = true;
                    self.stack_return(stack);
                    return Ok(());
                }
                if !self.mods[mod_id].dir.lock(set, way, FindAndLock, stack) {
                    // Queued; this event re-runs from the top on wakeup.
                    return Ok(());
                }
                self.frame_mut(stack).dir_lock = Some((mod_id, set, way));

                // Record the transient tag so a later lookup sees the fill
                // in progress, and update LRU order.
                self.mods[mod_id].cache.set_transient_tag(set, way, tag);
                self.mods[mod_id].cache.access_block(set, way);

                let lat = self.mods[mod_id].latency;
                self.queue.schedule(FindAndLockAction, stack, lat);
            }
            FindAndLockAction => {
                // On miss with a valid victim, run the eviction sub-flow.
                if !f.hit && f.state.is_valid() {
                    self.frame_mut(stack).eviction = true;
                    let child = self.child(stack, mod_id, 0, FindAndLockFinish);
                    let c = self.frame_mut(child);
                    c.set = f.set;
                    c.way = f.way;
                    self.queue.schedule(Evict, child, 0);
                    return Ok(());
                }
                self.queue.schedule(FindAndLockFinish, stack, 0);
            }
            FindAndLockFinish => {
                if f.err {
                    // Eviction failed; surface the error and release.
                    let (_, state) = self.mods[mod_id].cache.get_block(f.set, f.way);
                    if !state.is_valid() || !f.eviction {
                        return Err(SimError::CoherenceInconsistency(format!(
                            "failed eviction left invalid block at {}",
                            self.mods[mod_id].name
                        )));
                    }
                    self.frame_mut(parent).err = true;
                    self.unlock_dir(f.dir_lock);
                    self.stack_return(stack);
                    return Ok(());
                }

                let mut state = f.state;
                if f.eviction {
                    self.mods[mod_id].stats.evictions += 1;
                    let (_, vstate) = self.mods[mod_id].cache.get_block(f.set, f.way);
                    if vstate.is_valid() {
                        return Err(SimError::CoherenceInconsistency(format!(
                            "eviction left valid block at {}",
                            self.mods[mod_id].name
                        )));
                    }
                    state = vstate;
                }

                // Main memory materialises missing blocks; a miss there was
                // only a directory miss.
                if self.mods[mod_id].kind == ModuleKind::MainMemory && !state.is_valid() {
                    state = BlockState::Exclusive;
                    self.mods[mod_id].cache.set_block(f.set, f.way, f.tag, state);
                }

                {
                    let p = self.frame_mut(parent);
                    p.err = false;
                    p.set = f.set;
                    p.way = f.way;
                    p.state = state;
                    p.tag = f.tag;
                    p.dir_lock = f.dir_lock;
                }
                self.stack_return(stack);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Evict
    // ------------------------------------------------------------------

    fn handle_evict(&mut self, kind: EventKind, stack: u64) -> Result<(), SimError> {
        use EventKind::*;
        let f = self.frame(stack).clone();
        let mod_id = f.mod_id;

        match kind {
            Evict => {
                let parent = f.ret.expect("evict has a caller");
                self.frame_mut(parent).err = false;

                let (tag, state) = self.mods[mod_id].cache.get_block(f.set, f.way);
                if !state.is_valid() && self.mods[mod_id].dir.group_shared_or_owned(f.set, f.way) {
                    return Err(SimError::CoherenceInconsistency(format!(
                        "invalid evict victim with sharers at {}",
                        self.mods[mod_id].name
                    )));
                }
                log::trace!(
                    "  {} {} {:#x} {} evict (set={}, way={}, state={:?})",
                    self.queue.now(),
                    f.access_id,
                    tag,
                    self.mods[mod_id].name,
                    f.set,
                    f.way,
                    state
                );

                {
                    let fm = self.frame_mut(stack);
                    fm.tag = tag;
                    fm.state = state;
                    fm.src_set = f.set;
                    fm.src_way = f.way;
                    fm.src_tag = tag;
                }
                if self.mods[mod_id].kind == ModuleKind::Cache {
                    let low = self.low_mod(mod_id);
                    self.frame_mut(stack).target_mod = Some(low);
                }

                // Pull the line out of every upper-level sharer first.
                let child = self.child(stack, mod_id, 0, EvictInvalid);
                let c = self.frame_mut(child);
                c.except_mod = None;
                c.set = f.set;
                c.way = f.way;
                self.queue.schedule(Invalidate, child, 0);
            }
            EvictInvalid => {
                // Main memory keeps no copy below it: invalidate and stop.
                if self.mods[mod_id].kind == ModuleKind::MainMemory {
                    self.mods[mod_id]
                        .cache
                        .set_block(f.src_set, f.src_way, 0, BlockState::Invalid);
                    self.queue.schedule(EvictFinish, stack, 0);
                    return Ok(());
                }
                self.queue.schedule(EvictAction, stack, 0);
            }
            EvictAction => {
                let target = f.target_mod.expect("evict target");
                let low_net = self.mods[mod_id].low_net.expect("cache has low net");
                let src_node = self.mods[mod_id].low_net_node;
                let dst_node = self.mods[target].high_net_node;

                match f.state {
                    BlockState::Invalid => {
                        self.queue.schedule(EvictFinish, stack, 0);
                    }
                    BlockState::Modified | BlockState::Owned => {
                        // Dirty line travels with the message.
                        let size = self.mods[mod_id].block_size + 8;
                        let msg = self.nets[low_net].try_send(
                            &mut self.queue,
                            src_node,
                            dst_node,
                            size,
                            EvictReceive,
                            EvictAction,
                            stack,
                        );
                        let fm = self.frame_mut(stack);
                        fm.writeback = true;
                        fm.msg = msg.map(|m| (low_net, m));
                    }
                    BlockState::Shared | BlockState::Exclusive => {
                        let msg = self.nets[low_net].try_send(
                            &mut self.queue,
                            src_node,
                            dst_node,
                            8,
                            EvictReceive,
                            EvictAction,
                            stack,
                        );
                        self.frame_mut(stack).msg = msg.map(|m| (low_net, m));
                    }
                }
            }
            EvictReceive => {
                let target = f.target_mod.expect("evict target");
                if let Some((net, msg)) = f.msg {
                    let node = self.mods[target].high_net_node;
                    self.nets[net].receive(node, msg);
                    self.frame_mut(stack).msg = None;
                }
                let child = self.child(stack, target, f.src_tag, EvictWriteback);
                let c = self.frame_mut(child);
                c.blocking = false;
                c.read = false;
                c.retried = false;
                self.queue.schedule(FindAndLock, child, 0);
            }
            EvictWriteback => {
                let parent = f.ret.expect("evict has a caller");
                if f.err {
                    self.frame_mut(parent).err = true;
                    self.queue.schedule(EvictReply, stack, 0);
                    return Ok(());
                }
                if !f.writeback {
                    self.queue.schedule(EvictProcess, stack, 0);
                    return Ok(());
                }
                // Dirty landing: flush other sharers of the target line.
                let target = f.target_mod.expect("evict target");
                let child = self.child(stack, target, 0, EvictWritebackExclusive);
                let c = self.frame_mut(child);
                c.except_mod = Some(mod_id);
                c.set = f.set;
                c.way = f.way;
                self.queue.schedule(Invalidate, child, 0);
            }
            EvictWritebackExclusive => {
                let target = f.target_mod.expect("evict target");
                if !f.state.is_valid() {
                    return Err(SimError::CoherenceInconsistency(format!(
                        "writeback to invalid block at {}",
                        self.mods[target].name
                    )));
                }
                // O/S at the target: promote to M further down first.
                if matches!(f.state, BlockState::Owned | BlockState::Shared) {
                    let low = self.low_mod(target);
                    let child = self.child(stack, target, f.tag, EvictWritebackFinish);
                    self.frame_mut(child).target_mod = Some(low);
                    self.queue.schedule(WriteRequest, child, 0);
                    return Ok(());
                }
                self.queue.schedule(EvictWritebackFinish, stack, 0);
            }
            EvictWritebackFinish => {
                let parent = f.ret.expect("evict has a caller");
                let target = f.target_mod.expect("evict target");
                if f.err {
                    self.frame_mut(parent).err = true;
                    self.unlock_dir(f.dir_lock);
                    self.frame_mut(stack).dir_lock = None;
                    self.queue.schedule(EvictReply, stack, 0);
                    return Ok(());
                }
                self.mods[target]
                    .cache
                    .set_block(f.set, f.way, f.tag, BlockState::Modified);
                self.queue.schedule(EvictProcess, stack, 0);
            }
            EvictProcess => {
                // Drop the evicting node's sharer/owner bits at the target.
                let target = f.target_mod.expect("evict target");
                let evicting_node = self.mods[mod_id].low_net_node;
                let zsize = self.mods[target].dir.zsize;
                let block_size = self.mods[mod_id].block_size;
                for z in 0..zsize {
                    let entry_tag = f.tag + z * self.min_block_size;
                    if entry_tag < f.src_tag || entry_tag >= f.src_tag + block_size {
                        continue;
                    }
                    self.mods[target].dir.clear_sharer(f.set, f.way, z, evicting_node);
                    if self.mods[target].dir.entry(f.set, f.way, z).owner == Some(evicting_node) {
                        self.mods[target].dir.set_owner(f.set, f.way, z, None);
                    }
                }
                self.unlock_dir(f.dir_lock);
                self.frame_mut(stack).dir_lock = None;
                self.queue.schedule(EvictReply, stack, 0);
            }
            EvictReply => {
                let target = f.target_mod.expect("evict target");
                let high_net = self.mods[target].high_net.expect("target has high net");
                let src_node = self.mods[target].high_net_node;
                let dst_node = self.mods[mod_id].low_net_node;
                let msg = self.nets[high_net].try_send(
                    &mut self.queue,
                    src_node,
                    dst_node,
                    8,
                    EvictReplyReceive,
                    EvictReply,
                    stack,
                );
                self.frame_mut(stack).msg = msg.map(|m| (high_net, m));
            }
            EvictReplyReceive => {
                if let Some((net, msg)) = f.msg {
                    let node = self.mods[mod_id].low_net_node;
                    self.nets[net].receive(node, msg);
                    self.frame_mut(stack).msg = None;
                }
                if !f.err {
                    self.mods[mod_id]
                        .cache
                        .set_block(f.src_set, f.src_way, 0, BlockState::Invalid);
                }
                if self.mods[mod_id].dir.group_shared_or_owned(f.src_set, f.src_way) {
                    return Err(SimError::CoherenceInconsistency(format!(
                        "evicted block still shared at {}",
                        self.mods[mod_id].name
                    )));
                }
                self.queue.schedule(EvictFinish, stack, 0);
            }
            EvictFinish => {
                log::trace!(
                    "  {} {} {:#x} {} evict finish",
                    self.queue.now(),
                    f.access_id,
                    f.tag,
                    self.mods[mod_id].name
                );
                self.stack_return(stack);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read request
    // ------------------------------------------------------------------

    fn handle_read_request(&mut self, kind: EventKind, stack: u64) -> Result<(), SimError> {
        use EventKind::*;
        let f = self.frame(stack).clone();
        let mod_id = f.mod_id;
        let target = f.target_mod.expect("read request has a target");
        let updown = self.is_updown(mod_id, target)?;

        match kind {
            ReadRequest => {
                {
                    let parent = f.ret.expect("read request has a caller");
                    let p = self.frame_mut(parent);
                    p.shared = false;
                    p.err = false;
                }
                let (net, src, dst) = if updown {
                    (
                        self.mods[mod_id].low_net.unwrap(),
                        self.mods[mod_id].low_net_node,
                        self.mods[target].high_net_node,
                    )
                } else {
                    (
                        self.mods[mod_id].high_net.unwrap(),
                        self.mods[mod_id].high_net_node,
                        self.mods[target].low_net_node,
                    )
                };
                let msg = self.nets[net].try_send(
                    &mut self.queue,
                    src,
                    dst,
                    8,
                    ReadRequestReceive,
                    ReadRequest,
                    stack,
                );
                self.frame_mut(stack).msg = msg.map(|m| (net, m));
            }
            ReadRequestReceive => {
                if let Some((net, msg)) = f.msg {
                    let node = if updown {
                        self.mods[target].high_net_node
                    } else {
                        self.mods[target].low_net_node
                    };
                    self.nets[net].receive(node, msg);
                    self.frame_mut(stack).msg = None;
                }
                let child = self.child(stack, target, f.addr, ReadRequestAction);
                let c = self.frame_mut(child);
                // Down-up requests must not fail; they block on the lock.
                c.blocking = !updown;
                c.read = true;
                c.retried = false;
                self.queue.schedule(FindAndLock, child, 0);
            }
            ReadRequestAction => {
                if f.err {
                    if !updown {
                        return Err(SimError::CoherenceInconsistency(
                            "down-up read request failed to lock".into(),
                        ));
                    }
                    let parent = f.ret.expect("read request has a caller");
                    self.frame_mut(parent).err = true;
                    self.frame_mut(stack).reply_size = 8;
                    self.queue.schedule(ReadRequestReply, stack, 0);
                    return Ok(());
                }
                self.queue.schedule(
                    if updown {
                        ReadRequestUpDown
                    } else {
                        ReadRequestDownUp
                    },
                    stack,
                    0,
                );
            }
            ReadRequestUpDown => {
                self.frame_mut(stack).pending = 1;

                if f.state.is_valid() {
                    // Forward to the owner of each sub-block held by
                    // someone other than the requester.
                    let zsize = self.mods[target].dir.zsize;
                    let req_node = self.mods[mod_id].low_net_node;
                    let high_net = self.mods[target].high_net.unwrap();
                    for z in 0..zsize {
                        let entry_tag = f.tag + z * self.min_block_size;
                        let entry = self.mods[target].dir.entry(f.set, f.way, z);
                        let owner = match entry.owner {
                            Some(o) => o,
                            None => continue,
                        };
                        if owner == req_node {
                            continue;
                        }
                        let owner_mod = self.node_mods[high_net][owner];
                        if entry_tag % self.mods[owner_mod].block_size != 0 {
                            continue;
                        }
                        self.frame_mut(stack).pending += 1;
                        let child =
                            self.child(stack, target, entry_tag, ReadRequestUpDownFinish);
                        self.frame_mut(child).target_mod = Some(owner_mod);
                        self.queue.schedule(ReadRequest, child, 0);
                    }
                    self.queue.schedule(ReadRequestUpDownFinish, stack, 0);
                } else {
                    // I here: fetch from the next level down.
                    if self.mods[target].dir.group_shared_or_owned(f.set, f.way) {
                        return Err(SimError::CoherenceInconsistency(format!(
                            "invalid block with sharers at {}",
                            self.mods[target].name
                        )));
                    }
                    let low = self.low_mod(target);
                    let child = self.child(stack, target, f.tag, ReadRequestUpDownMiss);
                    self.frame_mut(child).target_mod = Some(low);
                    self.queue.schedule(ReadRequest, child, 0);
                }
            }
            ReadRequestUpDownMiss => {
                if f.err {
                    self.unlock_dir(f.dir_lock);
                    self.frame_mut(stack).dir_lock = None;
                    let parent = f.ret.expect("read request has a caller");
                    self.frame_mut(parent).err = true;
                    self.frame_mut(stack).reply_size = 8;
                    self.queue.schedule(ReadRequestReply, stack, 0);
                    return Ok(());
                }
                let state = if f.shared {
                    BlockState::Shared
                } else {
                    BlockState::Exclusive
                };
                self.mods[target].cache.set_block(f.set, f.way, f.tag, state);
                self.queue.schedule(ReadRequestUpDownFinish, stack, 0);
            }
            ReadRequestUpDownFinish => {
                {
                    let fm = self.frame_mut(stack);
                    debug_assert!(fm.pending > 0);
                    fm.pending -= 1;
                    if fm.pending > 0 {
                        return Ok(());
                    }
                }
                let zsize = self.mods[target].dir.zsize;
                let req_node = self.mods[mod_id].low_net_node;
                let req_block = self.mods[mod_id].block_size;

                // Ownership above is gone for everything we flushed.
                for z in 0..zsize {
                    let entry = self.mods[target].dir.entry(f.set, f.way, z);
                    if entry.owner.is_some() && entry.owner != Some(req_node) {
                        self.mods[target].dir.set_owner(f.set, f.way, z, None);
                    }
                }

                // Add the requester as sharer; detect co-sharers.
                let mut shared = false;
                for z in 0..zsize {
                    let entry_tag = f.tag + z * self.min_block_size;
                    if entry_tag < f.addr || entry_tag >= f.addr + req_block {
                        continue;
                    }
                    self.mods[target].dir.set_sharer(f.set, f.way, z, req_node);
                    if self.mods[target].dir.entry(f.set, f.way, z).num_sharers() > 1 {
                        shared = true;
                    }
                }

                // Sole sharer gets ownership; otherwise tell the requester
                // to install S instead of E.
                {
                    let parent = f.ret.expect("read request has a caller");
                    self.frame_mut(parent).shared = shared;
                }
                if !shared {
                    for z in 0..zsize {
                        let entry_tag = f.tag + z * self.min_block_size;
                        if entry_tag < f.addr || entry_tag >= f.addr + req_block {
                            continue;
                        }
                        self.mods[target].dir.set_owner(f.set, f.way, z, Some(req_node));
                    }
                }

                self.frame_mut(stack).reply_size = req_block + 8;
                self.unlock_dir(f.dir_lock);
                self.frame_mut(stack).dir_lock = None;
                self.queue.schedule(ReadRequestReply, stack, 0);
            }
            ReadRequestDownUp => {
                if !f.state.is_valid() {
                    return Err(SimError::CoherenceInconsistency(format!(
                        "down-up read of invalid block at {}",
                        self.mods[target].name
                    )));
                }
                {
                    let reply_size = if matches!(f.state, BlockState::Exclusive | BlockState::Shared)
                    {
                        8
                    } else {
                        self.mods[target].block_size + 8
                    };
                    let fm = self.frame_mut(stack);
                    fm.pending = 1;
                    fm.reply_size = reply_size;
                }

                // Flush sub-block owners above before downgrading.
                let zsize = self.mods[target].dir.zsize;
                let high_net = self.mods[target].high_net;
                for z in 0..zsize {
                    let entry_tag = f.tag + z * self.min_block_size;
                    let entry = self.mods[target].dir.entry(f.set, f.way, z);
                    let owner = match entry.owner {
                        Some(o) => o,
                        None => continue,
                    };
                    let net = high_net.expect("owned sub-block implies high net");
                    let owner_mod = self.node_mods[net][owner];
                    if entry_tag % self.mods[owner_mod].block_size != 0 {
                        continue;
                    }
                    {
                        let reply_size = self.mods[target].block_size + 8;
                        let fm = self.frame_mut(stack);
                        fm.pending += 1;
                        fm.reply_size = reply_size;
                    }
                    let child = self.child(stack, target, entry_tag, ReadRequestDownUpFinish);
                    self.frame_mut(child).target_mod = Some(owner_mod);
                    self.queue.schedule(ReadRequest, child, 0);
                }
                self.queue.schedule(ReadRequestDownUpFinish, stack, 0);
            }
            ReadRequestDownUpFinish => {
                {
                    let fm = self.frame_mut(stack);
                    debug_assert!(fm.pending > 0);
                    fm.pending -= 1;
                    if fm.pending > 0 {
                        return Ok(());
                    }
                }
                let zsize = self.mods[target].dir.zsize;
                for z in 0..zsize {
                    self.mods[target].dir.set_owner(f.set, f.way, z, None);
                }
                self.mods[target]
                    .cache
                    .set_block(f.set, f.way, f.tag, BlockState::Shared);
                self.unlock_dir(f.dir_lock);
                self.frame_mut(stack).dir_lock = None;
                self.queue.schedule(ReadRequestReply, stack, 0);
            }
            ReadRequestReply => {
                let reply_size = self.frame(stack).reply_size;
                debug_assert!(reply_size > 0);
                let (net, src, dst) = if updown {
                    (
                        self.mods[mod_id].low_net.unwrap(),
                        self.mods[target].high_net_node,
                        self.mods[mod_id].low_net_node,
                    )
                } else {
                    (
                        self.mods[mod_id].high_net.unwrap(),
                        self.mods[target].low_net_node,
                        self.mods[mod_id].high_net_node,
                    )
                };
                let msg = self.nets[net].try_send(
                    &mut self.queue,
                    src,
                    dst,
                    reply_size,
                    ReadRequestFinish,
                    ReadRequestReply,
                    stack,
                );
                self.frame_mut(stack).msg = msg.map(|m| (net, m));
            }
            ReadRequestFinish => {
                if let Some((net, msg)) = f.msg {
                    let node = if updown {
                        self.mods[mod_id].low_net_node
                    } else {
                        self.mods[mod_id].high_net_node
                    };
                    self.nets[net].receive(node, msg);
                    self.frame_mut(stack).msg = None;
                }
                self.stack_return(stack);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Write request
    // ------------------------------------------------------------------

    fn handle_write_request(&mut self, kind: EventKind, stack: u64) -> Result<(), SimError> {
        use EventKind::*;
        let f = self.frame(stack).clone();
        let mod_id = f.mod_id;
        let target = f.target_mod.expect("write request has a target");
        let updown = self.is_updown(mod_id, target)?;

        match kind {
            WriteRequest => {
                {
                    let parent = f.ret.expect("write request has a caller");
                    self.frame_mut(parent).err = false;
                }
                let (net, src, dst) = if updown {
                    (
                        self.mods[mod_id].low_net.unwrap(),
                        self.mods[mod_id].low_net_node,
                        self.mods[target].high_net_node,
                    )
                } else {
                    (
                        self.mods[mod_id].high_net.unwrap(),
                        self.mods[mod_id].high_net_node,
                        self.mods[target].low_net_node,
                    )
                };
                let msg = self.nets[net].try_send(
                    &mut self.queue,
                    src,
                    dst,
                    8,
                    WriteRequestReceive,
                    WriteRequest,
                    stack,
                );
                self.frame_mut(stack).msg = msg.map(|m| (net, m));
            }
            WriteRequestReceive => {
                if let Some((net, msg)) = f.msg {
                    let node = if updown {
                        self.mods[target].high_net_node
                    } else {
                        self.mods[target].low_net_node
                    };
                    self.nets[net].receive(node, msg);
                    self.frame_mut(stack).msg = None;
                }
                let child = self.child(stack, target, f.addr, WriteRequestAction);
                let c = self.frame_mut(child);
                c.blocking = !updown;
                c.read = false;
                c.retried = false;
                self.queue.schedule(FindAndLock, child, 0);
            }
            WriteRequestAction => {
                if f.err {
                    if !updown {
                        return Err(SimError::CoherenceInconsistency(
                            "down-up write request failed to lock".into(),
                        ));
                    }
                    let parent = f.ret.expect("write request has a caller");
                    self.frame_mut(parent).err = true;
                    self.frame_mut(stack).reply_size = 8;
                    self.queue.schedule(WriteRequestReply, stack, 0);
                    return Ok(());
                }
                // Strip every other upper-level sharer first.
                let child = self.child(stack, target, 0, WriteRequestExclusive);
                let c = self.frame_mut(child);
                c.except_mod = Some(mod_id);
                c.set = f.set;
                c.way = f.way;
                self.queue.schedule(Invalidate, child, 0);
            }
            WriteRequestExclusive => {
                self.queue.schedule(
                    if updown {
                        WriteRequestUpDown
                    } else {
                        WriteRequestDownUp
                    },
                    stack,
                    0,
                );
            }
            WriteRequestUpDown => {
                if matches!(f.state, BlockState::Modified | BlockState::Exclusive) {
                    self.queue.schedule(WriteRequestUpDownFinish, stack, 0);
                    return Ok(());
                }
                // O/S/I: get exclusivity from the next level down.
                let low = self.low_mod(target);
                let child = self.child(stack, target, f.tag, WriteRequestUpDownFinish);
                self.frame_mut(child).target_mod = Some(low);
                self.queue.schedule(WriteRequest, child, 0);
            }
            WriteRequestUpDownFinish => {
                if f.err {
                    let parent = f.ret.expect("write request has a caller");
                    self.frame_mut(parent).err = true;
                    self.frame_mut(stack).reply_size = 8;
                    self.unlock_dir(f.dir_lock);
                    self.frame_mut(stack).dir_lock = None;
                    self.queue.schedule(WriteRequestReply, stack, 0);
                    return Ok(());
                }

                // Requester becomes sole sharer and owner of its range.
                let zsize = self.mods[target].dir.zsize;
                let req_node = self.mods[mod_id].low_net_node;
                let req_block = self.mods[mod_id].block_size;
                for z in 0..zsize {
                    let entry_tag = f.tag + z * self.min_block_size;
                    if entry_tag < f.addr || entry_tag >= f.addr + req_block {
                        continue;
                    }
                    self.mods[target].dir.set_sharer(f.set, f.way, z, req_node);
                    self.mods[target].dir.set_owner(f.set, f.way, z, Some(req_node));
                    if self.mods[target].dir.entry(f.set, f.way, z).num_sharers() != 1 {
                        return Err(SimError::CoherenceInconsistency(format!(
                            "write request left extra sharers at {}",
                            self.mods[target].name
                        )));
                    }
                }

                // M stays M; O/E/S/I becomes E.
                if f.state != BlockState::Modified {
                    self.mods[target]
                        .cache
                        .set_block(f.set, f.way, f.tag, BlockState::Exclusive);
                }

                self.unlock_dir(f.dir_lock);
                self.frame_mut(stack).dir_lock = None;
                self.frame_mut(stack).reply_size = req_block + 8;
                self.queue.schedule(WriteRequestReply, stack, 0);
            }
            WriteRequestDownUp => {
                if !f.state.is_valid() {
                    return Err(SimError::CoherenceInconsistency(format!(
                        "down-up write of invalid block at {}",
                        self.mods[target].name
                    )));
                }
                if self.mods[target].dir.group_shared_or_owned(f.set, f.way) {
                    return Err(SimError::CoherenceInconsistency(format!(
                        "down-up write with live sharers at {}",
                        self.mods[target].name
                    )));
                }
                // Dirty copies travel back with the reply.
                self.frame_mut(stack).reply_size = if f.state.is_dirty() {
                    self.mods[target].block_size + 8
                } else {
                    8
                };
                self.mods[target]
                    .cache
                    .set_block(f.set, f.way, 0, BlockState::Invalid);
                self.unlock_dir(f.dir_lock);
                self.frame_mut(stack).dir_lock = None;
                self.queue.schedule(WriteRequestReply, stack, 0);
            }
            WriteRequestReply => {
                let reply_size = self.frame(stack).reply_size;
                debug_assert!(reply_size > 0);
                let (net, src, dst) = if updown {
                    (
                        self.mods[mod_id].low_net.unwrap(),
                        self.mods[target].high_net_node,
                        self.mods[mod_id].low_net_node,
                    )
                } else {
                    (
                        self.mods[mod_id].high_net.unwrap(),
                        self.mods[target].low_net_node,
                        self.mods[mod_id].high_net_node,
                    )
                };
                let msg = self.nets[net].try_send(
                    &mut self.queue,
                    src,
                    dst,
                    reply_size,
                    WriteRequestFinish,
                    WriteRequestReply,
                    stack,
                );
                self.frame_mut(stack).msg = msg.map(|m| (net, m));
            }
            WriteRequestFinish => {
                if let Some((net, msg)) = f.msg {
                    let node = if updown {
                        self.mods[mod_id].low_net_node
                    } else {
                        self.mods[mod_id].high_net_node
                    };
                    self.nets[net].receive(node, msg);
                    self.frame_mut(stack).msg = None;
                }
                self.stack_return(stack);
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Invalidate
    // ------------------------------------------------------------------

    fn handle_invalidate(&mut self, kind: EventKind, stack: u64) -> Result<(), SimError> {
        use EventKind::*;
        let f = self.frame(stack).clone();
        let mod_id = f.mod_id;

        match kind {
            Invalidate => {
                let (tag, state) = self.mods[mod_id].cache.get_block(f.set, f.way);
                log::trace!(
                    "  {} {} {:#x} {} invalidate (set={}, way={}, state={:?})",
                    self.queue.now(),
                    f.access_id,
                    tag,
                    self.mods[mod_id].name,
                    f.set,
                    f.way,
                    state
                );
                {
                    let fm = self.frame_mut(stack);
                    fm.tag = tag;
                    fm.state = state;
                    fm.pending = 1;
                }

                // Write-request every upper sharer except the excepted
                // module; clear its bits as we go.
                let zsize = self.mods[mod_id].dir.zsize;
                let high = self.mods[mod_id].high_net;
                let node_count = high.map(|n| self.nets[n].node_count()).unwrap_or(0);
                for z in 0..zsize {
                    let entry_tag = tag + z * self.min_block_size;
                    for node in 1..node_count {
                        if !self.mods[mod_id].dir.entry(f.set, f.way, z).is_sharer(node) {
                            continue;
                        }
                        let sharer_mod = self.node_mods[high.unwrap()][node];
                        if Some(sharer_mod) == f.except_mod {
                            continue;
                        }
                        self.mods[mod_id].dir.clear_sharer(f.set, f.way, z, node);
                        if self.mods[mod_id].dir.entry(f.set, f.way, z).owner == Some(node) {
                            self.mods[mod_id].dir.set_owner(f.set, f.way, z, None);
                        }
                        // One request per sharer line, at its first
                        // sub-block only.
                        if entry_tag % self.mods[sharer_mod].block_size != 0 {
                            continue;
                        }
                        self.frame_mut(stack).pending += 1;
                        let child = self.child(stack, mod_id, entry_tag, InvalidateFinish);
                        self.frame_mut(child).target_mod = Some(sharer_mod);
                        self.queue.schedule(WriteRequest, child, 0);
                    }
                }
                self.queue.schedule(InvalidateFinish, stack, 0);
            }
            InvalidateFinish => {
                let fm = self.frame_mut(stack);
                debug_assert!(fm.pending > 0);
                fm.pending -= 1;
                if fm.pending > 0 {
                    return Ok(());
                }
                self.stack_return(stack);
            }
            _ => unreachable!(),
        }
        Ok(())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
