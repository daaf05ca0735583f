//! The emulator environment.
//!
//! `Emu` is the explicit global state passed to every handler: the context
//! table and its four scheduling lists, the pid allocator, the futex sleep
//! counter, the coherence engine (event kernel included), and statistics.
//! The run loop advances each running context one instruction per tick,
//! drains coherence events, polls suspended contexts against their wakeup
//! predicates, and frees finished contexts at the end of each pass.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::coherence::{Engine, ModId};
use crate::common::SimError;
use crate::context::signal::{build_handler_frame, TRAMPOLINE_ADDR};
use crate::context::{primary_list, state, Context, ContextList, FileKind, FileTable, Regs};
use crate::context::{MipsRegs, X86Regs};
use crate::isa::IsaKind;
use crate::loader::{self, Loader};
use crate::mem::{perm, Memory};
use crate::stats::SimStats;
use crate::syscall;

/// Signal-return trampolines, one per ISA, mapped at `TRAMPOLINE_ADDR`.
/// MIPS: `li $v0, 4119; syscall`. x86: `mov eax, 119; int 0x80`.
const MIPS_TRAMPOLINE: [u8; 8] = [0x17, 0x10, 0x02, 0x24, 0x0c, 0x00, 0x00, 0x00];
const X86_TRAMPOLINE: [u8; 7] = [0xb8, 0x77, 0x00, 0x00, 0x00, 0xcd, 0x80];

/// The simulator environment.
pub struct Emu {
    contexts: BTreeMap<i32, Context>,
    running: Vec<i32>,
    suspended: Vec<i32>,
    zombie: Vec<i32>,
    finished: Vec<i32>,
    next_pid: i32,
    futex_sleep_count: u64,
    /// Memory hierarchy; empty when running untimed.
    pub engine: Engine,
    /// Guest data accesses are routed into this module per context when
    /// timing is attached.
    timing: BTreeMap<i32, ModId>,
    /// Run statistics.
    pub stats: SimStats,
    /// Exit code of the first (root) context once it finishes.
    pub exit_code: Option<i32>,
    /// Instruction budget; the run stops when exceeded.
    pub max_instructions: u64,
    root_pid: Option<i32>,
}

impl Emu {
    pub fn new() -> Self {
        Self {
            contexts: BTreeMap::new(),
            running: Vec::new(),
            suspended: Vec::new(),
            zombie: Vec::new(),
            finished: Vec::new(),
            next_pid: 1000,
            futex_sleep_count: 0,
            engine: Engine::new(),
            timing: BTreeMap::new(),
            stats: SimStats::default(),
            exit_code: None,
            max_instructions: u64::MAX,
            root_pid: None,
        }
    }

    /// Allocates a pid.
    pub fn new_pid(&mut self) -> i32 {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }

    /// Microsecond clock base for guest timeouts.
    pub fn real_time(&self) -> u64 {
        self.engine.queue.real_time()
    }

    /// Monotone futex sleep counter; lower values wake first.
    pub fn next_futex_sleep(&mut self) -> u64 {
        self.futex_sleep_count += 1;
        self.futex_sleep_count
    }

    // ------------------------------------------------------------------
    // Context creation
    // ------------------------------------------------------------------

    /// Creates a detached context with empty memory and tables. Unit-test
    /// scaffolding; `load` is the real entry point.
    pub fn bare_context(&mut self, isa: IsaKind) -> Context {
        let pid = self.new_pid();
        let memory = Rc::new(RefCell::new(Memory::new()));
        let regs = match isa {
            IsaKind::Mips => Regs::Mips(MipsRegs::default()),
            IsaKind::X86 => Regs::X86(X86Regs::default()),
        };
        let file_table = Rc::new(RefCell::new(FileTable::new()));
        Context::new(pid, memory, regs, file_table, Rc::new(Loader::default()))
    }

    /// Loads a program and creates its first context. Returns the pid.
    pub fn load(&mut self, mut ld: Loader) -> Result<i32, SimError> {
        let mut mem = Memory::new();
        let image = loader::load_program(&mut mem, &mut ld)?;

        // Signal-return trampoline page.
        mem.map(TRAMPOLINE_ADDR, crate::common::PAGE_SIZE, perm::INIT | perm::READ | perm::EXEC);
        let code: &[u8] = match ld.isa {
            IsaKind::Mips => &MIPS_TRAMPOLINE,
            IsaKind::X86 => &X86_TRAMPOLINE,
        };
        mem.write_init(TRAMPOLINE_ADDR, code)
            .map_err(|f| SimError::MemoryFault { addr: f.addr, write: f.write })?;

        // Standard descriptors, honoring stdin/stdout redirection.
        let mut table = FileTable::new();
        let stdin_fd = match &ld.stdin_path {
            Some(path) => open_host(path, libc::O_RDONLY)?,
            None => 0,
        };
        let stdout_fd = match &ld.stdout_path {
            Some(path) => open_host(path, libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC)?,
            None => 1,
        };
        let stderr_fd = if ld.stdout_path.is_some() { stdout_fd } else { 2 };
        table.new_desc(FileKind::Std, stdin_fd, "stdin", 0);
        table.new_desc(FileKind::Std, stdout_fd, "stdout", 0o1);
        table.new_desc(FileKind::Std, stderr_fd, "stderr", 0o1);

        let mut regs = match ld.isa {
            IsaKind::Mips => Regs::Mips(MipsRegs::default()),
            IsaKind::X86 => Regs::X86(X86Regs::default()),
        };
        regs.set_pc(image.entry);
        regs.set_sp(image.sp);

        let pid = self.new_pid();
        let ctx = Context::new(
            pid,
            Rc::new(RefCell::new(mem)),
            regs,
            Rc::new(RefCell::new(table)),
            Rc::new(ld),
        );
        if self.root_pid.is_none() {
            self.root_pid = Some(pid);
        }
        self.add_context(ctx);
        Ok(pid)
    }

    /// Inserts a context and places it on its list.
    pub fn add_context(&mut self, ctx: Context) {
        let pid = ctx.pid;
        self.contexts.insert(pid, ctx);
        self.stats.contexts_created += 1;
        self.refresh_lists(pid);
    }

    /// Routes a context's data accesses through a hierarchy module.
    pub fn attach_timing(&mut self, pid: i32, module: ModId) {
        self.timing.insert(pid, module);
    }

    /// Issues a timed access for a context and drains the event queue.
    /// Untimed contexts return immediately.
    pub fn timing_access(&mut self, pid: i32, addr: u32, is_store: bool) -> Result<(), SimError> {
        let module = match self.timing.get(&pid) {
            Some(&m) => m,
            None => return Ok(()),
        };
        let access = if is_store {
            self.engine.store(module, addr)
        } else {
            self.engine.load(module, addr)
        };
        self.engine.run_until_idle()?;
        if !self.engine.take_finished(access) {
            return Err(SimError::CoherenceInconsistency(format!(
                "access {:#x} did not complete",
                addr
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // List management
    // ------------------------------------------------------------------

    fn list_of(&mut self, list: ContextList) -> &mut Vec<i32> {
        match list {
            ContextList::Running => &mut self.running,
            ContextList::Suspended => &mut self.suspended,
            ContextList::Zombie => &mut self.zombie,
            ContextList::Finished => &mut self.finished,
        }
    }

    /// Reconciles a context's list membership with its state bitmap: the
    /// context appears on exactly one primary list (or none once freed).
    pub fn refresh_lists(&mut self, pid: i32) {
        let target = self.contexts.get(&pid).map(|c| primary_list(c.state));
        for list in [
            ContextList::Running,
            ContextList::Suspended,
            ContextList::Zombie,
            ContextList::Finished,
        ] {
            let on_this = target == Some(list);
            let v = self.list_of(list);
            let present = v.contains(&pid);
            if on_this && !present {
                v.push(pid);
            } else if !on_this && present {
                v.retain(|&p| p != pid);
            }
        }
    }

    /// Context accessors for tests and the CLI.
    pub fn context(&self, pid: i32) -> Option<&Context> {
        self.contexts.get(&pid)
    }

    pub fn context_mut(&mut self, pid: i32) -> Option<&mut Context> {
        self.contexts.get_mut(&pid)
    }

    /// Pids of every live context.
    pub fn pids(&self) -> Vec<i32> {
        self.contexts.keys().copied().collect()
    }

    /// Pids currently on a list.
    pub fn list(&self, list: ContextList) -> &[i32] {
        match list {
            ContextList::Running => &self.running,
            ContextList::Suspended => &self.suspended,
            ContextList::Zombie => &self.zombie,
            ContextList::Finished => &self.finished,
        }
    }

    // ------------------------------------------------------------------
    // Termination
    // ------------------------------------------------------------------

    /// Terminates a context: clears the child-tid word (waking one futex
    /// waiter on it), reports the exit signal to the group parent, and
    /// moves the context to zombie (or straight to finished when nobody
    /// can reap it).
    pub fn finish_context(&mut self, ctx: &mut Context, status: i32) {
        if ctx.clear_child_tid != 0 {
            let _ = ctx.memory.borrow_mut().write_u32(ctx.clear_child_tid, 0);
            self.futex_wake(ctx.clear_child_tid, 1, 0xffff_ffff);
            ctx.clear_child_tid = 0;
        }
        ctx.exit_code = status;
        ctx.wake();
        ctx.clear_state(state::RUNNING | state::HANDLER);
        if ctx.exit_signal != 0 {
            if let Some(parent) = ctx.parent {
                log::debug!("pid {}: sending signal {} to parent {}", ctx.pid, ctx.exit_signal, parent);
                self.post_signal(parent, ctx.exit_signal);
            }
        }
        // Thread-group members with no exit signal auto-reap; everything
        // else waits as a zombie for the parent's waitpid. The initial
        // context has nobody to report to.
        let is_thread = ctx.group_parent.is_some() && ctx.exit_signal == 0;
        if ctx.parent.is_some() && !is_thread {
            ctx.set_state(state::ZOMBIE);
        } else {
            ctx.set_state(state::FINISHED);
        }
        log::debug!("pid {}: exit status {:#x}", ctx.pid, status);
    }

    /// Terminates every context of the caller's thread group, the caller
    /// included.
    pub fn finish_group(&mut self, ctx: &mut Context, status: i32) {
        let group = ctx.group_parent.unwrap_or(ctx.pid);
        let members: Vec<i32> = self
            .contexts
            .iter()
            .filter(|(_, c)| c.group_parent.unwrap_or(c.pid) == group)
            .map(|(&pid, _)| pid)
            .collect();
        for pid in members {
            if let Some(mut member) = self.contexts.remove(&pid) {
                self.finish_context(&mut member, status);
                self.contexts.insert(pid, member);
                self.refresh_lists(pid);
            }
        }
        self.finish_context(ctx, status);
    }

    /// Finds and reaps a zombie child of `parent_pid` matching `pid`
    /// (-1 = any). Returns its pid and exit code.
    pub fn reap_zombie_child(&mut self, parent_pid: i32, pid: i32) -> Option<(i32, i32)> {
        let child_pid = self
            .contexts
            .iter()
            .find(|(_, c)| {
                c.has_state(state::ZOMBIE)
                    && c.parent == Some(parent_pid)
                    && (pid == -1 || pid == c.pid)
            })
            .map(|(&p, _)| p)?;
        let child = self.contexts.get_mut(&child_pid)?;
        let code = child.exit_code;
        child.clear_state(state::ZOMBIE);
        child.set_state(state::FINISHED);
        self.refresh_lists(child_pid);
        Some((child_pid, code))
    }

    // ------------------------------------------------------------------
    // Signals and futexes
    // ------------------------------------------------------------------

    /// Posts a signal to another context. Returns false when the pid does
    /// not exist.
    pub fn post_signal(&mut self, pid: i32, sig: i32) -> bool {
        match self.contexts.get_mut(&pid) {
            Some(ctx) => {
                ctx.signal_mask.set_pending(sig);
                true
            }
            None => false,
        }
    }

    /// Wakes up to `count` contexts suspended on futex `addr` whose wait
    /// bitset intersects `bitset`, earliest sleepers first. Returns the
    /// number woken.
    pub fn futex_wake(&mut self, addr: u32, count: i32, bitset: u32) -> i32 {
        let mut sleepers: Vec<(u64, i32)> = self
            .contexts
            .values()
            .filter(|c| {
                c.has_state(state::FUTEX)
                    && c.wakeup_futex == addr
                    && c.wakeup_futex_bitset & bitset != 0
            })
            .map(|c| (c.wakeup_futex_sleep, c.pid))
            .collect();
        sleepers.sort_unstable();

        let mut woken = 0;
        for (_, pid) in sleepers {
            if woken >= count {
                break;
            }
            if let Some(ctx) = self.contexts.get_mut(&pid) {
                ctx.regs.set_syscall_ret(0);
                ctx.wake();
                woken += 1;
                self.stats.futex_wakes += 1;
            }
            self.refresh_lists(pid);
        }
        woken
    }

    /// Moves every remaining waiter on `addr1` to `addr2`. Returns the
    /// number requeued.
    pub fn futex_requeue(&mut self, addr1: u32, addr2: u32) -> i32 {
        let mut moved = 0;
        for ctx in self.contexts.values_mut() {
            if ctx.has_state(state::FUTEX) && ctx.wakeup_futex == addr1 {
                ctx.wakeup_futex = addr2;
                moved += 1;
            }
        }
        moved
    }

    /// Delivers a signal to a context: builds the handler frame and
    /// redirects execution. Signals without an installed handler are
    /// dropped (faults only post signals when a handler exists).
    fn deliver_signal(&mut self, ctx: &mut Context, sig: i32) -> Result<(), SimError> {
        ctx.signal_mask.clear_pending(sig);
        let handler = *ctx.signal_handlers.borrow().get(sig);
        if handler.handler == 0 {
            log::debug!("pid {}: signal {} has no handler, ignored", ctx.pid, sig);
            return Ok(());
        }
        log::debug!("pid {}: running handler for signal {}", ctx.pid, sig);
        let blocked = ctx.signal_mask.blocked;
        let frame = build_handler_frame(
            &mut ctx.regs,
            &mut ctx.memory.borrow_mut(),
            sig,
            handler.handler,
            blocked,
        )
        .map_err(|f| SimError::MemoryFault { addr: f.addr, write: f.write })?;
        ctx.signal_mask.frame = Some(frame);
        ctx.signal_mask.blocked |= handler.mask | (1u64 << (sig - 1));
        ctx.set_state(state::HANDLER);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Per-tick wakeup polling
    // ------------------------------------------------------------------

    /// Evaluates every suspended context's wakeup predicate and delivers
    /// pending signals. Called once per scheduling pass.
    pub fn process_events(&mut self) -> Result<(), SimError> {
        // Pending signals pre-empt any suspension cause.
        for pid in self.suspended.clone() {
            let mut ctx = match self.contexts.remove(&pid) {
                Some(c) => c,
                None => continue,
            };
            let result = self.poll_suspended(&mut ctx);
            self.contexts.insert(pid, ctx);
            self.refresh_lists(pid);
            result?;
        }

        // Running contexts outside a handler pick up newly pending
        // signals before their next instruction.
        for pid in self.running.clone() {
            let mut ctx = match self.contexts.remove(&pid) {
                Some(c) => c,
                None => continue,
            };
            let result = if !ctx.has_state(state::HANDLER) {
                match ctx.signal_mask.next_deliverable() {
                    Some(sig) => self.deliver_signal(&mut ctx, sig),
                    None => Ok(()),
                }
            } else {
                Ok(())
            };
            self.contexts.insert(pid, ctx);
            self.refresh_lists(pid);
            result?;
        }
        Ok(())
    }

    fn poll_suspended(&mut self, ctx: &mut Context) -> Result<(), SimError> {
        // Signal pre-emption: an unblocked pending signal wakes the
        // context out of any wait with -EINTR, then runs the handler.
        if let Some(sig) = ctx.signal_mask.next_deliverable() {
            if ctx.signal_handlers.borrow().get(sig).handler != 0 {
                ctx.wake();
                ctx.regs.set_syscall_ret(crate::common::Errno::Eintr.ret());
                return self.deliver_signal(ctx, sig);
            }
        }

        if ctx.has_state(state::READ) {
            let ready = {
                let table = ctx.file_table.borrow();
                match table.get(ctx.wakeup_fd) {
                    Some(d) => {
                        poll_host(d.host_fd, libc::POLLIN) || d.flags & 0o4000 != 0
                    }
                    None => true,
                }
            };
            if ready {
                log::debug!("pid {}: blocking read completed", ctx.pid);
                let ret = syscall::resume_read(self, ctx)?;
                ctx.wake();
                ctx.regs.set_syscall_ret(ret);
            }
            return Ok(());
        }

        if ctx.has_state(state::WRITE) {
            let ready = {
                let table = ctx.file_table.borrow();
                match table.get(ctx.wakeup_fd) {
                    Some(d) => poll_host(d.host_fd, libc::POLLOUT),
                    None => true,
                }
            };
            if ready {
                log::debug!("pid {}: blocking write completed", ctx.pid);
                let ret = syscall::resume_write(self, ctx)?;
                ctx.wake();
                ctx.regs.set_syscall_ret(ret);
            }
            return Ok(());
        }

        if ctx.has_state(state::NANOSLEEP) {
            if self.real_time() >= ctx.wakeup_time {
                ctx.wake();
                ctx.regs.set_syscall_ret(0);
            }
            return Ok(());
        }

        if ctx.has_state(state::WAITPID) {
            if let Some((child_pid, exit_code)) =
                self.reap_zombie_child(ctx.pid, ctx.wakeup_pid)
            {
                let (_, args) = syscall::read_abi(ctx)?;
                let status_ptr = args[1];
                if status_ptr != 0 {
                    ctx.memory
                        .borrow_mut()
                        .write_u32(status_ptr, exit_code as u32)
                        .map_err(|f| SimError::MemoryFault { addr: f.addr, write: f.write })?;
                }
                ctx.wake();
                ctx.regs.set_syscall_ret(child_pid);
            }
            return Ok(());
        }

        // FUTEX waiters are woken by futex_wake, not by polling.
        Ok(())
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    /// Frees finished contexts. The root context's exit code is recorded
    /// before its context drops.
    fn reap_finished(&mut self) {
        for pid in std::mem::take(&mut self.finished) {
            if let Some(ctx) = self.contexts.remove(&pid) {
                if Some(pid) == self.root_pid || self.exit_code.is_none() {
                    self.exit_code = Some(ctx.exit_code);
                }
                self.stats.contexts_finished += 1;
                log::debug!("pid {}: freed", pid);
            }
        }
    }

    /// Runs one scheduling pass: one instruction per running context,
    /// then wakeup polling and reaping. Returns false when no context can
    /// make progress anymore.
    pub fn tick(&mut self) -> Result<bool, SimError> {
        if self.running.is_empty() && self.suspended.is_empty() {
            self.reap_finished();
            return Ok(false);
        }

        // Futex waiters are only ever woken by running guest code; with no
        // runnable context left they can never make progress again.
        if self.running.is_empty()
            && self
                .suspended
                .iter()
                .all(|p| self.contexts.get(p).map_or(true, |c| c.has_state(state::FUTEX)))
        {
            return Err(SimError::UnsupportedFeature(
                "every remaining context is suspended on a futex (guest deadlock)".into(),
            ));
        }

        for pid in self.running.clone() {
            let mut ctx = match self.contexts.remove(&pid) {
                Some(c) => c,
                None => continue,
            };
            if !ctx.has_state(state::RUNNING) || ctx.has_state(state::ZOMBIE | state::FINISHED) {
                self.contexts.insert(pid, ctx);
                self.refresh_lists(pid);
                continue;
            }
            let result = crate::isa::execute(self, &mut ctx);
            self.contexts.insert(pid, ctx);
            self.refresh_lists(pid);
            result?;
            self.stats.instructions += 1;
        }

        self.process_events()?;
        self.reap_finished();
        Ok(true)
    }

    /// Runs to completion (or the instruction budget) and returns the
    /// root context's exit code.
    pub fn run(&mut self) -> Result<i32, SimError> {
        while self.tick()? {
            if self.stats.instructions >= self.max_instructions {
                log::warn!(
                    "instruction budget exhausted after {} instructions",
                    self.stats.instructions
                );
                break;
            }
        }
        Ok(self.exit_code.unwrap_or(0))
    }
}

impl Default for Emu {
    fn default() -> Self {
        Self::new()
    }
}

fn poll_host(host_fd: i32, events: i16) -> bool {
    let mut p = libc::pollfd {
        fd: host_fd,
        events,
        revents: 0,
    };
    let n = unsafe { libc::poll(&mut p, 1, 0) };
    n > 0 && (p.revents & events) != 0
}

fn open_host(path: &str, flags: i32) -> Result<i32, SimError> {
    let c = std::ffi::CString::new(path)
        .map_err(|_| SimError::UnsupportedFeature(format!("bad path '{}'", path)))?;
    let fd = unsafe { libc::open(c.as_ptr(), flags, 0o644 as libc::c_uint) };
    if fd < 0 {
        return Err(SimError::Host(std::io::Error::last_os_error()));
    }
    Ok(fd)
}
