//! Context lifecycle invariants, observed tick by tick.
//!
//! A fork-style clone whose child sleeps before exiting drives every list
//! transition: running -> suspended (parent in waitpid, child in
//! nanosleep), child -> zombie, zombie -> finished on reap. At every tick
//! each live context sits on exactly one primary list.

use mcsim_core::context::ContextList;
use mcsim_core::loader::Loader;
use mcsim_core::Emu;

use crate::common::elf::{x86_program, X86_DATA};
use crate::common::init;
use crate::common::x86_asm::{nr, X86Asm, EAX, EBX, ECX, EDX, ESI};

const SIGCHLD: u32 = 17;
const NR_WAITPID: u32 = 7;

/// Builds: fork-style clone; child sleeps 5 ms and exits 7; parent
/// waitpid()s, checks the status word, and exits 0.
fn wait_program() -> Vec<u8> {
    let status = X86_DATA + 0x10;
    let tspec = X86_DATA + 0x20;

    let mut asm = X86Asm::new();
    // clone(SIGCHLD, 0, 0, 0, 0): plain fork, child keeps the copied
    // stack at the same address.
    asm.mov_reg_imm(EAX, nr::CLONE);
    asm.mov_reg_imm(EBX, SIGCHLD);
    asm.mov_reg_imm(ECX, 0);
    asm.xor_reg_reg(EDX, EDX);
    asm.xor_reg_reg(ESI, ESI);
    asm.xor_reg_reg(crate::common::x86_asm::EDI, crate::common::x86_asm::EDI);
    asm.int80();
    asm.test_reg_reg(EAX, EAX);
    asm.jz("child");

    // Parent: waitpid(-1, status, 0).
    asm.mov_reg_imm(EAX, NR_WAITPID);
    asm.mov_reg_imm(EBX, -1i32 as u32);
    asm.mov_reg_imm(ECX, status);
    asm.xor_reg_reg(EDX, EDX);
    asm.int80();
    asm.mov_reg_mem(EAX, status);
    asm.cmp_reg_imm(EAX, 7);
    asm.jnz("fail");
    asm.mov_reg_imm(EAX, nr::EXIT);
    asm.xor_reg_reg(EBX, EBX);
    asm.int80();
    asm.label("fail");
    asm.mov_reg_imm(EAX, nr::EXIT);
    asm.mov_reg_imm(EBX, 1);
    asm.int80();

    // Child: nanosleep({0, 5ms}); exit(7).
    asm.label("child");
    asm.mov_mem_imm(tspec, 0);
    asm.mov_mem_imm(tspec + 4, 5_000_000);
    asm.mov_reg_imm(EAX, nr::NANOSLEEP);
    asm.mov_reg_imm(EBX, tspec);
    asm.xor_reg_reg(ECX, ECX);
    asm.int80();
    asm.mov_reg_imm(EAX, nr::EXIT);
    asm.mov_reg_imm(EBX, 7);
    asm.int80();

    asm.finish()
}

/// Every live context is on exactly one primary list, at every tick, and
/// the run walks through suspension, zombie, and reap.
#[test]
fn one_primary_list_per_context() {
    init();
    let program = x86_program(&wait_program(), &[]);
    let mut emu = Emu::new();
    let ld = Loader {
        exe: program.path(),
        args: vec![program.path()],
        ..Loader::default()
    };
    emu.load(ld).unwrap();

    let mut saw_suspended = false;
    let mut saw_zombie = false;
    while emu.tick().unwrap() {
        for pid in emu.pids() {
            let memberships = [
                ContextList::Running,
                ContextList::Suspended,
                ContextList::Zombie,
                ContextList::Finished,
            ]
            .iter()
            .filter(|&&l| emu.list(l).contains(&pid))
            .count();
            assert_eq!(memberships, 1, "pid {} on {} lists", pid, memberships);
        }
        saw_suspended |= !emu.list(ContextList::Suspended).is_empty();
        saw_zombie |= !emu.list(ContextList::Zombie).is_empty();
        assert!(
            emu.stats.instructions < 5_000_000,
            "run did not converge"
        );
    }

    assert_eq!(emu.exit_code, Some(0), "parent saw the child's status");
    assert!(saw_suspended, "waitpid/nanosleep suspension observed");
    assert!(saw_zombie, "child passed through the zombie state");
    assert_eq!(emu.stats.contexts_created, 2);
    assert_eq!(emu.stats.contexts_finished, 2);
    assert!(emu.pids().is_empty(), "finished contexts are freed");
}

/// CLONE_VM children observe each other's writes through the shared
/// image; fork-style children get their own copy.
#[test]
fn clone_shares_memory_image() {
    init();
    let mut emu = Emu::new();
    let parent = emu.bare_context(mcsim_core::isa::IsaKind::Mips);
    parent
        .memory
        .borrow_mut()
        .map(0x1000, 0x1000, mcsim_core::mem::perm::INIT | mcsim_core::mem::perm::READ | mcsim_core::mem::perm::WRITE);

    let child = parent.clone_from(emu.new_pid());
    child.memory.borrow_mut().write_u32(0x1000, 0xfeed).unwrap();
    assert_eq!(parent.memory.borrow_mut().read_u32(0x1000).unwrap(), 0xfeed);

    // A fork-style child gets its own copy.
    let forked = parent.fork_from(emu.new_pid());
    forked.memory.borrow_mut().write_u32(0x1000, 0xbeef).unwrap();
    assert_eq!(parent.memory.borrow_mut().read_u32(0x1000).unwrap(), 0xfeed);
}
