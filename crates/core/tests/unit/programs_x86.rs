//! End-to-end x86 guest programs: the two-thread futex counter and the
//! blocking-read pipe wakeup.

use mcsim_core::loader::Loader;
use mcsim_core::Emu;

use crate::common::elf::{x86_program, GuestProgram, X86_DATA};
use crate::common::init;
use crate::common::x86_asm::{nr, X86Asm, EAX, EBP, EBX, ECX, EDI, EDX, ESI};

const CLONE_THREAD_FLAGS: u32 = 0x0001_0f00; // VM|FS|FILES|SIGHAND|THREAD

fn run_to_exit(program: &GuestProgram) -> (i32, Emu) {
    let mut emu = Emu::new();
    emu.max_instructions = 5_000_000;
    let ld = Loader {
        exe: program.path(),
        args: vec![program.path()],
        ..Loader::default()
    };
    emu.load(ld).unwrap();
    let code = emu.run().unwrap();
    assert!(emu.exit_code.is_some(), "guest did not exit");
    (code, emu)
}

fn emit_exit(asm: &mut X86Asm, code: u32) {
    asm.mov_reg_imm(EAX, nr::EXIT);
    asm.mov_reg_imm(EBX, code);
    asm.int80();
}

/// clone(CLONE_VM|...|CLONE_THREAD) with a fresh stack inside the shared
/// image; eax = 0 in the child, the child's pid in the parent.
fn emit_clone(asm: &mut X86Asm, child_stack: u32) {
    asm.mov_reg_imm(EAX, nr::CLONE);
    asm.mov_reg_imm(EBX, CLONE_THREAD_FLAGS);
    asm.mov_reg_imm(ECX, child_stack);
    asm.xor_reg_reg(EDX, EDX);
    asm.xor_reg_reg(ESI, ESI);
    asm.xor_reg_reg(EDI, EDI);
    asm.int80();
}

// ══════════════════════════════════════════════════════════
// 1. Two-thread futex counter
// ══════════════════════════════════════════════════════════

/// Parent and CLONE_VM child both increment a shared counter 1000 times
/// under a futex-backed spinlock (lock cmpxchg to acquire, FUTEX_WAIT on
/// contention, FUTEX_WAKE on release). The final count is exactly 2000
/// and both contexts reach the finished state.
#[test]
fn two_thread_futex_counter() {
    init();
    let lock = X86_DATA;
    let counter = X86_DATA + 4;
    let child_stack = X86_DATA + 0x3000;

    let mut asm = X86Asm::new();
    emit_clone(&mut asm, child_stack);
    // Role in ebp (survives syscalls): 0 = child, pid = parent.
    asm.mov_reg_reg(EBP, EAX);

    asm.mov_reg_imm(ECX, 1000);

    asm.label("loop_head");
    asm.label("acquire");
    asm.mov_reg_imm(EAX, 0);
    asm.mov_reg_imm(EDX, 1);
    asm.lock_cmpxchg_mem(lock, EDX);
    asm.jz("got");

    // Lock held: futex(lock, FUTEX_WAIT, 1, NULL).
    asm.push_reg(ECX);
    asm.mov_reg_imm(EAX, nr::FUTEX);
    asm.mov_reg_imm(EBX, lock);
    asm.mov_reg_imm(ECX, 0);
    asm.mov_reg_imm(EDX, 1);
    asm.xor_reg_reg(ESI, ESI);
    asm.int80();
    asm.pop_reg(ECX);
    asm.jmp("acquire");

    asm.label("got");
    asm.inc_mem(counter);
    // Release and wake one waiter.
    asm.mov_mem_imm(lock, 0);
    asm.push_reg(ECX);
    asm.mov_reg_imm(EAX, nr::FUTEX);
    asm.mov_reg_imm(EBX, lock);
    asm.mov_reg_imm(ECX, 1); // FUTEX_WAKE
    asm.mov_reg_imm(EDX, 1);
    asm.int80();
    asm.pop_reg(ECX);

    asm.dec_reg(ECX);
    asm.jnz("loop_head");

    // Child exits; parent waits for the full count first.
    asm.test_reg_reg(EBP, EBP);
    asm.jz("child_exit");
    asm.label("parent_wait");
    asm.mov_reg_mem(EAX, counter);
    asm.cmp_reg_imm(EAX, 2000);
    asm.jnz("parent_wait");
    emit_exit(&mut asm, 0);

    asm.label("child_exit");
    emit_exit(&mut asm, 0);

    let program = x86_program(&asm.finish(), &[]);
    let (code, emu) = run_to_exit(&program);
    assert_eq!(code, 0);
    assert_eq!(emu.stats.contexts_created, 2);
    assert_eq!(emu.stats.contexts_finished, 2, "both contexts reach finished");
}

// ══════════════════════════════════════════════════════════
// 2. Blocking read woken by a delayed writer
// ══════════════════════════════════════════════════════════

/// The parent reads 8 bytes from an empty pipe and suspends; the child
/// nanosleeps ~10 ms, then writes 8 bytes. The read returns 8 with the
/// writer's bytes.
#[test]
fn blocking_read_wakes_on_pipe_write() {
    init();
    let fds = X86_DATA; // int fds[2]
    let tspec = X86_DATA + 0x20;
    let src = X86_DATA + 0x40;
    let dst = X86_DATA + 0x60;
    let child_stack = X86_DATA + 0x3000;

    let mut asm = X86Asm::new();

    // pipe(fds)
    asm.mov_reg_imm(EAX, nr::PIPE);
    asm.mov_reg_imm(EBX, fds);
    asm.int80();

    emit_clone(&mut asm, child_stack);
    asm.test_reg_reg(EAX, EAX);
    asm.jz("child");

    // Parent: read(fds[0], dst, 8) -- blocks until the child writes.
    asm.mov_reg_imm(EAX, nr::READ);
    asm.mov_reg_mem(EBX, fds);
    asm.mov_reg_imm(ECX, dst);
    asm.mov_reg_imm(EDX, 8);
    asm.int80();
    asm.cmp_reg_imm(EAX, 8);
    asm.jnz("fail");
    asm.mov_reg_mem(EAX, dst);
    asm.cmp_reg_imm(EAX, 0x6463_6261); // "abcd"
    asm.jnz("fail");
    asm.mov_reg_mem(EAX, dst + 4);
    asm.cmp_reg_imm(EAX, 0x6867_6665); // "efgh"
    asm.jnz("fail");
    emit_exit(&mut asm, 0);
    asm.label("fail");
    emit_exit(&mut asm, 1);

    // Child: nanosleep({0, 10ms}), then write(fds[1], src, 8).
    asm.label("child");
    asm.mov_mem_imm(tspec, 0);
    asm.mov_mem_imm(tspec + 4, 10_000_000);
    asm.mov_reg_imm(EAX, nr::NANOSLEEP);
    asm.mov_reg_imm(EBX, tspec);
    asm.xor_reg_reg(ECX, ECX);
    asm.int80();

    asm.mov_mem_imm(src, 0x6463_6261);
    asm.mov_mem_imm(src + 4, 0x6867_6665);
    asm.mov_reg_imm(EAX, nr::WRITE);
    asm.mov_reg_mem(EBX, fds + 4);
    asm.mov_reg_imm(ECX, src);
    asm.mov_reg_imm(EDX, 8);
    asm.int80();
    emit_exit(&mut asm, 0);

    let program = x86_program(&asm.finish(), &[]);
    let (code, emu) = run_to_exit(&program);
    assert_eq!(code, 0, "read returned the writer's bytes");
    assert_eq!(emu.stats.contexts_finished, 2);
}
