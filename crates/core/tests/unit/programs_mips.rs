//! End-to-end MIPS guest programs: hello-world output, heap grow/shrink,
//! mmap range reuse, futex EAGAIN, and signal-handler state restore.

use mcsim_core::loader::Loader;
use mcsim_core::Emu;

use crate::common::elf::{mips_program, GuestProgram, MIPS_DATA};
use crate::common::init;
use crate::common::mips_asm::{mips_abi::*, nr, MipsAsm, S0, S1, T0, T1, T2, T3, T4};

fn run_to_exit(program: &GuestProgram, stdout: Option<String>) -> (i32, Emu) {
    let mut emu = Emu::new();
    emu.max_instructions = 2_000_000;
    let ld = Loader {
        exe: program.path(),
        args: vec![program.path()],
        stdout_path: stdout,
        ..Loader::default()
    };
    emu.load(ld).unwrap();
    let code = emu.run().unwrap();
    assert!(emu.exit_code.is_some(), "guest did not exit");
    (code, emu)
}

/// Emits `li $v0, n; syscall`.
fn emit_syscall(asm: &mut MipsAsm, n: i32) {
    asm.li(V0, n);
    asm.syscall();
}

/// Emits `li $a0, code; li $v0, exit; syscall`.
fn emit_exit(asm: &mut MipsAsm, code: i32) {
    asm.li(A0, code);
    emit_syscall(asm, nr::EXIT);
}

// ══════════════════════════════════════════════════════════
// 1. Hello world
// ══════════════════════════════════════════════════════════

/// write(1, "hi\n", 3); exit(0) -- the bytes land on the redirected
/// stdout and the simulator reports exit code 0.
#[test]
fn hello_world_writes_stdout() {
    init();
    let mut asm = MipsAsm::new(crate::common::elf::MIPS_BASE);
    asm.li(A0, 1);
    asm.li32(A1, MIPS_DATA);
    asm.li(A2, 3);
    emit_syscall(&mut asm, nr::WRITE);
    emit_exit(&mut asm, 0);

    let program = mips_program(&asm.finish(), b"hi\n");
    let out = tempfile::NamedTempFile::new().unwrap();
    let out_path = out.path().display().to_string();

    let (code, emu) = run_to_exit(&program, Some(out_path.clone()));
    assert_eq!(code, 0);
    assert_eq!(std::fs::read(&out_path).unwrap(), b"hi\n");
    assert_eq!(emu.stats.contexts_finished, 1);
}

// ══════════════════════════════════════════════════════════
// 2. Heap grow-shrink (brk)
// ══════════════════════════════════════════════════════════

/// brk(0) -> X; brk(X+0x3000) grows; a byte written at X+0x2fff reads
/// back; brk(X) shrinks back to X. Exit code 0 on success.
#[test]
fn heap_grow_shrink() {
    init();
    let mut asm = MipsAsm::new(crate::common::elf::MIPS_BASE);

    // X = brk(0)
    asm.li(A0, 0);
    emit_syscall(&mut asm, nr::BRK);
    asm.move_(S0, V0);

    // brk(X + 0x3000) must return X + 0x3000.
    asm.addiu(A0, S0, 0x3000);
    emit_syscall(&mut asm, nr::BRK);
    asm.addiu(T0, S0, 0x3000);
    asm.bne(V0, T0, "fail");
    asm.nop();

    // *(X + 0x2fff) = 0xAA; read it back (lb sign-extends).
    asm.addiu(T1, S0, 0x2fff);
    asm.li(T2, 0xAA);
    asm.sb(T2, 0, T1);
    asm.lb(T3, 0, T1);
    asm.li(T4, -86); // 0xAA as a signed byte
    asm.bne(T3, T4, "fail");
    asm.nop();

    // brk(X) shrinks and returns X.
    asm.move_(A0, S0);
    emit_syscall(&mut asm, nr::BRK);
    asm.bne(V0, S0, "fail");
    asm.nop();

    emit_exit(&mut asm, 0);
    asm.label("fail");
    emit_exit(&mut asm, 1);

    let program = mips_program(&asm.finish(), &[]);
    let (code, _) = run_to_exit(&program, None);
    assert_eq!(code, 0);
}

// ══════════════════════════════════════════════════════════
// 3. mmap/munmap range reuse
// ══════════════════════════════════════════════════════════

/// mmap2 of an anonymous range, munmap of the same range, then a second
/// mmap2 of the same size reuses the address.
#[test]
fn mmap_range_reuse_after_munmap() {
    init();
    let mut asm = MipsAsm::new(crate::common::elf::MIPS_BASE);

    // Stack slots for arguments five (fd=-1) and six (offset=0).
    asm.addiu(SP, SP, -24);
    asm.li(T0, -1);
    asm.sw(T0, 16, SP);
    asm.sw(ZERO, 20, SP);

    // addr1 = mmap2(0, 0x2000, PROT_READ|PROT_WRITE, MAP_PRIVATE|MAP_ANON, -1, 0)
    asm.li(A0, 0);
    asm.li(A1, 0x2000);
    asm.li(A2, 0x3);
    asm.li(A3, 0x22);
    emit_syscall(&mut asm, nr::MMAP2);
    asm.move_(S0, V0);

    // munmap(addr1, 0x2000)
    asm.move_(A0, S0);
    asm.li(A1, 0x2000);
    emit_syscall(&mut asm, nr::MUNMAP);

    // addr2 = mmap2(...) must equal addr1.
    asm.li(A0, 0);
    asm.li(A1, 0x2000);
    asm.li(A2, 0x3);
    asm.li(A3, 0x22);
    emit_syscall(&mut asm, nr::MMAP2);
    asm.bne(V0, S0, "fail");
    asm.nop();

    emit_exit(&mut asm, 0);
    asm.label("fail");
    emit_exit(&mut asm, 1);

    let program = mips_program(&asm.finish(), &[]);
    let (code, _) = run_to_exit(&program, None);
    assert_eq!(code, 0);
}

// ══════════════════════════════════════════════════════════
// 4. Futex EAGAIN
// ══════════════════════════════════════════════════════════

/// FUTEX_WAIT returns EAGAIN when the word no longer holds the expected
/// value; under the o32 convention $a3 carries the error flag and $v0
/// the positive errno.
#[test]
fn futex_wait_wrong_value_is_eagain() {
    init();
    let mut asm = MipsAsm::new(crate::common::elf::MIPS_BASE);

    // Zeroed stack slots for args five and six.
    asm.addiu(SP, SP, -24);
    asm.sw(ZERO, 16, SP);
    asm.sw(ZERO, 20, SP);

    // *(word) = 5
    asm.li32(T0, MIPS_DATA);
    asm.li(T1, 5);
    asm.sw(T1, 0, T0);

    // futex(word, FUTEX_WAIT, 4, NULL, 0, 0): word != 4 -> EAGAIN.
    asm.move_(A0, T0);
    asm.li(A1, 0);
    asm.li(A2, 4);
    asm.li(A3, 0);
    emit_syscall(&mut asm, nr::FUTEX);

    // Expect $a3 == 1 and $v0 == 11 (EAGAIN).
    asm.li(T2, 11);
    asm.bne(V0, T2, "fail");
    asm.nop();
    asm.li(T3, 1);
    asm.bne(A3, T3, "fail");
    asm.nop();

    emit_exit(&mut asm, 0);
    asm.label("fail");
    emit_exit(&mut asm, 1);

    let program = mips_program(&asm.finish(), &[]);
    let (code, _) = run_to_exit(&program, None);
    assert_eq!(code, 0);
}

// ══════════════════════════════════════════════════════════
// 5. Signal delivery and sigreturn
// ══════════════════════════════════════════════════════════

/// Installs a handler, raises the signal at itself, and verifies that a
/// register the handler clobbers is restored by sigreturn while the
/// handler's side effect (a flag in memory) persists.
#[test]
fn signal_handler_restores_registers() {
    init();
    let mut asm = MipsAsm::new(crate::common::elf::MIPS_BASE);
    let flag = MIPS_DATA + 0x100;
    let act = MIPS_DATA + 0x40;

    // Build struct sigaction {handler, flags=0, restorer=0, mask=0} at `act`.
    asm.li32(T0, act);
    asm.la(T1, "handler");
    asm.sw(T1, 0, T0);
    asm.sw(ZERO, 4, T0);
    asm.sw(ZERO, 8, T0);
    asm.sw(ZERO, 12, T0);
    asm.sw(ZERO, 16, T0);

    // rt_sigaction(SIGUSR1=10, act, NULL, 8)
    asm.li(A0, 10);
    asm.move_(A1, T0);
    asm.li(A2, 0);
    asm.li(A3, 8);
    emit_syscall(&mut asm, nr::RT_SIGACTION);

    // Marker values the handler will clobber.
    asm.li(S0, 0x1234);
    asm.li(S1, 0x4321);

    // kill(getpid(), SIGUSR1)
    emit_syscall(&mut asm, nr::GETPID);
    asm.move_(A0, V0);
    asm.li(A1, 10);
    emit_syscall(&mut asm, nr::KILL);

    // Wait for the handler's flag.
    asm.li32(T2, flag);
    asm.label("spin");
    asm.lw(T3, 0, T2);
    asm.beq(T3, ZERO, "spin");
    asm.nop();

    // Registers must be restored register-for-register.
    asm.li(T4, 0x1234);
    asm.bne(S0, T4, "fail");
    asm.nop();
    asm.li(T4, 0x4321);
    asm.bne(S1, T4, "fail");
    asm.nop();

    emit_exit(&mut asm, 0);
    asm.label("fail");
    emit_exit(&mut asm, 1);

    // Handler: clobber the markers, set the flag, return through $ra to
    // the sigreturn trampoline.
    asm.label("handler");
    asm.li(S0, 0x6666);
    asm.li(S1, 0x7777);
    asm.li32(T0, flag);
    asm.li(T1, 1);
    asm.sw(T1, 0, T0);
    asm.jr(RA);
    asm.nop();

    let program = mips_program(&asm.finish(), &[]);
    let (code, emu) = run_to_exit(&program, None);
    assert_eq!(code, 0);
    assert_eq!(emu.stats.contexts_finished, 1);
}
