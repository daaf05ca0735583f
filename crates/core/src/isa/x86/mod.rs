//! x86 (IA-32) executor.
//!
//! Flat protected mode, 32-bit code only. The decoder resolves addressing
//! up front; routines operate on register indices and absolute guest
//! addresses. The `gs` segment override maps to the glibc TLS segment
//! installed by `set_thread_area`. System calls enter through `int 0x80`.

pub mod decode;
mod exec;

use crate::context::{state, Context, Regs};
use crate::emu::Emu;
use crate::isa::{ExecError, Fault};

use decode::{decode, Insn, Op, EXEC_TABLE};

/// Execution routine signature: one entry per op in the flat table.
pub type ExecFn = fn(&mut Emu, &mut Context, &Insn) -> Result<(), ExecError>;

/// Longest x86 instruction encoding.
const MAX_INSN_LEN: usize = 15;

/// Fetches up to 16 bytes at `pc`, tolerating a mapping boundary inside
/// the window.
fn fetch_window(ctx: &mut Context, pc: u32) -> ([u8; 16], usize) {
    let mut window = [0u8; 16];
    if ctx.has_state(state::SPEC_MODE) {
        ctx.spec_mem.read(pc, &mut window);
        return (window, 16);
    }
    let mut mem = ctx.memory.borrow_mut();
    for len in (1..=16usize).rev() {
        if mem.read_init(pc, &mut window[..len]).is_ok() {
            return (window, len);
        }
    }
    (window, 0)
}

/// Fetches and executes one instruction.
pub fn execute_one(emu: &mut Emu, ctx: &mut Context) -> Result<(), ExecError> {
    let pc = ctx.regs.pc();
    ctx.last_ip = ctx.current_ip;
    ctx.current_ip = pc;

    let (window, valid) = fetch_window(ctx, pc);
    if valid == 0 {
        return Err(ExecError::Fault(Fault::Mem(crate::mem::MemFault {
            addr: pc,
            write: false,
        })));
    }

    let insn = {
        let r = match &ctx.regs {
            Regs::X86(r) => r,
            _ => unreachable!("x86 executor on non-x86 context"),
        };
        decode(&window[..valid], r, ctx.glibc_segment_base)
    };

    if insn.op == Op::Invalid || insn.len as usize > MAX_INSN_LEN.min(valid) {
        return Err(ExecError::Fault(Fault::Illegal {
            addr: pc,
            raw: u32::from_le_bytes([window[0], window[1], window[2], window[3]]),
        }));
    }

    // Advance past the instruction; control transfers overwrite eip.
    if let Regs::X86(r) = &mut ctx.regs {
        r.eip = pc.wrapping_add(insn.len);
    }

    EXEC_TABLE[insn.op as usize](emu, ctx, &insn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::regs::eflags;
    use crate::mem::perm;

    fn harness(code: &[u8]) -> (Emu, crate::context::Context) {
        let mut emu = Emu::new();
        let mut ctx = emu.bare_context(crate::isa::IsaKind::X86);
        {
            let mut mem = ctx.memory.borrow_mut();
            mem.map(0x0804_8000, 0x1000, perm::INIT | perm::READ | perm::EXEC);
            mem.map(0x1000_0000, 0x2000, perm::INIT | perm::READ | perm::WRITE);
            // Stack.
            mem.map(0xbfff_0000, 0x1000, perm::INIT | perm::READ | perm::WRITE);
            mem.write_init(0x0804_8000, code).unwrap();
        }
        ctx.regs.set_pc(0x0804_8000);
        ctx.regs.set_sp(0xbfff_0800);
        (emu, ctx)
    }

    fn x86(ctx: &crate::context::Context) -> &crate::context::X86Regs {
        match &ctx.regs {
            Regs::X86(r) => r,
            _ => unreachable!(),
        }
    }

    fn step(emu: &mut Emu, ctx: &mut crate::context::Context, n: usize) {
        for _ in 0..n {
            execute_one(emu, ctx).unwrap();
        }
    }

    /// mov/add with immediate and register forms.
    #[test]
    fn mov_add_basic() {
        // mov eax, 5 ; mov ebx, 7 ; add eax, ebx
        let (mut emu, mut ctx) = harness(&[
            0xb8, 5, 0, 0, 0, //
            0xbb, 7, 0, 0, 0, //
            0x01, 0xd8,
        ]);
        step(&mut emu, &mut ctx, 3);
        assert_eq!(x86(&ctx).eax, 12);
        assert_eq!(x86(&ctx).eflags & eflags::ZF, 0);
    }

    /// push/pop round-trips through the stack.
    #[test]
    fn push_pop() {
        // mov eax, 0x1234 ; push eax ; pop ecx
        let (mut emu, mut ctx) = harness(&[0xb8, 0x34, 0x12, 0, 0, 0x50, 0x59]);
        let sp0 = ctx.regs.sp();
        step(&mut emu, &mut ctx, 2);
        assert_eq!(ctx.regs.sp(), sp0 - 4);
        step(&mut emu, &mut ctx, 1);
        assert_eq!(x86(&ctx).ecx, 0x1234);
        assert_eq!(ctx.regs.sp(), sp0);
    }

    /// call pushes the return address; ret pops it.
    #[test]
    fn call_ret() {
        let (mut emu, mut ctx) = harness(&[
            0xe8, 0x05, 0x00, 0x00, 0x00, // call +5 -> 0x804800a
            0xb8, 0x01, 0x00, 0x00, 0x00, // mov eax,1 (return lands here)
            0xc3, // 0x804800a: ret
        ]);
        execute_one(&mut emu, &mut ctx).unwrap();
        assert_eq!(ctx.regs.pc(), 0x0804_800a);
        execute_one(&mut emu, &mut ctx).unwrap();
        assert_eq!(ctx.regs.pc(), 0x0804_8005, "ret returns past the call");
        execute_one(&mut emu, &mut ctx).unwrap();
        assert_eq!(x86(&ctx).eax, 1);
    }

    /// Conditional jump takes the ZF path and records the target.
    #[test]
    fn jcc_zero_flag() {
        // xor eax, eax ; jz +3 ; mov bl, 9 ; mov cl, 7
        let (mut emu, mut ctx) = harness(&[
            0x31, 0xc0, // xor eax,eax -> ZF
            0x74, 0x02, // jz +2 (skip mov bl)
            0xb3, 0x09, // mov bl, 9 (skipped)
            0xb1, 0x07, // mov cl, 7
        ]);
        step(&mut emu, &mut ctx, 3);
        assert_eq!(x86(&ctx).ebx & 0xff, 0);
        assert_eq!(x86(&ctx).ecx & 0xff, 7);
        assert_eq!(ctx.target_ip, 0x0804_8006);
    }

    /// rep movsb copies a block.
    #[test]
    fn rep_movsb() {
        // mov esi, src ; mov edi, dst ; mov ecx, 4 ; rep movsb
        let (mut emu, mut ctx) = harness(&[
            0xbe, 0x00, 0x00, 0x00, 0x10, // mov esi, 0x10000000
            0xbf, 0x00, 0x01, 0x00, 0x10, // mov edi, 0x10000100
            0xb9, 0x04, 0x00, 0x00, 0x00, // mov ecx, 4
            0xf3, 0xa4, // rep movsb
        ]);
        ctx.memory
            .borrow_mut()
            .write(0x1000_0000, &[1, 2, 3, 4])
            .unwrap();
        step(&mut emu, &mut ctx, 4);
        let mut out = [0u8; 4];
        ctx.memory.borrow_mut().read(0x1000_0100, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(x86(&ctx).ecx, 0);
    }

    /// lock cmpxchg success and failure paths.
    #[test]
    fn cmpxchg_paths() {
        // mov dword [0x10000000], 5 ; mov eax, 5 ; mov ecx, 9
        // lock cmpxchg [0x10000000], ecx   (succeeds: ZF, mem=9)
        // lock cmpxchg [0x10000000], ecx   (fails: eax=9)
        let (mut emu, mut ctx) = harness(&[
            0xc7, 0x05, 0x00, 0x00, 0x00, 0x10, 0x05, 0x00, 0x00, 0x00, // mov [..], 5
            0xb8, 0x05, 0x00, 0x00, 0x00, // mov eax, 5
            0xb9, 0x09, 0x00, 0x00, 0x00, // mov ecx, 9
            0xf0, 0x0f, 0xb1, 0x0d, 0x00, 0x00, 0x00, 0x10, // lock cmpxchg
            0xf0, 0x0f, 0xb1, 0x0d, 0x00, 0x00, 0x00, 0x10,
        ]);
        step(&mut emu, &mut ctx, 4);
        assert_ne!(x86(&ctx).eflags & eflags::ZF, 0);
        assert_eq!(ctx.memory.borrow_mut().read_u32(0x1000_0000).unwrap(), 9);

        step(&mut emu, &mut ctx, 1);
        assert_eq!(x86(&ctx).eflags & eflags::ZF, 0);
        assert_eq!(x86(&ctx).eax, 9, "failure loads the memory value");
    }
}
