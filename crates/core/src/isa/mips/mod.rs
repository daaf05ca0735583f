//! MIPS32 executor.
//!
//! Little-endian MIPS32 with the classic delay-slot model: the register
//! file carries both `pc` and `npc`, branch routines write the branch
//! target into `npc`, and the delay-slot instruction executes before the
//! transfer lands. The context's `target_ip` records the branch target
//! whether or not the branch is taken.

pub mod decode;
mod exec;

use crate::context::{state, Context};
use crate::emu::Emu;
use crate::isa::{ExecError, Fault};

use decode::{decode, Inst, EXEC_TABLE};

/// Execution routine signature: one entry per opcode in the flat table.
pub type ExecFn = fn(&mut Emu, &mut Context, Inst) -> Result<(), ExecError>;

/// Fetches and executes one instruction.
pub fn execute_one(emu: &mut Emu, ctx: &mut Context) -> Result<(), ExecError> {
    let (pc, npc) = match &ctx.regs {
        crate::context::Regs::Mips(r) => (r.pc, r.npc),
        _ => unreachable!("mips executor on non-mips context"),
    };

    ctx.last_ip = ctx.current_ip;
    ctx.current_ip = pc;

    // Fetch. Speculative fetch reads through the mirror.
    let mut word = [0u8; 4];
    if ctx.has_state(state::SPEC_MODE) {
        ctx.spec_mem.read(pc, &mut word);
    } else {
        ctx.memory
            .borrow_mut()
            .read_init(pc, &mut word)
            .map_err(|f| ExecError::Fault(Fault::Mem(f)))?;
    }
    let raw = u32::from_le_bytes(word);

    // Advance: the delay-slot successor becomes current; branch routines
    // overwrite the new npc.
    if let crate::context::Regs::Mips(r) = &mut ctx.regs {
        r.pc = npc;
        r.npc = npc.wrapping_add(4);
    }

    let opcode = decode(raw);
    let inst = Inst(raw);
    EXEC_TABLE[opcode as usize](emu, ctx, inst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::regs::mips_abi;
    use crate::context::Regs;
    use crate::emu::Emu;
    use crate::mem::perm;

    /// Builds an emulator with one MIPS context whose text is `words`.
    fn harness(words: &[u32]) -> (Emu, crate::context::Context) {
        let mut emu = Emu::new();
        let mut ctx = emu.bare_context(crate::isa::IsaKind::Mips);
        {
            let mut mem = ctx.memory.borrow_mut();
            mem.map(0x0040_0000, 0x1000, perm::INIT | perm::READ | perm::EXEC);
            mem.map(0x1000_0000, 0x2000, perm::INIT | perm::READ | perm::WRITE);
            for (i, w) in words.iter().enumerate() {
                mem.write_init(0x0040_0000 + (i as u32) * 4, &w.to_le_bytes())
                    .unwrap();
            }
        }
        ctx.regs.set_pc(0x0040_0000);
        (emu, ctx)
    }

    fn reg(ctx: &crate::context::Context, r: usize) -> u32 {
        match &ctx.regs {
            Regs::Mips(m) => m.read(r),
            _ => unreachable!(),
        }
    }

    /// Arithmetic and immediate forms.
    #[test]
    fn addiu_and_addu() {
        // addiu $t0, $zero, 5 ; addiu $t1, $zero, 7 ; addu $t2, $t0, $t1
        let (mut emu, mut ctx) = harness(&[0x2408_0005, 0x2409_0007, 0x0109_5021]);
        for _ in 0..3 {
            execute_one(&mut emu, &mut ctx).unwrap();
        }
        assert_eq!(reg(&ctx, 8), 5);
        assert_eq!(reg(&ctx, 9), 7);
        assert_eq!(reg(&ctx, 10), 12);
    }

    /// A taken branch executes its delay slot before transferring.
    #[test]
    fn branch_delay_slot() {
        // beq $zero, $zero, +2 ; addiu $t0, $zero, 1 (delay slot)
        // addiu $t0, $t0, 10 (skipped) ; addiu $t1, $zero, 9 (target)
        let (mut emu, mut ctx) = harness(&[0x1000_0002, 0x2408_0001, 0x2508_000a, 0x2409_0009]);
        for _ in 0..3 {
            execute_one(&mut emu, &mut ctx).unwrap();
        }
        assert_eq!(reg(&ctx, 8), 1, "delay slot executed");
        assert_eq!(reg(&ctx, 9), 9, "branch target reached");
        assert_eq!(ctx.target_ip, 0x0040_000c, "target recorded");
    }

    /// A not-taken branch still records its target.
    #[test]
    fn branch_not_taken_records_target() {
        // bne $zero, $zero, +4 ; nop
        let (mut emu, mut ctx) = harness(&[0x1400_0004, 0x0000_0000]);
        execute_one(&mut emu, &mut ctx).unwrap();
        assert_eq!(ctx.target_ip, 0x0040_0014);
        execute_one(&mut emu, &mut ctx).unwrap();
        assert_eq!(ctx.regs.pc(), 0x0040_0008, "fell through");
    }

    /// Loads and stores round-trip through guest memory.
    #[test]
    fn load_store_round_trip() {
        // lui $t0, 0x1000 ; addiu $t1, $zero, 0x1234 ; sw $t1, 16($t0) ; lw $t2, 16($t0)
        let (mut emu, mut ctx) =
            harness(&[0x3c08_1000, 0x2409_1234, 0xad09_0010, 0x8d0a_0010]);
        for _ in 0..4 {
            execute_one(&mut emu, &mut ctx).unwrap();
        }
        assert_eq!(reg(&ctx, 10), 0x1234);
        assert_eq!(ctx.effective_addr, 0x1000_0010);
    }

    /// jal sets $ra past the delay slot; jr returns through it.
    #[test]
    fn jal_and_jr() {
        // 0x400000: jal 0x400010 ; nop ; <0x400008: addiu $t3,$zero,3> ...
        // 0x400010: jr $ra ; nop
        let (mut emu, mut ctx) = harness(&[
            0x0c10_0004, // jal 0x400010
            0x0000_0000, // nop
            0x240b_0003, // addiu $t3, $zero, 3  (return lands here)
            0x0000_0000, // nop
            0x03e0_0008, // 0x400010: jr $ra
            0x0000_0000, // nop
        ]);
        for _ in 0..5 {
            execute_one(&mut emu, &mut ctx).unwrap();
        }
        assert_eq!(reg(&ctx, mips_abi::RA), 0x0040_0008);
        assert_eq!(reg(&ctx, 11), 3);
    }

    /// lwl/lwr pairs assemble an unaligned word (little-endian variant).
    #[test]
    fn unaligned_lwl_lwr() {
        // Memory: bytes 0x11 0x22 0x33 0x44 0x55 ... at 0x10000000.
        // lui $t0, 0x1000 ; lwr $t2, 1($t0) ; lwl $t2, 4($t0)
        let (mut emu, mut ctx) = harness(&[0x3c08_1000, 0x990a_0001, 0x890a_0004]);
        ctx.memory
            .borrow_mut()
            .write(0x1000_0000, &[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88])
            .unwrap();
        for _ in 0..3 {
            execute_one(&mut emu, &mut ctx).unwrap();
        }
        // The unaligned word at 0x10000001 is 0x55443322.
        assert_eq!(reg(&ctx, 10), 0x5544_3322);
    }

    /// rdhwr $29 reads the TLS pointer.
    #[test]
    fn rdhwr_tls() {
        let (mut emu, mut ctx) = harness(&[0x7c03_e83b]);
        ctx.glibc_segment_base = 0x55aa_1000;
        execute_one(&mut emu, &mut ctx).unwrap();
        assert_eq!(reg(&ctx, 3), 0x55aa_1000);
    }
}
