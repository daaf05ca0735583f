//! MIPS32 execution routines, one per opcode.
//!
//! Routines receive the emulator (for syscalls and the timing model), the
//! context, and the raw instruction. The program counter has already been
//! advanced past the instruction; branch routines overwrite `npc` so the
//! delay slot executes first.

use super::decode::Inst;
use crate::context::regs::mips_abi;
use crate::context::{Context, Regs};
use crate::emu::Emu;
use crate::isa::{data_read, data_write, ExecError, Fault};

fn regs(ctx: &mut Context) -> &mut crate::context::MipsRegs {
    match &mut ctx.regs {
        Regs::Mips(r) => r,
        _ => unreachable!(),
    }
}

/// Effective address of a load/store.
fn ea(ctx: &mut Context, inst: Inst) -> u32 {
    let base = regs(ctx).read(inst.rs());
    base.wrapping_add(inst.simm() as u32)
}

/// Branch target relative to the delay slot, recorded on the context
/// whether or not the branch is taken.
fn branch_target(ctx: &mut Context, inst: Inst) -> u32 {
    let target = regs(ctx).pc.wrapping_add((inst.simm() as u32) << 2);
    ctx.target_ip = target;
    target
}

fn take_branch(ctx: &mut Context, target: u32) {
    regs(ctx).npc = target;
}

pub fn op_invalid(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    Err(ExecError::Fault(Fault::Illegal {
        addr: ctx.current_ip,
        raw: inst.0,
    }))
}

// ----------------------------------------------------------------------
// Shifts
// ----------------------------------------------------------------------

pub fn op_sll(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = r.read(inst.rt()) << inst.shamt();
    r.write(inst.rd(), v);
    Ok(())
}

pub fn op_srl(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = r.read(inst.rt()) >> inst.shamt();
    r.write(inst.rd(), v);
    Ok(())
}

pub fn op_sra(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = (r.read(inst.rt()) as i32) >> inst.shamt();
    r.write(inst.rd(), v as u32);
    Ok(())
}

pub fn op_sllv(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = r.read(inst.rt()) << (r.read(inst.rs()) & 0x1f);
    r.write(inst.rd(), v);
    Ok(())
}

pub fn op_srlv(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = r.read(inst.rt()) >> (r.read(inst.rs()) & 0x1f);
    r.write(inst.rd(), v);
    Ok(())
}

pub fn op_srav(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = (r.read(inst.rt()) as i32) >> (r.read(inst.rs()) & 0x1f);
    r.write(inst.rd(), v as u32);
    Ok(())
}

// ----------------------------------------------------------------------
// Jumps and branches
// ----------------------------------------------------------------------

pub fn op_jr(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let target = regs(ctx).read(inst.rs());
    ctx.target_ip = target;
    take_branch(ctx, target);
    Ok(())
}

pub fn op_jalr(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let target = r.read(inst.rs());
    let link = r.npc;
    r.write(inst.rd(), link);
    ctx.target_ip = target;
    take_branch(ctx, target);
    Ok(())
}

pub fn op_j(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let target = (regs(ctx).pc & 0xf000_0000) | (inst.target() << 2);
    ctx.target_ip = target;
    take_branch(ctx, target);
    Ok(())
}

pub fn op_jal(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let link = r.npc;
    r.write(mips_abi::RA, link);
    let target = (r.pc & 0xf000_0000) | (inst.target() << 2);
    ctx.target_ip = target;
    take_branch(ctx, target);
    Ok(())
}

pub fn op_beq(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let target = branch_target(ctx, inst);
    let r = regs(ctx);
    if r.read(inst.rs()) == r.read(inst.rt()) {
        take_branch(ctx, target);
    }
    Ok(())
}

pub fn op_bne(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let target = branch_target(ctx, inst);
    let r = regs(ctx);
    if r.read(inst.rs()) != r.read(inst.rt()) {
        take_branch(ctx, target);
    }
    Ok(())
}

pub fn op_blez(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let target = branch_target(ctx, inst);
    if (regs(ctx).read(inst.rs()) as i32) <= 0 {
        take_branch(ctx, target);
    }
    Ok(())
}

pub fn op_bgtz(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let target = branch_target(ctx, inst);
    if (regs(ctx).read(inst.rs()) as i32) > 0 {
        take_branch(ctx, target);
    }
    Ok(())
}

pub fn op_bltz(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let target = branch_target(ctx, inst);
    if (regs(ctx).read(inst.rs()) as i32) < 0 {
        take_branch(ctx, target);
    }
    Ok(())
}

pub fn op_bgez(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let target = branch_target(ctx, inst);
    if (regs(ctx).read(inst.rs()) as i32) >= 0 {
        take_branch(ctx, target);
    }
    Ok(())
}

pub fn op_bltzal(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let target = branch_target(ctx, inst);
    let r = regs(ctx);
    let link = r.npc;
    r.write(mips_abi::RA, link);
    if (r.read(inst.rs()) as i32) < 0 {
        take_branch(ctx, target);
    }
    Ok(())
}

pub fn op_bgezal(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let target = branch_target(ctx, inst);
    let r = regs(ctx);
    let link = r.npc;
    r.write(mips_abi::RA, link);
    if (r.read(inst.rs()) as i32) >= 0 {
        take_branch(ctx, target);
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Conditional moves, system
// ----------------------------------------------------------------------

pub fn op_movz(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    if r.read(inst.rt()) == 0 {
        let v = r.read(inst.rs());
        r.write(inst.rd(), v);
    }
    Ok(())
}

pub fn op_movn(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    if r.read(inst.rt()) != 0 {
        let v = r.read(inst.rs());
        r.write(inst.rd(), v);
    }
    Ok(())
}

pub fn op_syscall(emu: &mut Emu, ctx: &mut Context, _inst: Inst) -> Result<(), ExecError> {
    crate::syscall::execute(emu, ctx).map_err(ExecError::Fatal)
}

pub fn op_break(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    Err(ExecError::Fault(Fault::Illegal {
        addr: ctx.current_ip,
        raw: inst.0,
    }))
}

pub fn op_sync(_emu: &mut Emu, _ctx: &mut Context, _inst: Inst) -> Result<(), ExecError> {
    // Single-threaded cooperative execution: every access is already
    // globally ordered.
    Ok(())
}

pub fn op_teq(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    if r.read(inst.rs()) == r.read(inst.rt()) {
        // gcc guards integer division with `teq divisor, $zero`.
        return Err(ExecError::Fault(Fault::DivideByZero {
            addr: ctx.current_ip,
        }));
    }
    Ok(())
}

pub fn op_pref(_emu: &mut Emu, _ctx: &mut Context, _inst: Inst) -> Result<(), ExecError> {
    Ok(())
}

pub fn op_cache(_emu: &mut Emu, _ctx: &mut Context, _inst: Inst) -> Result<(), ExecError> {
    Ok(())
}

pub fn op_rdhwr(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    // Hardware registers: 0 = cpu number, 29 = user local (TLS pointer).
    let value = match inst.rd() {
        0 => 0,
        29 => ctx.glibc_segment_base,
        _ => 0,
    };
    regs(ctx).write(inst.rt(), value);
    Ok(())
}

// ----------------------------------------------------------------------
// Hi/lo and multiply/divide
// ----------------------------------------------------------------------

pub fn op_mfhi(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = r.hi;
    r.write(inst.rd(), v);
    Ok(())
}

pub fn op_mthi(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    r.hi = r.read(inst.rs());
    Ok(())
}

pub fn op_mflo(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = r.lo;
    r.write(inst.rd(), v);
    Ok(())
}

pub fn op_mtlo(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    r.lo = r.read(inst.rs());
    Ok(())
}

pub fn op_mult(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let prod = (r.read(inst.rs()) as i32 as i64) * (r.read(inst.rt()) as i32 as i64);
    r.lo = prod as u32;
    r.hi = (prod >> 32) as u32;
    Ok(())
}

pub fn op_multu(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let prod = u64::from(r.read(inst.rs())) * u64::from(r.read(inst.rt()));
    r.lo = prod as u32;
    r.hi = (prod >> 32) as u32;
    Ok(())
}

pub fn op_div(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let num = r.read(inst.rs()) as i32;
    let den = r.read(inst.rt()) as i32;
    // Divide by zero leaves hi/lo unpredictable; guest code guards with
    // teq. Overflow case (MIN / -1) wraps.
    if den != 0 {
        r.lo = num.wrapping_div(den) as u32;
        r.hi = num.wrapping_rem(den) as u32;
    }
    Ok(())
}

pub fn op_divu(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let num = r.read(inst.rs());
    let den = r.read(inst.rt());
    if den != 0 {
        r.lo = num / den;
        r.hi = num % den;
    }
    Ok(())
}

pub fn op_mul(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = r.read(inst.rs()).wrapping_mul(r.read(inst.rt()));
    r.write(inst.rd(), v);
    Ok(())
}

fn acc_op(ctx: &mut Context, inst: Inst, signed: bool, add: bool) {
    let r = regs(ctx);
    let prod = if signed {
        ((r.read(inst.rs()) as i32 as i64) * (r.read(inst.rt()) as i32 as i64)) as u64
    } else {
        u64::from(r.read(inst.rs())) * u64::from(r.read(inst.rt()))
    };
    let acc = (u64::from(r.hi) << 32) | u64::from(r.lo);
    let result = if add {
        acc.wrapping_add(prod)
    } else {
        acc.wrapping_sub(prod)
    };
    r.lo = result as u32;
    r.hi = (result >> 32) as u32;
}

pub fn op_madd(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    acc_op(ctx, inst, true, true);
    Ok(())
}

pub fn op_maddu(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    acc_op(ctx, inst, false, true);
    Ok(())
}

pub fn op_msub(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    acc_op(ctx, inst, true, false);
    Ok(())
}

pub fn op_msubu(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    acc_op(ctx, inst, false, false);
    Ok(())
}

// ----------------------------------------------------------------------
// ALU register forms
// ----------------------------------------------------------------------

pub fn op_add(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    // Overflow traps are not modeled; gcc emits addu everywhere anyway.
    op_addu(_emu, ctx, inst)
}

pub fn op_addu(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = r.read(inst.rs()).wrapping_add(r.read(inst.rt()));
    r.write(inst.rd(), v);
    Ok(())
}

pub fn op_sub(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    op_subu(_emu, ctx, inst)
}

pub fn op_subu(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = r.read(inst.rs()).wrapping_sub(r.read(inst.rt()));
    r.write(inst.rd(), v);
    Ok(())
}

pub fn op_and(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = r.read(inst.rs()) & r.read(inst.rt());
    r.write(inst.rd(), v);
    Ok(())
}

pub fn op_or(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = r.read(inst.rs()) | r.read(inst.rt());
    r.write(inst.rd(), v);
    Ok(())
}

pub fn op_xor(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = r.read(inst.rs()) ^ r.read(inst.rt());
    r.write(inst.rd(), v);
    Ok(())
}

pub fn op_nor(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = !(r.read(inst.rs()) | r.read(inst.rt()));
    r.write(inst.rd(), v);
    Ok(())
}

pub fn op_slt(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = ((r.read(inst.rs()) as i32) < (r.read(inst.rt()) as i32)) as u32;
    r.write(inst.rd(), v);
    Ok(())
}

pub fn op_sltu(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = (r.read(inst.rs()) < r.read(inst.rt())) as u32;
    r.write(inst.rd(), v);
    Ok(())
}

pub fn op_clz(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = r.read(inst.rs()).leading_zeros();
    r.write(inst.rd(), v);
    Ok(())
}

pub fn op_clo(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = r.read(inst.rs()).leading_ones();
    r.write(inst.rd(), v);
    Ok(())
}

// ----------------------------------------------------------------------
// ALU immediate forms
// ----------------------------------------------------------------------

pub fn op_addi(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    op_addiu(_emu, ctx, inst)
}

pub fn op_addiu(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = r.read(inst.rs()).wrapping_add(inst.simm() as u32);
    r.write(inst.rt(), v);
    Ok(())
}

pub fn op_slti(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = ((r.read(inst.rs()) as i32) < inst.simm()) as u32;
    r.write(inst.rt(), v);
    Ok(())
}

pub fn op_sltiu(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = (r.read(inst.rs()) < inst.simm() as u32) as u32;
    r.write(inst.rt(), v);
    Ok(())
}

pub fn op_andi(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = r.read(inst.rs()) & inst.imm();
    r.write(inst.rt(), v);
    Ok(())
}

pub fn op_ori(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = r.read(inst.rs()) | inst.imm();
    r.write(inst.rt(), v);
    Ok(())
}

pub fn op_xori(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = r.read(inst.rs()) ^ inst.imm();
    r.write(inst.rt(), v);
    Ok(())
}

pub fn op_lui(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    regs(ctx).write(inst.rt(), inst.imm() << 16);
    Ok(())
}

// ----------------------------------------------------------------------
// Bit fields
// ----------------------------------------------------------------------

pub fn op_ext(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let lsb = inst.shamt();
    let size = inst.rd() as u32 + 1;
    let mask = if size == 32 { u32::MAX } else { (1 << size) - 1 };
    let v = (r.read(inst.rs()) >> lsb) & mask;
    r.write(inst.rt(), v);
    Ok(())
}

pub fn op_ins(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let lsb = inst.shamt();
    let msb = inst.rd() as u32;
    let size = msb - lsb + 1;
    let mask = if size == 32 { u32::MAX } else { (1 << size) - 1 };
    let field = (r.read(inst.rs()) & mask) << lsb;
    let v = (r.read(inst.rt()) & !(mask << lsb)) | field;
    r.write(inst.rt(), v);
    Ok(())
}

pub fn op_seb(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = r.read(inst.rt()) as u8 as i8 as i32 as u32;
    r.write(inst.rd(), v);
    Ok(())
}

pub fn op_seh(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = r.read(inst.rt()) as u16 as i16 as i32 as u32;
    r.write(inst.rd(), v);
    Ok(())
}

pub fn op_wsbh(_emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = r.read(inst.rt());
    let swapped = ((v & 0x00ff_00ff) << 8) | ((v & 0xff00_ff00) >> 8);
    r.write(inst.rd(), swapped);
    Ok(())
}

// ----------------------------------------------------------------------
// Loads
// ----------------------------------------------------------------------

fn check_align(addr: u32, align: u32, write: bool) -> Result<(), ExecError> {
    if addr % align != 0 {
        return Err(ExecError::Fault(Fault::Mem(crate::mem::MemFault {
            addr,
            write,
        })));
    }
    Ok(())
}

pub fn op_lb(emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let addr = ea(ctx, inst);
    let mut b = [0u8];
    data_read(emu, ctx, addr, &mut b)?;
    regs(ctx).write(inst.rt(), b[0] as i8 as i32 as u32);
    Ok(())
}

pub fn op_lbu(emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let addr = ea(ctx, inst);
    let mut b = [0u8];
    data_read(emu, ctx, addr, &mut b)?;
    regs(ctx).write(inst.rt(), u32::from(b[0]));
    Ok(())
}

pub fn op_lh(emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let addr = ea(ctx, inst);
    check_align(addr, 2, false)?;
    let mut b = [0u8; 2];
    data_read(emu, ctx, addr, &mut b)?;
    regs(ctx).write(inst.rt(), i16::from_le_bytes(b) as i32 as u32);
    Ok(())
}

pub fn op_lhu(emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let addr = ea(ctx, inst);
    check_align(addr, 2, false)?;
    let mut b = [0u8; 2];
    data_read(emu, ctx, addr, &mut b)?;
    regs(ctx).write(inst.rt(), u32::from(u16::from_le_bytes(b)));
    Ok(())
}

pub fn op_lw(emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let addr = ea(ctx, inst);
    check_align(addr, 4, false)?;
    let mut b = [0u8; 4];
    data_read(emu, ctx, addr, &mut b)?;
    regs(ctx).write(inst.rt(), u32::from_le_bytes(b));
    Ok(())
}

pub fn op_ll(emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    // Cooperative single-threaded model: LL is a plain load and the
    // paired SC always succeeds.
    op_lw(emu, ctx, inst)
}

fn read_aligned_word(emu: &mut Emu, ctx: &mut Context, addr: u32) -> Result<u32, ExecError> {
    let mut b = [0u8; 4];
    data_read(emu, ctx, addr & !3, &mut b)?;
    Ok(u32::from_le_bytes(b))
}

pub fn op_lwl(emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    // Little-endian LWL: merge the low (byte+1) bytes of the aligned word
    // into the top of rt.
    let addr = ea(ctx, inst);
    let byte = addr & 3;
    let word = read_aligned_word(emu, ctx, addr)?;
    let shift = 8 * (3 - byte);
    let keep = if shift == 0 { 0 } else { (1u32 << shift) - 1 };
    let r = regs(ctx);
    let v = (word << shift) | (r.read(inst.rt()) & keep);
    r.write(inst.rt(), v);
    Ok(())
}

pub fn op_lwr(emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    // Little-endian LWR: merge the high (4-byte) bytes of the aligned
    // word into the bottom of rt.
    let addr = ea(ctx, inst);
    let byte = addr & 3;
    let word = read_aligned_word(emu, ctx, addr)?;
    let shift = 8 * byte;
    let keep = if shift == 0 { 0 } else { !(u32::MAX >> shift) };
    let r = regs(ctx);
    let v = (r.read(inst.rt()) & keep) | (word >> shift);
    r.write(inst.rt(), v);
    Ok(())
}

// ----------------------------------------------------------------------
// Stores
// ----------------------------------------------------------------------

pub fn op_sb(emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let addr = ea(ctx, inst);
    let v = regs(ctx).read(inst.rt()) as u8;
    data_write(emu, ctx, addr, &[v])
}

pub fn op_sh(emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let addr = ea(ctx, inst);
    check_align(addr, 2, true)?;
    let v = regs(ctx).read(inst.rt()) as u16;
    data_write(emu, ctx, addr, &v.to_le_bytes())
}

pub fn op_sw(emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let addr = ea(ctx, inst);
    check_align(addr, 4, true)?;
    let v = regs(ctx).read(inst.rt());
    data_write(emu, ctx, addr, &v.to_le_bytes())
}

pub fn op_sc(emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let addr = ea(ctx, inst);
    check_align(addr, 4, true)?;
    let v = regs(ctx).read(inst.rt());
    data_write(emu, ctx, addr, &v.to_le_bytes())?;
    // Always succeeds; see op_ll.
    regs(ctx).write(inst.rt(), 1);
    Ok(())
}

pub fn op_swl(emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let addr = ea(ctx, inst);
    let byte = addr & 3;
    let word = read_aligned_word(emu, ctx, addr)?;
    let rt = regs(ctx).read(inst.rt());
    let shift = 8 * (3 - byte);
    let mask = if shift == 0 { u32::MAX } else { (1u32 << (8 * (byte + 1))) - 1 };
    let merged = (word & !mask) | ((rt >> shift) & mask);
    data_write(emu, ctx, addr & !3, &merged.to_le_bytes())
}

pub fn op_swr(emu: &mut Emu, ctx: &mut Context, inst: Inst) -> Result<(), ExecError> {
    let addr = ea(ctx, inst);
    let byte = addr & 3;
    let word = read_aligned_word(emu, ctx, addr)?;
    let rt = regs(ctx).read(inst.rt());
    let shift = 8 * byte;
    let mask = if shift == 0 { u32::MAX } else { u32::MAX << shift };
    let merged = (word & !mask) | ((rt << shift) & mask);
    data_write(emu, ctx, addr & !3, &merged.to_le_bytes())
}
