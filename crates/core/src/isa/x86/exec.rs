//! x86 execution routines, one per decoded op.
//!
//! The instruction pointer has already been advanced past the encoding;
//! control-transfer routines overwrite it. Flags are computed eagerly.

use super::decode::{Insn, RmOperand, Width};
use crate::context::regs::{eflags, X86Regs};
use crate::context::{Context, Regs};
use crate::emu::Emu;
use crate::isa::{data_read, data_write, ExecError, Fault};

fn regs(ctx: &mut Context) -> &mut X86Regs {
    match &mut ctx.regs {
        Regs::X86(r) => r,
        _ => unreachable!(),
    }
}

// ----------------------------------------------------------------------
// Register and r/m access
// ----------------------------------------------------------------------

fn read_reg(r: &X86Regs, idx: usize, w: Width) -> u32 {
    let full = match idx & 7 {
        0 => r.eax,
        1 => r.ecx,
        2 => r.edx,
        3 => r.ebx,
        4 => r.esp,
        5 => r.ebp,
        6 => r.esi,
        7 => r.edi,
        _ => unreachable!(),
    };
    match w {
        Width::W32 => full,
        Width::W16 => full & 0xffff,
        Width::W8 => {
            // 4..7 select the high byte of eax/ecx/edx/ebx.
            if idx < 4 {
                full & 0xff
            } else {
                (reg_raw(r, idx & 3) >> 8) & 0xff
            }
        }
    }
}

fn reg_raw(r: &X86Regs, idx: usize) -> u32 {
    match idx {
        0 => r.eax,
        1 => r.ecx,
        2 => r.edx,
        3 => r.ebx,
        4 => r.esp,
        5 => r.ebp,
        6 => r.esi,
        7 => r.edi,
        _ => unreachable!(),
    }
}

fn reg_slot<'a>(r: &'a mut X86Regs, idx: usize) -> &'a mut u32 {
    match idx {
        0 => &mut r.eax,
        1 => &mut r.ecx,
        2 => &mut r.edx,
        3 => &mut r.ebx,
        4 => &mut r.esp,
        5 => &mut r.ebp,
        6 => &mut r.esi,
        7 => &mut r.edi,
        _ => unreachable!(),
    }
}

fn write_reg(r: &mut X86Regs, idx: usize, w: Width, v: u32) {
    match w {
        Width::W32 => *reg_slot(r, idx) = v,
        Width::W16 => {
            let slot = reg_slot(r, idx);
            *slot = (*slot & 0xffff_0000) | (v & 0xffff);
        }
        Width::W8 => {
            if idx < 4 {
                let slot = reg_slot(r, idx);
                *slot = (*slot & 0xffff_ff00) | (v & 0xff);
            } else {
                let slot = reg_slot(r, idx & 3);
                *slot = (*slot & 0xffff_00ff) | ((v & 0xff) << 8);
            }
        }
    }
}

fn read_mem(emu: &mut Emu, ctx: &mut Context, addr: u32, w: Width) -> Result<u32, ExecError> {
    let mut buf = [0u8; 4];
    let n = w.bytes() as usize;
    data_read(emu, ctx, addr, &mut buf[..n])?;
    Ok(u32::from_le_bytes(buf) & w.mask())
}

fn write_mem(emu: &mut Emu, ctx: &mut Context, addr: u32, w: Width, v: u32) -> Result<(), ExecError> {
    let bytes = v.to_le_bytes();
    data_write(emu, ctx, addr, &bytes[..w.bytes() as usize])
}

fn read_rm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<u32, ExecError> {
    match insn.rm {
        RmOperand::Reg(idx) => Ok(read_reg(regs(ctx), idx, insn.width)),
        RmOperand::Mem(addr) => read_mem(emu, ctx, addr, insn.width),
        RmOperand::None => unreachable!("operand-less op read r/m"),
    }
}

fn write_rm(emu: &mut Emu, ctx: &mut Context, insn: &Insn, v: u32) -> Result<(), ExecError> {
    match insn.rm {
        RmOperand::Reg(idx) => {
            write_reg(regs(ctx), idx, insn.width, v);
            Ok(())
        }
        RmOperand::Mem(addr) => write_mem(emu, ctx, addr, insn.width, v),
        RmOperand::None => unreachable!("operand-less op wrote r/m"),
    }
}

fn push(emu: &mut Emu, ctx: &mut Context, v: u32) -> Result<(), ExecError> {
    let sp = regs(ctx).esp.wrapping_sub(4);
    regs(ctx).esp = sp;
    write_mem(emu, ctx, sp, Width::W32, v)
}

fn pop(emu: &mut Emu, ctx: &mut Context) -> Result<u32, ExecError> {
    let sp = regs(ctx).esp;
    let v = read_mem(emu, ctx, sp, Width::W32)?;
    regs(ctx).esp = sp.wrapping_add(4);
    Ok(v)
}

// ----------------------------------------------------------------------
// Flags
// ----------------------------------------------------------------------

fn parity_even(v: u32) -> bool {
    (v as u8).count_ones() % 2 == 0
}

fn set_szp(r: &mut X86Regs, v: u32, w: Width) {
    let v = v & w.mask();
    r.eflags &= !(eflags::ZF | eflags::SF | eflags::PF);
    if v == 0 {
        r.eflags |= eflags::ZF;
    }
    if v & w.sign_bit() != 0 {
        r.eflags |= eflags::SF;
    }
    if parity_even(v) {
        r.eflags |= eflags::PF;
    }
}

fn set_flag(r: &mut X86Regs, flag: u32, on: bool) {
    if on {
        r.eflags |= flag;
    } else {
        r.eflags &= !flag;
    }
}

/// Addition flags for `a + b + carry_in = res`.
fn flags_add(r: &mut X86Regs, a: u32, b: u32, carry_in: u32, w: Width) -> u32 {
    let mask = w.mask();
    let wide = u64::from(a & mask) + u64::from(b & mask) + u64::from(carry_in);
    let res = (wide as u32) & mask;
    set_flag(r, eflags::CF, wide > u64::from(mask));
    set_flag(
        r,
        eflags::OF,
        ((a ^ res) & (b ^ res) & w.sign_bit()) != 0,
    );
    set_flag(r, eflags::AF, ((a ^ b ^ res) & 0x10) != 0);
    set_szp(r, res, w);
    res
}

/// Subtraction flags for `a - b - borrow_in = res`.
fn flags_sub(r: &mut X86Regs, a: u32, b: u32, borrow_in: u32, w: Width) -> u32 {
    let mask = w.mask();
    let res = a.wrapping_sub(b).wrapping_sub(borrow_in) & mask;
    set_flag(
        r,
        eflags::CF,
        u64::from(a & mask) < u64::from(b & mask) + u64::from(borrow_in),
    );
    set_flag(
        r,
        eflags::OF,
        ((a ^ b) & (a ^ res) & w.sign_bit()) != 0,
    );
    set_flag(r, eflags::AF, ((a ^ b ^ res) & 0x10) != 0);
    set_szp(r, res, w);
    res
}

fn flags_logic(r: &mut X86Regs, res: u32, w: Width) -> u32 {
    set_flag(r, eflags::CF, false);
    set_flag(r, eflags::OF, false);
    set_szp(r, res, w);
    res & w.mask()
}

/// Applies ALU selector 0..7 (add/or/adc/sbb/and/sub/xor/cmp) and returns
/// the result (unwritten for cmp, selector 7).
fn alu(r: &mut X86Regs, sel: u8, a: u32, b: u32, w: Width) -> (u32, bool) {
    let cf = u32::from(r.eflags & eflags::CF != 0);
    match sel {
        0 => (flags_add(r, a, b, 0, w), true),
        1 => (flags_logic(r, a | b, w), true),
        2 => (flags_add(r, a, b, cf, w), true),
        3 => (flags_sub(r, a, b, cf, w), true),
        4 => (flags_logic(r, a & b, w), true),
        5 => (flags_sub(r, a, b, 0, w), true),
        6 => (flags_logic(r, a ^ b, w), true),
        7 => (flags_sub(r, a, b, 0, w), false),
        _ => unreachable!(),
    }
}

/// Evaluates condition code 0..15.
fn cond(r: &X86Regs, cc: u8) -> bool {
    let f = r.eflags;
    let cf = f & eflags::CF != 0;
    let zf = f & eflags::ZF != 0;
    let sf = f & eflags::SF != 0;
    let of = f & eflags::OF != 0;
    let pf = f & eflags::PF != 0;
    match cc {
        0x0 => of,
        0x1 => !of,
        0x2 => cf,
        0x3 => !cf,
        0x4 => zf,
        0x5 => !zf,
        0x6 => cf || zf,
        0x7 => !cf && !zf,
        0x8 => sf,
        0x9 => !sf,
        0xa => pf,
        0xb => !pf,
        0xc => sf != of,
        0xd => sf == of,
        0xe => zf || (sf != of),
        0xf => !zf && (sf == of),
        _ => unreachable!(),
    }
}

// ----------------------------------------------------------------------
// Routines
// ----------------------------------------------------------------------

pub fn op_invalid(_emu: &mut Emu, ctx: &mut Context, _insn: &Insn) -> Result<(), ExecError> {
    Err(ExecError::Fault(Fault::Illegal {
        addr: ctx.current_ip,
        raw: 0,
    }))
}

pub fn op_nop(_emu: &mut Emu, _ctx: &mut Context, _insn: &Insn) -> Result<(), ExecError> {
    Ok(())
}

pub fn op_mov_rm_reg(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let v = read_reg(regs(ctx), insn.reg, insn.width);
    write_rm(emu, ctx, insn, v)
}

pub fn op_mov_reg_rm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let v = read_rm(emu, ctx, insn)?;
    write_reg(regs(ctx), insn.reg, insn.width, v);
    Ok(())
}

pub fn op_mov_rm_imm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    write_rm(emu, ctx, insn, insn.imm)
}

pub fn op_mov_reg_imm(_emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    write_reg(regs(ctx), insn.reg, insn.width, insn.imm);
    Ok(())
}

pub fn op_mov_acc_moffs(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let v = read_mem(emu, ctx, insn.imm, insn.width)?;
    write_reg(regs(ctx), 0, insn.width, v);
    Ok(())
}

pub fn op_mov_moffs_acc(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let v = read_reg(regs(ctx), 0, insn.width);
    write_mem(emu, ctx, insn.imm, insn.width, v)
}

pub fn op_lea(_emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    match insn.rm {
        RmOperand::Mem(addr) => {
            write_reg(regs(ctx), insn.reg, insn.width, addr);
            Ok(())
        }
        _ => Err(ExecError::Fault(Fault::Illegal {
            addr: ctx.current_ip,
            raw: 0x8d,
        })),
    }
}

pub fn op_alu_rm_reg(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let a = read_rm(emu, ctx, insn)?;
    let b = read_reg(regs(ctx), insn.reg, insn.width);
    let (res, store) = alu(regs(ctx), insn.sub, a, b, insn.width);
    if store {
        write_rm(emu, ctx, insn, res)?;
    }
    Ok(())
}

pub fn op_alu_reg_rm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let a = read_reg(regs(ctx), insn.reg, insn.width);
    let b = read_rm(emu, ctx, insn)?;
    let (res, store) = alu(regs(ctx), insn.sub, a, b, insn.width);
    if store {
        write_reg(regs(ctx), insn.reg, insn.width, res);
    }
    Ok(())
}

pub fn op_alu_acc_imm(_emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let a = read_reg(regs(ctx), 0, insn.width);
    let (res, store) = alu(regs(ctx), insn.sub, a, insn.imm, insn.width);
    if store {
        write_reg(regs(ctx), 0, insn.width, res);
    }
    Ok(())
}

pub fn op_alu_rm_imm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let a = read_rm(emu, ctx, insn)?;
    let (res, store) = alu(regs(ctx), insn.sub, a, insn.imm, insn.width);
    if store {
        write_rm(emu, ctx, insn, res)?;
    }
    Ok(())
}

fn inc_dec(r: &mut X86Regs, v: u32, w: Width, inc: bool) -> u32 {
    // inc/dec preserve CF.
    let cf = r.eflags & eflags::CF;
    let res = if inc {
        flags_add(r, v, 1, 0, w)
    } else {
        flags_sub(r, v, 1, 0, w)
    };
    r.eflags = (r.eflags & !eflags::CF) | cf;
    res
}

pub fn op_inc_reg(_emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = read_reg(r, insn.reg, insn.width);
    let res = inc_dec(r, v, insn.width, true);
    write_reg(r, insn.reg, insn.width, res);
    Ok(())
}

pub fn op_dec_reg(_emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let r = regs(ctx);
    let v = read_reg(r, insn.reg, insn.width);
    let res = inc_dec(r, v, insn.width, false);
    write_reg(r, insn.reg, insn.width, res);
    Ok(())
}

pub fn op_inc_rm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let v = read_rm(emu, ctx, insn)?;
    let res = inc_dec(regs(ctx), v, insn.width, true);
    write_rm(emu, ctx, insn, res)
}

pub fn op_dec_rm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let v = read_rm(emu, ctx, insn)?;
    let res = inc_dec(regs(ctx), v, insn.width, false);
    write_rm(emu, ctx, insn, res)
}

pub fn op_push_reg(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let v = read_reg(regs(ctx), insn.reg, Width::W32);
    push(emu, ctx, v)
}

pub fn op_pop_reg(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let v = pop(emu, ctx)?;
    write_reg(regs(ctx), insn.reg, Width::W32, v);
    Ok(())
}

pub fn op_push_imm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    push(emu, ctx, insn.imm)
}

pub fn op_push_rm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let v = read_rm(emu, ctx, insn)?;
    push(emu, ctx, v)
}

pub fn op_pop_rm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let v = pop(emu, ctx)?;
    write_rm(emu, ctx, insn, v)
}

pub fn op_test_rm_reg(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let a = read_rm(emu, ctx, insn)?;
    let b = read_reg(regs(ctx), insn.reg, insn.width);
    flags_logic(regs(ctx), a & b, insn.width);
    Ok(())
}

pub fn op_test_acc_imm(_emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let a = read_reg(regs(ctx), 0, insn.width);
    flags_logic(regs(ctx), a & insn.imm, insn.width);
    Ok(())
}

pub fn op_test_rm_imm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let a = read_rm(emu, ctx, insn)?;
    flags_logic(regs(ctx), a & insn.imm, insn.width);
    Ok(())
}

pub fn op_not_rm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let v = read_rm(emu, ctx, insn)?;
    write_rm(emu, ctx, insn, !v)
}

pub fn op_neg_rm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let v = read_rm(emu, ctx, insn)?;
    let res = flags_sub(regs(ctx), 0, v, 0, insn.width);
    write_rm(emu, ctx, insn, res)
}

pub fn op_mul_rm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let v = read_rm(emu, ctx, insn)?;
    let r = regs(ctx);
    let high = match insn.width {
        Width::W8 => {
            // ax = al * rm8
            let prod = (r.eax & 0xff) * v;
            write_reg(r, 0, Width::W16, prod);
            prod >> 8 != 0
        }
        Width::W16 => {
            // dx:ax = ax * rm16
            let prod = (r.eax & 0xffff) * v;
            write_reg(r, 0, Width::W16, prod);
            write_reg(r, 2, Width::W16, prod >> 16);
            prod >> 16 != 0
        }
        Width::W32 => {
            let prod = u64::from(r.eax) * u64::from(v);
            r.eax = prod as u32;
            r.edx = (prod >> 32) as u32;
            r.edx != 0
        }
    };
    set_flag(r, eflags::CF, high);
    set_flag(r, eflags::OF, high);
    Ok(())
}

pub fn op_imul_rm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let v = read_rm(emu, ctx, insn)?;
    let r = regs(ctx);
    let overflow = match insn.width {
        Width::W8 => {
            let prod = (r.eax as u8 as i8 as i32) * (v as u8 as i8 as i32);
            write_reg(r, 0, Width::W16, prod as u32);
            prod != i32::from(prod as i8)
        }
        Width::W16 => {
            let prod = (r.eax as u16 as i16 as i32) * (v as u16 as i16 as i32);
            write_reg(r, 0, Width::W16, prod as u32);
            write_reg(r, 2, Width::W16, (prod >> 16) as u32);
            prod != i32::from(prod as i16)
        }
        Width::W32 => {
            let prod = (r.eax as i32 as i64) * (v as i32 as i64);
            r.eax = prod as u32;
            r.edx = (prod >> 32) as u32;
            prod != i64::from(prod as i32)
        }
    };
    set_flag(r, eflags::CF, overflow);
    set_flag(r, eflags::OF, overflow);
    Ok(())
}

pub fn op_div_rm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let v = read_rm(emu, ctx, insn)?;
    if v == 0 {
        return Err(ExecError::Fault(Fault::DivideByZero {
            addr: ctx.current_ip,
        }));
    }
    let r = regs(ctx);
    match insn.width {
        Width::W8 => {
            // al = ax / rm8, ah = ax % rm8
            let num = r.eax & 0xffff;
            write_reg(r, 0, Width::W8, num / v);
            write_reg(r, 4, Width::W8, num % v); // ah
        }
        Width::W16 => {
            let num = ((r.edx & 0xffff) << 16) | (r.eax & 0xffff);
            write_reg(r, 0, Width::W16, num / v);
            write_reg(r, 2, Width::W16, num % v);
        }
        Width::W32 => {
            let num = (u64::from(r.edx) << 32) | u64::from(r.eax);
            r.eax = (num / u64::from(v)) as u32;
            r.edx = (num % u64::from(v)) as u32;
        }
    }
    Ok(())
}

pub fn op_idiv_rm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let v = read_rm(emu, ctx, insn)?;
    if v & insn.width.mask() == 0 {
        return Err(ExecError::Fault(Fault::DivideByZero {
            addr: ctx.current_ip,
        }));
    }
    let r = regs(ctx);
    match insn.width {
        Width::W8 => {
            let num = r.eax as u16 as i16 as i32;
            let d = v as u8 as i8 as i32;
            write_reg(r, 0, Width::W8, num.wrapping_div(d) as u32);
            write_reg(r, 4, Width::W8, num.wrapping_rem(d) as u32);
        }
        Width::W16 => {
            let num = ((((r.edx & 0xffff) << 16) | (r.eax & 0xffff)) as i32) as i64;
            let d = i64::from(v as u16 as i16);
            write_reg(r, 0, Width::W16, num.wrapping_div(d) as u32);
            write_reg(r, 2, Width::W16, num.wrapping_rem(d) as u32);
        }
        Width::W32 => {
            let num = (((r.edx as u64) << 32) | u64::from(r.eax)) as i64;
            let d = i64::from(v as i32);
            r.eax = num.wrapping_div(d) as u32;
            r.edx = num.wrapping_rem(d) as u32;
        }
    }
    Ok(())
}

pub fn op_xchg_rm_reg(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let m = read_rm(emu, ctx, insn)?;
    let v = read_reg(regs(ctx), insn.reg, insn.width);
    write_rm(emu, ctx, insn, v)?;
    write_reg(regs(ctx), insn.reg, insn.width, m);
    Ok(())
}

pub fn op_xchg_acc_reg(_emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let r = regs(ctx);
    let a = r.eax;
    let b = reg_raw(r, insn.reg);
    r.eax = b;
    *reg_slot(r, insn.reg) = a;
    Ok(())
}

pub fn op_call_rel(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let next = regs(ctx).eip;
    push(emu, ctx, next)?;
    let target = next.wrapping_add(insn.imm);
    ctx.target_ip = target;
    regs(ctx).eip = target;
    Ok(())
}

pub fn op_call_rm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let target = read_rm(emu, ctx, insn)?;
    let next = regs(ctx).eip;
    push(emu, ctx, next)?;
    ctx.target_ip = target;
    regs(ctx).eip = target;
    Ok(())
}

pub fn op_ret(emu: &mut Emu, ctx: &mut Context, _insn: &Insn) -> Result<(), ExecError> {
    let target = pop(emu, ctx)?;
    ctx.target_ip = target;
    regs(ctx).eip = target;
    Ok(())
}

pub fn op_ret_imm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let target = pop(emu, ctx)?;
    let r = regs(ctx);
    r.esp = r.esp.wrapping_add(insn.imm);
    ctx.target_ip = target;
    regs(ctx).eip = target;
    Ok(())
}

pub fn op_jmp_rel(_emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let target = regs(ctx).eip.wrapping_add(insn.imm);
    ctx.target_ip = target;
    regs(ctx).eip = target;
    Ok(())
}

pub fn op_jmp_rm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let target = read_rm(emu, ctx, insn)?;
    ctx.target_ip = target;
    regs(ctx).eip = target;
    Ok(())
}

pub fn op_jcc(_emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let target = regs(ctx).eip.wrapping_add(insn.imm);
    ctx.target_ip = target;
    if cond(regs(ctx), insn.sub) {
        regs(ctx).eip = target;
    }
    Ok(())
}

pub fn op_setcc(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let v = u32::from(cond(regs(ctx), insn.sub));
    write_rm(emu, ctx, insn, v)
}

pub fn op_cmovcc(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let v = read_rm(emu, ctx, insn)?;
    if cond(regs(ctx), insn.sub) {
        write_reg(regs(ctx), insn.reg, insn.width, v);
    }
    Ok(())
}

fn shift(r: &mut X86Regs, sel: u8, v: u32, count: u32, w: Width) -> Option<u32> {
    let count = count & 0x1f;
    if count == 0 {
        return Some(v);
    }
    let bits = w.bytes() * 8;
    let masked = v & w.mask();
    let res = match sel {
        0 => {
            // rol
            let c = count % bits;
            let out = if c == 0 {
                masked
            } else {
                ((masked << c) | (masked >> (bits - c))) & w.mask()
            };
            set_flag(r, eflags::CF, out & 1 != 0);
            out
        }
        1 => {
            // ror
            let c = count % bits;
            let out = if c == 0 {
                masked
            } else {
                ((masked >> c) | (masked << (bits - c))) & w.mask()
            };
            set_flag(r, eflags::CF, out & w.sign_bit() != 0);
            out
        }
        4 | 6 => {
            // shl/sal
            let out = if count >= bits { 0 } else { (masked << count) & w.mask() };
            let cf = if count <= bits {
                (masked >> (bits - count)) & 1 != 0
            } else {
                false
            };
            set_flag(r, eflags::CF, cf);
            set_szp(r, out, w);
            out
        }
        5 => {
            // shr
            let out = if count >= bits { 0 } else { masked >> count };
            let cf = if count <= bits {
                (masked >> (count - 1)) & 1 != 0
            } else {
                false
            };
            set_flag(r, eflags::CF, cf);
            set_szp(r, out, w);
            out
        }
        7 => {
            // sar
            let sign_ext = if masked & w.sign_bit() != 0 {
                (!0u32) << (bits - 1)
            } else {
                0
            };
            let sv = (masked | sign_ext) as i32;
            let out = if count >= bits {
                (sv >> 31) as u32 & w.mask()
            } else {
                ((sv >> count) as u32) & w.mask()
            };
            set_flag(r, eflags::CF, (sv >> (count.min(bits) - 1)) & 1 != 0);
            set_szp(r, out, w);
            out
        }
        _ => return None,
    };
    Some(res)
}

fn do_shift(emu: &mut Emu, ctx: &mut Context, insn: &Insn, count: u32) -> Result<(), ExecError> {
    let v = read_rm(emu, ctx, insn)?;
    match shift(regs(ctx), insn.sub, v, count, insn.width) {
        Some(res) => write_rm(emu, ctx, insn, res),
        None => Err(ExecError::Fault(Fault::Illegal {
            addr: ctx.current_ip,
            raw: u32::from(insn.sub),
        })),
    }
}

pub fn op_shift_rm_imm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    do_shift(emu, ctx, insn, insn.imm)
}

pub fn op_shift_rm_1(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    do_shift(emu, ctx, insn, 1)
}

pub fn op_shift_rm_cl(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let count = regs(ctx).ecx & 0xff;
    do_shift(emu, ctx, insn, count)
}

fn mov_extend(
    emu: &mut Emu,
    ctx: &mut Context,
    insn: &Insn,
    src_w: Width,
    sign: bool,
) -> Result<(), ExecError> {
    let narrow = Insn {
        width: src_w,
        ..*insn
    };
    let v = read_rm(emu, ctx, &narrow)?;
    let v = if sign {
        match src_w {
            Width::W8 => v as u8 as i8 as i32 as u32,
            Width::W16 => v as u16 as i16 as i32 as u32,
            Width::W32 => v,
        }
    } else {
        v
    };
    write_reg(regs(ctx), insn.reg, Width::W32, v);
    Ok(())
}

pub fn op_movzx_b(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    mov_extend(emu, ctx, insn, Width::W8, false)
}

pub fn op_movzx_w(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    mov_extend(emu, ctx, insn, Width::W16, false)
}

pub fn op_movsx_b(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    mov_extend(emu, ctx, insn, Width::W8, true)
}

pub fn op_movsx_w(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    mov_extend(emu, ctx, insn, Width::W16, true)
}

pub fn op_imul_reg_rm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let a = read_reg(regs(ctx), insn.reg, insn.width) as i32 as i64;
    let b = read_rm(emu, ctx, insn)? as i32 as i64;
    let prod = a * b;
    let fits = prod == (prod as i32 as i64);
    let r = regs(ctx);
    set_flag(r, eflags::CF, !fits);
    set_flag(r, eflags::OF, !fits);
    write_reg(r, insn.reg, insn.width, prod as u32);
    Ok(())
}

pub fn op_imul_reg_rm_imm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let b = read_rm(emu, ctx, insn)? as i32 as i64;
    let prod = (insn.imm as i32 as i64) * b;
    let fits = prod == (prod as i32 as i64);
    let r = regs(ctx);
    set_flag(r, eflags::CF, !fits);
    set_flag(r, eflags::OF, !fits);
    write_reg(r, insn.reg, insn.width, prod as u32);
    Ok(())
}

pub fn op_int_imm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    if insn.imm != 0x80 {
        return Err(ExecError::Fault(Fault::Illegal {
            addr: ctx.current_ip,
            raw: 0xcd00 | insn.imm,
        }));
    }
    crate::syscall::execute(emu, ctx).map_err(ExecError::Fatal)
}

pub fn op_cld(_emu: &mut Emu, ctx: &mut Context, _insn: &Insn) -> Result<(), ExecError> {
    set_flag(regs(ctx), eflags::DF, false);
    Ok(())
}

pub fn op_std(_emu: &mut Emu, ctx: &mut Context, _insn: &Insn) -> Result<(), ExecError> {
    set_flag(regs(ctx), eflags::DF, true);
    Ok(())
}

pub fn op_stos(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let step = insn.width.bytes();
    loop {
        if insn.rep && regs(ctx).ecx == 0 {
            break;
        }
        let di = regs(ctx).edi;
        let v = read_reg(regs(ctx), 0, insn.width);
        write_mem(emu, ctx, di, insn.width, v)?;
        let r = regs(ctx);
        r.edi = if r.eflags & eflags::DF != 0 {
            di.wrapping_sub(step)
        } else {
            di.wrapping_add(step)
        };
        if !insn.rep {
            break;
        }
        r.ecx -= 1;
    }
    Ok(())
}

pub fn op_movs(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let step = insn.width.bytes();
    loop {
        if insn.rep && regs(ctx).ecx == 0 {
            break;
        }
        let (si, di) = {
            let r = regs(ctx);
            (r.esi, r.edi)
        };
        let v = read_mem(emu, ctx, si, insn.width)?;
        write_mem(emu, ctx, di, insn.width, v)?;
        let r = regs(ctx);
        if r.eflags & eflags::DF != 0 {
            r.esi = si.wrapping_sub(step);
            r.edi = di.wrapping_sub(step);
        } else {
            r.esi = si.wrapping_add(step);
            r.edi = di.wrapping_add(step);
        }
        if !insn.rep {
            break;
        }
        r.ecx -= 1;
    }
    Ok(())
}

pub fn op_leave(emu: &mut Emu, ctx: &mut Context, _insn: &Insn) -> Result<(), ExecError> {
    let bp = regs(ctx).ebp;
    regs(ctx).esp = bp;
    let v = pop(emu, ctx)?;
    regs(ctx).ebp = v;
    Ok(())
}

pub fn op_cdq(_emu: &mut Emu, ctx: &mut Context, _insn: &Insn) -> Result<(), ExecError> {
    let r = regs(ctx);
    r.edx = if r.eax & 0x8000_0000 != 0 { u32::MAX } else { 0 };
    Ok(())
}

pub fn op_cwde(_emu: &mut Emu, ctx: &mut Context, _insn: &Insn) -> Result<(), ExecError> {
    let r = regs(ctx);
    r.eax = r.eax as u16 as i16 as i32 as u32;
    Ok(())
}

pub fn op_cmpxchg(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let current = read_rm(emu, ctx, insn)?;
    let acc = read_reg(regs(ctx), 0, insn.width);
    flags_sub(regs(ctx), acc, current, 0, insn.width);
    if acc == current {
        let v = read_reg(regs(ctx), insn.reg, insn.width);
        write_rm(emu, ctx, insn, v)?;
    } else {
        write_reg(regs(ctx), 0, insn.width, current);
    }
    Ok(())
}

pub fn op_xadd(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let m = read_rm(emu, ctx, insn)?;
    let v = read_reg(regs(ctx), insn.reg, insn.width);
    let sum = flags_add(regs(ctx), m, v, 0, insn.width);
    write_rm(emu, ctx, insn, sum)?;
    write_reg(regs(ctx), insn.reg, insn.width, m);
    Ok(())
}

pub fn op_bt_rm(emu: &mut Emu, ctx: &mut Context, insn: &Insn) -> Result<(), ExecError> {
    let bit = read_reg(regs(ctx), insn.reg, insn.width) % (insn.width.bytes() * 8);
    let v = read_rm(emu, ctx, insn)?;
    let r = regs(ctx);
    set_flag(r, eflags::CF, (v >> bit) & 1 != 0);
    Ok(())
}
