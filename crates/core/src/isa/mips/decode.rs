//! MIPS32 instruction decoder.
//!
//! Decodes a 32-bit little-endian instruction word into an opcode
//! identifier plus raw fields. The identifier indexes the flat dispatch
//! table in the executor.

/// A fetched instruction word with field accessors.
#[derive(Clone, Copy, Debug)]
pub struct Inst(pub u32);

impl Inst {
    /// Primary opcode field, bits 31..26.
    #[inline]
    pub fn op(self) -> u32 {
        self.0 >> 26
    }
    #[inline]
    pub fn rs(self) -> usize {
        ((self.0 >> 21) & 0x1f) as usize
    }
    #[inline]
    pub fn rt(self) -> usize {
        ((self.0 >> 16) & 0x1f) as usize
    }
    #[inline]
    pub fn rd(self) -> usize {
        ((self.0 >> 11) & 0x1f) as usize
    }
    #[inline]
    pub fn shamt(self) -> u32 {
        (self.0 >> 6) & 0x1f
    }
    #[inline]
    pub fn funct(self) -> u32 {
        self.0 & 0x3f
    }
    /// Zero-extended immediate.
    #[inline]
    pub fn imm(self) -> u32 {
        self.0 & 0xffff
    }
    /// Sign-extended immediate.
    #[inline]
    pub fn simm(self) -> i32 {
        (self.0 & 0xffff) as u16 as i16 as i32
    }
    /// 26-bit jump index.
    #[inline]
    pub fn target(self) -> u32 {
        self.0 & 0x03ff_ffff
    }
}

// Primary opcodes.
const OP_SPECIAL: u32 = 0x00;
const OP_REGIMM: u32 = 0x01;
const OP_SPECIAL2: u32 = 0x1c;
const OP_SPECIAL3: u32 = 0x1f;

macro_rules! define_opcodes {
    ($(($name:ident, $handler:ident)),* $(,)?) => {
        /// Decoded opcode identifiers; `Invalid` is index 0.
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        #[repr(usize)]
        pub enum Opcode {
            Invalid = 0,
            $($name,)*
        }

        /// Number of opcode identifiers (dispatch table size).
        pub const OPCODE_COUNT: usize = {
            let mut n = 1;
            $(let _ = Opcode::$name; n += 1;)*
            n
        };

        /// Flat dispatch table, indexed by `Opcode` discriminant.
        pub static EXEC_TABLE: [super::ExecFn; OPCODE_COUNT] = [
            super::exec::op_invalid,
            $(super::exec::$handler,)*
        ];
    };
}

define_opcodes! {
    (Sll, op_sll),
    (Srl, op_srl),
    (Sra, op_sra),
    (Sllv, op_sllv),
    (Srlv, op_srlv),
    (Srav, op_srav),
    (Jr, op_jr),
    (Jalr, op_jalr),
    (Movz, op_movz),
    (Movn, op_movn),
    (Syscall, op_syscall),
    (Break, op_break),
    (Sync, op_sync),
    (Mfhi, op_mfhi),
    (Mthi, op_mthi),
    (Mflo, op_mflo),
    (Mtlo, op_mtlo),
    (Mult, op_mult),
    (Multu, op_multu),
    (Div, op_div),
    (Divu, op_divu),
    (Add, op_add),
    (Addu, op_addu),
    (Sub, op_sub),
    (Subu, op_subu),
    (And, op_and),
    (Or, op_or),
    (Xor, op_xor),
    (Nor, op_nor),
    (Slt, op_slt),
    (Sltu, op_sltu),
    (Teq, op_teq),
    (Bltz, op_bltz),
    (Bgez, op_bgez),
    (Bltzal, op_bltzal),
    (Bgezal, op_bgezal),
    (J, op_j),
    (Jal, op_jal),
    (Beq, op_beq),
    (Bne, op_bne),
    (Blez, op_blez),
    (Bgtz, op_bgtz),
    (Addi, op_addi),
    (Addiu, op_addiu),
    (Slti, op_slti),
    (Sltiu, op_sltiu),
    (Andi, op_andi),
    (Ori, op_ori),
    (Xori, op_xori),
    (Lui, op_lui),
    (Mul, op_mul),
    (Madd, op_madd),
    (Maddu, op_maddu),
    (Msub, op_msub),
    (Msubu, op_msubu),
    (Clz, op_clz),
    (Clo, op_clo),
    (Ext, op_ext),
    (Ins, op_ins),
    (Seb, op_seb),
    (Seh, op_seh),
    (Wsbh, op_wsbh),
    (Rdhwr, op_rdhwr),
    (Lb, op_lb),
    (Lh, op_lh),
    (Lwl, op_lwl),
    (Lw, op_lw),
    (Lbu, op_lbu),
    (Lhu, op_lhu),
    (Lwr, op_lwr),
    (Sb, op_sb),
    (Sh, op_sh),
    (Swl, op_swl),
    (Sw, op_sw),
    (Swr, op_swr),
    (Ll, op_ll),
    (Sc, op_sc),
    (Pref, op_pref),
    (CacheOp, op_cache),
}

/// Decodes an instruction word. Unknown encodings map to `Invalid`, which
/// dispatches to the illegal-instruction routine.
pub fn decode(raw: u32) -> Opcode {
    let inst = Inst(raw);
    match inst.op() {
        OP_SPECIAL => match inst.funct() {
            0x00 => Opcode::Sll,
            0x02 => Opcode::Srl,
            0x03 => Opcode::Sra,
            0x04 => Opcode::Sllv,
            0x06 => Opcode::Srlv,
            0x07 => Opcode::Srav,
            0x08 => Opcode::Jr,
            0x09 => Opcode::Jalr,
            0x0a => Opcode::Movz,
            0x0b => Opcode::Movn,
            0x0c => Opcode::Syscall,
            0x0d => Opcode::Break,
            0x0f => Opcode::Sync,
            0x10 => Opcode::Mfhi,
            0x11 => Opcode::Mthi,
            0x12 => Opcode::Mflo,
            0x13 => Opcode::Mtlo,
            0x18 => Opcode::Mult,
            0x19 => Opcode::Multu,
            0x1a => Opcode::Div,
            0x1b => Opcode::Divu,
            0x20 => Opcode::Add,
            0x21 => Opcode::Addu,
            0x22 => Opcode::Sub,
            0x23 => Opcode::Subu,
            0x24 => Opcode::And,
            0x25 => Opcode::Or,
            0x26 => Opcode::Xor,
            0x27 => Opcode::Nor,
            0x2a => Opcode::Slt,
            0x2b => Opcode::Sltu,
            0x34 => Opcode::Teq,
            _ => Opcode::Invalid,
        },
        OP_REGIMM => match inst.rt() {
            0x00 => Opcode::Bltz,
            0x01 => Opcode::Bgez,
            0x10 => Opcode::Bltzal,
            0x11 => Opcode::Bgezal,
            _ => Opcode::Invalid,
        },
        0x02 => Opcode::J,
        0x03 => Opcode::Jal,
        0x04 => Opcode::Beq,
        0x05 => Opcode::Bne,
        0x06 => Opcode::Blez,
        0x07 => Opcode::Bgtz,
        0x08 => Opcode::Addi,
        0x09 => Opcode::Addiu,
        0x0a => Opcode::Slti,
        0x0b => Opcode::Sltiu,
        0x0c => Opcode::Andi,
        0x0d => Opcode::Ori,
        0x0e => Opcode::Xori,
        0x0f => Opcode::Lui,
        OP_SPECIAL2 => match inst.funct() {
            0x00 => Opcode::Madd,
            0x01 => Opcode::Maddu,
            0x02 => Opcode::Mul,
            0x04 => Opcode::Msub,
            0x05 => Opcode::Msubu,
            0x20 => Opcode::Clz,
            0x21 => Opcode::Clo,
            _ => Opcode::Invalid,
        },
        OP_SPECIAL3 => match inst.funct() {
            0x00 => Opcode::Ext,
            0x04 => Opcode::Ins,
            0x20 => match inst.shamt() {
                0x02 => Opcode::Wsbh,
                0x10 => Opcode::Seb,
                0x18 => Opcode::Seh,
                _ => Opcode::Invalid,
            },
            0x3b => Opcode::Rdhwr,
            _ => Opcode::Invalid,
        },
        0x20 => Opcode::Lb,
        0x21 => Opcode::Lh,
        0x22 => Opcode::Lwl,
        0x23 => Opcode::Lw,
        0x24 => Opcode::Lbu,
        0x25 => Opcode::Lhu,
        0x26 => Opcode::Lwr,
        0x28 => Opcode::Sb,
        0x29 => Opcode::Sh,
        0x2a => Opcode::Swl,
        0x2b => Opcode::Sw,
        0x2e => Opcode::Swr,
        0x2f => Opcode::CacheOp,
        0x30 => Opcode::Ll,
        0x33 => Opcode::Pref,
        0x38 => Opcode::Sc,
        _ => Opcode::Invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Spot checks of well-known encodings.
    #[test]
    fn decode_spot_checks() {
        // addiu $v0, $zero, 4 -> 0x24020004
        assert_eq!(decode(0x2402_0004), Opcode::Addiu);
        // syscall -> 0x0000000c
        assert_eq!(decode(0x0000_000c), Opcode::Syscall);
        // nop == sll $0,$0,0
        assert_eq!(decode(0x0000_0000), Opcode::Sll);
        // jr $ra -> 0x03e00008
        assert_eq!(decode(0x03e0_0008), Opcode::Jr);
        // lw $a0, 8($sp) -> 0x8fa40008
        assert_eq!(decode(0x8fa4_0008), Opcode::Lw);
        // sw $ra, 4($sp) -> 0xafbf0004
        assert_eq!(decode(0xafbf_0004), Opcode::Sw);
        // lui $gp, 0x1 -> 0x3c1c0001
        assert_eq!(decode(0x3c1c_0001), Opcode::Lui);
        // rdhwr $v1, $29 -> 0x7c03e83b
        assert_eq!(decode(0x7c03_e83b), Opcode::Rdhwr);
    }

    /// The dispatch table covers every opcode discriminant.
    #[test]
    fn table_matches_enum() {
        assert_eq!(EXEC_TABLE.len(), OPCODE_COUNT);
    }

    /// Field extraction.
    #[test]
    fn inst_fields() {
        // addiu $v0, $zero, -4
        let i = Inst(0x2402_fffc);
        assert_eq!(i.op(), 0x09);
        assert_eq!(i.rs(), 0);
        assert_eq!(i.rt(), 2);
        assert_eq!(i.simm(), -4);
        assert_eq!(i.imm(), 0xfffc);
    }
}
