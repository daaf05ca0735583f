//! Signal tables and delivery.
//!
//! A fixed 64-entry handler table (shared between contexts cloned with
//! CLONE_SIGHAND) plus per-context pending/blocked sets. Delivery builds a
//! synthetic call frame: the pre-handler register file and blocked mask are
//! saved, a return trampoline address lands in the ABI's return slot, and
//! the handler's mask is OR-ed into the blocked set. The `sigreturn`
//! syscall undoes all of it register-for-register.

use crate::context::regs::{mips_abi, Regs};
use crate::mem::{MemFault, Memory};

/// Guest address of the signal-return trampoline page. The loader maps one
/// page here containing the ISA's `sigreturn` invocation sequence.
pub const TRAMPOLINE_ADDR: u32 = 0xffff_0000;

/// One installed handler.
#[derive(Clone, Copy, Debug, Default)]
pub struct SignalHandler {
    /// Guest address of the handler entry, 0 = default action.
    pub handler: u32,
    pub flags: u32,
    pub restorer: u32,
    /// Signals blocked while the handler runs.
    pub mask: u64,
}

/// The 64-entry handler table. Signal numbers are 1-based.
#[derive(Debug)]
pub struct SignalHandlerTable {
    handlers: [SignalHandler; 64],
}

impl SignalHandlerTable {
    pub fn new() -> Self {
        Self {
            handlers: [SignalHandler::default(); 64],
        }
    }

    pub fn get(&self, sig: i32) -> &SignalHandler {
        &self.handlers[(sig - 1) as usize]
    }

    pub fn set(&mut self, sig: i32, handler: SignalHandler) {
        self.handlers[(sig - 1) as usize] = handler;
    }

    /// Reads a guest `struct sigaction` (i386 rt layout: handler, flags,
    /// restorer, 8-byte mask).
    pub fn read_sigaction(mem: &mut Memory, addr: u32) -> Result<SignalHandler, MemFault> {
        let handler = mem.read_u32(addr)?;
        let flags = mem.read_u32(addr + 4)?;
        let restorer = mem.read_u32(addr + 8)?;
        let lo = mem.read_u32(addr + 12)?;
        let hi = mem.read_u32(addr + 16)?;
        Ok(SignalHandler {
            handler,
            flags,
            restorer,
            mask: (u64::from(hi) << 32) | u64::from(lo),
        })
    }

    /// Writes a handler back as a guest `struct sigaction`.
    pub fn write_sigaction(
        mem: &mut Memory,
        addr: u32,
        handler: &SignalHandler,
    ) -> Result<(), MemFault> {
        mem.write_u32(addr, handler.handler)?;
        mem.write_u32(addr + 4, handler.flags)?;
        mem.write_u32(addr + 8, handler.restorer)?;
        mem.write_u32(addr + 12, handler.mask as u32)?;
        mem.write_u32(addr + 16, (handler.mask >> 32) as u32)
    }
}

impl Default for SignalHandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-context signal state: pending and blocked sets (bit N-1 = signal N)
/// plus the saved frame while a handler runs.
#[derive(Debug, Default)]
pub struct SignalMaskTable {
    pub pending: u64,
    pub blocked: u64,
    /// Saved pre-handler state; present exactly while a handler runs.
    pub frame: Option<SignalFrame>,
}

/// The synthetic frame built at delivery.
#[derive(Debug, Clone)]
pub struct SignalFrame {
    /// Signal being handled.
    pub sig: i32,
    /// Complete pre-handler register file.
    pub regs: Regs,
    /// Blocked set before the handler mask was OR-ed in.
    pub blocked: u64,
}

impl SignalMaskTable {
    /// Lowest pending signal not currently blocked, if any.
    pub fn next_deliverable(&self) -> Option<i32> {
        let ready = self.pending & !self.blocked;
        if ready == 0 {
            None
        } else {
            Some(ready.trailing_zeros() as i32 + 1)
        }
    }

    pub fn set_pending(&mut self, sig: i32) {
        self.pending |= 1u64 << (sig - 1);
    }

    pub fn clear_pending(&mut self, sig: i32) {
        self.pending &= !(1u64 << (sig - 1));
    }
}

/// Redirects `regs` into `handler_entry` for signal `sig`, pushing the
/// trampoline return address and the signal number per the ABI. Returns
/// the frame to stash on the context.
pub fn build_handler_frame(
    regs: &mut Regs,
    mem: &mut Memory,
    sig: i32,
    handler_entry: u32,
    blocked_before: u64,
) -> Result<SignalFrame, MemFault> {
    let frame = SignalFrame {
        sig,
        regs: regs.clone(),
        blocked: blocked_before,
    };
    match regs {
        Regs::Mips(r) => {
            r.write(mips_abi::A0, sig as u32);
            r.write(mips_abi::RA, TRAMPOLINE_ADDR);
            // Handlers may be called through $t9 by PIC code.
            r.write(mips_abi::T9, handler_entry);
            r.pc = handler_entry;
            r.npc = handler_entry.wrapping_add(4);
        }
        Regs::X86(r) => {
            r.esp -= 4;
            mem.write_u32(r.esp, sig as u32)?;
            r.esp -= 4;
            mem.write_u32(r.esp, TRAMPOLINE_ADDR)?;
            r.eip = handler_entry;
        }
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::regs::MipsRegs;
    use crate::mem::perm;

    /// Delivery and restore are inverse operations on the register file.
    #[test]
    fn frame_round_trip() {
        let mut mem = Memory::new();
        mem.map(0x1000, 0x1000, perm::INIT | perm::READ | perm::WRITE);

        let mut mips = MipsRegs::default();
        mips.pc = 0x400100;
        mips.npc = 0x400104;
        mips.write(mips_abi::SP, 0x1800);
        mips.write(mips_abi::A0, 99);
        let mut regs = Regs::Mips(mips);
        let before = regs.clone();

        let frame = build_handler_frame(&mut regs, &mut mem, 10, 0x400800, 0).unwrap();
        assert_eq!(regs.pc(), 0x400800);
        assert_ne!(regs, before);

        // sigreturn restores the saved file.
        let restored = frame.regs.clone();
        assert_eq!(restored, before);
    }

    /// Blocked signals are not deliverable until unblocked.
    #[test]
    fn pending_respects_blocked() {
        let mut t = SignalMaskTable::default();
        t.set_pending(10);
        t.blocked = 1u64 << 9;
        assert_eq!(t.next_deliverable(), None);

        t.blocked = 0;
        assert_eq!(t.next_deliverable(), Some(10));

        t.set_pending(2);
        assert_eq!(t.next_deliverable(), Some(2), "lowest signal first");
    }
}
