//! Instruction-set executors.
//!
//! One submodule per guest ISA, each with a decoder and a flat dispatch
//! table mapping decoded opcodes to execution routines. Routines read
//! operands from registers and memory, compute, write back, and advance
//! the PC; branches record a target PC even when not taken. Memory writes
//! in speculative mode are routed into the context's speculative mirror.

pub mod mips;
pub mod x86;

use crate::common::SimError;
use crate::context::{state, Context};
use crate::emu::Emu;
use crate::mem::MemFault;

/// Guest instruction-set architectures.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IsaKind {
    #[default]
    Mips,
    X86,
}

/// A guest-visible execution fault. Becomes a guest signal when a handler
/// is installed, a fatal error otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Bad memory access (unmapped or permission).
    Mem(MemFault),
    /// Undecodable or unimplemented instruction.
    Illegal { addr: u32, raw: u32 },
    /// Integer division by zero.
    DivideByZero { addr: u32 },
}

/// Executor-internal error: a guest fault or a fatal simulator error.
#[derive(Debug)]
pub enum ExecError {
    Fault(Fault),
    Fatal(SimError),
}

impl From<MemFault> for ExecError {
    fn from(f: MemFault) -> Self {
        ExecError::Fault(Fault::Mem(f))
    }
}

impl From<SimError> for ExecError {
    fn from(e: SimError) -> Self {
        ExecError::Fatal(e)
    }
}

/// Signal number a fault maps to.
fn fault_signal(fault: Fault) -> i32 {
    match fault {
        Fault::Mem(_) => 11,          // SIGSEGV
        Fault::Illegal { .. } => 4,   // SIGILL
        Fault::DivideByZero { .. } => 8, // SIGFPE
    }
}

/// Emulates one instruction of `ctx`. Faults post a guest signal when the
/// guest installed a handler for them; in speculative mode they trigger
/// recovery instead; otherwise they are fatal.
pub fn execute(emu: &mut Emu, ctx: &mut Context) -> Result<(), SimError> {
    let result = match ctx.isa() {
        IsaKind::Mips => mips::execute_one(emu, ctx),
        IsaKind::X86 => x86::execute_one(emu, ctx),
    };

    match result {
        Ok(()) => Ok(()),
        Err(ExecError::Fatal(e)) => Err(e),
        Err(ExecError::Fault(fault)) => {
            if ctx.has_state(state::SPEC_MODE) {
                // Wrong-path fault: discard the mirror and restore the
                // snapshot taken at speculation entry.
                ctx.spec_mem.clear();
                if let Some(saved) = ctx.backup_regs.take() {
                    ctx.regs = saved;
                }
                ctx.clear_state(state::SPEC_MODE);
                return Ok(());
            }

            let sig = fault_signal(fault);
            let installed = ctx.signal_handlers.borrow().get(sig).handler != 0;
            if installed {
                log::debug!(
                    "pid {}: fault {:?} at {:#x}, posting signal {}",
                    ctx.pid,
                    fault,
                    ctx.current_ip,
                    sig
                );
                ctx.signal_mask.set_pending(sig);
                return Ok(());
            }
            match fault {
                Fault::Mem(f) => Err(SimError::MemoryFault {
                    addr: f.addr,
                    write: f.write,
                }),
                Fault::Illegal { addr, raw } => Err(SimError::IllegalInstruction { addr, raw }),
                Fault::DivideByZero { addr } => Err(SimError::IllegalInstruction {
                    addr,
                    raw: 0,
                }),
            }
        }
    }
}

/// Reads guest memory for an executing instruction, honoring speculative
/// mode and routing the access through the timing model when one is
/// attached.
pub fn data_read(
    emu: &mut Emu,
    ctx: &mut Context,
    addr: u32,
    buf: &mut [u8],
) -> Result<(), ExecError> {
    ctx.effective_addr = addr;
    emu.timing_access(ctx.pid, addr, false)?;
    if ctx.has_state(state::SPEC_MODE) {
        ctx.spec_mem.read(addr, buf);
        return Ok(());
    }
    ctx.memory.borrow_mut().read(addr, buf)?;
    Ok(())
}

/// Writes guest memory for an executing instruction; speculative writes
/// land in the mirror only.
pub fn data_write(
    emu: &mut Emu,
    ctx: &mut Context,
    addr: u32,
    buf: &[u8],
) -> Result<(), ExecError> {
    ctx.effective_addr = addr;
    emu.timing_access(ctx.pid, addr, true)?;
    if ctx.has_state(state::SPEC_MODE) {
        ctx.spec_mem.write(addr, buf);
        return Ok(());
    }
    ctx.memory.borrow_mut().write(addr, buf)?;
    Ok(())
}
