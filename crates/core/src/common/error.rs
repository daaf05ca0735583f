//! Fatal simulator errors.
//!
//! Guest-visible failures travel back to guest code as negative errno values
//! in the ABI return register and never appear here. `SimError` covers the
//! conditions that abort the whole run: unimplemented or unsupported guest
//! requests, exhausted guest address space, malformed binaries, and
//! violated coherence invariants.

use std::fmt;
use std::io;

/// A fatal condition that terminates the simulation with a diagnostic.
#[derive(Debug)]
pub enum SimError {
    /// A guest system call with no handler. Unimplemented syscalls must
    /// fail noisily; returning a fake success would corrupt guest state.
    UnimplementedSyscall {
        /// ABI syscall number as the guest issued it.
        code: u32,
        /// Best-effort name for the diagnostic.
        name: &'static str,
    },

    /// A syscall was reached but invoked with flags or arguments outside
    /// the supported envelope. The payload names the syscall and the flag.
    UnsupportedFeature(String),

    /// No free region of guest address space satisfied an allocation.
    OutOfGuestMemory {
        /// Requested size in bytes.
        size: u32,
    },

    /// A guest memory access violated page permissions or touched an
    /// unmapped page, and no guest signal handler was installed for it.
    MemoryFault {
        /// Faulting guest virtual address.
        addr: u32,
        /// True for a store, false for a load/fetch.
        write: bool,
    },

    /// The ELF image could not be parsed or is not a supported 32-bit
    /// little-endian executable for the selected ISA.
    BadBinary(String),

    /// An instruction encoding the executor cannot decode or execute.
    IllegalInstruction {
        /// Address of the instruction.
        addr: u32,
        /// Raw bits as fetched (first word for variable-length ISAs).
        raw: u32,
    },

    /// A coherence-protocol invariant did not hold. Always a simulator
    /// bug, never a guest bug.
    CoherenceInconsistency(String),

    /// Host-side I/O failure outside a guest syscall (e.g. reading the
    /// guest executable itself).
    Host(io::Error),
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::UnimplementedSyscall { code, name } => {
                write!(f, "unimplemented system call '{}' (code {})", name, code)
            }
            SimError::UnsupportedFeature(what) => {
                write!(f, "unsupported: {}", what)
            }
            SimError::OutOfGuestMemory { size } => {
                write!(f, "out of guest memory (requested {:#x} bytes)", size)
            }
            SimError::MemoryFault { addr, write } => {
                write!(
                    f,
                    "guest memory fault: {} at {:#010x}",
                    if *write { "write" } else { "read" },
                    addr
                )
            }
            SimError::BadBinary(why) => write!(f, "bad executable: {}", why),
            SimError::IllegalInstruction { addr, raw } => {
                write!(f, "illegal instruction {:#010x} at {:#010x}", raw, addr)
            }
            SimError::CoherenceInconsistency(why) => {
                write!(f, "coherence invariant violated: {}", why)
            }
            SimError::Host(err) => write!(f, "host i/o error: {}", err),
        }
    }
}

impl std::error::Error for SimError {}

impl From<io::Error> for SimError {
    fn from(err: io::Error) -> Self {
        SimError::Host(err)
    }
}
