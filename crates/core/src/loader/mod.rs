//! Program loader.
//!
//! Loads a 32-bit little-endian ELF executable into a fresh memory image,
//! pulls in the dynamic interpreter named by PT_INTERP when present, and
//! builds the initial stack: argc, argv and envp pointer arrays, the
//! auxiliary vector, the argument/environment strings, and sixteen random
//! bytes for AT_RANDOM. Loader metadata is shared by every context cloned
//! from the same program image.

use std::fs;

use goblin::elf::program_header::{PT_GNU_STACK, PT_INTERP, PT_LOAD, PT_NOTE, PT_PHDR};
use goblin::elf::Elf;

use crate::common::{round_up, SimError, PAGE_SIZE};
use crate::isa::IsaKind;
use crate::mem::{perm, Memory};

/// Base address where an ET_DYN interpreter is placed.
const INTERP_BASE: u32 = 0x4000_0000;
/// Top of the initial stack.
const STACK_TOP: u32 = 0xc000_0000;
/// Initial stack size (8 MiB).
const STACK_SIZE: u32 = 0x0080_0000;

/// AT_RANDOM content. Fixed so runs are reproducible.
const RANDOM_BYTES: [u8; 16] = [
    0x5b, 0x1f, 0x8e, 0x09, 0xd3, 0x6a, 0xc4, 0x77, 0x21, 0xee, 0x40, 0x9c, 0x02, 0xb8, 0x65, 0xfa,
];

// Auxiliary vector types.
const AT_NULL: u32 = 0;
const AT_PHDR: u32 = 3;
const AT_PHENT: u32 = 4;
const AT_PHNUM: u32 = 5;
const AT_PAGESZ: u32 = 6;
const AT_BASE: u32 = 7;
const AT_ENTRY: u32 = 9;
const AT_UID: u32 = 11;
const AT_EUID: u32 = 12;
const AT_GID: u32 = 13;
const AT_EGID: u32 = 14;
const AT_RANDOM: u32 = 25;

/// Loader metadata for one program image, shared by all contexts spawned
/// from it.
#[derive(Debug, Default)]
pub struct Loader {
    /// Executable path.
    pub exe: String,
    /// Command-line arguments, argv[0] included.
    pub args: Vec<String>,
    /// Environment strings (`NAME=value`).
    pub env: Vec<String>,
    /// Current working directory for relative guest paths.
    pub cwd: String,
    /// Redirected standard input file, if any.
    pub stdin_path: Option<String>,
    /// Redirected standard output/error file, if any.
    pub stdout_path: Option<String>,
    /// Dynamic interpreter path from PT_INTERP.
    pub interp: Option<String>,
    /// Stack geometry.
    pub stack_base: u32,
    pub stack_top: u32,
    pub stack_size: u32,
    /// Address of envp[0] in the initial stack.
    pub environ_base: u32,
    /// Lowest initialised address of the image.
    pub bottom: u32,
    /// Entry points.
    pub prog_entry: u32,
    pub interp_entry: u32,
    /// Program header table as seen by the guest.
    pub phdt_base: u32,
    pub phdr_count: u32,
    /// Guest address of the AT_RANDOM bytes.
    pub at_random_addr: u32,
    /// Guest ISA detected from the ELF header.
    pub isa: IsaKind,
}

/// Result of loading: where execution and the stack pointer start.
#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    /// Initial program counter (interpreter entry when present).
    pub entry: u32,
    /// Initial stack pointer, pointing at argc.
    pub sp: u32,
}

fn perms_of(p_flags: u32) -> u32 {
    let mut perms = perm::INIT;
    if p_flags & goblin::elf::program_header::PF_R != 0 {
        perms |= perm::READ;
    }
    if p_flags & goblin::elf::program_header::PF_W != 0 {
        perms |= perm::WRITE;
    }
    if p_flags & goblin::elf::program_header::PF_X != 0 {
        perms |= perm::EXEC;
    }
    perms
}

fn isa_of(machine: u16) -> Result<IsaKind, SimError> {
    match machine {
        goblin::elf::header::EM_MIPS => Ok(IsaKind::Mips),
        goblin::elf::header::EM_386 => Ok(IsaKind::X86),
        other => Err(SimError::BadBinary(format!(
            "unsupported machine type {}",
            other
        ))),
    }
}

/// Maps one ELF's PT_LOAD segments at `bias` and returns the highest
/// mapped address.
fn load_segments(
    mem: &mut Memory,
    elf: &Elf,
    bytes: &[u8],
    bias: u32,
    loader: &mut Loader,
    main_image: bool,
) -> Result<u32, SimError> {
    let mut top = 0u32;
    for ph in &elf.program_headers {
        match ph.p_type {
            PT_LOAD => {
                let vaddr = bias.wrapping_add(ph.p_vaddr as u32);
                let memsz = ph.p_memsz as u32;
                let filesz = ph.p_filesz as u32;
                if memsz == 0 {
                    continue;
                }
                mem.map(vaddr, memsz, perms_of(ph.p_flags));
                let off = ph.p_offset as usize;
                let data = bytes
                    .get(off..off + filesz as usize)
                    .ok_or_else(|| SimError::BadBinary("segment beyond file".into()))?;
                mem.write_init(vaddr, data)
                    .map_err(|_| SimError::BadBinary("segment write failed".into()))?;

                if main_image {
                    if loader.bottom == 0 || vaddr < loader.bottom {
                        loader.bottom = vaddr;
                    }
                }
                top = top.max(vaddr.wrapping_add(memsz));
            }
            PT_PHDR if main_image => {
                loader.phdt_base = ph.p_vaddr as u32;
            }
            PT_INTERP if main_image => {
                let off = ph.p_offset as usize;
                let len = ph.p_filesz as usize;
                let raw = bytes
                    .get(off..off + len)
                    .ok_or_else(|| SimError::BadBinary("PT_INTERP beyond file".into()))?;
                let path = raw.split(|&b| b == 0).next().unwrap_or(raw);
                loader.interp = Some(String::from_utf8_lossy(path).into_owned());
            }
            // Honored by ignoring: notes carry no runtime obligation and
            // the stack is always mapped non-executable here.
            PT_NOTE | PT_GNU_STACK => {}
            _ => {}
        }
    }
    Ok(top)
}

fn check_header(elf: &Elf, what: &str) -> Result<(), SimError> {
    if elf.is_64 {
        return Err(SimError::BadBinary(format!("{} is 64-bit", what)));
    }
    if !elf.little_endian {
        return Err(SimError::BadBinary(format!("{} is big-endian", what)));
    }
    Ok(())
}

/// Builds the initial stack image below `stack_top` and returns the final
/// stack pointer (pointing at argc).
fn build_stack(mem: &mut Memory, loader: &mut Loader) -> Result<u32, SimError> {
    let fault = |_| SimError::BadBinary("stack image write failed".into());

    let mut sp = loader.stack_top;

    // Random bytes first, at the very top.
    sp -= RANDOM_BYTES.len() as u32;
    loader.at_random_addr = sp;
    mem.write_init(sp, &RANDOM_BYTES).map_err(fault)?;

    // Argument and environment strings.
    let mut arg_ptrs = Vec::with_capacity(loader.args.len());
    for arg in &loader.args {
        sp -= arg.len() as u32 + 1;
        mem.write_init(sp, arg.as_bytes()).map_err(fault)?;
        mem.write_init(sp + arg.len() as u32, &[0]).map_err(fault)?;
        arg_ptrs.push(sp);
    }
    let mut env_ptrs = Vec::with_capacity(loader.env.len());
    for var in &loader.env {
        sp -= var.len() as u32 + 1;
        mem.write_init(sp, var.as_bytes()).map_err(fault)?;
        mem.write_init(sp + var.len() as u32, &[0]).map_err(fault)?;
        env_ptrs.push(sp);
    }
    sp &= !3;

    let auxv: Vec<(u32, u32)> = vec![
        (AT_PHDR, loader.phdt_base),
        (AT_PHENT, 32),
        (AT_PHNUM, loader.phdr_count),
        (AT_PAGESZ, PAGE_SIZE),
        (
            AT_BASE,
            if loader.interp.is_some() { INTERP_BASE } else { 0 },
        ),
        (AT_ENTRY, loader.prog_entry),
        (AT_UID, 1000),
        (AT_EUID, 1000),
        (AT_GID, 1000),
        (AT_EGID, 1000),
        (AT_RANDOM, loader.at_random_addr),
        (AT_NULL, 0),
    ];

    // Pointer block: argc, argv[], NULL, envp[], NULL, auxv.
    let words = 1 + arg_ptrs.len() + 1 + env_ptrs.len() + 1 + auxv.len() * 2;
    sp -= (words * 4) as u32;
    sp &= !15; // entry alignment

    let mut cur = sp;
    let put = |mem: &mut Memory, cur: &mut u32, value: u32| -> Result<(), SimError> {
        mem.write_init(*cur, &value.to_le_bytes()).map_err(fault)?;
        *cur += 4;
        Ok(())
    };

    put(mem, &mut cur, loader.args.len() as u32)?;
    for &p in &arg_ptrs {
        put(mem, &mut cur, p)?;
    }
    put(mem, &mut cur, 0)?;
    loader.environ_base = cur;
    for &p in &env_ptrs {
        put(mem, &mut cur, p)?;
    }
    put(mem, &mut cur, 0)?;
    for &(key, value) in &auxv {
        put(mem, &mut cur, key)?;
        put(mem, &mut cur, value)?;
    }

    Ok(sp)
}

/// Loads the program named in `loader.exe` into `mem` and prepares the
/// initial stack. Fills in loader metadata and returns the entry state.
pub fn load_program(mem: &mut Memory, loader: &mut Loader) -> Result<LoadedImage, SimError> {
    let bytes = fs::read(&loader.exe)?;
    let elf = Elf::parse(&bytes).map_err(|e| SimError::BadBinary(e.to_string()))?;
    check_header(&elf, "executable")?;
    loader.isa = isa_of(elf.header.e_machine)?;
    loader.prog_entry = elf.header.e_entry as u32;
    loader.phdr_count = elf.header.e_phnum as u32;

    let top = load_segments(mem, &elf, &bytes, 0, loader, true)?;
    if loader.phdt_base == 0 {
        // No PT_PHDR: the table sits inside the first loaded segment.
        loader.phdt_base = loader.bottom.wrapping_add(elf.header.e_phoff as u32);
    }
    mem.set_heap_break(round_up(top, PAGE_SIZE));

    // Dynamic interpreter.
    let mut entry = loader.prog_entry;
    if let Some(interp_path) = loader.interp.clone() {
        let ibytes = fs::read(&interp_path)?;
        let ielf = Elf::parse(&ibytes).map_err(|e| SimError::BadBinary(e.to_string()))?;
        check_header(&ielf, "interpreter")?;
        let bias = if ielf.header.e_type == goblin::elf::header::ET_DYN {
            INTERP_BASE
        } else {
            0
        };
        load_segments(mem, &ielf, &ibytes, bias, loader, false)?;
        loader.interp_entry = bias.wrapping_add(ielf.header.e_entry as u32);
        entry = loader.interp_entry;
        log::debug!(
            "interpreter '{}' loaded, entry {:#x}",
            interp_path,
            loader.interp_entry
        );
    }

    // Stack.
    loader.stack_top = STACK_TOP;
    loader.stack_size = STACK_SIZE;
    loader.stack_base = STACK_TOP - STACK_SIZE;
    mem.map(
        loader.stack_base,
        loader.stack_size,
        perm::INIT | perm::READ | perm::WRITE,
    );
    let sp = build_stack(mem, loader)?;

    log::debug!(
        "loaded '{}': entry={:#x} sp={:#x} brk={:#x} phdt={:#x}",
        loader.exe,
        entry,
        sp,
        mem.heap_break(),
        loader.phdt_base
    );
    Ok(LoadedImage { entry, sp })
}
