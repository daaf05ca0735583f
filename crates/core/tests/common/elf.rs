//! Minimal guest ELF synthesis.
//!
//! Builds 32-bit little-endian ET_EXEC images with a single RWX PT_LOAD
//! segment: code at the segment base, optional data one page in, and
//! trailing zero-initialised space. Enough for the loader under test;
//! no section headers are emitted.

use std::io::Write;

use tempfile::NamedTempFile;

/// Segment base for synthesized MIPS programs.
pub const MIPS_BASE: u32 = 0x0040_0000;
/// Data area inside a MIPS program (one page past the code).
pub const MIPS_DATA: u32 = MIPS_BASE + 0x1000;

/// Segment base for synthesized x86 programs.
pub const X86_BASE: u32 = 0x0804_8000;
/// Data area inside an x86 program.
pub const X86_DATA: u32 = X86_BASE + 0x1000;

const EM_MIPS: u16 = 8;
const EM_386: u16 = 3;

/// A synthesized guest executable on disk. The file is deleted when this
/// drops, so keep it alive for the duration of the run.
pub struct GuestProgram {
    file: NamedTempFile,
}

impl GuestProgram {
    /// Host path of the executable.
    pub fn path(&self) -> String {
        self.file.path().display().to_string()
    }
}

fn build(machine: u16, base: u32, code: &[u8], data: &[u8], bss: u32) -> GuestProgram {
    // Layout: [ehdr 52][phdr 32][pad to 0x1000][code][pad to 0x2000][data]
    let code_off = 0x1000usize;
    let data_off = 0x2000usize;
    let filesz = if data.is_empty() {
        code.len() as u32
    } else {
        (data_off - code_off) as u32 + data.len() as u32
    };
    let memsz = filesz + bss + 0x1000;

    let mut image = Vec::new();

    // ELF header.
    image.extend_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]);
    image.extend_from_slice(&[0; 8]);
    image.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    image.extend_from_slice(&machine.to_le_bytes());
    image.extend_from_slice(&1u32.to_le_bytes()); // EV_CURRENT
    image.extend_from_slice(&base.to_le_bytes()); // e_entry
    image.extend_from_slice(&52u32.to_le_bytes()); // e_phoff
    image.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
    image.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    image.extend_from_slice(&52u16.to_le_bytes()); // e_ehsize
    image.extend_from_slice(&32u16.to_le_bytes()); // e_phentsize
    image.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    image.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

    // Program header: one RWX PT_LOAD.
    image.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    image.extend_from_slice(&(code_off as u32).to_le_bytes()); // p_offset
    image.extend_from_slice(&base.to_le_bytes()); // p_vaddr
    image.extend_from_slice(&base.to_le_bytes()); // p_paddr
    image.extend_from_slice(&filesz.to_le_bytes());
    image.extend_from_slice(&memsz.to_le_bytes());
    image.extend_from_slice(&7u32.to_le_bytes()); // PF_R|PF_W|PF_X
    image.extend_from_slice(&0x1000u32.to_le_bytes()); // p_align

    image.resize(code_off, 0);
    image.extend_from_slice(code);
    if !data.is_empty() {
        image.resize(data_off, 0);
        image.extend_from_slice(data);
    }

    let mut file = NamedTempFile::new().expect("temp file for guest program");
    file.write_all(&image).expect("write guest program");
    file.flush().expect("flush guest program");
    GuestProgram { file }
}

/// Synthesizes a MIPS executable from instruction words plus a data blob
/// at `MIPS_DATA`.
pub fn mips_program(words: &[u32], data: &[u8]) -> GuestProgram {
    let code: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    build(EM_MIPS, MIPS_BASE, &code, data, 0x4000)
}

/// Synthesizes an x86 executable from raw code bytes plus a data blob at
/// `X86_DATA`.
pub fn x86_program(code: &[u8], data: &[u8]) -> GuestProgram {
    build(EM_386, X86_BASE, code, data, 0x4000)
}
