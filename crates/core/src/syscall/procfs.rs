//! Synthesised `/proc` files.
//!
//! When the guest opens a path under `/proc/` that the simulator knows how
//! to render, the content is generated from simulator state, written to a
//! host temp file, and served through a descriptor of kind Virtual. The
//! temp file is deleted when the descriptor closes.

use std::io::Write;

use tempfile::NamedTempFile;

use crate::context::Context;

/// `/proc/cpuinfo` template: a fixed single-CPU description.
const CPUINFO: &str = "\
processor\t: 0
vendor_id\t: GenuineIntel
cpu family\t: 6
model\t\t: 23
model name\t: Intel(R) Xeon(R) CPU           E5440  @ 2.83GHz
stepping\t: 10
cpu MHz\t\t: 2833.278
cache size\t: 6144 KB
fpu\t\t: yes
fpu_exception\t: yes
cpuid level\t: 13
wp\t\t: yes
flags\t\t: fpu vme de pse tsc msr pae mce cx8 apic sep mtrr pge mca cmov
bogomips\t: 5666.55
clflush size\t: 64
cache_alignment\t: 64
address sizes\t: 38 bits physical, 48 bits virtual

";

/// Renders a known `/proc` path for `ctx` into a temp file, or None when
/// the path is not synthesised.
pub fn open_virtual(ctx: &mut Context, path: &str) -> Option<NamedTempFile> {
    let content = match path {
        "/proc/self/maps" => ctx.memory.borrow().format_maps(),
        "/proc/cpuinfo" => CPUINFO.to_string(),
        _ => return None,
    };
    let mut file = NamedTempFile::new().ok()?;
    file.write_all(content.as_bytes()).ok()?;
    file.flush().ok()?;
    Some(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emu::Emu;
    use crate::mem::perm;
    use std::io::Read;

    /// /proc/self/maps renders the live mapping table.
    #[test]
    fn maps_content_tracks_memory() {
        let mut emu = Emu::new();
        let mut ctx = emu.bare_context(crate::isa::IsaKind::Mips);
        ctx.memory
            .borrow_mut()
            .map(0x0040_0000, 0x2000, perm::INIT | perm::READ | perm::EXEC);

        let file = open_virtual(&mut ctx, "/proc/self/maps").unwrap();
        let mut content = String::new();
        file.reopen().unwrap().read_to_string(&mut content).unwrap();
        assert!(content.contains("00400000-00402000 r-xp"));
    }

    /// Unknown /proc paths are not synthesised.
    #[test]
    fn unknown_path_is_none() {
        let mut emu = Emu::new();
        let mut ctx = emu.bare_context(crate::isa::IsaKind::Mips);
        assert!(open_virtual(&mut ctx, "/proc/meminfo").is_none());
    }
}
