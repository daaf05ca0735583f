//! Guest structure marshalling.
//!
//! The guest ABI is i386-flavoured: packed `stat64`, 65-byte `utsname`
//! fields, 32-bit `rlimit`, the `user_desc` TLS descriptor, and the
//! two-word `timespec`/`timeval`. Layouts are written out field by field;
//! host struct layout never leaks into the guest image.

use crate::mem::{MemFault, Memory};

/// Serialised size of the guest `struct stat64`.
pub const STAT64_SIZE: usize = 96;

/// Writes a host `stat` into guest `struct stat64` layout at `addr`.
pub fn write_stat64(mem: &mut Memory, addr: u32, st: &libc::stat) -> Result<(), MemFault> {
    let mut buf = [0u8; STAT64_SIZE];
    let put32 = |off: usize, v: u32, buf: &mut [u8; STAT64_SIZE]| {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    };
    let put64 = |off: usize, v: u64, buf: &mut [u8; STAT64_SIZE]| {
        buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
    };

    put64(0, st.st_dev, &mut buf);
    put32(12, st.st_ino as u32, &mut buf);
    put32(16, st.st_mode, &mut buf);
    put32(20, st.st_nlink as u32, &mut buf);
    put32(24, st.st_uid, &mut buf);
    put32(28, st.st_gid, &mut buf);
    put64(32, st.st_rdev, &mut buf);
    // st_size is 8-byte but 4-byte aligned in the packed i386 layout.
    put32(44, st.st_size as u32, &mut buf);
    put32(48, (st.st_size as u64 >> 32) as u32, &mut buf);
    put32(52, st.st_blksize as u32, &mut buf);
    put64(56, st.st_blocks as u64, &mut buf);
    put32(64, st.st_atime as u32, &mut buf);
    put32(68, st.st_atime_nsec as u32, &mut buf);
    put32(72, st.st_mtime as u32, &mut buf);
    put32(76, st.st_mtime_nsec as u32, &mut buf);
    put32(80, st.st_ctime as u32, &mut buf);
    put32(84, st.st_ctime_nsec as u32, &mut buf);
    put64(88, st.st_ino, &mut buf);

    mem.write(addr, &buf)
}

/// Guest `struct utsname`: six 65-byte NUL-padded fields.
pub fn write_utsname(mem: &mut Memory, addr: u32, machine: &str) -> Result<(), MemFault> {
    const FIELD: usize = 65;
    let fields = [
        "Linux",
        "mcsim",
        "3.1.9-1.fc16.i686",
        "#1 Fri Jan 13 16:37:42 UTC 2012",
        machine,
        "",
    ];
    let mut buf = vec![0u8; FIELD * fields.len()];
    for (i, f) in fields.iter().enumerate() {
        let bytes = f.as_bytes();
        let n = bytes.len().min(FIELD - 1);
        buf[i * FIELD..i * FIELD + n].copy_from_slice(&bytes[..n]);
    }
    mem.write(addr, &buf)
}

/// Guest `struct rlimit`: two 32-bit words.
pub fn write_rlimit(mem: &mut Memory, addr: u32, cur: u32, max: u32) -> Result<(), MemFault> {
    mem.write_u32(addr, cur)?;
    mem.write_u32(addr + 4, max)
}

/// Guest `struct user_desc` for set_thread_area / CLONE_SETTLS.
#[derive(Clone, Copy, Debug)]
pub struct UserDesc {
    pub entry_number: u32,
    pub base_addr: u32,
    pub limit: u32,
    pub seg_32bit: bool,
    pub limit_in_pages: bool,
}

impl UserDesc {
    pub fn read(mem: &mut Memory, addr: u32) -> Result<UserDesc, MemFault> {
        let entry_number = mem.read_u32(addr)?;
        let base_addr = mem.read_u32(addr + 4)?;
        let limit = mem.read_u32(addr + 8)?;
        let flags = mem.read_u32(addr + 12)?;
        Ok(UserDesc {
            entry_number,
            base_addr,
            limit,
            seg_32bit: flags & 1 != 0,
            limit_in_pages: flags & (1 << 4) != 0,
        })
    }

    /// Writes back the (possibly reassigned) entry number.
    pub fn write_entry_number(mem: &mut Memory, addr: u32, entry: u32) -> Result<(), MemFault> {
        mem.write_u32(addr, entry)
    }
}

/// Reads a guest `struct timespec` and returns whole microseconds. The
/// nanosecond remainder below one microsecond is dropped (division), so a
/// 1999ns sleep rounds down to 1us.
pub fn read_timespec_us(mem: &mut Memory, addr: u32) -> Result<u64, MemFault> {
    let sec = mem.read_u32(addr)?;
    let nsec = mem.read_u32(addr + 4)?;
    Ok(u64::from(sec) * 1_000_000 + u64::from(nsec) / 1000)
}

/// Writes a guest `struct timespec` from microseconds.
pub fn write_timespec(mem: &mut Memory, addr: u32, us: u64) -> Result<(), MemFault> {
    mem.write_u32(addr, (us / 1_000_000) as u32)?;
    mem.write_u32(addr + 4, ((us % 1_000_000) * 1000) as u32)
}

/// Writes a guest `struct timeval` from microseconds.
pub fn write_timeval(mem: &mut Memory, addr: u32, us: u64) -> Result<(), MemFault> {
    mem.write_u32(addr, (us / 1_000_000) as u32)?;
    mem.write_u32(addr + 4, (us % 1_000_000) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::perm;

    fn mem() -> Memory {
        let mut m = Memory::new();
        m.map(0x1000, 0x2000, perm::INIT | perm::READ | perm::WRITE);
        m
    }

    /// The nanosecond part rounds down to whole microseconds.
    #[test]
    fn timespec_microsecond_round_down() {
        let mut m = mem();
        m.write_u32(0x1000, 2).unwrap();
        m.write_u32(0x1004, 1999).unwrap();
        assert_eq!(read_timespec_us(&mut m, 0x1000).unwrap(), 2_000_001);

        m.write_u32(0x1004, 999).unwrap();
        assert_eq!(read_timespec_us(&mut m, 0x1000).unwrap(), 2_000_000);
    }

    /// utsname fields land at 65-byte strides.
    #[test]
    fn utsname_layout() {
        let mut m = mem();
        write_utsname(&mut m, 0x1000, "mips").unwrap();
        assert_eq!(m.read_string(0x1000).unwrap(), "Linux");
        assert_eq!(m.read_string(0x1000 + 65).unwrap(), "mcsim");
        assert_eq!(m.read_string(0x1000 + 4 * 65).unwrap(), "mips");
    }

    /// user_desc flag unpacking.
    #[test]
    fn user_desc_flags() {
        let mut m = mem();
        m.write_u32(0x1100, u32::MAX).unwrap(); // entry_number = -1
        m.write_u32(0x1104, 0x0800_0000).unwrap();
        m.write_u32(0x1108, 0xfffff).unwrap();
        m.write_u32(0x110c, 0x11).unwrap(); // seg_32bit | limit_in_pages

        let d = UserDesc::read(&mut m, 0x1100).unwrap();
        assert_eq!(d.entry_number, u32::MAX);
        assert!(d.seg_32bit);
        assert!(d.limit_in_pages);
    }
}
