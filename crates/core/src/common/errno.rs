//! Guest errno values.
//!
//! The guest ABI reports failures as negative integers in the return
//! register. These are the Linux i386 values 1..34 (EPERM..ERANGE); the
//! translator uses this table and never the host's headers, so the guest
//! sees the same numbers regardless of the host platform.

/// Linux i386 errno numbers, as positive integers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Errno {
    /// Operation not permitted.
    Eperm = 1,
    /// No such file or directory.
    Enoent = 2,
    /// No such process.
    Esrch = 3,
    /// Interrupted system call.
    Eintr = 4,
    /// I/O error.
    Eio = 5,
    /// No such device or address.
    Enxio = 6,
    /// Argument list too long.
    E2big = 7,
    /// Exec format error.
    Enoexec = 8,
    /// Bad file number.
    Ebadf = 9,
    /// No child processes.
    Echild = 10,
    /// Try again (also EWOULDBLOCK).
    Eagain = 11,
    /// Out of memory.
    Enomem = 12,
    /// Permission denied.
    Eacces = 13,
    /// Bad address.
    Efault = 14,
    /// Block device required.
    Enotblk = 15,
    /// Device or resource busy.
    Ebusy = 16,
    /// File exists.
    Eexist = 17,
    /// Cross-device link.
    Exdev = 18,
    /// No such device.
    Enodev = 19,
    /// Not a directory.
    Enotdir = 20,
    /// Is a directory.
    Eisdir = 21,
    /// Invalid argument.
    Einval = 22,
    /// File table overflow.
    Enfile = 23,
    /// Too many open files.
    Emfile = 24,
    /// Not a typewriter.
    Enotty = 25,
    /// Text file busy.
    Etxtbsy = 26,
    /// File too large.
    Efbig = 27,
    /// No space left on device.
    Enospc = 28,
    /// Illegal seek.
    Espipe = 29,
    /// Read-only file system.
    Erofs = 30,
    /// Too many links.
    Emlink = 31,
    /// Broken pipe.
    Epipe = 32,
    /// Math argument out of domain of func.
    Edom = 33,
    /// Math result not representable.
    Erange = 34,
}

/// Largest errno value the guest ABI can report.
pub const ERRNO_MAX: i32 = 34;

impl Errno {
    /// The negative ABI return value for this errno.
    #[inline]
    pub fn ret(self) -> i32 {
        -(self as i32)
    }

    /// Name for a (positive) errno number, for syscall trace output.
    pub fn name(num: i32) -> &'static str {
        match num {
            1 => "EPERM",
            2 => "ENOENT",
            3 => "ESRCH",
            4 => "EINTR",
            5 => "EIO",
            6 => "ENXIO",
            7 => "E2BIG",
            8 => "ENOEXEC",
            9 => "EBADF",
            10 => "ECHILD",
            11 => "EAGAIN",
            12 => "ENOMEM",
            13 => "EACCES",
            14 => "EFAULT",
            15 => "ENOTBLK",
            16 => "EBUSY",
            17 => "EEXIST",
            18 => "EXDEV",
            19 => "ENODEV",
            20 => "ENOTDIR",
            21 => "EISDIR",
            22 => "EINVAL",
            23 => "ENFILE",
            24 => "EMFILE",
            25 => "ENOTTY",
            26 => "ETXTBSY",
            27 => "EFBIG",
            28 => "ENOSPC",
            29 => "ESPIPE",
            30 => "EROFS",
            31 => "EMLINK",
            32 => "EPIPE",
            33 => "EDOM",
            34 => "ERANGE",
            _ => "E?",
        }
    }

    /// Maps a host errno (from `libc`) into the guest table. Values beyond
    /// the i386 1..34 range collapse to EINVAL; the guest ABI has no wider
    /// vocabulary.
    pub fn from_host(host: i32) -> Errno {
        if (1..=ERRNO_MAX).contains(&host) {
            // Same numbering on both sides for 1..34.
            unsafe { std::mem::transmute::<i32, Errno>(host) }
        } else {
            Errno::Einval
        }
    }
}

/// Reads the host's `errno` after a failed libc call and converts it to the
/// guest's negative-return convention.
pub fn host_errno_ret() -> i32 {
    let host = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    Errno::from_host(host).ret()
}
