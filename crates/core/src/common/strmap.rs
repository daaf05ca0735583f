//! Named flag and value tables.
//!
//! Every host/guest flag translation in the syscall layer goes through one
//! of these tables; the exact bit values are part of the guest ABI and must
//! not be taken from host headers. The tables double as debug formatters
//! for the syscall trace.

/// A static table of (name, value) pairs.
///
/// Used both ways: mapping a value to its name for trace output, and
/// holding the authoritative guest-side bit values for flag words.
pub struct StringMap {
    entries: &'static [(&'static str, u32)],
}

impl StringMap {
    /// Wraps a static entry table.
    pub const fn new(entries: &'static [(&'static str, u32)]) -> Self {
        Self { entries }
    }

    /// Name for an exact value, or `"?"`.
    pub fn value_name(&self, value: u32) -> &'static str {
        self.entries
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(n, _)| *n)
            .unwrap_or("?")
    }

    /// Value for a name, if present.
    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| *v)
    }

    /// Renders a flag word as `A|B|C`, listing every table bit present in
    /// `flags`. Bits with no table entry are appended in hex.
    pub fn flags_name(&self, flags: u32) -> String {
        let mut out = String::new();
        let mut rest = flags;
        for (name, value) in self.entries {
            if *value != 0 && flags & value == *value {
                if !out.is_empty() {
                    out.push('|');
                }
                out.push_str(name);
                rest &= !value;
            }
        }
        if rest != 0 || out.is_empty() {
            if !out.is_empty() {
                out.push('|');
            }
            out.push_str(&format!("{:#x}", rest));
        }
        out
    }
}

/// `open(2)` flag bits (octal in the ABI).
pub static OPEN_FLAGS: StringMap = StringMap::new(&[
    ("O_RDONLY", 0o0),
    ("O_WRONLY", 0o1),
    ("O_RDWR", 0o2),
    ("O_CREAT", 0o100),
    ("O_EXCL", 0o200),
    ("O_NOCTTY", 0o400),
    ("O_TRUNC", 0o1000),
    ("O_APPEND", 0o2000),
    ("O_NONBLOCK", 0o4000),
    ("O_SYNC", 0o10000),
    ("FASYNC", 0o20000),
    ("O_DIRECT", 0o40000),
    ("O_LARGEFILE", 0o100000),
    ("O_DIRECTORY", 0o200000),
    ("O_NOFOLLOW", 0o400000),
    ("O_NOATIME", 0o1000000),
]);

/// `clone(2)` flag bits.
pub static CLONE_FLAGS: StringMap = StringMap::new(&[
    ("CLONE_VM", 0x0000_0100),
    ("CLONE_FS", 0x0000_0200),
    ("CLONE_FILES", 0x0000_0400),
    ("CLONE_SIGHAND", 0x0000_0800),
    ("CLONE_PTRACE", 0x0000_2000),
    ("CLONE_VFORK", 0x0000_4000),
    ("CLONE_PARENT", 0x0000_8000),
    ("CLONE_THREAD", 0x0001_0000),
    ("CLONE_NEWNS", 0x0002_0000),
    ("CLONE_SYSVSEM", 0x0004_0000),
    ("CLONE_SETTLS", 0x0008_0000),
    ("CLONE_PARENT_SETTID", 0x0010_0000),
    ("CLONE_CHILD_CLEARTID", 0x0020_0000),
    ("CLONE_DETACHED", 0x0040_0000),
    ("CLONE_UNTRACED", 0x0080_0000),
    ("CLONE_CHILD_SETTID", 0x0100_0000),
    ("CLONE_STOPPED", 0x0200_0000),
    ("CLONE_NEWUTS", 0x0400_0000),
    ("CLONE_NEWIPC", 0x0800_0000),
    ("CLONE_NEWUSER", 0x1000_0000),
    ("CLONE_NEWPID", 0x2000_0000),
    ("CLONE_NEWNET", 0x4000_0000),
    ("CLONE_IO", 0x8000_0000),
]);

/// `mmap(2)` protection bits.
pub static MMAP_PROT: StringMap = StringMap::new(&[
    ("PROT_READ", 0x1),
    ("PROT_WRITE", 0x2),
    ("PROT_EXEC", 0x4),
    ("PROT_SEM", 0x8),
    ("PROT_GROWSDOWN", 0x0100_0000),
    ("PROT_GROWSUP", 0x0200_0000),
]);

/// `mmap(2)` mapping flags.
pub static MMAP_FLAGS: StringMap = StringMap::new(&[
    ("MAP_SHARED", 0x01),
    ("MAP_PRIVATE", 0x02),
    ("MAP_FIXED", 0x10),
    ("MAP_ANONYMOUS", 0x20),
    ("MAP_GROWSDOWN", 0x0100),
    ("MAP_DENYWRITE", 0x0800),
    ("MAP_EXECUTABLE", 0x1000),
    ("MAP_LOCKED", 0x2000),
    ("MAP_NORESERVE", 0x4000),
    ("MAP_POPULATE", 0x8000),
    ("MAP_NONBLOCK", 0x10000),
]);

/// `getrlimit(2)` resource numbers.
pub static RLIMIT_RESOURCES: StringMap = StringMap::new(&[
    ("RLIMIT_CPU", 0),
    ("RLIMIT_FSIZE", 1),
    ("RLIMIT_DATA", 2),
    ("RLIMIT_STACK", 3),
    ("RLIMIT_CORE", 4),
    ("RLIMIT_RSS", 5),
    ("RLIMIT_NPROC", 6),
    ("RLIMIT_NOFILE", 7),
    ("RLIMIT_MEMLOCK", 8),
    ("RLIMIT_AS", 9),
]);

/// `waitpid(2)` option bits.
pub static WAITPID_OPTIONS: StringMap = StringMap::new(&[
    ("WNOHANG", 0x0000_0001),
    ("WUNTRACED", 0x0000_0002),
    ("WEXITED", 0x0000_0004),
    ("WCONTINUED", 0x0000_0008),
    ("WNOWAIT", 0x0100_0000),
    ("WNOTHREAD", 0x2000_0000),
    ("WALL", 0x4000_0000),
    ("WCLONE", 0x8000_0000),
]);

/// `futex(2)` command numbers (after stripping PRIVATE/CLOCK_REALTIME).
pub static FUTEX_CMDS: StringMap = StringMap::new(&[
    ("FUTEX_WAIT", 0),
    ("FUTEX_WAKE", 1),
    ("FUTEX_FD", 2),
    ("FUTEX_REQUEUE", 3),
    ("FUTEX_CMP_REQUEUE", 4),
    ("FUTEX_WAKE_OP", 5),
    ("FUTEX_LOCK_PI", 6),
    ("FUTEX_UNLOCK_PI", 7),
    ("FUTEX_TRYLOCK_PI", 8),
    ("FUTEX_WAIT_BITSET", 9),
    ("FUTEX_WAKE_BITSET", 10),
    ("FUTEX_WAIT_REQUEUE_PI", 11),
    ("FUTEX_CMP_REQUEUE_PI", 12),
]);

/// Signal numbers for trace output.
pub static SIGNALS: StringMap = StringMap::new(&[
    ("SIGHUP", 1),
    ("SIGINT", 2),
    ("SIGQUIT", 3),
    ("SIGILL", 4),
    ("SIGTRAP", 5),
    ("SIGABRT", 6),
    ("SIGBUS", 7),
    ("SIGFPE", 8),
    ("SIGKILL", 9),
    ("SIGUSR1", 10),
    ("SIGSEGV", 11),
    ("SIGUSR2", 12),
    ("SIGPIPE", 13),
    ("SIGALRM", 14),
    ("SIGTERM", 15),
    ("SIGSTKFLT", 16),
    ("SIGCHLD", 17),
    ("SIGCONT", 18),
    ("SIGSTOP", 19),
    ("SIGTSTP", 20),
    ("SIGTTIN", 21),
    ("SIGTTOU", 22),
    ("SIGURG", 23),
    ("SIGXCPU", 24),
    ("SIGXFSZ", 25),
    ("SIGVTALRM", 26),
    ("SIGPROF", 27),
    ("SIGWINCH", 28),
    ("SIGIO", 29),
    ("SIGPWR", 30),
    ("SIGSYS", 31),
]);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_name_lists_all_set_bits() {
        let s = CLONE_FLAGS.flags_name(0x0000_0100 | 0x0000_0200);
        assert_eq!(s, "CLONE_VM|CLONE_FS");
    }

    #[test]
    fn flags_name_keeps_unknown_bits_as_hex() {
        let s = MMAP_FLAGS.flags_name(0x02 | 0x4000_0000);
        assert_eq!(s, "MAP_PRIVATE|0x40000000");
    }

    #[test]
    fn value_name_and_lookup_round_trip() {
        assert_eq!(RLIMIT_RESOURCES.value_name(3), "RLIMIT_STACK");
        assert_eq!(RLIMIT_RESOURCES.lookup("RLIMIT_NOFILE"), Some(7));
        assert_eq!(FUTEX_CMDS.value_name(9), "FUTEX_WAIT_BITSET");
    }
}
