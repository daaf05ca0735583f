//! Guest file descriptor table.
//!
//! Maps guest descriptor numbers to host descriptors plus bookkeeping.
//! Descriptors 0-2 are pre-opened from the loader's stdin/stdout
//! redirection (or the simulator's own standard streams). Tables are
//! shared between contexts cloned with CLONE_FILES.

use tempfile::TempPath;

/// What kind of object a guest descriptor refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    /// Ordinary host-backed file.
    Regular,
    /// One of the pre-opened standard streams.
    Std,
    /// Host pipe end.
    Pipe,
    /// Synthesised `/proc` content backed by a host temp file.
    Virtual,
    /// Socket (kept for parity; no socket syscalls are translated).
    Socket,
}

/// One guest descriptor.
#[derive(Debug)]
pub struct FileDesc {
    pub kind: FileKind,
    /// Guest-visible descriptor number.
    pub guest_fd: i32,
    /// Backing host descriptor.
    pub host_fd: i32,
    /// Path as the guest named it (or the host temp path for virtual
    /// files).
    pub path: String,
    /// Guest open flags.
    pub flags: u32,
    /// For virtual files: owning handle of the host temp file; deleting
    /// happens when the descriptor is freed.
    pub temp: Option<TempPath>,
}

/// The table. Index = guest fd; holes are closed descriptors.
#[derive(Debug, Default)]
pub struct FileTable {
    descs: Vec<Option<FileDesc>>,
}

impl FileTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the lowest free guest descriptor for a new entry.
    pub fn new_desc(&mut self, kind: FileKind, host_fd: i32, path: &str, flags: u32) -> i32 {
        let slot = self
            .descs
            .iter()
            .position(|d| d.is_none())
            .unwrap_or_else(|| {
                self.descs.push(None);
                self.descs.len() - 1
            });
        let guest_fd = slot as i32;
        self.descs[slot] = Some(FileDesc {
            kind,
            guest_fd,
            host_fd,
            path: path.to_string(),
            flags,
            temp: None,
        });
        guest_fd
    }

    pub fn get(&self, guest_fd: i32) -> Option<&FileDesc> {
        if guest_fd < 0 {
            return None;
        }
        self.descs.get(guest_fd as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, guest_fd: i32) -> Option<&mut FileDesc> {
        if guest_fd < 0 {
            return None;
        }
        self.descs.get_mut(guest_fd as usize)?.as_mut()
    }

    /// Host descriptor behind a guest descriptor, if open.
    pub fn host_fd(&self, guest_fd: i32) -> Option<i32> {
        self.get(guest_fd).map(|d| d.host_fd)
    }

    /// Duplicates the table for a fork-style clone: the standard streams
    /// share the host descriptor, everything else gets its own host
    /// descriptor via dup(2). Temp-file ownership stays with the
    /// original; unlinking a still-open file is fine on the host side.
    pub fn duplicate(&self) -> FileTable {
        let descs = self
            .descs
            .iter()
            .map(|slot| {
                slot.as_ref().map(|d| {
                    let host_fd = if d.kind == FileKind::Std {
                        d.host_fd
                    } else {
                        unsafe { libc::dup(d.host_fd) }
                    };
                    FileDesc {
                        kind: d.kind,
                        guest_fd: d.guest_fd,
                        host_fd,
                        path: d.path.clone(),
                        flags: d.flags,
                        temp: None,
                    }
                })
            })
            .collect();
        FileTable { descs }
    }

    /// Closes a guest descriptor, returning its record (temp files are
    /// deleted when the record drops).
    pub fn free(&mut self, guest_fd: i32) -> Option<FileDesc> {
        if guest_fd < 0 {
            return None;
        }
        self.descs.get_mut(guest_fd as usize)?.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Descriptor numbers allocate lowest-first and recycle after close.
    #[test]
    fn fd_allocation_recycles() {
        let mut t = FileTable::new();
        assert_eq!(t.new_desc(FileKind::Std, 0, "stdin", 0), 0);
        assert_eq!(t.new_desc(FileKind::Std, 1, "stdout", 0), 1);
        assert_eq!(t.new_desc(FileKind::Regular, 5, "/tmp/a", 0), 2);

        t.free(1);
        assert!(t.get(1).is_none());
        assert_eq!(t.new_desc(FileKind::Regular, 6, "/tmp/b", 0), 1);
        assert_eq!(t.host_fd(1), Some(6));
        assert_eq!(t.host_fd(2), Some(5));
    }
}
