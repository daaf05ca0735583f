//! System call handlers.
//!
//! Handlers return the value for the ABI return register, negative errno
//! for guest-visible failures, or `Err(SimError)` for conditions that
//! abort the simulation. A handler that must block records its wakeup
//! metadata on the context, suspends it, and returns 0; the per-tick
//! poller resumes the call and supplies the real return value.

use std::ffi::CString;

use crate::common::errno::host_errno_ret;
use crate::common::strmap::{
    CLONE_FLAGS, FUTEX_CMDS, MMAP_FLAGS, MMAP_PROT, OPEN_FLAGS, RLIMIT_RESOURCES, SIGNALS,
    WAITPID_OPTIONS,
};
use crate::common::{round_up, Errno, SimError, PAGE_MASK, PAGE_SIZE};
use crate::context::signal::SignalHandlerTable;
use crate::context::{state, Context, FileKind};
use crate::emu::Emu;
use crate::mem::perm;

use super::procfs;
use super::structs::{
    read_timespec_us, write_rlimit, write_stat64, write_timespec, write_timeval, write_utsname,
    UserDesc,
};

type Args = [u32; 6];
type SysResult = Result<i32, SimError>;

// Guest flag values (i386 ABI).
const GUEST_O_NONBLOCK: u32 = 0o4000;
const POLLIN: u32 = 0x1;
const POLLOUT: u32 = 0x4;

const MMAP_BASE_ADDRESS: u32 = 0xb7fb_0000;

fn mem_fault(f: crate::mem::MemFault) -> SimError {
    SimError::MemoryFault {
        addr: f.addr,
        write: f.write,
    }
}

/// Polls a host descriptor with zero timeout.
fn poll_ready(host_fd: i32, events: i16) -> bool {
    let mut p = libc::pollfd {
        fd: host_fd,
        events,
        revents: 0,
    };
    let n = unsafe { libc::poll(&mut p, 1, 0) };
    n > 0 && (p.revents & events) != 0
}

/// Translates guest open flags to host flags.
fn open_flags_to_host(guest: u32) -> i32 {
    let mut host = match guest & 0o3 {
        0o0 => libc::O_RDONLY,
        0o1 => libc::O_WRONLY,
        _ => libc::O_RDWR,
    };
    let table: [(u32, i32); 7] = [
        (0o100, libc::O_CREAT),
        (0o200, libc::O_EXCL),
        (0o1000, libc::O_TRUNC),
        (0o2000, libc::O_APPEND),
        (0o4000, libc::O_NONBLOCK),
        (0o200000, libc::O_DIRECTORY),
        (0o400000, libc::O_NOFOLLOW),
    ];
    for (bit, flag) in table {
        if guest & bit != 0 {
            host |= flag;
        }
    }
    host
}

/// Resolves a guest path against the loader's working directory.
fn full_path(ctx: &Context, path: &str) -> String {
    if path.starts_with('/') || ctx.loader.cwd.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", ctx.loader.cwd, path)
    }
}

fn c_path(path: &str) -> Result<CString, i32> {
    CString::new(path).map_err(|_| Errno::Einval.ret())
}

// ----------------------------------------------------------------------
// Process lifetime
// ----------------------------------------------------------------------

pub fn sys_exit(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let status = args[0] as i32;
    log::debug!("  status={:#x}", status);
    emu.finish_context(ctx, status);
    Ok(0)
}

pub fn sys_exit_group(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let status = args[0] as i32;
    log::debug!("  status={:#x}", status);
    emu.finish_group(ctx, status);
    Ok(0)
}

pub fn sys_waitpid(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let pid = args[0] as i32;
    let status_ptr = args[1];
    let options = args[2];
    log::debug!(
        "  pid={}, pstatus={:#x}, options={}",
        pid,
        status_ptr,
        WAITPID_OPTIONS.flags_name(options)
    );

    if pid != -1 && pid <= 0 {
        return Err(SimError::UnsupportedFeature(format!(
            "waitpid: pid={} (only -1 or positive pids)",
            pid
        )));
    }

    match emu.reap_zombie_child(ctx.pid, pid) {
        Some((child_pid, exit_code)) => {
            if status_ptr != 0 {
                ctx.memory
                    .borrow_mut()
                    .write_u32(status_ptr, exit_code as u32)
                    .map_err(mem_fault)?;
            }
            Ok(child_pid)
        }
        // WNOHANG present: report nothing to wait for.
        None if options & 0x1 != 0 => Ok(0),
        None => {
            ctx.wakeup_pid = pid;
            ctx.suspend(state::WAITPID);
            Ok(0)
        }
    }
}

// ----------------------------------------------------------------------
// File I/O
// ----------------------------------------------------------------------

pub fn sys_read(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let guest_fd = args[0] as i32;
    let buf_ptr = args[1];
    let count = args[2] as usize;
    log::debug!("  guest_fd={}, buf_ptr={:#x}, count={:#x}", guest_fd, buf_ptr, count);

    let (host_fd, flags) = {
        let table = ctx.file_table.borrow();
        match table.get(guest_fd) {
            Some(d) => (d.host_fd, d.flags),
            None => return Ok(Errno::Ebadf.ret()),
        }
    };
    log::debug!("  host_fd={}", host_fd);

    if poll_ready(host_fd, libc::POLLIN) || flags & GUEST_O_NONBLOCK != 0 {
        return do_host_read(ctx, host_fd, buf_ptr, count);
    }

    // Blocking read: park the context until the descriptor is readable.
    log::debug!("  blocking read - process suspended");
    ctx.wakeup_fd = guest_fd;
    ctx.wakeup_events = POLLIN;
    ctx.suspend(state::READ);
    let _ = emu;
    Ok(0)
}

fn do_host_read(ctx: &mut Context, host_fd: i32, buf_ptr: u32, count: usize) -> SysResult {
    let mut buf = vec![0u8; count];
    let n = unsafe { libc::read(host_fd, buf.as_mut_ptr().cast(), count) };
    if n < 0 {
        return Ok(host_errno_ret());
    }
    if n > 0 {
        ctx.memory
            .borrow_mut()
            .write(buf_ptr, &buf[..n as usize])
            .map_err(mem_fault)?;
    }
    Ok(n as i32)
}

/// Completes a read the context suspended on; called by the wakeup poller
/// once the descriptor is ready. Arguments still sit in the ABI registers.
pub fn resume_read(emu: &mut Emu, ctx: &mut Context) -> SysResult {
    let (_, args) = super::read_abi(ctx)?;
    let host_fd = ctx
        .file_table
        .borrow()
        .host_fd(ctx.wakeup_fd)
        .unwrap_or(-1);
    let _ = emu;
    do_host_read(ctx, host_fd, args[1], args[2] as usize)
}

pub fn sys_write(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let guest_fd = args[0] as i32;
    let buf_ptr = args[1];
    let count = args[2] as usize;
    log::debug!("  guest_fd={}, buf_ptr={:#x}, count={:#x}", guest_fd, buf_ptr, count);

    let host_fd = {
        let table = ctx.file_table.borrow();
        match table.get(guest_fd) {
            Some(d) => d.host_fd,
            None => return Ok(Errno::Ebadf.ret()),
        }
    };
    log::debug!("  host_fd={}", host_fd);

    if poll_ready(host_fd, libc::POLLOUT) {
        return do_host_write(ctx, host_fd, buf_ptr, count);
    }

    log::debug!("  blocking write - process suspended");
    ctx.wakeup_fd = guest_fd;
    ctx.wakeup_events = POLLOUT;
    ctx.suspend(state::WRITE);
    let _ = emu;
    Ok(0)
}

fn do_host_write(ctx: &mut Context, host_fd: i32, buf_ptr: u32, count: usize) -> SysResult {
    let mut buf = vec![0u8; count];
    ctx.memory
        .borrow_mut()
        .read(buf_ptr, &mut buf)
        .map_err(mem_fault)?;
    let n = unsafe { libc::write(host_fd, buf.as_ptr().cast(), count) };
    if n < 0 {
        return Ok(host_errno_ret());
    }
    Ok(n as i32)
}

/// Completes a write the context suspended on.
pub fn resume_write(emu: &mut Emu, ctx: &mut Context) -> SysResult {
    let (_, args) = super::read_abi(ctx)?;
    let host_fd = ctx
        .file_table
        .borrow()
        .host_fd(ctx.wakeup_fd)
        .unwrap_or(-1);
    let _ = emu;
    do_host_write(ctx, host_fd, args[1], args[2] as usize)
}

pub fn sys_open(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let path_ptr = args[0];
    let flags = args[1];
    let mode = args[2];
    let file_name = ctx
        .memory
        .borrow_mut()
        .read_string(path_ptr)
        .map_err(mem_fault)?;
    let path = full_path(ctx, &file_name);
    log::debug!("  filename='{}' flags={:#x}, mode={:#x}", file_name, flags, mode);
    log::debug!("  fullpath='{}'", path);
    log::debug!("  flags={}", OPEN_FLAGS.flags_name(flags));
    let _ = emu;

    // Virtual files take precedence over the host filesystem.
    if path.starts_with("/proc/") {
        if let Some(temp) = procfs::open_virtual(ctx, &path) {
            let temp_path = temp.into_temp_path();
            let c = c_path(&temp_path.to_string_lossy())
                .map_err(|e| SimError::UnsupportedFeature(format!("bad temp path ({})", e)))?;
            let host_fd = unsafe { libc::open(c.as_ptr(), libc::O_RDONLY) };
            if host_fd < 0 {
                return Ok(host_errno_ret());
            }
            let mut table = ctx.file_table.borrow_mut();
            let guest_fd = table.new_desc(FileKind::Virtual, host_fd, &path, flags);
            if let Some(desc) = table.get_mut(guest_fd) {
                desc.temp = Some(temp_path);
            }
            log::debug!("    virtual file opened: guest_fd={}", guest_fd);
            return Ok(guest_fd);
        }
    }

    let c = match c_path(&path) {
        Ok(c) => c,
        Err(e) => return Ok(e),
    };
    let host_fd =
        unsafe { libc::open(c.as_ptr(), open_flags_to_host(flags), mode as libc::c_uint) };
    if host_fd < 0 {
        return Ok(host_errno_ret());
    }
    let guest_fd = ctx
        .file_table
        .borrow_mut()
        .new_desc(FileKind::Regular, host_fd, &path, flags);
    log::debug!("    host fd {} -> guest_fd={}", host_fd, guest_fd);
    Ok(guest_fd)
}

pub fn sys_close(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let guest_fd = args[0] as i32;
    log::debug!("  guest_fd={}", guest_fd);
    let _ = emu;
    let desc = match ctx.file_table.borrow_mut().free(guest_fd) {
        Some(d) => d,
        None => return Ok(Errno::Ebadf.ret()),
    };
    // The standard streams belong to the simulator, not the guest.
    if desc.kind != FileKind::Std {
        unsafe { libc::close(desc.host_fd) };
    }
    // Virtual temp files are deleted when `desc.temp` drops here.
    Ok(0)
}

pub fn sys_access(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let path = ctx
        .memory
        .borrow_mut()
        .read_string(args[0])
        .map_err(mem_fault)?;
    let mode = args[1] as i32;
    let path = full_path(ctx, &path);
    log::debug!("  path='{}', mode={:#x}", path, mode);
    let _ = emu;
    let c = match c_path(&path) {
        Ok(c) => c,
        Err(e) => return Ok(e),
    };
    let err = unsafe { libc::access(c.as_ptr(), mode) };
    if err < 0 {
        return Ok(host_errno_ret());
    }
    Ok(0)
}

pub fn sys_unlink(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let path = ctx
        .memory
        .borrow_mut()
        .read_string(args[0])
        .map_err(mem_fault)?;
    let path = full_path(ctx, &path);
    log::debug!("  path='{}'", path);
    let _ = emu;
    let c = match c_path(&path) {
        Ok(c) => c,
        Err(e) => return Ok(e),
    };
    let err = unsafe { libc::unlink(c.as_ptr()) };
    if err < 0 {
        return Ok(host_errno_ret());
    }
    Ok(0)
}

pub fn sys_lseek(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let guest_fd = args[0] as i32;
    let offset = args[1] as i32;
    let whence = args[2] as i32;
    let _ = emu;
    let host_fd = match ctx.file_table.borrow().host_fd(guest_fd) {
        Some(fd) => fd,
        None => return Ok(Errno::Ebadf.ret()),
    };
    let pos = unsafe { libc::lseek(host_fd, libc::off_t::from(offset), whence) };
    if pos < 0 {
        return Ok(host_errno_ret());
    }
    Ok(pos as i32)
}

pub fn sys_dup(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let guest_fd = args[0] as i32;
    let _ = emu;
    let (host_fd, kind, path, flags) = {
        let table = ctx.file_table.borrow();
        match table.get(guest_fd) {
            Some(d) => (d.host_fd, d.kind, d.path.clone(), d.flags),
            None => return Ok(Errno::Ebadf.ret()),
        }
    };
    let new_host = unsafe { libc::dup(host_fd) };
    if new_host < 0 {
        return Ok(host_errno_ret());
    }
    Ok(ctx
        .file_table
        .borrow_mut()
        .new_desc(kind, new_host, &path, flags))
}

pub fn sys_pipe(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let fds_ptr = args[0];
    let _ = emu;
    let mut host_fds = [0i32; 2];
    if unsafe { libc::pipe(host_fds.as_mut_ptr()) } < 0 {
        return Ok(host_errno_ret());
    }
    let (rd, wr) = {
        let mut table = ctx.file_table.borrow_mut();
        let rd = table.new_desc(FileKind::Pipe, host_fds[0], "pipe", 0);
        let wr = table.new_desc(FileKind::Pipe, host_fds[1], "pipe", 0o1);
        (rd, wr)
    };
    log::debug!("  guest fds: read={}, write={}", rd, wr);
    let mut mem = ctx.memory.borrow_mut();
    mem.write_u32(fds_ptr, rd as u32).map_err(mem_fault)?;
    mem.write_u32(fds_ptr + 4, wr as u32).map_err(mem_fault)?;
    Ok(0)
}

pub fn sys_writev(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let guest_fd = args[0] as i32;
    let iov_ptr = args[1];
    let iovcnt = args[2];
    let _ = emu;
    let host_fd = match ctx.file_table.borrow().host_fd(guest_fd) {
        Some(fd) => fd,
        None => return Ok(Errno::Ebadf.ret()),
    };

    let mut gathered = Vec::new();
    {
        let mut mem = ctx.memory.borrow_mut();
        for i in 0..iovcnt {
            let base = mem.read_u32(iov_ptr + i * 8).map_err(mem_fault)?;
            let len = mem.read_u32(iov_ptr + i * 8 + 4).map_err(mem_fault)?;
            let start = gathered.len();
            gathered.resize(start + len as usize, 0);
            mem.read(base, &mut gathered[start..]).map_err(mem_fault)?;
        }
    }
    let n = unsafe { libc::write(host_fd, gathered.as_ptr().cast(), gathered.len()) };
    if n < 0 {
        return Ok(host_errno_ret());
    }
    Ok(n as i32)
}

pub fn sys_poll(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let fds_ptr = args[0];
    let nfds = args[1];
    let timeout = args[2] as i32;
    log::debug!("  pfds={:#x}, nfds={}, timeout={}", fds_ptr, nfds, timeout);
    let _ = emu;

    let mut ready = 0;
    let mut mem = ctx.memory.borrow_mut();
    let table = ctx.file_table.borrow();
    for i in 0..nfds {
        let entry = fds_ptr + i * 8;
        let guest_fd = mem.read_u32(entry).map_err(mem_fault)? as i32;
        let events = mem.read_u32(entry + 4).map_err(mem_fault)? & 0xffff;
        let mut revents = 0u32;
        if let Some(host_fd) = table.host_fd(guest_fd) {
            if events & POLLIN != 0 && poll_ready(host_fd, libc::POLLIN) {
                revents |= POLLIN;
            }
            if events & POLLOUT != 0 && poll_ready(host_fd, libc::POLLOUT) {
                revents |= POLLOUT;
            }
        }
        if revents != 0 {
            ready += 1;
        }
        mem.write_u32(entry + 4, events | (revents << 16))
            .map_err(mem_fault)?;
    }
    if ready > 0 || timeout == 0 {
        return Ok(ready);
    }
    Err(SimError::UnsupportedFeature(
        "poll with a blocking timeout".into(),
    ))
}

pub fn sys_fcntl64(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let guest_fd = args[0] as i32;
    let cmd = args[1];
    let arg = args[2];
    log::debug!("  guest_fd={}, cmd={}, arg={:#x}", guest_fd, cmd, arg);
    match cmd {
        // F_DUPFD
        0 => sys_dup(emu, ctx, args),
        // F_GETFD / F_SETFD: close-on-exec is irrelevant without exec.
        1 | 2 => Ok(0),
        // F_GETFL
        3 => match ctx.file_table.borrow().get(guest_fd) {
            Some(d) => Ok(d.flags as i32),
            None => Ok(Errno::Ebadf.ret()),
        },
        // F_SETFL: only O_NONBLOCK is honored.
        4 => match ctx.file_table.borrow_mut().get_mut(guest_fd) {
            Some(d) => {
                d.flags = (d.flags & !GUEST_O_NONBLOCK) | (arg & GUEST_O_NONBLOCK);
                Ok(0)
            }
            None => Ok(Errno::Ebadf.ret()),
        },
        _ => Err(SimError::UnsupportedFeature(format!(
            "fcntl64 cmd {}",
            cmd
        ))),
    }
}

pub fn sys_ioctl(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let guest_fd = args[0] as i32;
    let request = args[1];
    log::debug!("  guest_fd={}, request={:#x}", guest_fd, request);
    let _ = (emu, ctx);
    match request {
        // TCGETS on anything the simulator serves: not a tty.
        0x5401 => Ok(Errno::Enotty.ret()),
        _ => Err(SimError::UnsupportedFeature(format!(
            "ioctl request {:#x}",
            request
        ))),
    }
}

// ----------------------------------------------------------------------
// stat family
// ----------------------------------------------------------------------

fn stat_path(ctx: &mut Context, path_ptr: u32, statbuf_ptr: u32, follow: bool) -> SysResult {
    let path = ctx
        .memory
        .borrow_mut()
        .read_string(path_ptr)
        .map_err(mem_fault)?;
    let path = full_path(ctx, &path);
    let c = match c_path(&path) {
        Ok(c) => c,
        Err(e) => return Ok(e),
    };
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let err = unsafe {
        if follow {
            libc::stat(c.as_ptr(), &mut st)
        } else {
            libc::lstat(c.as_ptr(), &mut st)
        }
    };
    if err < 0 {
        return Ok(host_errno_ret());
    }
    write_stat64(&mut ctx.memory.borrow_mut(), statbuf_ptr, &st).map_err(mem_fault)?;
    Ok(0)
}

pub fn sys_stat64(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let _ = emu;
    stat_path(ctx, args[0], args[1], true)
}

pub fn sys_lstat64(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let _ = emu;
    stat_path(ctx, args[0], args[1], false)
}

pub fn sys_fstat64(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let guest_fd = args[0] as i32;
    let statbuf_ptr = args[1];
    log::debug!("  fd={}, statbuf_ptr={:#x}", guest_fd, statbuf_ptr);
    let _ = emu;
    let host_fd = match ctx.file_table.borrow().host_fd(guest_fd) {
        Some(fd) => fd,
        None => return Ok(Errno::Ebadf.ret()),
    };
    log::debug!("  host_fd={}", host_fd);
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(host_fd, &mut st) } < 0 {
        return Ok(host_errno_ret());
    }
    write_stat64(&mut ctx.memory.borrow_mut(), statbuf_ptr, &st).map_err(mem_fault)?;
    Ok(0)
}

// ----------------------------------------------------------------------
// Time
// ----------------------------------------------------------------------

pub fn sys_time(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let time_ptr = args[0];
    let _ = emu;
    let t = unsafe { libc::time(std::ptr::null_mut()) } as u32;
    if time_ptr != 0 {
        ctx.memory
            .borrow_mut()
            .write_u32(time_ptr, t)
            .map_err(mem_fault)?;
    }
    Ok(t as i32)
}

pub fn sys_gettimeofday(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let tv_ptr = args[0];
    if tv_ptr != 0 {
        let us = emu.real_time();
        write_timeval(&mut ctx.memory.borrow_mut(), tv_ptr, us).map_err(mem_fault)?;
    }
    Ok(0)
}

pub fn sys_clock_gettime(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let clock = args[0];
    let tp_ptr = args[1];
    match clock {
        // CLOCK_REALTIME / CLOCK_MONOTONIC both run off the simulator
        // clock base.
        0 | 1 => {
            let us = emu.real_time();
            write_timespec(&mut ctx.memory.borrow_mut(), tp_ptr, us).map_err(mem_fault)?;
            Ok(0)
        }
        _ => Err(SimError::UnsupportedFeature(format!(
            "clock_gettime clock {}",
            clock
        ))),
    }
}

pub fn sys_times(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let buf_ptr = args[0];
    let _ = emu;
    if buf_ptr != 0 {
        let mut mem = ctx.memory.borrow_mut();
        for i in 0..4 {
            mem.write_u32(buf_ptr + i * 4, 0).map_err(mem_fault)?;
        }
    }
    Ok(0)
}

pub fn sys_nanosleep(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let rqtp = args[0];
    let rmtp = args[1];
    log::debug!("  rqtp={:#x}, rmtp={:#x}", rqtp, rmtp);

    let total_us = read_timespec_us(&mut ctx.memory.borrow_mut(), rqtp).map_err(mem_fault)?;
    log::debug!("  sleep time (us): {}", total_us);

    ctx.wakeup_time = emu.real_time() + total_us;
    ctx.suspend(state::NANOSLEEP);
    Ok(0)
}

// ----------------------------------------------------------------------
// Memory management
// ----------------------------------------------------------------------

pub fn sys_brk(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let new_break = args[0];
    let mut mem = ctx.memory.borrow_mut();
    let old_break = mem.heap_break();
    log::debug!("  newbrk={:#x} (previous brk was {:#x})", new_break, old_break);
    let _ = emu;

    let new_aligned = round_up(new_break, PAGE_SIZE);
    let old_aligned = round_up(old_break, PAGE_SIZE);

    if new_break == 0 {
        return Ok(old_break as i32);
    }

    if new_break > old_break {
        let size = new_aligned - old_aligned;
        if size > 0 {
            if mem.map_space(old_aligned, size) != Some(old_aligned) {
                return Err(SimError::OutOfGuestMemory { size });
            }
            mem.map(old_aligned, size, perm::INIT | perm::READ | perm::WRITE);
        }
        mem.set_heap_break(new_break);
        log::debug!("  heap grows {} bytes", new_break - old_break);
        return Ok(new_break as i32);
    }

    if new_break < old_break {
        let size = old_aligned - new_aligned;
        if size > 0 {
            mem.unmap(new_aligned, size);
        }
        mem.set_heap_break(new_break);
        log::debug!("  heap shrinks {} bytes", old_break - new_break);
        return Ok(new_break as i32);
    }

    Ok(old_break as i32)
}

fn mmap_aux(
    ctx: &mut Context,
    addr: u32,
    len: u32,
    prot: u32,
    flags: u32,
    guest_fd: i32,
    offset: u32,
) -> SysResult {
    log::debug!(
        "  addr={:#x}, len={:#x}, prot={}, flags={}, guest_fd={}, offset={:#x}",
        addr,
        len,
        MMAP_PROT.flags_name(prot),
        MMAP_FLAGS.flags_name(flags),
        guest_fd,
        offset
    );

    const MAP_FIXED: u32 = 0x10;
    const MAP_ANONYMOUS: u32 = 0x20;

    let mut host_fd = ctx.file_table.borrow().host_fd(guest_fd).unwrap_or(-1);
    if guest_fd > 0 && host_fd < 0 {
        return Err(SimError::UnsupportedFeature(format!(
            "mmap of invalid guest descriptor {}",
            guest_fd
        )));
    }
    if flags & MAP_ANONYMOUS != 0 {
        host_fd = -1;
    }

    let mut perms = perm::INIT;
    if prot & 0x1 != 0 {
        perms |= perm::READ;
    }
    if prot & 0x2 != 0 {
        perms |= perm::WRITE;
    }
    if prot & 0x4 != 0 {
        perms |= perm::EXEC;
    }

    if offset & !PAGE_MASK != 0 {
        return Err(SimError::UnsupportedFeature("mmap: unaligned offset".into()));
    }
    if addr & !PAGE_MASK != 0 {
        return Err(SimError::UnsupportedFeature("mmap: unaligned address".into()));
    }
    let len_aligned = round_up(len, PAGE_SIZE);

    let addr = {
        let mut mem = ctx.memory.borrow_mut();
        if flags & MAP_FIXED != 0 {
            if addr == 0 {
                return Err(SimError::UnsupportedFeature(
                    "mmap: fixed mapping without an address".into(),
                ));
            }
            mem.unmap(addr, len_aligned);
            addr
        } else {
            let hint = if addr == 0 || mem.map_space_down(addr, len_aligned) != Some(addr) {
                MMAP_BASE_ADDRESS
            } else {
                addr
            };
            match mem.map_space_down(hint, len_aligned) {
                Some(a) => a,
                None => return Err(SimError::OutOfGuestMemory { size: len_aligned }),
            }
        }
    };

    ctx.memory.borrow_mut().map(addr, len_aligned, perms);

    // File-backed mapping: read the file contents through the host
    // descriptor, page by page, preserving its file position.
    if host_fd >= 0 {
        let last_pos = unsafe { libc::lseek(host_fd, 0, libc::SEEK_CUR) };
        unsafe { libc::lseek(host_fd, libc::off_t::from(offset), libc::SEEK_SET) };

        let mut page_buf = [0u8; PAGE_SIZE as usize];
        let mut cur = addr;
        let mut remaining = len_aligned;
        while remaining > 0 {
            page_buf.fill(0);
            let n = unsafe {
                libc::read(host_fd, page_buf.as_mut_ptr().cast(), PAGE_SIZE as usize)
            };
            if n > 0 {
                ctx.memory
                    .borrow_mut()
                    .write_init(cur, &page_buf)
                    .map_err(mem_fault)?;
            }
            cur += PAGE_SIZE;
            remaining -= PAGE_SIZE;
        }
        unsafe { libc::lseek(host_fd, last_pos, libc::SEEK_SET) };
    }

    Ok(addr as i32)
}

pub fn sys_mmap(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let _ = emu;
    // Offset in bytes.
    mmap_aux(ctx, args[0], args[1], args[2], args[3], args[4] as i32, args[5])
}

pub fn sys_mmap2(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let _ = emu;
    // Offset in pages.
    mmap_aux(
        ctx,
        args[0],
        args[1],
        args[2],
        args[3],
        args[4] as i32,
        args[5] << 12,
    )
}

pub fn sys_munmap(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let addr = args[0];
    let size = args[1];
    log::debug!("  addr={:#x}, size={:#x}", addr, size);
    let _ = emu;
    if addr & !PAGE_MASK != 0 {
        return Err(SimError::UnsupportedFeature("munmap: unaligned address".into()));
    }
    let size_aligned = round_up(size, PAGE_SIZE);
    ctx.memory.borrow_mut().unmap(addr, size_aligned);
    Ok(0)
}

pub fn sys_mprotect(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let addr = args[0];
    let len = args[1];
    let prot = args[2];
    log::debug!("  addr={:#x}, len={:#x}, prot={}", addr, len, MMAP_PROT.flags_name(prot));
    let _ = emu;

    let mut perms = perm::INIT;
    if prot & 0x1 != 0 {
        perms |= perm::READ;
    }
    if prot & 0x2 != 0 {
        perms |= perm::WRITE;
    }
    if prot & 0x4 != 0 {
        perms |= perm::EXEC;
    }
    ctx.memory
        .borrow_mut()
        .protect(addr, round_up(len, PAGE_SIZE), perms);
    Ok(0)
}

// ----------------------------------------------------------------------
// Identity and limits
// ----------------------------------------------------------------------

pub fn sys_uname(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let ptr = args[0];
    log::debug!("  putsname={:#x}", ptr);
    let _ = emu;
    let machine = match ctx.isa() {
        crate::isa::IsaKind::Mips => "mips",
        crate::isa::IsaKind::X86 => "i686",
    };
    write_utsname(&mut ctx.memory.borrow_mut(), ptr, machine).map_err(mem_fault)?;
    Ok(0)
}

pub fn sys_getrlimit(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let res = args[0];
    let rlim_ptr = args[1];
    log::debug!("  res={}, rlim_ptr={:#x}", RLIMIT_RESOURCES.value_name(res), rlim_ptr);
    let _ = emu;

    let (cur, max) = match res {
        // RLIMIT_DATA
        2 => (0xffff_ffff, 0xffff_ffff),
        // RLIMIT_STACK
        3 => (ctx.loader.stack_size, 0xffff_ffff),
        // RLIMIT_NOFILE
        7 => (0x400, 0x400),
        _ => {
            return Err(SimError::UnsupportedFeature(format!(
                "getrlimit resource {}",
                RLIMIT_RESOURCES.value_name(res)
            )))
        }
    };
    write_rlimit(&mut ctx.memory.borrow_mut(), rlim_ptr, cur, max).map_err(mem_fault)?;
    log::debug!("  ret: cur={:#x}, max={:#x}", cur, max);
    Ok(0)
}

pub fn sys_setrlimit(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let res = args[0];
    let _ = (emu, ctx);
    if RLIMIT_RESOURCES.value_name(res) == "?" {
        return Ok(Errno::Einval.ret());
    }
    // Limits are advisory here; accept and ignore.
    Ok(0)
}

pub fn sys_getcwd(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let buf_ptr = args[0];
    let size = args[1];
    let _ = emu;
    let cwd = if ctx.loader.cwd.is_empty() {
        "/".to_string()
    } else {
        ctx.loader.cwd.clone()
    };
    let needed = cwd.len() as u32 + 1;
    if size < needed {
        return Ok(Errno::Erange.ret());
    }
    let mut mem = ctx.memory.borrow_mut();
    mem.write(buf_ptr, cwd.as_bytes()).map_err(mem_fault)?;
    mem.write(buf_ptr + cwd.len() as u32, &[0]).map_err(mem_fault)?;
    Ok(needed as i32)
}

pub fn sys_readlink(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let path = ctx
        .memory
        .borrow_mut()
        .read_string(args[0])
        .map_err(mem_fault)?;
    let buf_ptr = args[1];
    let bufsize = args[2] as usize;
    let _ = emu;
    if path != "/proc/self/exe" {
        return Ok(Errno::Einval.ret());
    }
    let exe = ctx.loader.exe.clone();
    let n = exe.len().min(bufsize);
    ctx.memory
        .borrow_mut()
        .write(buf_ptr, &exe.as_bytes()[..n])
        .map_err(mem_fault)?;
    Ok(n as i32)
}

// ----------------------------------------------------------------------
// Signals
// ----------------------------------------------------------------------

pub fn sys_kill(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let pid = args[0] as i32;
    let sig = args[1] as i32;
    log::debug!("  pid={}, sig={} ({})", pid, sig, SIGNALS.value_name(sig as u32));
    if !(1..=64).contains(&sig) {
        return Ok(Errno::Einval.ret());
    }
    if pid == ctx.pid {
        ctx.signal_mask.set_pending(sig);
        return Ok(0);
    }
    if emu.post_signal(pid, sig) {
        Ok(0)
    } else {
        Ok(Errno::Esrch.ret())
    }
}

pub fn sys_tgkill(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    // tgkill(tgid, tid, sig): the thread id is what identifies the
    // context here.
    let forwarded = [args[1], args[2], 0, 0, 0, 0];
    sys_kill(emu, ctx, &forwarded)
}

pub fn sys_rt_sigaction(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let sig = args[0] as i32;
    let act_ptr = args[1];
    let old_act_ptr = args[2];
    log::debug!(
        "  sig={} ({}), act_ptr={:#x}, old_act_ptr={:#x}",
        sig,
        SIGNALS.value_name(sig as u32),
        act_ptr,
        old_act_ptr
    );
    let _ = emu;
    if !(1..=64).contains(&sig) {
        return Err(SimError::UnsupportedFeature(format!(
            "rt_sigaction: invalid signal {}",
            sig
        )));
    }

    let new_handler = if act_ptr != 0 {
        Some(
            SignalHandlerTable::read_sigaction(&mut ctx.memory.borrow_mut(), act_ptr)
                .map_err(mem_fault)?,
        )
    } else {
        None
    };

    if old_act_ptr != 0 {
        let old = *ctx.signal_handlers.borrow().get(sig);
        SignalHandlerTable::write_sigaction(&mut ctx.memory.borrow_mut(), old_act_ptr, &old)
            .map_err(mem_fault)?;
    }

    if let Some(handler) = new_handler {
        log::debug!("  handler={:#x} flags={:#x}", handler.handler, handler.flags);
        ctx.signal_handlers.borrow_mut().set(sig, handler);
    }
    Ok(0)
}

pub fn sys_rt_sigprocmask(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let how = args[0];
    let set_ptr = args[1];
    let old_set_ptr = args[2];
    log::debug!("  how={}, set_ptr={:#x}, old_set_ptr={:#x}", how, set_ptr, old_set_ptr);
    let _ = emu;

    let old = ctx.signal_mask.blocked;

    if set_ptr != 0 {
        let (lo, hi) = {
            let mut mem = ctx.memory.borrow_mut();
            (
                mem.read_u32(set_ptr).map_err(mem_fault)?,
                mem.read_u32(set_ptr + 4).map_err(mem_fault)?,
            )
        };
        let set = (u64::from(hi) << 32) | u64::from(lo);
        match how {
            // SIG_BLOCK
            0 => ctx.signal_mask.blocked |= set,
            // SIG_UNBLOCK
            1 => ctx.signal_mask.blocked &= !set,
            // SIG_SETMASK
            2 => ctx.signal_mask.blocked = set,
            _ => {
                return Err(SimError::UnsupportedFeature(format!(
                    "rt_sigprocmask how={}",
                    how
                )))
            }
        }
    }

    if old_set_ptr != 0 {
        let mut mem = ctx.memory.borrow_mut();
        mem.write_u32(old_set_ptr, old as u32).map_err(mem_fault)?;
        mem.write_u32(old_set_ptr + 4, (old >> 32) as u32)
            .map_err(mem_fault)?;
    }
    // Unblocking may make a pending signal deliverable; the per-tick
    // poller picks it up before the next instruction.
    Ok(0)
}

pub fn sys_rt_sigsuspend(_emu: &mut Emu, _ctx: &mut Context, _args: &Args) -> SysResult {
    Err(SimError::UnsupportedFeature("rt_sigsuspend".into()))
}

pub fn sys_sigreturn(emu: &mut Emu, ctx: &mut Context, _args: &Args) -> SysResult {
    let frame = match ctx.signal_mask.frame.take() {
        Some(f) => f,
        None => {
            return Err(SimError::UnsupportedFeature(
                "sigreturn outside a signal handler".into(),
            ))
        }
    };
    log::debug!("  returning from handler for signal {}", frame.sig);
    ctx.regs = frame.regs;
    ctx.signal_mask.blocked = frame.blocked;
    ctx.clear_state(state::HANDLER);
    let _ = emu;
    Ok(0)
}

// ----------------------------------------------------------------------
// Threads
// ----------------------------------------------------------------------

const CLONE_VM: u32 = 0x0000_0100;
const CLONE_FS: u32 = 0x0000_0200;
const CLONE_FILES: u32 = 0x0000_0400;
const CLONE_SIGHAND: u32 = 0x0000_0800;
const CLONE_THREAD: u32 = 0x0001_0000;
const CLONE_SYSVSEM: u32 = 0x0004_0000;
const CLONE_SETTLS: u32 = 0x0008_0000;
const CLONE_PARENT_SETTID: u32 = 0x0010_0000;
const CLONE_CHILD_CLEARTID: u32 = 0x0020_0000;
const CLONE_CHILD_SETTID: u32 = 0x0100_0000;

const CLONE_SUPPORTED: u32 = CLONE_VM
    | CLONE_FS
    | CLONE_FILES
    | CLONE_SIGHAND
    | CLONE_THREAD
    | CLONE_SYSVSEM
    | CLONE_SETTLS
    | CLONE_PARENT_SETTID
    | CLONE_CHILD_CLEARTID
    | CLONE_CHILD_SETTID;

pub fn sys_clone(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let mut flags = args[0];
    let new_sp = args[1];
    let parent_tid_ptr = args[2];
    let tls_ptr = args[3];
    let child_tid_ptr = args[4];

    let exit_signal = (flags & 0xff) as i32;
    flags &= !0xff;

    log::debug!(
        "  flags={}, newsp={:#x}, ptid={:#x}, ctid={:#x}",
        CLONE_FLAGS.flags_name(flags),
        new_sp,
        parent_tid_ptr,
        child_tid_ptr
    );
    log::debug!("  exit_signal={} ({})", exit_signal, SIGNALS.value_name(exit_signal as u32));

    if flags & !CLONE_SUPPORTED != 0 {
        return Err(SimError::UnsupportedFeature(format!(
            "clone flags {}",
            CLONE_FLAGS.flags_name(flags & !CLONE_SUPPORTED)
        )));
    }

    let new_sp = if new_sp == 0 { ctx.regs.sp() } else { new_sp };
    let child_pid = emu.new_pid();

    let shared_vm = flags & CLONE_VM != 0;
    let fs_files_sighand = CLONE_FS | CLONE_FILES | CLONE_SIGHAND;
    let mut child = if shared_vm {
        if flags & fs_files_sighand != fs_files_sighand {
            return Err(SimError::UnsupportedFeature(
                "clone: CLONE_VM requires CLONE_FS|CLONE_FILES|CLONE_SIGHAND".into(),
            ));
        }
        ctx.clone_from(child_pid)
    } else {
        if flags & fs_files_sighand != 0 {
            return Err(SimError::UnsupportedFeature(
                "clone: CLONE_FS/FILES/SIGHAND without CLONE_VM".into(),
            ));
        }
        ctx.fork_from(child_pid)
    };
    child.parent = Some(ctx.pid);

    if flags & CLONE_THREAD != 0 {
        child.exit_signal = 0;
        child.group_parent = Some(ctx.group_parent.unwrap_or(ctx.pid));
    } else {
        child.exit_signal = exit_signal;
        child.group_parent = None;
    }

    if flags & CLONE_PARENT_SETTID != 0 {
        ctx.memory
            .borrow_mut()
            .write_u32(parent_tid_ptr, child_pid as u32)
            .map_err(mem_fault)?;
    }
    if flags & CLONE_CHILD_SETTID != 0 {
        child
            .memory
            .borrow_mut()
            .write_u32(child_tid_ptr, child_pid as u32)
            .map_err(mem_fault)?;
    }
    if flags & CLONE_CHILD_CLEARTID != 0 {
        child.clear_child_tid = child_tid_ptr;
    }

    if flags & CLONE_SETTLS != 0 {
        match ctx.isa() {
            // MIPS passes the thread pointer directly.
            crate::isa::IsaKind::Mips => {
                child.glibc_segment_base = tls_ptr;
            }
            // x86 passes a user_desc describing the TLS segment; the
            // entry number is forced to 6 and written back.
            crate::isa::IsaKind::X86 => {
                let mut desc =
                    UserDesc::read(&mut ctx.memory.borrow_mut(), tls_ptr).map_err(mem_fault)?;
                log::debug!(
                    "  tls: entry_number={:#x}, base_addr={:#x}, limit={:#x}",
                    desc.entry_number,
                    desc.base_addr,
                    desc.limit
                );
                if !desc.seg_32bit {
                    return Err(SimError::UnsupportedFeature(
                        "clone: only 32-bit TLS segments".into(),
                    ));
                }
                if desc.limit_in_pages {
                    desc.limit <<= 12;
                }
                UserDesc::write_entry_number(&mut ctx.memory.borrow_mut(), tls_ptr, 6)
                    .map_err(mem_fault)?;
                child.glibc_segment_base = desc.base_addr;
                child.glibc_segment_limit = desc.limit;
            }
        }
    }

    child.regs.set_sp(new_sp);
    child.regs.set_syscall_ret(0);

    log::debug!("  context created with pid {}", child_pid);
    emu.add_context(child);
    Ok(child_pid)
}

pub fn sys_set_tid_address(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let tid_ptr = args[0];
    log::debug!("  tidptr={:#x}", tid_ptr);
    let _ = emu;
    ctx.clear_child_tid = tid_ptr;
    Ok(ctx.pid)
}

pub fn sys_set_thread_area(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let uinfo_ptr = args[0];
    log::debug!("  uinfo_ptr={:#x}", uinfo_ptr);
    let _ = emu;

    // MIPS installs the thread pointer directly (read back by rdhwr).
    if ctx.isa() == crate::isa::IsaKind::Mips {
        ctx.glibc_segment_base = uinfo_ptr;
        return Ok(0);
    }

    let mut desc = UserDesc::read(&mut ctx.memory.borrow_mut(), uinfo_ptr).map_err(mem_fault)?;
    log::debug!(
        "  entry_number={:#x}, base_addr={:#x}, limit={:#x}",
        desc.entry_number,
        desc.base_addr,
        desc.limit
    );
    if !desc.seg_32bit {
        return Err(SimError::UnsupportedFeature(
            "set_thread_area: only 32-bit segments".into(),
        ));
    }
    if desc.limit_in_pages {
        desc.limit <<= 12;
    }

    if desc.entry_number == u32::MAX {
        if ctx.glibc_segment_base != 0 {
            return Err(SimError::UnsupportedFeature(
                "set_thread_area: segment already set".into(),
            ));
        }
        UserDesc::write_entry_number(&mut ctx.memory.borrow_mut(), uinfo_ptr, 6)
            .map_err(mem_fault)?;
    } else {
        if desc.entry_number != 6 {
            return Err(SimError::UnsupportedFeature(
                "set_thread_area: invalid entry number".into(),
            ));
        }
        if ctx.glibc_segment_base == 0 {
            return Err(SimError::UnsupportedFeature(
                "set_thread_area: segment not set".into(),
            ));
        }
    }
    ctx.glibc_segment_base = desc.base_addr;
    ctx.glibc_segment_limit = desc.limit;
    Ok(0)
}

// ----------------------------------------------------------------------
// Futex
// ----------------------------------------------------------------------

pub fn sys_futex(emu: &mut Emu, ctx: &mut Context, args: &Args) -> SysResult {
    let addr1 = args[0];
    let op = args[1];
    let val1 = args[2] as i32;
    let timeout_ptr = args[3];
    let addr2 = args[4];
    let val3 = args[5];

    // Strip FUTEX_PRIVATE_FLAG (128) and FUTEX_CLOCK_REALTIME (256).
    let cmd = op & !(256 | 128);
    let word = ctx
        .memory
        .borrow_mut()
        .read_u32(addr1)
        .map_err(mem_fault)?;
    log::debug!(
        "  addr1={:#x}, op={}, val1={}, ptimeout={:#x}, addr2={:#x}, val3={:#x}",
        addr1,
        op,
        val1,
        timeout_ptr,
        addr2,
        val3
    );
    log::debug!("  futex={}, cmd={} ({})", word, cmd, FUTEX_CMDS.value_name(cmd));

    match cmd {
        // FUTEX_WAIT / FUTEX_WAIT_BITSET
        0 | 9 => {
            let bitset = if cmd == 9 { val3 } else { 0xffff_ffff };
            if word != val1 as u32 {
                return Ok(Errno::Eagain.ret());
            }
            if timeout_ptr != 0 {
                return Err(SimError::UnsupportedFeature(
                    "futex wait with a timeout".into(),
                ));
            }
            ctx.wakeup_futex = addr1;
            ctx.wakeup_futex_bitset = bitset;
            ctx.wakeup_futex_sleep = emu.next_futex_sleep();
            ctx.suspend(state::FUTEX);
            Ok(0)
        }

        // FUTEX_WAKE / FUTEX_WAKE_BITSET
        1 | 10 => {
            let bitset = if cmd == 10 { val3 } else { 0xffff_ffff };
            let woken = emu.futex_wake(addr1, val1, bitset);
            log::debug!("  futex at {:#x}: {} processes woken up", addr1, woken);
            Ok(woken)
        }

        // FUTEX_CMP_REQUEUE
        4 => {
            // The timeout slot is reinterpreted as an integer count; only
            // the INT_MAX form is used by glibc.
            if timeout_ptr != 0x7fff_ffff {
                return Err(SimError::UnsupportedFeature(
                    "futex cmp_requeue with bounded requeue count".into(),
                ));
            }
            if word != val3 {
                return Ok(Errno::Eagain.ret());
            }
            let woken = emu.futex_wake(addr1, val1, 0xffff_ffff);
            let requeued = emu.futex_requeue(addr1, addr2);
            log::debug!(
                "  futex at {:#x}: {} woken, {} requeued to {:#x}",
                addr1,
                woken,
                requeued,
                addr2
            );
            Ok(woken)
        }

        // FUTEX_WAKE_OP
        5 => {
            let wake_op = (val3 >> 28) & 0xf;
            let cmp = (val3 >> 24) & 0xf;
            let oparg = (val3 >> 12) & 0xfff;
            let cmparg = val3 & 0xfff;
            let val2 = timeout_ptr as i32;

            let oldval = ctx
                .memory
                .borrow_mut()
                .read_u32(addr2)
                .map_err(mem_fault)? as i32;
            let newval = match wake_op {
                0 => oparg as i32,
                1 => oldval.wrapping_add(oparg as i32),
                2 => oldval | oparg as i32,
                3 => oldval & oparg as i32,
                4 => oldval ^ oparg as i32,
                _ => {
                    return Err(SimError::UnsupportedFeature(
                        "futex wake_op operation".into(),
                    ))
                }
            };
            ctx.memory
                .borrow_mut()
                .write_u32(addr2, newval as u32)
                .map_err(mem_fault)?;

            let mut woken = emu.futex_wake(addr1, val1, 0xffff_ffff);

            let cond = match cmp {
                0 => oldval == cmparg as i32,
                1 => oldval != cmparg as i32,
                2 => oldval < cmparg as i32,
                3 => oldval <= cmparg as i32,
                4 => oldval > cmparg as i32,
                5 => oldval >= cmparg as i32,
                _ => {
                    return Err(SimError::UnsupportedFeature(
                        "futex wake_op condition".into(),
                    ))
                }
            };
            if cond {
                woken += emu.futex_wake(addr2, val2, 0xffff_ffff);
            }
            Ok(woken)
        }

        _ => Err(SimError::UnsupportedFeature(format!(
            "futex cmd {} ({})",
            cmd,
            FUTEX_CMDS.value_name(cmd)
        ))),
    }
}
