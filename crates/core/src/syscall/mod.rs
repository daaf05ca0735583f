//! Linux-ABI syscall translator.
//!
//! The ISA executor recognises the system-call instruction and enters
//! here. Arguments arrive in ABI-defined registers (MIPS o32: code in
//! `$v0`, arguments in `$a0..$a3` plus the stack; x86: code in `eax`,
//! arguments in `ebx ecx edx esi edi ebp`). Each handler translates
//! pointers and structures between guest and host representations, issues
//! the host call, and returns the integer written back into the ABI
//! return register -- unless it suspended the context, in which case the
//! wakeup path provides the final value.
//!
//! Unimplemented syscalls terminate the run with a diagnostic naming the
//! call; they never silently succeed.

mod handlers;
mod procfs;
mod structs;

pub use handlers::resume_read;
pub use handlers::resume_write;

use crate::common::{Errno, SimError};
use crate::context::regs::mips_abi;
use crate::context::{state, Context, Regs};
use crate::emu::Emu;

/// ISA-independent syscall identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Code {
    Exit,
    Read,
    Write,
    Open,
    Close,
    Waitpid,
    Unlink,
    Time,
    Lseek,
    Getpid,
    Getppid,
    Gettid,
    Getuid,
    Geteuid,
    Getgid,
    Getegid,
    Access,
    Kill,
    Tgkill,
    Dup,
    Pipe,
    Times,
    Brk,
    Ioctl,
    Setrlimit,
    Getrlimit,
    Gettimeofday,
    Readlink,
    Mmap,
    Munmap,
    Mprotect,
    Uname,
    Writev,
    Poll,
    SchedYield,
    Nanosleep,
    Sigreturn,
    RtSigaction,
    RtSigprocmask,
    RtSigsuspend,
    Getcwd,
    Mmap2,
    Stat64,
    Lstat64,
    Fstat64,
    Madvise,
    Fcntl64,
    Futex,
    SetThreadArea,
    Clone,
    ExitGroup,
    SetTidAddress,
    ClockGettime,
    SetRobustList,
}

/// Maps a MIPS o32 syscall number (4000-based) to a unified code.
fn mips_code(n: u32) -> Option<(Code, &'static str)> {
    let entry = match n {
        4001 => (Code::Exit, "exit"),
        4003 => (Code::Read, "read"),
        4004 => (Code::Write, "write"),
        4005 => (Code::Open, "open"),
        4006 => (Code::Close, "close"),
        4007 => (Code::Waitpid, "waitpid"),
        4010 => (Code::Unlink, "unlink"),
        4013 => (Code::Time, "time"),
        4019 => (Code::Lseek, "lseek"),
        4020 => (Code::Getpid, "getpid"),
        4024 => (Code::Getuid, "getuid"),
        4033 => (Code::Access, "access"),
        4037 => (Code::Kill, "kill"),
        4041 => (Code::Dup, "dup"),
        4042 => (Code::Pipe, "pipe"),
        4043 => (Code::Times, "times"),
        4045 => (Code::Brk, "brk"),
        4047 => (Code::Getgid, "getgid"),
        4049 => (Code::Geteuid, "geteuid"),
        4050 => (Code::Getegid, "getegid"),
        4054 => (Code::Ioctl, "ioctl"),
        4064 => (Code::Getppid, "getppid"),
        4075 => (Code::Setrlimit, "setrlimit"),
        4076 => (Code::Getrlimit, "getrlimit"),
        4078 => (Code::Gettimeofday, "gettimeofday"),
        4085 => (Code::Readlink, "readlink"),
        4090 => (Code::Mmap, "mmap"),
        4091 => (Code::Munmap, "munmap"),
        4119 => (Code::Sigreturn, "sigreturn"),
        4120 => (Code::Clone, "clone"),
        4122 => (Code::Uname, "uname"),
        4125 => (Code::Mprotect, "mprotect"),
        4146 => (Code::Writev, "writev"),
        4162 => (Code::Nanosleep, "nanosleep"),
        4166 => (Code::SchedYield, "sched_yield"),
        4188 => (Code::Poll, "poll"),
        4193 => (Code::Sigreturn, "rt_sigreturn"),
        4194 => (Code::RtSigaction, "rt_sigaction"),
        4195 => (Code::RtSigprocmask, "rt_sigprocmask"),
        4199 => (Code::RtSigsuspend, "rt_sigsuspend"),
        4203 => (Code::Getcwd, "getcwd"),
        4210 => (Code::Mmap2, "mmap2"),
        4213 => (Code::Stat64, "stat64"),
        4214 => (Code::Lstat64, "lstat64"),
        4215 => (Code::Fstat64, "fstat64"),
        4218 => (Code::Madvise, "madvise"),
        4220 => (Code::Fcntl64, "fcntl64"),
        4222 => (Code::Gettid, "gettid"),
        4238 => (Code::Futex, "futex"),
        4246 => (Code::ExitGroup, "exit_group"),
        4252 => (Code::SetTidAddress, "set_tid_address"),
        4263 => (Code::ClockGettime, "clock_gettime"),
        4266 => (Code::Tgkill, "tgkill"),
        4283 => (Code::SetThreadArea, "set_thread_area"),
        4309 => (Code::SetRobustList, "set_robust_list"),
        _ => return None,
    };
    Some(entry)
}

/// Maps an i386 syscall number to a unified code.
fn x86_code(n: u32) -> Option<(Code, &'static str)> {
    let entry = match n {
        1 => (Code::Exit, "exit"),
        3 => (Code::Read, "read"),
        4 => (Code::Write, "write"),
        5 => (Code::Open, "open"),
        6 => (Code::Close, "close"),
        7 => (Code::Waitpid, "waitpid"),
        10 => (Code::Unlink, "unlink"),
        13 => (Code::Time, "time"),
        19 => (Code::Lseek, "lseek"),
        20 => (Code::Getpid, "getpid"),
        24 => (Code::Getuid, "getuid"),
        33 => (Code::Access, "access"),
        37 => (Code::Kill, "kill"),
        41 => (Code::Dup, "dup"),
        42 => (Code::Pipe, "pipe"),
        43 => (Code::Times, "times"),
        45 => (Code::Brk, "brk"),
        47 => (Code::Getgid, "getgid"),
        49 => (Code::Geteuid, "geteuid"),
        50 => (Code::Getegid, "getegid"),
        54 => (Code::Ioctl, "ioctl"),
        64 => (Code::Getppid, "getppid"),
        75 => (Code::Setrlimit, "setrlimit"),
        76 => (Code::Getrlimit, "getrlimit"),
        78 => (Code::Gettimeofday, "gettimeofday"),
        85 => (Code::Readlink, "readlink"),
        90 => (Code::Mmap, "mmap"),
        91 => (Code::Munmap, "munmap"),
        102 => return None, // socketcall: no socket surface
        119 => (Code::Sigreturn, "sigreturn"),
        120 => (Code::Clone, "clone"),
        122 => (Code::Uname, "uname"),
        125 => (Code::Mprotect, "mprotect"),
        146 => (Code::Writev, "writev"),
        158 => (Code::SchedYield, "sched_yield"),
        162 => (Code::Nanosleep, "nanosleep"),
        168 => (Code::Poll, "poll"),
        173 => (Code::Sigreturn, "rt_sigreturn"),
        174 => (Code::RtSigaction, "rt_sigaction"),
        175 => (Code::RtSigprocmask, "rt_sigprocmask"),
        179 => (Code::RtSigsuspend, "rt_sigsuspend"),
        183 => (Code::Getcwd, "getcwd"),
        191 => (Code::Getrlimit, "ugetrlimit"),
        192 => (Code::Mmap2, "mmap2"),
        195 => (Code::Stat64, "stat64"),
        196 => (Code::Lstat64, "lstat64"),
        197 => (Code::Fstat64, "fstat64"),
        199 => (Code::Getuid, "getuid32"),
        200 => (Code::Getgid, "getgid32"),
        201 => (Code::Geteuid, "geteuid32"),
        202 => (Code::Getegid, "getegid32"),
        219 => (Code::Madvise, "madvise"),
        221 => (Code::Fcntl64, "fcntl64"),
        224 => (Code::Gettid, "gettid"),
        240 => (Code::Futex, "futex"),
        243 => (Code::SetThreadArea, "set_thread_area"),
        252 => (Code::ExitGroup, "exit_group"),
        258 => (Code::SetTidAddress, "set_tid_address"),
        265 => (Code::ClockGettime, "clock_gettime"),
        270 => (Code::Tgkill, "tgkill"),
        311 => (Code::SetRobustList, "set_robust_list"),
        _ => return None,
    };
    Some(entry)
}

/// Reads (code, args) per the context's ABI. MIPS o32 passes arguments
/// five and six on the stack.
pub(crate) fn read_abi(ctx: &mut Context) -> Result<(u32, [u32; 6]), SimError> {
    match &ctx.regs {
        Regs::Mips(r) => {
            let code = r.read(mips_abi::V0);
            let sp = r.read(mips_abi::SP);
            let mut args = [
                r.read(mips_abi::A0),
                r.read(mips_abi::A1),
                r.read(mips_abi::A2),
                r.read(mips_abi::A3),
                0,
                0,
            ];
            let mut mem = ctx.memory.borrow_mut();
            // Stack slots 16 and 20 hold the fifth and sixth arguments;
            // reading may fail for syscalls that take fewer, so fall back
            // to zero.
            args[4] = mem.read_u32(sp.wrapping_add(16)).unwrap_or(0);
            args[5] = mem.read_u32(sp.wrapping_add(20)).unwrap_or(0);
            Ok((code, args))
        }
        Regs::X86(r) => Ok((
            r.eax,
            [r.ebx, r.ecx, r.edx, r.esi, r.edi, r.ebp],
        )),
    }
}

/// Executes the system call the context just trapped into.
pub fn execute(emu: &mut Emu, ctx: &mut Context) -> Result<(), SimError> {
    let (raw, args) = read_abi(ctx)?;
    let mapped = match ctx.isa() {
        crate::isa::IsaKind::Mips => mips_code(raw),
        crate::isa::IsaKind::X86 => x86_code(raw),
    };
    let (code, name) = match mapped {
        Some(entry) => entry,
        None => {
            return Err(SimError::UnimplementedSyscall {
                code: raw,
                name: "unknown",
            })
        }
    };

    log::debug!(
        "system call '{}' (code {}, inst {}, pid {})",
        name,
        raw,
        emu.stats.instructions,
        ctx.pid
    );
    emu.stats.syscalls += 1;

    let ret = dispatch(emu, ctx, code, &args)?;

    // The return register is written unless the context suspended (the
    // wakeup routine provides the value) or the call was sigreturn (the
    // restored frame already holds it).
    if code != Code::Sigreturn && !ctx.has_state(state::SUSPENDED) {
        ctx.regs.set_syscall_ret(ret);
    }

    if ret < 0 && -ret <= crate::common::errno::ERRNO_MAX {
        log::debug!("  ret = ({}, {:#x}, errno = {})", ret, ret, Errno::name(-ret));
    } else {
        log::debug!("  ret = ({}, {:#x})", ret, ret as u32);
    }
    Ok(())
}

fn dispatch(emu: &mut Emu, ctx: &mut Context, code: Code, args: &[u32; 6]) -> Result<i32, SimError> {
    use handlers as h;
    match code {
        Code::Exit => h::sys_exit(emu, ctx, args),
        Code::Read => h::sys_read(emu, ctx, args),
        Code::Write => h::sys_write(emu, ctx, args),
        Code::Open => h::sys_open(emu, ctx, args),
        Code::Close => h::sys_close(emu, ctx, args),
        Code::Waitpid => h::sys_waitpid(emu, ctx, args),
        Code::Unlink => h::sys_unlink(emu, ctx, args),
        Code::Time => h::sys_time(emu, ctx, args),
        Code::Lseek => h::sys_lseek(emu, ctx, args),
        Code::Getpid => Ok(ctx.pid),
        Code::Getppid => Ok(ctx.parent.unwrap_or(1)),
        Code::Gettid => Ok(ctx.pid),
        Code::Getuid | Code::Geteuid => Ok(1000),
        Code::Getgid | Code::Getegid => Ok(1000),
        Code::Access => h::sys_access(emu, ctx, args),
        Code::Kill => h::sys_kill(emu, ctx, args),
        Code::Tgkill => h::sys_tgkill(emu, ctx, args),
        Code::Dup => h::sys_dup(emu, ctx, args),
        Code::Pipe => h::sys_pipe(emu, ctx, args),
        Code::Times => h::sys_times(emu, ctx, args),
        Code::Brk => h::sys_brk(emu, ctx, args),
        Code::Ioctl => h::sys_ioctl(emu, ctx, args),
        Code::Setrlimit => h::sys_setrlimit(emu, ctx, args),
        Code::Getrlimit => h::sys_getrlimit(emu, ctx, args),
        Code::Gettimeofday => h::sys_gettimeofday(emu, ctx, args),
        Code::Readlink => h::sys_readlink(emu, ctx, args),
        Code::Mmap => h::sys_mmap(emu, ctx, args),
        Code::Munmap => h::sys_munmap(emu, ctx, args),
        Code::Mprotect => h::sys_mprotect(emu, ctx, args),
        Code::Uname => h::sys_uname(emu, ctx, args),
        Code::Writev => h::sys_writev(emu, ctx, args),
        Code::Poll => h::sys_poll(emu, ctx, args),
        Code::SchedYield => Ok(0),
        Code::Nanosleep => h::sys_nanosleep(emu, ctx, args),
        Code::Sigreturn => h::sys_sigreturn(emu, ctx, args),
        Code::RtSigaction => h::sys_rt_sigaction(emu, ctx, args),
        Code::RtSigprocmask => h::sys_rt_sigprocmask(emu, ctx, args),
        Code::RtSigsuspend => h::sys_rt_sigsuspend(emu, ctx, args),
        Code::Getcwd => h::sys_getcwd(emu, ctx, args),
        Code::Mmap2 => h::sys_mmap2(emu, ctx, args),
        Code::Stat64 => h::sys_stat64(emu, ctx, args),
        Code::Lstat64 => h::sys_lstat64(emu, ctx, args),
        Code::Fstat64 => h::sys_fstat64(emu, ctx, args),
        Code::Madvise => Ok(0),
        Code::Fcntl64 => h::sys_fcntl64(emu, ctx, args),
        Code::Futex => h::sys_futex(emu, ctx, args),
        Code::SetThreadArea => h::sys_set_thread_area(emu, ctx, args),
        Code::Clone => h::sys_clone(emu, ctx, args),
        Code::ExitGroup => h::sys_exit_group(emu, ctx, args),
        Code::SetTidAddress => h::sys_set_tid_address(emu, ctx, args),
        Code::ClockGettime => h::sys_clock_gettime(emu, ctx, args),
        Code::SetRobustList => Ok(0),
    }
}
