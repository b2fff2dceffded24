//! Syscall classification tables and number-to-name resolution.

use std::borrow::Cow;

/// Largest task id the kernel can hand out.
pub const MAX_PID: i32 = i32::MAX;

/// True for syscalls that may create a new task (thread or process).
pub fn generates_child(no: i64) -> bool {
    #[cfg(target_arch = "x86_64")]
    if no == libc::SYS_fork || no == libc::SYS_vfork {
        return true;
    }
    no == libc::SYS_clone || no == libc::SYS_clone3
}

/// True for syscalls that terminate the calling task.
pub fn terminates_task(no: i64) -> bool {
    no == libc::SYS_exit || no == libc::SYS_exit_group
}

/// True for syscalls that never return to the call site, hence never produce
/// an exit notification. A failed execve does return, so it is not listed.
pub fn never_returns(no: i64) -> bool {
    no == libc::SYS_rt_sigreturn
}

/// Resolve a syscall number to its name, falling back to `syscall_<n>` for
/// numbers outside the table.
pub fn name(no: i64) -> Cow<'static, str> {
    let known = match no {
        libc::SYS_read => "read",
        libc::SYS_write => "write",
        libc::SYS_close => "close",
        libc::SYS_lseek => "lseek",
        libc::SYS_mmap => "mmap",
        libc::SYS_mprotect => "mprotect",
        libc::SYS_munmap => "munmap",
        libc::SYS_brk => "brk",
        libc::SYS_rt_sigaction => "rt_sigaction",
        libc::SYS_rt_sigprocmask => "rt_sigprocmask",
        libc::SYS_rt_sigreturn => "rt_sigreturn",
        libc::SYS_ioctl => "ioctl",
        libc::SYS_pread64 => "pread64",
        libc::SYS_pwrite64 => "pwrite64",
        libc::SYS_readv => "readv",
        libc::SYS_writev => "writev",
        libc::SYS_sched_yield => "sched_yield",
        libc::SYS_mremap => "mremap",
        libc::SYS_msync => "msync",
        libc::SYS_madvise => "madvise",
        libc::SYS_dup => "dup",
        libc::SYS_nanosleep => "nanosleep",
        libc::SYS_getpid => "getpid",
        libc::SYS_socket => "socket",
        libc::SYS_connect => "connect",
        libc::SYS_accept => "accept",
        libc::SYS_sendto => "sendto",
        libc::SYS_recvfrom => "recvfrom",
        libc::SYS_sendmsg => "sendmsg",
        libc::SYS_recvmsg => "recvmsg",
        libc::SYS_shutdown => "shutdown",
        libc::SYS_bind => "bind",
        libc::SYS_listen => "listen",
        libc::SYS_getsockname => "getsockname",
        libc::SYS_getpeername => "getpeername",
        libc::SYS_socketpair => "socketpair",
        libc::SYS_setsockopt => "setsockopt",
        libc::SYS_getsockopt => "getsockopt",
        libc::SYS_clone => "clone",
        libc::SYS_clone3 => "clone3",
        libc::SYS_execve => "execve",
        libc::SYS_execveat => "execveat",
        libc::SYS_exit => "exit",
        libc::SYS_exit_group => "exit_group",
        libc::SYS_wait4 => "wait4",
        libc::SYS_kill => "kill",
        libc::SYS_uname => "uname",
        libc::SYS_fcntl => "fcntl",
        libc::SYS_flock => "flock",
        libc::SYS_fsync => "fsync",
        libc::SYS_ftruncate => "ftruncate",
        libc::SYS_getcwd => "getcwd",
        libc::SYS_chdir => "chdir",
        libc::SYS_fchdir => "fchdir",
        libc::SYS_fchmod => "fchmod",
        libc::SYS_fchown => "fchown",
        libc::SYS_umask => "umask",
        libc::SYS_gettimeofday => "gettimeofday",
        libc::SYS_getrlimit => "getrlimit",
        libc::SYS_getrusage => "getrusage",
        libc::SYS_sysinfo => "sysinfo",
        libc::SYS_times => "times",
        libc::SYS_ptrace => "ptrace",
        libc::SYS_getuid => "getuid",
        libc::SYS_getgid => "getgid",
        libc::SYS_setuid => "setuid",
        libc::SYS_setgid => "setgid",
        libc::SYS_geteuid => "geteuid",
        libc::SYS_getegid => "getegid",
        libc::SYS_getppid => "getppid",
        libc::SYS_setsid => "setsid",
        libc::SYS_getsid => "getsid",
        libc::SYS_gettid => "gettid",
        libc::SYS_futex => "futex",
        libc::SYS_sched_getaffinity => "sched_getaffinity",
        libc::SYS_sched_setaffinity => "sched_setaffinity",
        libc::SYS_getdents64 => "getdents64",
        libc::SYS_set_tid_address => "set_tid_address",
        libc::SYS_fadvise64 => "fadvise64",
        libc::SYS_clock_gettime => "clock_gettime",
        libc::SYS_clock_getres => "clock_getres",
        libc::SYS_clock_nanosleep => "clock_nanosleep",
        libc::SYS_epoll_ctl => "epoll_ctl",
        libc::SYS_tgkill => "tgkill",
        libc::SYS_openat => "openat",
        libc::SYS_mkdirat => "mkdirat",
        libc::SYS_fchownat => "fchownat",
        libc::SYS_newfstatat => "newfstatat",
        libc::SYS_unlinkat => "unlinkat",
        libc::SYS_renameat => "renameat",
        libc::SYS_linkat => "linkat",
        libc::SYS_symlinkat => "symlinkat",
        libc::SYS_readlinkat => "readlinkat",
        libc::SYS_fchmodat => "fchmodat",
        libc::SYS_faccessat => "faccessat",
        libc::SYS_faccessat2 => "faccessat2",
        libc::SYS_pselect6 => "pselect6",
        libc::SYS_ppoll => "ppoll",
        libc::SYS_set_robust_list => "set_robust_list",
        libc::SYS_get_robust_list => "get_robust_list",
        libc::SYS_utimensat => "utimensat",
        libc::SYS_epoll_pwait => "epoll_pwait",
        libc::SYS_timerfd_create => "timerfd_create",
        libc::SYS_eventfd2 => "eventfd2",
        libc::SYS_epoll_create1 => "epoll_create1",
        libc::SYS_dup3 => "dup3",
        libc::SYS_pipe2 => "pipe2",
        libc::SYS_prlimit64 => "prlimit64",
        libc::SYS_getrandom => "getrandom",
        libc::SYS_memfd_create => "memfd_create",
        libc::SYS_statx => "statx",
        libc::SYS_rseq => "rseq",
        libc::SYS_openat2 => "openat2",
        libc::SYS_pidfd_open => "pidfd_open",
        libc::SYS_close_range => "close_range",
        libc::SYS_prctl => "prctl",
        libc::SYS_setpgid => "setpgid",
        libc::SYS_getpgid => "getpgid",
        libc::SYS_capget => "capget",
        libc::SYS_capset => "capset",
        libc::SYS_sigaltstack => "sigaltstack",
        libc::SYS_personality => "personality",
        libc::SYS_statfs => "statfs",
        libc::SYS_fstatfs => "fstatfs",
        libc::SYS_sync => "sync",
        libc::SYS_mount => "mount",
        libc::SYS_umount2 => "umount2",
        libc::SYS_sethostname => "sethostname",
        libc::SYS_setdomainname => "setdomainname",
        libc::SYS_init_module => "init_module",
        libc::SYS_delete_module => "delete_module",
        libc::SYS_quotactl => "quotactl",
        _ => "",
    };
    if !known.is_empty() {
        return Cow::Borrowed(known);
    }

    #[cfg(target_arch = "x86_64")]
    {
        let legacy = match no {
            libc::SYS_open => "open",
            libc::SYS_stat => "stat",
            libc::SYS_fstat => "fstat",
            libc::SYS_lstat => "lstat",
            libc::SYS_poll => "poll",
            libc::SYS_access => "access",
            libc::SYS_pipe => "pipe",
            libc::SYS_select => "select",
            libc::SYS_dup2 => "dup2",
            libc::SYS_pause => "pause",
            libc::SYS_alarm => "alarm",
            libc::SYS_fork => "fork",
            libc::SYS_vfork => "vfork",
            libc::SYS_unlink => "unlink",
            libc::SYS_readlink => "readlink",
            libc::SYS_mkdir => "mkdir",
            libc::SYS_rmdir => "rmdir",
            libc::SYS_creat => "creat",
            libc::SYS_rename => "rename",
            libc::SYS_chmod => "chmod",
            libc::SYS_chown => "chown",
            libc::SYS_epoll_create => "epoll_create",
            libc::SYS_epoll_wait => "epoll_wait",
            libc::SYS_arch_prctl => "arch_prctl",
            libc::SYS_time => "time",
            libc::SYS_utime => "utime",
            _ => "",
        };
        if !legacy.is_empty() {
            return Cow::Borrowed(legacy);
        }
    }

    Cow::Owned(format!("syscall_{no}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_common_names() {
        assert_eq!(name(libc::SYS_write), "write");
        assert_eq!(name(libc::SYS_execve), "execve");
        assert_eq!(name(libc::SYS_exit_group), "exit_group");
    }

    #[test]
    fn unknown_numbers_fall_back() {
        assert_eq!(name(99_999), "syscall_99999");
    }

    #[test]
    fn classification() {
        assert!(generates_child(libc::SYS_clone));
        assert!(terminates_task(libc::SYS_exit_group));
        assert!(never_returns(libc::SYS_rt_sigreturn));
        assert!(!generates_child(libc::SYS_write));
        assert!(!never_returns(libc::SYS_write));
    }
}
