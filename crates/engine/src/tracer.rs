//! Per-task ptrace state machine.
//!
//! A `Tracer` manages exactly one kernel task through its syscall lifecycle:
//! `init` starts or attaches, `handle` classifies one `waitpid` status, and
//! `proceed` releases a tracee suspended at an authorised syscall entry.
//! Every ptrace operation on the tracee must happen on the worker thread;
//! two consecutive `handle` or `proceed` calls for the same stop never occur.

use crate::error::Error;
use crate::notification::{
    ChildSpawn, ProcessNotification, SyscallEntry, SyscallExit, Termination,
};
use crate::registers::Registers;
use crate::stack::{Backtracer, LibunwindBacktracer, PcSpBacktracer, StackFrame};
use crate::syscalls;
use config::Trace;
use nix::sys::ptrace::{self, Event, Options};
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Result of feeding one `waitpid` status to [`Tracer::handle`].
#[derive(Debug)]
pub enum HandleOutcome {
    /// The stop was consumed internally (signal injection, uninteresting
    /// event); the tracee is running again.
    Resumed,
    /// A notification is ready for the consumer. An entry leaves the tracee
    /// suspended until authorised; an exit has already been released.
    Notify(ProcessNotification),
    /// A clone/fork/vfork completed; the manager must install a tracer for
    /// the new task. The tracee is running again.
    ChildSpawned { child_pid: Pid, child_spid: Pid },
    /// A successful execve changed the process image; the manager must
    /// update the executable name and retire sibling tracers.
    Execve { pid: Pid },
    /// The tracee is about to die; a death status will follow.
    ImminentExit(Termination),
    /// The tracee is gone. The manager removes the tracer.
    Exited(Termination),
    /// A stop arrived for a tracee already known to be dead.
    AlreadyGone,
}

pub struct Tracer {
    executable: Arc<str>,
    pid: Pid,
    spid: Pid,
    options: Option<Options>,
    collect_backtrace: bool,
    backtracer: Box<dyn Backtracer>,
    running: bool,
    attached: bool,
    retired: bool,
    entry: Option<SyscallEntry>,
    termination: Option<Termination>,
    pending_execve: Option<String>,
    pc_base: u64,
    epoch: Instant,
}

fn ptrace_options(trace: &Trace) -> Options {
    // SIGTRAP|0x80 on syscall stops, plus pre-death and post-exec events.
    let mut options =
        Options::PTRACE_O_TRACESYSGOOD | Options::PTRACE_O_TRACEEXIT | Options::PTRACE_O_TRACEEXEC;
    if trace.follow_children {
        // Extra notification just before a fork/vfork returns.
        options |= Options::PTRACE_O_TRACEFORK | Options::PTRACE_O_TRACEVFORK;
    }
    if trace.follow_threads {
        // Extra notification just before a clone returns.
        options |= Options::PTRACE_O_TRACECLONE;
    }
    if trace.jail {
        // The kernel kills the tracee if this process dies.
        options |= Options::PTRACE_O_EXITKILL;
    }
    options
}

fn new_backtracer(collect_backtrace: bool, spid: Pid) -> Result<Box<dyn Backtracer>, Error> {
    if collect_backtrace {
        Ok(Box::new(LibunwindBacktracer::new(spid)?))
    } else {
        Ok(Box::new(PcSpBacktracer))
    }
}

/// How a `SIGTRAP|0x80` stop relates to the pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyscallStop {
    /// No pending entry: a fresh entry.
    Entry,
    /// The pending entry cannot be completed by this stop (the call never
    /// returns, or the kernel restarted after a signal): drop it and treat
    /// the stop as a fresh entry.
    DiscardedEntry,
    /// The matching exit of the pending entry.
    Exit,
}

fn classify_syscall_stop(pending: Option<i64>, incoming: i64) -> SyscallStop {
    match pending {
        None => SyscallStop::Entry,
        Some(expected) if syscalls::never_returns(expected) => SyscallStop::DiscardedEntry,
        Some(expected) if expected != incoming => SyscallStop::DiscardedEntry,
        Some(_) => SyscallStop::Exit,
    }
}

impl Tracer {
    /// Fork and exec a new traced process. The child arms `PTRACE_TRACEME`
    /// before exec, so its first stop is the post-exec trap consumed by
    /// [`Tracer::init`].
    pub fn launch(
        program: impl Into<PathBuf>,
        args: &[String],
        trace: &Trace,
        epoch: Instant,
    ) -> Result<Self, Error> {
        let program = program.into();
        let mut command = Command::new(&program);
        command.args(args);
        unsafe {
            command.pre_exec(|| {
                // The worker blocks its wake-up signals and the child
                // inherits that mask across exec; the tracee must start with
                // a clean one.
                nix::sys::signal::sigprocmask(
                    nix::sys::signal::SigmaskHow::SIG_SETMASK,
                    Some(&nix::sys::signal::SigSet::empty()),
                    None,
                )
                .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
                ptrace::traceme().map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
            });
        }
        let child = command.spawn().map_err(|source| Error::Launch {
            program: program.clone(),
            source,
        })?;
        let spid = Pid::from_raw(child.id() as i32);
        info!(program = %program.display(), spid = spid.as_raw(), "tracee launched");
        Ok(Self {
            executable: Arc::from(program.to_string_lossy().as_ref()),
            pid: spid,
            spid,
            options: Some(ptrace_options(trace)),
            collect_backtrace: trace.backtrace,
            backtracer: new_backtracer(trace.backtrace, spid)?,
            running: true,
            attached: true,
            retired: false,
            entry: None,
            termination: None,
            pending_execve: None,
            pc_base: 0,
            epoch,
        })
    }

    /// Prepare a tracer for an already-running task. The actual
    /// `PTRACE_ATTACH` happens in [`Tracer::init`] on the worker thread.
    pub fn attach(spid: i32, trace: &Trace, epoch: Instant) -> Result<Self, Error> {
        let exe = procfs::process::Process::new(spid)
            .and_then(|p| p.exe())
            .map_err(|source| Error::ResolveExecutable { spid, source })?;
        let spid = Pid::from_raw(spid);
        // Pid and spid coincide: tracing effectively begins at the first
        // execve observed after the attach.
        Ok(Self {
            executable: Arc::from(exe.to_string_lossy().as_ref()),
            pid: spid,
            spid,
            options: Some(ptrace_options(trace)),
            collect_backtrace: trace.backtrace,
            backtracer: new_backtracer(trace.backtrace, spid)?,
            running: true,
            attached: false,
            retired: false,
            entry: None,
            termination: None,
            pending_execve: None,
            pc_base: 0,
            epoch,
        })
    }

    /// Like [`Tracer::attach`] but with the ptrace options left unset;
    /// `init` refuses to run until [`Tracer::set_options`] is called.
    pub fn attach_unconfigured(spid: i32, epoch: Instant) -> Result<Self, Error> {
        let mut tracer = Self::attach(spid, &Trace::default(), epoch)?;
        tracer.options = None;
        Ok(tracer)
    }

    /// Clone an existing tracer for a newly spawned task. Options and the
    /// executable name carry over; per-tracee state starts fresh.
    pub fn fork_child(&self, pid: Pid, spid: Pid) -> Result<Self, Error> {
        debug_assert!(pid.as_raw() > 0 && pid.as_raw() < syscalls::MAX_PID);
        debug_assert!(spid.as_raw() > 0 && spid.as_raw() < syscalls::MAX_PID);
        Ok(Self {
            executable: self.executable.clone(),
            pid,
            spid,
            options: self.options,
            collect_backtrace: self.collect_backtrace,
            backtracer: new_backtracer(self.collect_backtrace, spid)?,
            running: true,
            attached: true,
            retired: false,
            entry: None,
            termination: None,
            pending_execve: None,
            pc_base: 0,
            epoch: self.epoch,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn spid(&self) -> Pid {
        self.spid
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub(crate) fn set_executable(&mut self, name: &str) {
        debug_assert!(!name.is_empty());
        self.executable = Arc::from(name);
    }

    /// True when the tracee is alive and ptrace-attached, ready to deliver
    /// syscall notifications.
    pub fn is_tracing(&self) -> bool {
        self.running && self.attached
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired
    }

    pub(crate) fn mark_retired(&mut self) {
        self.retired = true;
    }

    pub fn set_options(&mut self, trace: &Trace) {
        self.options = Some(ptrace_options(trace));
    }

    /// The notification the tracee is currently stopped at, or its
    /// termination once it died.
    pub fn current_state(&self) -> Option<ProcessNotification> {
        if let Some(entry) = &self.entry {
            return Some(ProcessNotification::Entry(entry.clone()));
        }
        self.termination
            .as_ref()
            .map(|t| ProcessNotification::Termination(t.clone()))
    }

    pub(crate) fn take_pending_execve(&mut self) -> Option<String> {
        self.pending_execve.take()
    }

    fn timestamp(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Attach if needed, consume the first stop, set the ptrace options and
    /// release the tracee towards its first syscall.
    ///
    /// `replayed` carries a stop captured before this tracer existed (a
    /// child that won the race against its own registration).
    pub fn init(&mut self, replayed: Option<WaitStatus>) -> Result<(), Error> {
        if !self.attached {
            if !self.running {
                return Err(Error::InvalidState {
                    spid: self.spid.as_raw(),
                    operation: "init",
                    reason: "no live target to attach to",
                });
            }
            ptrace::attach(self.spid).map_err(|errno| Error::ptrace("ATTACH", self.spid, errno))?;
            self.attached = true;
        }
        let Some(options) = self.options else {
            debug!(spid = self.spid.as_raw(), "options deferred, init incomplete");
            return Err(Error::OptionsRequired(self.spid.as_raw()));
        };

        let first_stop = match replayed {
            Some(status) => status,
            None => loop {
                let status = waitpid(self.spid, Some(WaitPidFlag::__WALL)).map_err(Error::Wait)?;
                match status {
                    WaitStatus::Stopped(_, Signal::SIGSTOP | Signal::SIGTRAP) => break status,
                    WaitStatus::PtraceEvent(..) | WaitStatus::PtraceSyscall(_) => break status,
                    WaitStatus::Exited(..) | WaitStatus::Signaled(..) => break status,
                    _ => continue,
                }
            },
        };
        if matches!(
            first_stop,
            WaitStatus::Exited(..) | WaitStatus::Signaled(..)
        ) {
            self.running = false;
            self.attached = false;
            return Err(Error::Exited(self.spid.as_raw()));
        }

        ptrace::setoptions(self.spid, options)
            .map_err(|errno| Error::ptrace("SETOPTIONS", self.spid, errno))?;
        ptrace::syscall(self.spid, None)
            .map_err(|errno| Error::ptrace("SYSCALL", self.spid, errno))?;
        Ok(())
    }

    /// Classify one `waitpid` status belonging to this tracee.
    pub fn handle(&mut self, status: WaitStatus) -> Result<HandleOutcome, Error> {
        debug_assert!(self.spid.as_raw() > 0 && self.spid.as_raw() < syscalls::MAX_PID);
        match status {
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                self.running = false;
                self.attached = false;
                if let Some(entry) = self.entry.take() {
                    debug!(spid = self.spid.as_raw(), %entry, "syscall will never complete");
                }
                let termination =
                    Termination::from_wait(self.executable.clone(), self.pid, self.spid, status);
                self.termination = Some(termination.clone());
                Ok(HandleOutcome::Exited(termination))
            }
            WaitStatus::PtraceEvent(_, Signal::SIGTRAP, event)
                if event == Event::PTRACE_EVENT_EXEC as i32 && !self.running =>
            {
                // Back from the dead: another thread of the group performed
                // an execve and the kernel folded it onto this task id.
                self.running = true;
                self.attached = true;
                self.handle_execve()?;
                self.entry = None;
                self.termination = None;
                ptrace::syscall(self.spid, None)
                    .map_err(|errno| Error::ptrace("SYSCALL", self.spid, errno))?;
                Ok(HandleOutcome::Execve { pid: self.pid })
            }
            _ if !self.running => {
                ptrace::syscall(self.spid, None)
                    .map_err(|errno| Error::ptrace("SYSCALL", self.spid, errno))?;
                Ok(HandleOutcome::AlreadyGone)
            }
            WaitStatus::PtraceEvent(_, _, event) => self.handle_event(event),
            WaitStatus::PtraceSyscall(_) => {
                let regs = Registers::capture(self.spid)?;
                let pending = self.entry.as_ref().map(SyscallEntry::syscall_no);
                match classify_syscall_stop(pending, regs.syscall_no()) {
                    SyscallStop::Entry => self.syscall_entry(regs),
                    SyscallStop::DiscardedEntry => {
                        if let Some(expected) = pending
                            && !syscalls::never_returns(expected)
                        {
                            // Kernel restart after a signal: the out-of-sync
                            // entry is dropped and this stop re-enters fresh.
                            warn!(
                                spid = self.spid.as_raw(),
                                expected,
                                received = regs.syscall_no(),
                                "entry/exit syscall mismatch, discarding pending entry"
                            );
                        }
                        self.entry = None;
                        self.syscall_entry(regs)
                    }
                    SyscallStop::Exit => self.syscall_exit(regs),
                }
            }
            WaitStatus::Stopped(_, signal) => self.inject_signal(signal),
            WaitStatus::Continued(_) | WaitStatus::StillAlive => Ok(HandleOutcome::Resumed),
        }
    }

    /// Release a tracee suspended at an authorised syscall entry.
    pub fn proceed(&mut self) -> Result<(), Error> {
        if !self.running {
            return Err(Error::InvalidState {
                spid: self.spid.as_raw(),
                operation: "proceed",
                reason: "tracee is dead",
            });
        }
        if !self.attached {
            return Err(Error::InvalidState {
                spid: self.spid.as_raw(),
                operation: "proceed",
                reason: "tracee is not attached",
            });
        }
        let authorised = self.entry.as_ref().is_some_and(SyscallEntry::is_authorised);
        if !authorised {
            return Err(Error::InvalidState {
                spid: self.spid.as_raw(),
                operation: "proceed",
                reason: "no authorised entry is pending",
            });
        }
        ptrace::syscall(self.spid, None)
            .map_err(|errno| Error::ptrace("SYSCALL", self.spid, errno))
    }

    /// Deliver a signal to the tracee, SIGKILL by default.
    pub fn kill(&self, signal: Signal) -> Result<(), Error> {
        debug_assert!(self.spid.as_raw() > 0 && self.spid.as_raw() < syscalls::MAX_PID);
        if !self.running {
            info!(spid = self.spid.as_raw(), "tracee is already dead");
        }
        nix::sys::signal::kill(self.spid, signal).map_err(Error::Signal)
    }

    /// Extract a NUL-terminated string from the tracee address space.
    pub fn extract_string(&self, addr: u64, max_len: usize) -> Result<String, Error> {
        let word = size_of::<libc::c_long>();
        let mut bytes = Vec::new();
        let mut offset = 0usize;
        'outer: while offset < max_len {
            let chunk = self.extract_word(addr + offset as u64)?;
            for byte in chunk.to_ne_bytes() {
                if byte == 0 {
                    break 'outer;
                }
                bytes.push(byte);
            }
            offset += word;
        }
        bytes.truncate(max_len);
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Extract `len` raw bytes from the tracee address space.
    pub fn extract_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>, Error> {
        let word = size_of::<libc::c_long>();
        let mut bytes = Vec::with_capacity(len.next_multiple_of(word));
        let mut offset = 0usize;
        while offset < len {
            let chunk = self.extract_word(addr + offset as u64)?;
            bytes.extend_from_slice(&chunk.to_ne_bytes());
            offset += word;
        }
        bytes.truncate(len);
        Ok(bytes)
    }

    /// Extract one machine word from the tracee address space.
    pub fn extract_word(&self, addr: u64) -> Result<u64, Error> {
        ptrace::read(self.spid, addr as usize as ptrace::AddressType)
            .map(|word| word as u64)
            .map_err(|errno| Error::MemoryPeek {
                spid: self.spid.as_raw(),
                addr,
                source: errno,
            })
    }

    fn handle_event(&mut self, event: i32) -> Result<HandleOutcome, Error> {
        if event == Event::PTRACE_EVENT_EXIT as i32 {
            let event_status = ptrace::getevent(self.spid)
                .map_err(|errno| Error::ptrace("GETEVENTMSG", self.spid, errno))?;
            info!(
                spid = self.spid.as_raw(),
                status = event_status,
                "tracee is terminating"
            );
            self.running = false;
            self.attached = false;
            if let Some(entry) = self.entry.take() {
                debug!(spid = self.spid.as_raw(), %entry, "syscall will never complete");
            }
            let termination = Termination::synthesised(
                self.executable.clone(),
                self.pid,
                self.spid,
                event_status as i32,
            );
            self.termination = Some(termination.clone());
            ptrace::syscall(self.spid, None)
                .map_err(|errno| Error::ptrace("SYSCALL", self.spid, errno))?;
            return Ok(HandleOutcome::ImminentExit(termination));
        }
        if event == Event::PTRACE_EVENT_CLONE as i32
            || event == Event::PTRACE_EVENT_FORK as i32
            || event == Event::PTRACE_EVENT_VFORK as i32
        {
            return self.handle_child_event(event);
        }
        if event == Event::PTRACE_EVENT_EXEC as i32 {
            self.handle_execve()?;
            if let Some(entry) = self.entry.take() {
                entry.set_return_value(0);
            }
            ptrace::syscall(self.spid, None)
                .map_err(|errno| Error::ptrace("SYSCALL", self.spid, errno))?;
            return Ok(HandleOutcome::Execve { pid: self.pid });
        }
        // VFORK_DONE and friends carry nothing we track.
        ptrace::syscall(self.spid, None)
            .map_err(|errno| Error::ptrace("SYSCALL", self.spid, errno))?;
        Ok(HandleOutcome::Resumed)
    }

    /// Tri-notification resolution for clone/fork/vfork: the extra event stop
    /// and the syscall exit are folded away so the consumer sees a single
    /// entry whose return value and child identity are already known.
    fn handle_child_event(&mut self, event: i32) -> Result<HandleOutcome, Error> {
        let regs = self.syscall_jump()?;
        let Some(entry) = self.entry.clone() else {
            warn!(
                spid = self.spid.as_raw(),
                "task-creation event without a pending entry"
            );
            ptrace::syscall(self.spid, None)
                .map_err(|errno| Error::ptrace("SYSCALL", self.spid, errno))?;
            return Ok(HandleOutcome::Resumed);
        };
        let ret = regs.return_value();
        entry.set_return_value(ret);
        if ret < 1 || ret >= syscalls::MAX_PID as i64 {
            // The task creation failed; surface its exit like any other.
            self.entry = None;
            ptrace::syscall(self.spid, None)
                .map_err(|errno| Error::ptrace("SYSCALL", self.spid, errno))?;
            let exit = SyscallExit::new(
                self.executable.clone(),
                self.pid,
                self.spid,
                self.timestamp(),
                regs,
            );
            return Ok(HandleOutcome::Notify(ProcessNotification::Exit(exit)));
        }

        let child_spid = Pid::from_raw(ret as i32);
        // CLONE_THREAD keeps the new task in this thread group.
        let is_thread = event == Event::PTRACE_EVENT_CLONE as i32
            && (entry.argument(0) & libc::CLONE_THREAD as u64) != 0;
        let child_pid = if is_thread { self.pid } else { child_spid };
        entry.set_spawned_child(ChildSpawn {
            pid: child_pid,
            spid: child_spid,
        });
        self.entry = None;
        ptrace::syscall(self.spid, None)
            .map_err(|errno| Error::ptrace("SYSCALL", self.spid, errno))?;
        Ok(HandleOutcome::ChildSpawned {
            child_pid,
            child_spid,
        })
    }

    /// A successful execve re-randomises the address space and produces a
    /// redundant syscall-exit stop, which is consumed here.
    fn handle_execve(&mut self) -> Result<(), Error> {
        self.pc_base = 0;
        self.syscall_jump()?;
        Ok(())
    }

    /// Release the tracee and consume stops until the next syscall stop,
    /// whose registers are returned. The tracee is left suspended there.
    fn syscall_jump(&mut self) -> Result<Registers, Error> {
        ptrace::syscall(self.spid, None)
            .map_err(|errno| Error::ptrace("SYSCALL", self.spid, errno))?;
        loop {
            let status = waitpid(self.spid, Some(WaitPidFlag::__WALL)).map_err(Error::Wait)?;
            match status {
                WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                    self.running = false;
                    self.attached = false;
                    return Err(Error::Exited(self.spid.as_raw()));
                }
                WaitStatus::PtraceSyscall(_) => break,
                WaitStatus::Stopped(_, signal) => {
                    self.inject_signal(signal)?;
                }
                _ => {
                    ptrace::syscall(self.spid, None)
                        .map_err(|errno| Error::ptrace("SYSCALL", self.spid, errno))?;
                }
            }
        }
        let regs = Registers::capture(self.spid)?;
        debug!(
            spid = self.spid.as_raw(),
            syscall = regs.syscall_no(),
            ret = regs.return_value(),
            "jumped one syscall stop"
        );
        Ok(regs)
    }

    fn syscall_entry(&mut self, regs: Registers) -> Result<HandleOutcome, Error> {
        debug_assert!(self.running && self.attached);
        if self.pc_base == 0 {
            self.pc_base = regs.pc();
        }
        let stack = match self.backtracer.unwind(self.spid, &regs, self.pc_base) {
            Ok(frames) => frames,
            Err(err) => {
                warn!(spid = self.spid.as_raw(), %err, "stack unwind failed, degrading to pc/sp");
                vec![StackFrame::synthetic(
                    regs.pc(),
                    regs.pc().wrapping_sub(self.pc_base),
                    regs.sp(),
                )]
            }
        };
        let entry = SyscallEntry::new(
            self.executable.clone(),
            self.pid,
            self.spid,
            self.timestamp(),
            regs,
            stack,
        );
        // After the execve completes the target path is unreadable, so it is
        // captured now and applied if the call succeeds.
        if regs.syscall_no() == libc::SYS_execve {
            match self.extract_string(regs.argument(0), libc::PATH_MAX as usize) {
                Ok(target) if !target.is_empty() => self.pending_execve = Some(target),
                Ok(_) => {}
                Err(err) => warn!(
                    spid = self.spid.as_raw(),
                    %err,
                    "could not extract execve target"
                ),
            }
        }
        self.entry = Some(entry.clone());
        Ok(HandleOutcome::Notify(ProcessNotification::Entry(entry)))
    }

    fn syscall_exit(&mut self, regs: Registers) -> Result<HandleOutcome, Error> {
        let Some(pending) = self.entry.take() else {
            return self.syscall_entry(regs);
        };
        pending.set_return_value(regs.return_value());
        // Exits report what the kernel already did; the tracee does not wait
        // for authorisation here.
        ptrace::syscall(self.spid, None)
            .map_err(|errno| Error::ptrace("SYSCALL", self.spid, errno))?;
        let exit = SyscallExit::new(
            self.executable.clone(),
            self.pid,
            self.spid,
            self.timestamp(),
            regs,
        );
        Ok(HandleOutcome::Notify(ProcessNotification::Exit(exit)))
    }

    /// A stop signal that did not originate from ptrace is logged and
    /// re-injected; it never reaches the consumer.
    fn inject_signal(&mut self, signal: Signal) -> Result<HandleOutcome, Error> {
        match ptrace::getsiginfo(self.spid) {
            Ok(info) => debug!(
                spid = self.spid.as_raw(),
                signal = %signal,
                code = info.si_code,
                errno = info.si_errno,
                "re-injecting signal"
            ),
            Err(errno) => return Err(Error::ptrace("GETSIGINFO", self.spid, errno)),
        }
        ptrace::syscall(self.spid, Some(signal))
            .map_err(|errno| Error::ptrace("SYSCALL", self.spid, errno))?;
        Ok(HandleOutcome::Resumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_syscall_stop_is_an_entry() {
        assert_eq!(
            classify_syscall_stop(None, libc::SYS_write),
            SyscallStop::Entry
        );
    }

    #[test]
    fn matching_numbers_pair_entry_with_exit() {
        assert_eq!(
            classify_syscall_stop(Some(libc::SYS_write), libc::SYS_write),
            SyscallStop::Exit
        );
    }

    #[test]
    fn mismatched_numbers_discard_the_pending_entry() {
        // A kernel restart after a signal reports a different syscall; the
        // stale entry must not produce an exit notification.
        assert_eq!(
            classify_syscall_stop(Some(libc::SYS_nanosleep), libc::SYS_write),
            SyscallStop::DiscardedEntry
        );
    }

    #[test]
    fn non_returning_syscalls_never_pair() {
        // Even an equal number cannot be rt_sigreturn's exit: it has none.
        assert_eq!(
            classify_syscall_stop(Some(libc::SYS_rt_sigreturn), libc::SYS_rt_sigreturn),
            SyscallStop::DiscardedEntry
        );
        assert_eq!(
            classify_syscall_stop(Some(libc::SYS_rt_sigreturn), libc::SYS_write),
            SyscallStop::DiscardedEntry
        );
    }
}
