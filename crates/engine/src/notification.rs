//! Notifications produced by the tracing engine.
//!
//! A notification is a value; cloning one shares the interior cells
//! (authorisation flag, child-spawn outcome) so that a consumer holding an
//! older clone observes state the worker fills in later. This is what lets
//! the policy layer match a child's first notification against the clone
//! entry that generated it.

use crate::registers::Registers;
use crate::stack::StackFrame;
use crate::syscalls;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

/// Ordered stream element delivered by the engine. Exactly one variant is
/// current per tracee at any time.
#[derive(Debug, Clone)]
pub enum ProcessNotification {
    Entry(SyscallEntry),
    Exit(SyscallExit),
    Termination(Termination),
}

impl ProcessNotification {
    pub fn origin(&self) -> &str {
        match self {
            Self::Entry(e) => e.origin(),
            Self::Exit(e) => e.origin(),
            Self::Termination(t) => t.origin(),
        }
    }

    pub fn pid(&self) -> Pid {
        match self {
            Self::Entry(e) => e.pid(),
            Self::Exit(e) => e.pid(),
            Self::Termination(t) => t.pid(),
        }
    }

    pub fn spid(&self) -> Pid {
        match self {
            Self::Entry(e) => e.spid(),
            Self::Exit(e) => e.spid(),
            Self::Termination(t) => t.spid(),
        }
    }
}

/// A task created by a successful clone/fork/vfork, recorded on the entry
/// that generated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildSpawn {
    /// Thread-group id of the new task (the parent's pid for a new thread).
    pub pid: Pid,
    /// Kernel task id of the new task.
    pub spid: Pid,
}

/// What is known about child generation for an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    /// The syscall cannot create a task.
    None,
    /// The syscall can create a task but has not completed successfully yet.
    Possible,
    /// The syscall created this task.
    Spawned(ChildSpawn),
}

#[derive(Debug, Default)]
struct Outcome {
    return_value: OnceLock<i64>,
    child: OnceLock<ChildSpawn>,
}

/// A syscall-entry notification. The tracee stays suspended until the entry
/// is authorised.
#[derive(Clone)]
pub struct SyscallEntry {
    origin: Arc<str>,
    pid: Pid,
    spid: Pid,
    timestamp: u64,
    regs: Registers,
    stack: Arc<[StackFrame]>,
    authorised: Arc<AtomicBool>,
    outcome: Arc<Outcome>,
}

impl SyscallEntry {
    pub(crate) fn new(
        origin: Arc<str>,
        pid: Pid,
        spid: Pid,
        timestamp: u64,
        regs: Registers,
        stack: Vec<StackFrame>,
    ) -> Self {
        debug_assert!(pid.as_raw() > 0 && pid.as_raw() < syscalls::MAX_PID);
        debug_assert!(spid.as_raw() > 0 && spid.as_raw() < syscalls::MAX_PID);
        Self {
            origin,
            pid,
            spid,
            timestamp,
            regs,
            stack: stack.into(),
            authorised: Arc::new(AtomicBool::new(false)),
            outcome: Arc::new(Outcome::default()),
        }
    }

    /// Build an entry that never touched a tracee. For replaying recorded
    /// observations and for tests.
    pub fn synthetic(
        origin: &str,
        pid: i32,
        spid: i32,
        timestamp: u64,
        syscall_no: i64,
        stack: Vec<StackFrame>,
    ) -> Self {
        let regs = Registers::synthetic(syscall_no, 0, 0);
        Self::new(
            origin.into(),
            Pid::from_raw(pid),
            Pid::from_raw(spid),
            timestamp,
            regs,
            stack,
        )
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn spid(&self) -> Pid {
        self.spid
    }

    /// Nanoseconds since the engine epoch, monotone per spid.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn syscall_no(&self) -> i64 {
        self.regs.syscall_no()
    }

    pub fn pc(&self) -> u64 {
        self.regs.pc()
    }

    pub fn sp(&self) -> u64 {
        self.regs.sp()
    }

    pub fn argument(&self, i: usize) -> u64 {
        self.regs.argument(i)
    }

    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    pub fn stack(&self) -> &[StackFrame] {
        &self.stack
    }

    pub fn is_authorised(&self) -> bool {
        self.authorised.load(Ordering::Acquire)
    }

    /// Flip the authorisation flag. Returns true if this call performed the
    /// transition; the flag never clears again.
    pub fn mark_authorised(&self) -> bool {
        self.authorised
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The return value, known once the syscall completed. Filled by the
    /// worker; clones of the entry observe it.
    pub fn return_value(&self) -> Option<i64> {
        self.outcome.return_value.get().copied()
    }

    pub fn child(&self) -> ChildStatus {
        if !syscalls::generates_child(self.syscall_no()) {
            return ChildStatus::None;
        }
        match self.outcome.child.get() {
            Some(spawn) => ChildStatus::Spawned(*spawn),
            None => ChildStatus::Possible,
        }
    }

    /// The task spawned by this entry, if any.
    pub fn spawned_child(&self) -> Option<ChildSpawn> {
        match self.child() {
            ChildStatus::Spawned(spawn) => Some(spawn),
            _ => None,
        }
    }

    pub(crate) fn set_return_value(&self, value: i64) {
        let _ = self.outcome.return_value.set(value);
    }

    pub(crate) fn set_spawned_child(&self, spawn: ChildSpawn) {
        let _ = self.outcome.child.set(spawn);
    }

    /// Test/replay hook mirroring what the worker records on a completed
    /// clone.
    pub fn record_spawn(&self, child_pid: i32, child_spid: i32) {
        self.set_return_value(child_spid as i64);
        self.set_spawned_child(ChildSpawn {
            pid: Pid::from_raw(child_pid),
            spid: Pid::from_raw(child_spid),
        });
    }
}

impl fmt::Debug for SyscallEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyscallEntry")
            .field("origin", &self.origin)
            .field("pid", &self.pid.as_raw())
            .field("spid", &self.spid.as_raw())
            .field("syscall", &syscalls::name(self.syscall_no()))
            .field("authorised", &self.is_authorised())
            .field("child", &self.child())
            .finish()
    }
}

impl fmt::Display for SyscallEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "syscall entry {} ({}) pid={} spid={} origin={}",
            syscalls::name(self.syscall_no()),
            self.syscall_no(),
            self.pid.as_raw(),
            self.spid.as_raw(),
            self.origin,
        )?;
        write!(f, "  args = [")?;
        for i in 0..Registers::ARG_COUNT {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:#x}", self.argument(i))?;
        }
        writeln!(f, "]")?;
        for frame in self.stack.iter() {
            writeln!(f, "  {frame}")?;
        }
        if let Some(spawn) = self.spawned_child() {
            writeln!(
                f,
                "  spawned child pid={} spid={}",
                spawn.pid.as_raw(),
                spawn.spid.as_raw()
            )?;
        }
        Ok(())
    }
}

/// A syscall-exit notification. Always pre-authorised: it reports what the
/// kernel already did.
#[derive(Clone)]
pub struct SyscallExit {
    origin: Arc<str>,
    pid: Pid,
    spid: Pid,
    timestamp: u64,
    regs: Registers,
}

impl SyscallExit {
    pub(crate) fn new(
        origin: Arc<str>,
        pid: Pid,
        spid: Pid,
        timestamp: u64,
        regs: Registers,
    ) -> Self {
        Self {
            origin,
            pid,
            spid,
            timestamp,
            regs,
        }
    }

    /// Build an exit that never touched a tracee. For replaying recorded
    /// observations and for tests.
    pub fn synthetic(
        origin: &str,
        pid: i32,
        spid: i32,
        timestamp: u64,
        syscall_no: i64,
        return_value: i64,
    ) -> Self {
        let mut regs = Registers::synthetic(syscall_no, 0, 0);
        regs.set_return_value_raw(return_value);
        Self::new(
            origin.into(),
            Pid::from_raw(pid),
            Pid::from_raw(spid),
            timestamp,
            regs,
        )
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn spid(&self) -> Pid {
        self.spid
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn syscall_no(&self) -> i64 {
        self.regs.syscall_no()
    }

    pub fn return_value(&self) -> i64 {
        self.regs.return_value()
    }

    pub fn argument(&self, i: usize) -> u64 {
        self.regs.argument(i)
    }

    pub fn registers(&self) -> &Registers {
        &self.regs
    }
}

impl fmt::Debug for SyscallExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyscallExit")
            .field("origin", &self.origin)
            .field("pid", &self.pid.as_raw())
            .field("spid", &self.spid.as_raw())
            .field("syscall", &syscalls::name(self.syscall_no()))
            .field("return_value", &self.return_value())
            .finish()
    }
}

/// Death notification for one task.
#[derive(Debug, Clone)]
pub struct Termination {
    origin: Arc<str>,
    pid: Pid,
    spid: Pid,
    exit_status: i32,
    wait_status: Option<WaitStatus>,
}

impl Termination {
    /// Built from a real `waitpid` termination status.
    pub(crate) fn from_wait(origin: Arc<str>, pid: Pid, spid: Pid, status: WaitStatus) -> Self {
        let exit_status = match status {
            WaitStatus::Exited(_, code) => code,
            _ => 0,
        };
        Self {
            origin,
            pid,
            spid,
            exit_status,
            wait_status: Some(status),
        }
    }

    /// Synthesised from `PTRACE_EVENT_EXIT`; only the event message is known.
    pub(crate) fn synthesised(origin: Arc<str>, pid: Pid, spid: Pid, event_status: i32) -> Self {
        Self {
            origin,
            pid,
            spid,
            exit_status: event_status,
            wait_status: None,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn spid(&self) -> Pid {
        self.spid
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status
    }

    pub fn signal(&self) -> Option<Signal> {
        match self.wait_status {
            Some(WaitStatus::Signaled(_, signal, _)) => Some(signal),
            _ => None,
        }
    }

    pub fn core_dumped(&self) -> bool {
        matches!(self.wait_status, Some(WaitStatus::Signaled(_, _, true)))
    }

    /// The raw waitpid status, absent when this notification was synthesised
    /// from the pre-death ptrace event.
    pub fn wait_status(&self) -> Option<WaitStatus> {
        self.wait_status
    }

    /// Test/replay constructor.
    pub fn synthetic(origin: &str, pid: i32, spid: i32, exit_status: i32) -> Self {
        Self::synthesised(
            origin.into(),
            Pid::from_raw(pid),
            Pid::from_raw(spid),
            exit_status,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn authorisation_is_monotone() {
        let entry = SyscallEntry::synthetic("/bin/true", 10, 10, 0, libc::SYS_write, Vec::new());
        assert!(!entry.is_authorised());
        assert!(entry.mark_authorised());
        assert!(entry.is_authorised());
        // A second transition is refused, the flag stays set.
        assert!(!entry.mark_authorised());
        assert!(entry.is_authorised());
    }

    #[test]
    fn clones_share_the_outcome() {
        let entry = SyscallEntry::synthetic("/bin/sh", 10, 10, 0, libc::SYS_clone, Vec::new());
        let held_by_consumer = entry.clone();
        assert_eq!(held_by_consumer.child(), ChildStatus::Possible);

        entry.record_spawn(11, 11);
        match held_by_consumer.child() {
            ChildStatus::Spawned(spawn) => {
                assert_eq!(spawn.pid.as_raw(), 11);
                assert_eq!(spawn.spid.as_raw(), 11);
            }
            other => panic!("expected spawned child, got {other:?}"),
        }
        assert_eq!(held_by_consumer.return_value(), Some(11));
    }

    #[test]
    fn non_child_syscalls_report_no_child() {
        let entry = SyscallEntry::synthetic("/bin/true", 10, 10, 0, libc::SYS_write, Vec::new());
        assert_eq!(entry.child(), ChildStatus::None);
        assert_eq!(entry.spawned_child(), None);
    }
}
