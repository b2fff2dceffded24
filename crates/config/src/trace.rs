#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ptrace attachment options for the traced task and its descendants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Trace {
    /// Also trace threads spawned by the tracee (`PTRACE_O_TRACECLONE`).
    pub follow_threads: bool,

    /// Also trace child processes of the tracee
    /// (`PTRACE_O_TRACEFORK | PTRACE_O_TRACEVFORK`).
    pub follow_children: bool,

    /// Kill every tracee if the supervisor dies (`PTRACE_O_EXITKILL`).
    pub jail: bool,

    /// Identify call sites by stack unwinding. When disabled a syscall is
    /// identified by its program counter and stack pointer only.
    pub backtrace: bool,

    /// Spool the content moved by read/write syscalls below this directory.
    pub capture_io: Option<PathBuf>,
}

impl Default for Trace {
    fn default() -> Self {
        Self {
            follow_threads: true,
            follow_children: true,
            jail: false,
            backtrace: true,
            capture_io: None,
        }
    }
}
