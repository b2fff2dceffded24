use nix::errno::Errno;
use std::path::PathBuf;

/// Represents all possible errors of the tracing engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A ptrace request failed. Fatal for the affected tracer unless the
    /// target simply vanished (`ESRCH`).
    #[error("ptrace {request} failed for spid {spid}: {source}")]
    Ptrace {
        request: &'static str,
        spid: i32,
        source: Errno,
    },

    /// The `waitpid` loop failed. Fatal for the whole fleet.
    #[error("waitpid failed: {0}")]
    Wait(Errno),

    /// The tracee produced a death notification at an unexpected point.
    #[error("tracee spid {0} exited unexpectedly")]
    Exited(i32),

    /// Remote stack unwinding could not be initialised.
    #[error("stack unwinding unavailable for spid {spid}: {reason}")]
    Unwind { spid: i32, reason: String },

    /// A tracer was asked to proceed without ptrace options configured.
    #[error("tracer for spid {0} has no ptrace options set")]
    OptionsRequired(i32),

    /// The tracer is not in a state where the requested operation is legal.
    #[error("tracer for spid {spid} cannot {operation}: {reason}")]
    InvalidState {
        spid: i32,
        operation: &'static str,
        reason: &'static str,
    },

    /// Reading tracee memory failed. Transient for decoders.
    #[error("failed to read tracee memory of spid {spid} at {addr:#x}: {source}")]
    MemoryPeek { spid: i32, addr: u64, source: Errno },

    /// A decoder could not write its spool files. Transient.
    #[error("decoder I/O failed: {0}")]
    Decoder(std::io::Error),

    /// The traced program could not be started.
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: PathBuf,
        source: std::io::Error,
    },

    /// The executable of an attach target could not be resolved.
    #[error("failed to resolve executable of spid {spid}: {source}")]
    ResolveExecutable {
        spid: i32,
        source: procfs::ProcError,
    },

    /// A signal could not be delivered.
    #[error("signal delivery failed: {0}")]
    Signal(Errno),

    /// The worker thread terminated before it could be reached.
    #[error("the tracing worker is gone")]
    WorkerGone,

    /// The worker thread could not be spawned.
    #[error("failed to spawn the tracing worker: {0}")]
    SpawnWorker(std::io::Error),
}

impl Error {
    pub(crate) fn ptrace(request: &'static str, spid: nix::unistd::Pid, source: Errno) -> Self {
        Self::Ptrace {
            request,
            spid: spid.as_raw(),
            source,
        }
    }

    /// True when the underlying cause is a vanished tracee, which retires a
    /// single tracer instead of the fleet.
    pub fn is_vanished(&self) -> bool {
        matches!(
            self,
            Self::Ptrace {
                source: Errno::ESRCH,
                ..
            } | Self::Exited(_)
        )
    }
}
