//! Path and file-descriptor accounting for the open family.

use super::SyscallDecoder;
use crate::error::Error;
use crate::notification::{SyscallEntry, SyscallExit};
use crate::tracer::Tracer;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

const MAX_PATH_LEN: usize = 2048;

pub(super) fn syscalls() -> Vec<i64> {
    let mut set = vec![libc::SYS_openat, libc::SYS_openat2];
    #[cfg(target_arch = "x86_64")]
    {
        set.push(libc::SYS_open);
        set.push(libc::SYS_creat);
    }
    set
}

struct PathFd {
    path: String,
    fd: Option<i64>,
}

/// Records every path the tracees tried to open and the file descriptor the
/// kernel answered with.
#[derive(Default)]
pub struct OpenDecoder {
    paths: Vec<PathFd>,
    /// Entry observed, exit still outstanding, keyed by spid.
    awaiting_fd: FxHashMap<i32, usize>,
}

impl OpenDecoder {
    fn path_argument(entry: &SyscallEntry) -> u64 {
        #[cfg(target_arch = "x86_64")]
        if entry.syscall_no() == libc::SYS_open || entry.syscall_no() == libc::SYS_creat {
            return entry.argument(0);
        }
        // openat family: argument 0 is the directory fd.
        entry.argument(1)
    }
}

impl SyscallDecoder for OpenDecoder {
    fn name(&self) -> &'static str {
        "open"
    }

    fn entry(&mut self, tracer: &Tracer, entry: &SyscallEntry) -> Result<(), Error> {
        let path = tracer.extract_string(Self::path_argument(entry), MAX_PATH_LEN)?;
        debug!(spid = entry.spid().as_raw(), %path, "open observed");
        self.paths.push(PathFd { path, fd: None });
        self.awaiting_fd
            .insert(entry.spid().as_raw(), self.paths.len() - 1);
        Ok(())
    }

    fn exit(&mut self, _tracer: &Tracer, exit: &SyscallExit) -> Result<(), Error> {
        match self.awaiting_fd.remove(&exit.spid().as_raw()) {
            Some(index) => self.paths[index].fd = Some(exit.return_value()),
            None => warn!(
                spid = exit.spid().as_raw(),
                "open exit without a matching entry"
            ),
        }
        Ok(())
    }

    fn report(&self) {
        for entry in &self.paths {
            match entry.fd {
                Some(fd) if fd >= 0 => info!(fd, path = %entry.path, "opened"),
                Some(error) => info!(error, path = %entry.path, "open failed"),
                None => info!(path = %entry.path, "open never completed"),
            }
        }
    }
}
