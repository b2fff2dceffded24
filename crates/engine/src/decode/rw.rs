//! Accounting and optional content capture for the read/write families.
//!
//! Byte totals are tallied per file descriptor. With a capture root
//! configured, the moved bytes are additionally spooled to
//! `<root>/<pid>/<fd>-read` and `<root>/<pid>/<fd>-write`; descriptors are
//! unique per process and execution, so the spool names never collide.

use super::SyscallDecoder;
use crate::error::Error;
use crate::hexdump::Hexdump;
use crate::notification::{SyscallEntry, SyscallExit};
use crate::tracer::Tracer;
use rustc_hash::FxHashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, trace};

/// Per-call capture ceiling; larger transfers are spooled truncated.
const MAX_CAPTURE: usize = 64 * 1024;

fn write_syscalls() -> Vec<i64> {
    vec![libc::SYS_write, libc::SYS_pwrite64, libc::SYS_sendto]
}

fn read_syscalls() -> Vec<i64> {
    vec![libc::SYS_read, libc::SYS_pread64, libc::SYS_recvfrom]
}

pub(super) fn entry_syscalls() -> Vec<i64> {
    write_syscalls()
}

pub(super) fn exit_syscalls() -> Vec<i64> {
    let mut set = write_syscalls();
    set.extend(read_syscalls());
    set
}

fn is_write(no: i64) -> bool {
    write_syscalls().contains(&no)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Direction {
    Read,
    Write,
}

impl Direction {
    fn suffix(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

/// Tallies bytes moved per file descriptor and optionally spools the moved
/// content to disk.
#[derive(Default)]
pub struct ReadWriteDecoder {
    read_bytes: FxHashMap<u64, u64>,
    written_bytes: FxHashMap<u64, u64>,
    capture_root: Option<PathBuf>,
    spools: FxHashMap<(i32, u64, Direction), (PathBuf, File)>,
}

impl ReadWriteDecoder {
    pub fn new(capture_root: Option<PathBuf>) -> Self {
        Self {
            capture_root,
            ..Self::default()
        }
    }

    fn spool(
        &mut self,
        pid: i32,
        fd: u64,
        direction: Direction,
        content: &[u8],
    ) -> Result<(), Error> {
        let Some(root) = &self.capture_root else {
            return Ok(());
        };
        let key = (pid, fd, direction);
        if !self.spools.contains_key(&key) {
            let dir = root.join(pid.to_string());
            std::fs::create_dir_all(&dir).map_err(Error::Decoder)?;
            let path = dir.join(format!("{fd}-{}", direction.suffix()));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(Error::Decoder)?;
            self.spools.insert(key, (path, file));
        }
        if let Some((_, file)) = self.spools.get_mut(&key) {
            file.write_all(content).map_err(Error::Decoder)?;
        }
        trace!(pid, fd, "captured {} bytes:\n{}", content.len(), Hexdump::new(content));
        Ok(())
    }
}

impl SyscallDecoder for ReadWriteDecoder {
    fn name(&self) -> &'static str {
        "read-write"
    }

    /// Write-family buffers are valid at the entry stop.
    fn entry(&mut self, tracer: &Tracer, entry: &SyscallEntry) -> Result<(), Error> {
        if self.capture_root.is_none() {
            return Ok(());
        }
        let length = (entry.argument(2) as usize).min(MAX_CAPTURE);
        if length == 0 {
            return Ok(());
        }
        let content = tracer.extract_bytes(entry.argument(1), length)?;
        self.spool(
            entry.pid().as_raw(),
            entry.argument(0),
            Direction::Write,
            &content,
        )
    }

    fn exit(&mut self, tracer: &Tracer, exit: &SyscallExit) -> Result<(), Error> {
        let moved = exit.return_value();
        if moved <= 0 {
            return Ok(());
        }
        // The kernel preserves the argument registers across the call, so
        // the fd and buffer address are still readable at the exit stop.
        let fd = exit.argument(0);
        if is_write(exit.syscall_no()) {
            *self.written_bytes.entry(fd).or_default() += moved as u64;
            return Ok(());
        }
        *self.read_bytes.entry(fd).or_default() += moved as u64;
        if self.capture_root.is_some() {
            let length = (moved as usize).min(MAX_CAPTURE);
            let content = tracer.extract_bytes(exit.argument(1), length)?;
            self.spool(exit.pid().as_raw(), fd, Direction::Read, &content)?;
        }
        Ok(())
    }

    fn report(&self) {
        for (fd, bytes) in &self.read_bytes {
            info!(fd, bytes, "bytes read");
        }
        for (fd, bytes) in &self.written_bytes {
            info!(fd, bytes, "bytes written");
        }
        for ((pid, fd, direction), (path, _)) in &self.spools {
            info!(
                pid,
                fd,
                direction = direction.suffix(),
                path = %path.display(),
                "content captured"
            );
        }
    }
}
