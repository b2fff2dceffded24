//! Payload decoders: pretty-printing and accounting of syscall arguments.
//!
//! Decoders run on the worker thread right before a notification is queued,
//! because reading tracee memory is only possible from there. A decoder
//! failure is transient: it is logged and the notification goes out anyway.

mod connect;
mod exec;
mod open;
mod rw;

pub use connect::ConnectDecoder;
pub use exec::ExecveDecoder;
pub use open::OpenDecoder;
pub use rw::ReadWriteDecoder;

use crate::error::Error;
use crate::notification::{ProcessNotification, SyscallEntry, SyscallExit};
use crate::tracer::Tracer;
use rustc_hash::FxHashMap;
use tracing::warn;

/// One decoder, registered for a set of entry and/or exit syscall numbers.
pub trait SyscallDecoder: Send {
    fn name(&self) -> &'static str;

    fn entry(&mut self, _tracer: &Tracer, _entry: &SyscallEntry) -> Result<(), Error> {
        Ok(())
    }

    fn exit(&mut self, _tracer: &Tracer, _exit: &SyscallExit) -> Result<(), Error> {
        Ok(())
    }

    /// End-of-session summary, emitted when the fleet is retired.
    fn report(&self);
}

/// Dispatches notifications to the registered decoders by syscall number.
#[derive(Default)]
pub struct DecoderMapper {
    decoders: Vec<Box<dyn SyscallDecoder>>,
    entry_map: FxHashMap<i64, usize>,
    exit_map: FxHashMap<i64, usize>,
}

impl DecoderMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in decoder set: open, connect, read/write and execve.
    pub fn with_defaults() -> Self {
        Self::with_io_capture(None)
    }

    /// The built-in decoder set, spooling read/write content below
    /// `capture_root` when one is given.
    pub fn with_io_capture(capture_root: Option<std::path::PathBuf>) -> Self {
        let mut mapper = Self::new();
        let open_syscalls = open::syscalls();
        mapper.register(
            Box::new(OpenDecoder::default()),
            &open_syscalls,
            &open_syscalls,
        );
        mapper.register(
            Box::new(ConnectDecoder::default()),
            &connect::syscalls(),
            &[],
        );
        mapper.register(
            Box::new(ReadWriteDecoder::new(capture_root)),
            &rw::entry_syscalls(),
            &rw::exit_syscalls(),
        );
        mapper.register(Box::new(ExecveDecoder::default()), &exec::syscalls(), &[]);
        mapper
    }

    /// Register a decoder for the given syscall numbers. A number already
    /// claimed by another decoder stays with the first registration.
    pub fn register(
        &mut self,
        decoder: Box<dyn SyscallDecoder>,
        entry_syscalls: &[i64],
        exit_syscalls: &[i64],
    ) {
        let index = self.decoders.len();
        for &no in entry_syscalls {
            if self.entry_map.insert(no, index).is_some() {
                warn!(
                    syscall = no,
                    decoder = decoder.name(),
                    "entry decoder already registered for this syscall"
                );
            }
        }
        for &no in exit_syscalls {
            if self.exit_map.insert(no, index).is_some() {
                warn!(
                    syscall = no,
                    decoder = decoder.name(),
                    "exit decoder already registered for this syscall"
                );
            }
        }
        self.decoders.push(decoder);
    }

    pub(crate) fn decode(
        &mut self,
        tracer: &Tracer,
        notification: &ProcessNotification,
    ) -> Result<(), Error> {
        match notification {
            ProcessNotification::Entry(entry) => {
                if let Some(&index) = self.entry_map.get(&entry.syscall_no()) {
                    self.decoders[index].entry(tracer, entry)?;
                }
            }
            ProcessNotification::Exit(exit) => {
                if let Some(&index) = self.exit_map.get(&exit.syscall_no()) {
                    self.decoders[index].exit(tracer, exit)?;
                }
            }
            ProcessNotification::Termination(_) => {}
        }
        Ok(())
    }

    pub(crate) fn report(&self) {
        for decoder in &self.decoders {
            decoder.report();
        }
    }
}
