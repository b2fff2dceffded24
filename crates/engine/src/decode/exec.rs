//! Target and argv extraction for execve.

use super::SyscallDecoder;
use crate::error::Error;
use crate::notification::SyscallEntry;
use crate::tracer::Tracer;
use tracing::info;

const MAX_ARGS: usize = 32;
const MAX_ARG_LEN: usize = 4096;

pub(super) fn syscalls() -> Vec<i64> {
    vec![libc::SYS_execve]
}

/// Records every exec attempt with its argument vector.
#[derive(Default)]
pub struct ExecveDecoder {
    execs: Vec<(String, Vec<String>)>,
}

impl SyscallDecoder for ExecveDecoder {
    fn name(&self) -> &'static str {
        "execve"
    }

    fn entry(&mut self, tracer: &Tracer, entry: &SyscallEntry) -> Result<(), Error> {
        let target = tracer.extract_string(entry.argument(0), libc::PATH_MAX as usize)?;
        let argv_base = entry.argument(1);
        let mut argv = Vec::new();
        if argv_base != 0 {
            let word = size_of::<libc::c_long>() as u64;
            for index in 0..MAX_ARGS as u64 {
                let pointer = tracer.extract_word(argv_base + index * word)?;
                if pointer == 0 {
                    break;
                }
                argv.push(tracer.extract_string(pointer, MAX_ARG_LEN)?);
            }
        }
        info!(
            spid = entry.spid().as_raw(),
            %target,
            argv = %argv.join(" "),
            "execve observed"
        );
        self.execs.push((target, argv));
        Ok(())
    }

    fn report(&self) {
        for (target, argv) in &self.execs {
            info!(%target, argv = %argv.join(" "), "exec attempted");
        }
    }
}
