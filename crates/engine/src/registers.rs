//! Architecture-abstract view of a tracee register snapshot.
//!
//! Two snapshots exist per syscall: the entry snapshot (syscall number and
//! arguments valid, return value is `-ENOSYS`) and the exit snapshot (return
//! value valid).

use crate::error::Error;
use nix::unistd::Pid;
use std::fmt;

/// Register snapshot of a stopped tracee.
#[derive(Clone, Copy)]
pub struct Registers {
    raw: libc::user_regs_struct,
}

#[cfg(target_arch = "x86_64")]
impl Registers {
    /// Number of syscall argument registers on this architecture.
    pub const ARG_COUNT: usize = 6;

    /// Capture the registers of a stopped tracee.
    pub fn capture(spid: Pid) -> Result<Self, Error> {
        let raw = nix::sys::ptrace::getregs(spid)
            .map_err(|errno| Error::ptrace("GETREGS", spid, errno))?;
        Ok(Self { raw })
    }

    pub fn pc(&self) -> u64 {
        self.raw.rip
    }

    pub fn sp(&self) -> u64 {
        self.raw.rsp
    }

    pub fn bp(&self) -> u64 {
        self.raw.rbp
    }

    /// The syscall number, valid at both entry and exit stops.
    pub fn syscall_no(&self) -> i64 {
        self.raw.orig_rax as i64
    }

    /// The syscall return value. `-ENOSYS` until the exit stop.
    pub fn return_value(&self) -> i64 {
        self.raw.rax as i64
    }

    pub fn argument(&self, i: usize) -> u64 {
        match i {
            0 => self.raw.rdi,
            1 => self.raw.rsi,
            2 => self.raw.rdx,
            3 => self.raw.r10,
            4 => self.raw.r8,
            5 => self.raw.r9,
            _ => 0,
        }
    }

    /// The raw CPU flags word at the time of the stop.
    pub fn flags(&self) -> u64 {
        self.raw.eflags
    }

    /// Build a snapshot out of thin air. Only meaningful for replaying
    /// recorded observations and for tests.
    pub fn synthetic(syscall_no: i64, pc: u64, sp: u64) -> Self {
        let mut raw: libc::user_regs_struct = unsafe { std::mem::zeroed() };
        raw.orig_rax = syscall_no as u64;
        raw.rax = -libc::ENOSYS as i64 as u64;
        raw.rip = pc;
        raw.rsp = sp;
        Self { raw }
    }

    pub(crate) fn set_return_value_raw(&mut self, value: i64) {
        self.raw.rax = value as u64;
    }
}

#[cfg(target_arch = "aarch64")]
impl Registers {
    /// Number of syscall argument registers on this architecture.
    pub const ARG_COUNT: usize = 8;

    /// Capture the registers of a stopped tracee.
    pub fn capture(spid: Pid) -> Result<Self, Error> {
        let raw = nix::sys::ptrace::getregset::<nix::sys::ptrace::regset::NT_PRSTATUS>(spid)
            .map_err(|errno| Error::ptrace("GETREGSET", spid, errno))?;
        Ok(Self { raw })
    }

    pub fn pc(&self) -> u64 {
        self.raw.pc
    }

    pub fn sp(&self) -> u64 {
        self.raw.sp
    }

    pub fn bp(&self) -> u64 {
        self.raw.regs[29]
    }

    /// The syscall number, valid at both entry and exit stops.
    pub fn syscall_no(&self) -> i64 {
        self.raw.regs[8] as i64
    }

    /// The syscall return value. `-ENOSYS` until the exit stop.
    pub fn return_value(&self) -> i64 {
        self.raw.regs[0] as i64
    }

    pub fn argument(&self, i: usize) -> u64 {
        if i < Self::ARG_COUNT {
            self.raw.regs[i]
        } else {
            0
        }
    }

    /// The raw processor state word at the time of the stop.
    pub fn flags(&self) -> u64 {
        self.raw.pstate
    }

    /// Build a snapshot out of thin air. Only meaningful for replaying
    /// recorded observations and for tests.
    pub fn synthetic(syscall_no: i64, pc: u64, sp: u64) -> Self {
        let mut raw: libc::user_regs_struct = unsafe { std::mem::zeroed() };
        raw.regs[8] = syscall_no as u64;
        raw.regs[0] = -libc::ENOSYS as i64 as u64;
        raw.pc = pc;
        raw.sp = sp;
        Self { raw }
    }

    pub(crate) fn set_return_value_raw(&mut self, value: i64) {
        self.raw.regs[0] = value as u64;
    }
}

impl fmt::Debug for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registers")
            .field("pc", &format_args!("{:#x}", self.pc()))
            .field("sp", &format_args!("{:#x}", self.sp()))
            .field("syscall_no", &self.syscall_no())
            .field("return_value", &self.return_value())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_snapshot_reads_back() {
        let regs = Registers::synthetic(39, 0x40_1000, 0x7fff_f000);
        assert_eq!(regs.syscall_no(), 39);
        assert_eq!(regs.pc(), 0x40_1000);
        assert_eq!(regs.sp(), 0x7fff_f000);
        assert_eq!(regs.return_value(), -libc::ENOSYS as i64);
    }
}
