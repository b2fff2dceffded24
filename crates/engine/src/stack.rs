//! Stack acquisition for syscall call-site identification.
//!
//! Two backends exist, selected at tracer construction: remote unwinding
//! through libunwind's ptrace accessors, or a degenerate single frame built
//! from the program counter and stack pointer.

use crate::error::Error;
use crate::registers::Registers;
use nix::unistd::Pid;
use std::fmt;
use unwind::{Accessors, AddressSpace, Byteorder, Cursor, PTraceState, PTraceStateRef, RegNum};

/// One frame of a tracee stack. The bottom frame is the syscall itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub pc: u64,
    /// Program counter relative to the first one observed for the task,
    /// stable across address-space randomisation.
    pub relative_pc: u64,
    pub sp: u64,
    /// Resolved symbol, if the frame could be attributed to a function.
    pub function: Option<Box<str>>,
    /// Offset into the function; for synthetic frames this field carries the
    /// stack pointer instead.
    pub function_offset: u64,
}

impl StackFrame {
    pub fn symbolic(pc: u64, relative_pc: u64, sp: u64, function: String, offset: u64) -> Self {
        Self {
            pc,
            relative_pc,
            sp,
            function: Some(function.into_boxed_str()),
            function_offset: offset,
        }
    }

    /// Frame without symbol information, used in no-backtrace mode and when
    /// a single frame fails to resolve.
    pub fn synthetic(pc: u64, relative_pc: u64, sp: u64) -> Self {
        Self {
            pc,
            relative_pc,
            sp,
            function: None,
            function_offset: sp,
        }
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.function {
            Some(name) => write!(
                f,
                "{name}+{:#x} [pc={:#x} sp={:#x}]",
                self.function_offset, self.pc, self.sp
            ),
            None => write!(f, "{:#x} [sp={:#x}]", self.pc, self.sp),
        }
    }
}

/// Capability interface for stack acquisition backends.
pub trait Backtracer {
    /// Unwind the stack of a stopped tracee. `pc_base` is the task's first
    /// observed program counter, used to derive relative addresses.
    fn unwind(
        &mut self,
        spid: Pid,
        regs: &Registers,
        pc_base: u64,
    ) -> Result<Vec<StackFrame>, Error>;
}

/// Remote unwinding through libunwind.
pub struct LibunwindBacktracer {
    space: AddressSpace<PTraceStateRef>,
}

impl LibunwindBacktracer {
    pub fn new(spid: Pid) -> Result<Self, Error> {
        let space =
            AddressSpace::new(Accessors::ptrace(), Byteorder::DEFAULT).map_err(|err| {
                Error::Unwind {
                    spid: spid.as_raw(),
                    reason: err.to_string(),
                }
            })?;
        Ok(Self { space })
    }
}

impl Backtracer for LibunwindBacktracer {
    fn unwind(
        &mut self,
        spid: Pid,
        regs: &Registers,
        pc_base: u64,
    ) -> Result<Vec<StackFrame>, Error> {
        let unwind_err = |err: unwind::Error| Error::Unwind {
            spid: spid.as_raw(),
            reason: err.to_string(),
        };
        let state = PTraceState::new(spid.as_raw() as u32).map_err(unwind_err)?;
        let mut cursor = Cursor::remote(&self.space, &state).map_err(unwind_err)?;

        let mut frames = Vec::new();
        loop {
            let pc = match cursor.register(RegNum::IP) {
                Ok(ip) => ip,
                Err(_) => break,
            };
            let sp = cursor.register(RegNum::SP).unwrap_or(regs.sp());
            let name = cursor
                .procedure_name()
                .ok()
                .filter(|n| !n.name().is_empty());
            match name {
                Some(name) => frames.push(StackFrame::symbolic(
                    pc,
                    pc.wrapping_sub(pc_base),
                    sp,
                    name.name().to_string(),
                    name.offset(),
                )),
                None => frames.push(StackFrame::synthetic(pc, pc.wrapping_sub(pc_base), sp)),
            }
            match cursor.step() {
                Ok(true) => {}
                Ok(false) | Err(_) => break,
            }
        }

        if frames.is_empty() {
            // The cursor produced nothing usable; degrade to the registers.
            frames.push(StackFrame::synthetic(
                regs.pc(),
                regs.pc().wrapping_sub(pc_base),
                regs.sp(),
            ));
        }
        Ok(frames)
    }
}

/// Degenerate backend: the call site is `(pc, sp)` of the syscall itself.
#[derive(Debug, Default)]
pub struct PcSpBacktracer;

impl Backtracer for PcSpBacktracer {
    fn unwind(
        &mut self,
        _spid: Pid,
        regs: &Registers,
        pc_base: u64,
    ) -> Result<Vec<StackFrame>, Error> {
        Ok(vec![StackFrame::synthetic(
            regs.pc(),
            regs.pc().wrapping_sub(pc_base),
            regs.sp(),
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pc_sp_backend_produces_one_synthetic_frame() {
        let regs = Registers::synthetic(1, 0x40_2000, 0x7fff_0000);
        let frames = PcSpBacktracer
            .unwind(Pid::from_raw(1), &regs, 0x40_0000)
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].pc, 0x40_2000);
        assert_eq!(frames[0].relative_pc, 0x2000);
        assert_eq!(frames[0].function, None);
        assert_eq!(frames[0].function_offset, 0x7fff_0000);
    }

    #[test]
    fn frame_display_forms() {
        let symbolic = StackFrame::symbolic(0x10, 0x10, 0x20, "main".into(), 4);
        assert_eq!(format!("{symbolic}"), "main+0x4 [pc=0x10 sp=0x20]");
        let synthetic = StackFrame::synthetic(0x10, 0x10, 0x20);
        assert_eq!(format!("{synthetic}"), "0x10 [sp=0x20]");
    }
}
