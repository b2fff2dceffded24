//! Ptrace-based tracing engine.
//!
//! One dedicated worker thread owns every ptrace relationship; consumers
//! receive an ordered per-task stream of syscall entry, syscall exit and
//! termination notifications, and release suspended tracees by authorising
//! their entries.

pub mod decode;
mod engine;
mod error;
mod hexdump;
mod notification;
mod registers;
mod signals;
mod stack;
pub mod syscalls;
mod tracer;

pub use decode::{DecoderMapper, SyscallDecoder};
pub use engine::{EngineClient, EngineHandle, TraceeSpec, spawn};
pub use error::Error;
pub use hexdump::Hexdump;
pub use notification::{
    ChildSpawn, ChildStatus, ProcessNotification, SyscallEntry, SyscallExit, Termination,
};
pub use registers::Registers;
pub use stack::{Backtracer, LibunwindBacktracer, PcSpBacktracer, StackFrame};
pub use tracer::{HandleOutcome, Tracer};
