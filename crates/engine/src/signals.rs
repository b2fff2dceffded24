//! Wake-up signals for the worker thread.
//!
//! SIGUSR1 means "the authorised queue has elements", SIGUSR2 means "the
//! attach queue has elements". Both are delivered with `pthread_kill` to the
//! worker thread only. The worker keeps them blocked except across the
//! `waitpid` call, so a handler can only ever interrupt the worker while it
//! sits in the kernel; the handler reaches the engine through a thread-local
//! pointer installed at worker entry and performs nothing but queue drains
//! and ptrace continuations.

use crate::engine::Worker;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, SigmaskHow};
use std::cell::Cell;
use std::ptr;

thread_local! {
    static WORKER: Cell<*mut Worker> = const { Cell::new(ptr::null_mut()) };
}

/// Registers the running worker for the signal handlers; clears the pointer
/// again on drop.
pub(crate) struct WorkerRegistration;

impl WorkerRegistration {
    pub(crate) fn new(worker: *mut Worker) -> Self {
        WORKER.set(worker);
        Self
    }
}

impl Drop for WorkerRegistration {
    fn drop(&mut self) {
        WORKER.set(ptr::null_mut());
    }
}

extern "C" fn on_authorised(_signal: libc::c_int) {
    let saved_errno = unsafe { *libc::__errno_location() };
    let worker = WORKER.get();
    if !worker.is_null() {
        unsafe { (*worker).drain_authorised() };
    }
    unsafe { *libc::__errno_location() = saved_errno };
}

extern "C" fn on_attach(_signal: libc::c_int) {
    let saved_errno = unsafe { *libc::__errno_location() };
    let worker = WORKER.get();
    if !worker.is_null() {
        unsafe { (*worker).drain_attach_wait() };
    }
    unsafe { *libc::__errno_location() = saved_errno };
}

pub(crate) fn install_handlers() -> nix::Result<()> {
    let authorised = SigAction::new(
        SigHandler::Handler(on_authorised),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let attach = SigAction::new(
        SigHandler::Handler(on_attach),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe {
        nix::sys::signal::sigaction(Signal::SIGUSR1, &authorised)?;
        nix::sys::signal::sigaction(Signal::SIGUSR2, &attach)?;
    }
    Ok(())
}

fn wake_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGUSR1);
    set.add(Signal::SIGUSR2);
    set
}

/// Block the wake-up signals on the calling thread. Sent signals stay
/// pending until a [`WakeWindow`] opens.
pub(crate) fn block_wake_signals() -> nix::Result<()> {
    nix::sys::signal::pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&wake_set()), None)
}

/// RAII window during which the wake-up signals are deliverable. Opened only
/// around `waitpid`.
pub(crate) struct WakeWindow;

impl WakeWindow {
    pub(crate) fn open() -> nix::Result<Self> {
        nix::sys::signal::pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&wake_set()), None)?;
        Ok(Self)
    }
}

impl Drop for WakeWindow {
    fn drop(&mut self) {
        let _ = nix::sys::signal::pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&wake_set()), None);
    }
}
