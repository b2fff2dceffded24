//! SIGINT turns into a flag the consumer loops poll between notifications.

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::ffi::c_int;
use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_signal: c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

pub fn install() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_interrupt),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        nix::sys::signal::sigaction(Signal::SIGINT, &action)?;
    }
    Ok(())
}

pub fn triggered() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}
