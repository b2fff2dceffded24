//! Live tracing smoke tests. They fork real tracees, so Linux only.

#![cfg(target_os = "linux")]

use config::Trace;
use engine::{DecoderMapper, ProcessNotification, TraceeSpec, spawn};
use std::collections::HashMap;
use std::path::Path;

fn pc_sp_options() -> Trace {
    // Identification by pc/sp keeps the test independent of debug info and
    // symbol availability on the host.
    Trace {
        backtrace: false,
        ..Trace::default()
    }
}

#[derive(Default)]
struct SpidLog {
    pending_entry: Option<i64>,
    entries: usize,
    exits: usize,
    last_timestamp: u64,
    terminated: bool,
}

#[test]
fn bin_true_stream_is_ordered_per_spid() {
    let handle = spawn(
        TraceeSpec::Run {
            program: "/bin/true".into(),
            args: Vec::new(),
        },
        pc_sp_options(),
        DecoderMapper::new(),
    )
    .expect("engine spawn");

    let mut logs: HashMap<i32, SpidLog> = HashMap::new();
    let mut exit_status = None;

    while let Some(notification) = handle.next_notification() {
        let spid = notification.spid().as_raw();
        let log = logs.entry(spid).or_default();
        assert!(!log.terminated, "notification after termination for {spid}");

        match &notification {
            ProcessNotification::Entry(entry) => {
                assert!(
                    log.pending_entry.is_none(),
                    "two consecutive entries without an exit must come from a \
                     special syscall"
                );
                assert!(entry.timestamp() >= log.last_timestamp);
                log.last_timestamp = entry.timestamp();
                log.pending_entry = Some(entry.syscall_no());
                log.entries += 1;
                handle.authorize(entry).expect("authorize");
                // Entries that never produce an exit stop clear the pending
                // slot themselves.
                if engine::syscalls::never_returns(entry.syscall_no())
                    || engine::syscalls::terminates_task(entry.syscall_no())
                    || entry.syscall_no() == libc::SYS_execve
                {
                    log.pending_entry = None;
                }
            }
            ProcessNotification::Exit(exit) => {
                let pending = log.pending_entry.take().expect("exit without entry");
                assert_eq!(pending, exit.syscall_no(), "exit matches its entry");
                assert!(exit.timestamp() >= log.last_timestamp);
                log.last_timestamp = exit.timestamp();
                log.exits += 1;
            }
            ProcessNotification::Termination(termination) => {
                log.terminated = true;
                exit_status = Some(termination.exit_status());
            }
        }
    }

    handle.wait().expect("worker verdict");

    assert_eq!(logs.len(), 1, "/bin/true never clones");
    let log = logs.values().next().unwrap();
    assert!(log.entries > 0, "a real program performs syscalls");
    assert!(log.exits > 0, "ordinary syscalls produce exit notifications");
    assert!(log.terminated, "the termination notification is mandatory");
    assert_eq!(exit_status, Some(0));
}

#[test]
fn shell_command_reports_zero_exit() {
    if !Path::new("/bin/sh").exists() {
        return;
    }
    let handle = spawn(
        TraceeSpec::Run {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), ":".into()],
        },
        pc_sp_options(),
        DecoderMapper::with_defaults(),
    )
    .expect("engine spawn");

    let mut terminations = Vec::new();
    while let Some(notification) = handle.next_notification() {
        match &notification {
            ProcessNotification::Entry(entry) => handle.authorize(entry).expect("authorize"),
            ProcessNotification::Exit(_) => {}
            ProcessNotification::Termination(termination) => {
                terminations.push((termination.spid().as_raw(), termination.exit_status()));
            }
        }
    }
    handle.wait().expect("worker verdict");

    assert!(!terminations.is_empty());
    // The thread-group leader exits cleanly.
    assert!(terminations.iter().any(|&(_, status)| status == 0));
}

#[test]
fn stray_signals_are_reinjected_not_reported() {
    if !Path::new("/bin/sh").exists() {
        return;
    }
    let handle = spawn(
        TraceeSpec::Run {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), "sleep 0.3".into()],
        },
        pc_sp_options(),
        DecoderMapper::new(),
    )
    .expect("engine spawn");

    let mut signalled = false;
    let mut terminations = 0usize;
    while let Some(notification) = handle.next_notification() {
        match &notification {
            ProcessNotification::Entry(entry) => {
                if !signalled {
                    // SIGWINCH is ignored by default: if the engine injects
                    // it back correctly, the tracee never notices.
                    let _ = nix::sys::signal::kill(
                        entry.spid(),
                        nix::sys::signal::Signal::SIGWINCH,
                    );
                    signalled = true;
                }
                handle.authorize(entry).expect("authorize");
            }
            ProcessNotification::Exit(_) => {}
            ProcessNotification::Termination(_) => terminations += 1,
        }
    }
    handle.wait().expect("worker verdict");

    assert!(signalled, "the test never delivered its signal");
    assert!(terminations > 0, "the tracee must still terminate normally");
}

#[test]
fn launch_failure_is_reported() {
    let result = spawn(
        TraceeSpec::Run {
            program: "/nonexistent/definitely-not-a-program".into(),
            args: Vec::new(),
        },
        pc_sp_options(),
        DecoderMapper::new(),
    );
    assert!(result.is_err());
}
