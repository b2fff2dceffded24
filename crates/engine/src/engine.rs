//! Fleet management.
//!
//! One dedicated OS thread (the worker) performs every ptrace and waitpid
//! operation for every tracee; the kernel ties the tracing relationship to
//! that thread. Consumers talk to it through the notification channel, two
//! signal-drained queues and the live-task roster.

use crate::decode::DecoderMapper;
use crate::error::Error;
use crate::notification::{ProcessNotification, SyscallEntry};
use crate::signals;
use crate::tracer::{HandleOutcome, Tracer};
use config::Trace;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::os::unix::thread::JoinHandleExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// What the first tracer should bind to.
#[derive(Debug, Clone)]
pub enum TraceeSpec {
    /// Fork and exec a program under tracing.
    Run { program: PathBuf, args: Vec<String> },
    /// Attach to an already-running kernel task.
    Attach { spid: i32 },
}

struct AttachRequest {
    spid: i32,
    options: Trace,
}

#[derive(Default)]
pub(crate) struct Shared {
    authorised: Mutex<VecDeque<SyscallEntry>>,
    attach_wait: Mutex<VecDeque<AttachRequest>>,
    live: Mutex<BTreeSet<Pid>>,
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Start the tracing engine. Returns once the worker thread is running and
/// the first tracer delivered its initial stop.
pub fn spawn(
    spec: TraceeSpec,
    options: Trace,
    decoders: DecoderMapper,
) -> Result<EngineHandle, Error> {
    let shared = Arc::new(Shared::default());
    let (notify_tx, notify_rx) = flume::unbounded();
    let (ready_tx, ready_rx) = flume::bounded(1);

    let worker_shared = Arc::clone(&shared);
    let join = std::thread::Builder::new()
        .name("ptrace-worker".into())
        .spawn(move || {
            Worker::new(worker_shared, notify_tx, decoders, options).run(spec, ready_tx)
        })
        .map_err(Error::SpawnWorker)?;
    let worker_thread = join.as_pthread_t();

    let worker_spid = match ready_rx.recv() {
        Ok(Ok(spid)) => spid,
        Ok(Err(err)) => {
            let _ = join.join();
            return Err(err);
        }
        Err(_) => {
            let _ = join.join();
            return Err(Error::WorkerGone);
        }
    };

    Ok(EngineHandle {
        client: EngineClient {
            shared,
            notifications: notify_rx,
            worker_thread,
            worker_spid,
        },
        worker: Some(join),
    })
}

/// Owner-side handle: an [`EngineClient`] plus the worker join handle.
pub struct EngineHandle {
    client: EngineClient,
    worker: Option<JoinHandle<Result<(), Error>>>,
}

impl EngineHandle {
    /// A cheap clone of the consumer-side surface, e.g. for the authoriser.
    pub fn client(&self) -> EngineClient {
        self.client.clone()
    }

    /// Join the worker and surface its verdict. The notification stream ends
    /// before this returns.
    pub fn wait(mut self) -> Result<(), Error> {
        let Some(worker) = self.worker.take() else {
            return Err(Error::WorkerGone);
        };
        match worker.join() {
            Ok(result) => result,
            Err(_) => Err(Error::WorkerGone),
        }
    }
}

impl std::ops::Deref for EngineHandle {
    type Target = EngineClient;

    fn deref(&self) -> &EngineClient {
        &self.client
    }
}

/// Consumer-side surface of the engine: notification stream, authorisation,
/// attach requests and kill switches. Clonable across threads.
#[derive(Clone)]
pub struct EngineClient {
    shared: Arc<Shared>,
    notifications: flume::Receiver<ProcessNotification>,
    worker_thread: nix::sys::pthread::Pthread,
    worker_spid: Pid,
}

impl EngineClient {
    /// Blocking pop of the next notification. `None` marks the end of the
    /// stream: every tracer has been retired and the worker dropped its
    /// sender.
    pub fn next_notification(&self) -> Option<ProcessNotification> {
        self.notifications.recv().ok()
    }

    /// Like [`Self::next_notification`] with a timeout, for consumers that
    /// interleave shutdown polling.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<ProcessNotification, flume::RecvTimeoutError> {
        self.notifications.recv_timeout(timeout)
    }

    /// Authorise a suspended syscall entry. Idempotent: an entry authorised
    /// before is left alone. The tracee resumes once the worker's SIGUSR1
    /// handler drains the queue.
    pub fn authorize(&self, entry: &SyscallEntry) -> Result<(), Error> {
        if !entry.mark_authorised() {
            return Ok(());
        }
        lock_ignoring_poison(&self.shared.authorised).push_back(entry.clone());
        nix::sys::pthread::pthread_kill(self.worker_thread, Signal::SIGUSR1)
            .map_err(Error::Signal)
    }

    /// Ask the worker to attach a new tracee. Served by the SIGUSR2 handler.
    pub fn attach(&self, spid: i32, options: Trace) -> Result<(), Error> {
        lock_ignoring_poison(&self.shared.attach_wait).push_back(AttachRequest { spid, options });
        nix::sys::pthread::pthread_kill(self.worker_thread, Signal::SIGUSR2)
            .map_err(Error::Signal)
    }

    /// Deliver a signal to one tracee.
    pub fn kill(&self, spid: i32, signal: Signal) -> Result<(), Error> {
        let target = Pid::from_raw(spid);
        if !lock_ignoring_poison(&self.shared.live).contains(&target) {
            return Err(Error::InvalidState {
                spid,
                operation: "kill",
                reason: "no such tracee",
            });
        }
        nix::sys::signal::kill(target, signal).map_err(Error::Signal)
    }

    /// Deliver SIGKILL to every tracee. True iff every delivery succeeded.
    pub fn kill_fleet(&self) -> bool {
        let targets: Vec<Pid> = lock_ignoring_poison(&self.shared.live).iter().copied().collect();
        let mut all_delivered = true;
        for target in targets {
            info!(spid = target.as_raw(), "killing traced task");
            if nix::sys::signal::kill(target, Signal::SIGKILL).is_err() {
                all_delivered = false;
            }
        }
        all_delivered
    }

    /// True while at least one tracee is alive.
    pub fn is_running(&self) -> bool {
        !lock_ignoring_poison(&self.shared.live).is_empty()
    }

    /// Kernel task id of the worker thread.
    pub fn worker_spid(&self) -> Pid {
        self.worker_spid
    }
}

pub(crate) struct Worker {
    shared: Arc<Shared>,
    notifications: flume::Sender<ProcessNotification>,
    decoders: DecoderMapper,
    options: Trace,
    tracers: BTreeMap<Pid, Tracer>,
    /// Stops that arrived before their tracer existed, replayed at adoption.
    possible_children: FxHashMap<Pid, WaitStatus>,
    /// execve targets extracted at entry, applied if the call succeeds.
    possible_execves: FxHashMap<Pid, String>,
    /// Errors raised inside signal handlers, logged from the main loop.
    faults: Vec<Error>,
    epoch: Instant,
}

impl Worker {
    fn new(
        shared: Arc<Shared>,
        notifications: flume::Sender<ProcessNotification>,
        decoders: DecoderMapper,
        options: Trace,
    ) -> Self {
        Self {
            shared,
            notifications,
            decoders,
            options,
            tracers: BTreeMap::new(),
            possible_children: FxHashMap::default(),
            possible_execves: FxHashMap::default(),
            faults: Vec::new(),
            epoch: Instant::now(),
        }
    }

    fn run(
        mut self,
        spec: TraceeSpec,
        ready: flume::Sender<Result<Pid, Error>>,
    ) -> Result<(), Error> {
        let _registration = signals::WorkerRegistration::new(&mut self as *mut Worker);
        if let Err(errno) = signals::install_handlers().and_then(|()| signals::block_wake_signals())
        {
            let _ = ready.send(Err(Error::Signal(errno)));
            return Ok(());
        }
        let worker_spid = nix::unistd::gettid();
        debug!(worker_spid = worker_spid.as_raw(), "tracing worker started");

        let first = match &spec {
            TraceeSpec::Run { program, args } => {
                Tracer::launch(program, args, &self.options, self.epoch)
            }
            TraceeSpec::Attach { spid } => Tracer::attach(*spid, &self.options, self.epoch),
        };
        let mut first = match first {
            Ok(tracer) => tracer,
            Err(err) => {
                let _ = ready.send(Err(err));
                return Ok(());
            }
        };
        if let Err(err) = first.init(None) {
            let _ = ready.send(Err(err));
            return Ok(());
        }
        self.adopt(first);
        let _ = ready.send(Ok(worker_spid));

        let result = self.main_loop();
        self.decoders.report();
        lock_ignoring_poison(&self.shared.live).clear();
        result
    }

    fn main_loop(&mut self) -> Result<(), Error> {
        while !self.tracers.is_empty() {
            self.log_handler_faults();
            let status = match self.wait_any() {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    warn!("no children left to wait for");
                    break;
                }
                Err(errno) => {
                    error!(%errno, "waitpid failed, killing the fleet");
                    self.kill_fleet();
                    return Err(Error::Wait(errno));
                }
            };
            if let Err(err) = self.dispatch(status) {
                error!(%err, "unrecoverable tracing error, killing the fleet");
                self.kill_fleet();
                return Err(err);
            }
        }
        self.log_handler_faults();
        if !self.possible_children.is_empty() {
            let spids: Vec<i32> = self.possible_children.keys().map(|p| p.as_raw()).collect();
            warn!(?spids, "stops arrived for tasks no tracer ever claimed");
        }
        Ok(())
    }

    /// Wait for any tracee. The wake-up signals are deliverable only inside
    /// this window, so their handlers never interleave with fleet mutation.
    fn wait_any(&mut self) -> Result<WaitStatus, Errno> {
        let _window = signals::WakeWindow::open()?;
        waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL))
    }

    fn dispatch(&mut self, status: WaitStatus) -> Result<(), Error> {
        let Some(spid) = status.pid() else {
            return Ok(());
        };
        let Some(tracer) = self.tracers.get_mut(&spid) else {
            debug!(
                spid = spid.as_raw(),
                "stop from an unknown task, keeping it for the child rendezvous"
            );
            self.possible_children.insert(spid, status);
            return Ok(());
        };
        let outcome = tracer.handle(status);
        match outcome {
            Ok(outcome) => self.apply_outcome(spid, outcome),
            Err(err) if err.is_vanished() => {
                warn!(spid = spid.as_raw(), %err, "tracee vanished, retiring its tracer");
                self.remove_tracer(spid);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn apply_outcome(&mut self, spid: Pid, outcome: HandleOutcome) -> Result<(), Error> {
        match outcome {
            HandleOutcome::Resumed | HandleOutcome::AlreadyGone => Ok(()),
            HandleOutcome::Notify(notification) => {
                if let Some(tracer) = self.tracers.get_mut(&spid) {
                    let pid = tracer.pid();
                    if let Some(target) = tracer.take_pending_execve() {
                        debug!(pid = pid.as_raw(), %target, "possible execve");
                        self.possible_execves.insert(pid, target);
                    }
                }
                self.decode(spid, &notification);
                let _ = self.notifications.send(notification);
                Ok(())
            }
            HandleOutcome::ChildSpawned {
                child_pid,
                child_spid,
            } => {
                self.adopt_child(spid, child_pid, child_spid);
                Ok(())
            }
            HandleOutcome::Execve { pid } => {
                self.apply_execve(spid, pid);
                Ok(())
            }
            HandleOutcome::ImminentExit(termination) => {
                if let Some(tracer) = self.tracers.get_mut(&spid) {
                    // Kept until the death status arrives; the termination
                    // notification goes out only once.
                    tracer.mark_retired();
                }
                let _ = self
                    .notifications
                    .send(ProcessNotification::Termination(termination));
                Ok(())
            }
            HandleOutcome::Exited(termination) => {
                let already_reported = self
                    .tracers
                    .get(&spid)
                    .map(Tracer::is_retired)
                    .unwrap_or(true);
                if !already_reported {
                    let _ = self
                        .notifications
                        .send(ProcessNotification::Termination(termination));
                }
                info!(spid = spid.as_raw(), "tracee terminated");
                self.remove_tracer(spid);
                Ok(())
            }
        }
    }

    fn adopt(&mut self, tracer: Tracer) {
        lock_ignoring_poison(&self.shared.live).insert(tracer.spid());
        self.tracers.insert(tracer.spid(), tracer);
    }

    fn remove_tracer(&mut self, spid: Pid) {
        self.tracers.remove(&spid);
        lock_ignoring_poison(&self.shared.live).remove(&spid);
    }

    /// Install a tracer for a task created by an observed clone/fork/vfork.
    /// If the child delivered its first stop before the tracer existed, that
    /// stop is replayed into `init`.
    fn adopt_child(&mut self, parent: Pid, child_pid: Pid, child_spid: Pid) {
        let Some(parent_tracer) = self.tracers.get(&parent) else {
            return;
        };
        info!(
            parent = parent.as_raw(),
            child_pid = child_pid.as_raw(),
            child_spid = child_spid.as_raw(),
            "tracing new task"
        );
        let mut child = match parent_tracer.fork_child(child_pid, child_spid) {
            Ok(child) => child,
            Err(err) => {
                warn!(child_spid = child_spid.as_raw(), %err, "could not clone tracer");
                return;
            }
        };
        let replayed = self.possible_children.remove(&child_spid);
        match child.init(replayed) {
            Ok(()) => self.adopt(child),
            Err(err) => {
                warn!(child_spid = child_spid.as_raw(), %err, "new task init failed")
            }
        }
    }

    /// A successful execve leaves only the thread-group leader alive; the
    /// kernel silently destroys every other task of the group.
    fn apply_execve(&mut self, spid: Pid, pid: Pid) {
        match self.possible_execves.get(&pid) {
            Some(name) => {
                info!(pid = pid.as_raw(), %name, "process image changed");
                if let Some(tracer) = self.tracers.get_mut(&spid) {
                    tracer.set_executable(name);
                }
            }
            None => warn!(
                pid = pid.as_raw(),
                "execve completed without a captured target"
            ),
        }
        let doomed: Vec<Pid> = self
            .tracers
            .values()
            .filter(|t| t.pid() == pid && t.spid() != t.pid())
            .map(Tracer::spid)
            .collect();
        for sibling in doomed {
            debug!(
                spid = sibling.as_raw(),
                "retiring sibling tracer after execve"
            );
            self.remove_tracer(sibling);
        }
    }

    fn decode(&mut self, spid: Pid, notification: &ProcessNotification) {
        let Some(tracer) = self.tracers.get(&spid) else {
            return;
        };
        if let Err(err) = self.decoders.decode(tracer, notification) {
            // Transient by contract: the notification still goes out.
            debug!(spid = spid.as_raw(), %err, "decoder failed");
        }
    }

    fn kill_fleet(&mut self) {
        for tracer in self.tracers.values() {
            let _ = tracer.kill(Signal::SIGKILL);
        }
    }

    fn log_handler_faults(&mut self) {
        for fault in self.faults.drain(..) {
            warn!(%fault, "deferred error from a signal handler");
        }
    }

    /// SIGUSR1 handler body: release every tracee whose entry was authorised.
    pub(crate) fn drain_authorised(&mut self) {
        loop {
            let entry = lock_ignoring_poison(&self.shared.authorised).pop_front();
            let Some(entry) = entry else { break };
            let Some(tracer) = self.tracers.get_mut(&entry.spid()) else {
                continue;
            };
            if let Err(err) = tracer.proceed() {
                self.faults.push(err);
            }
        }
    }

    /// SIGUSR2 handler body: initialise every queued attach request.
    pub(crate) fn drain_attach_wait(&mut self) {
        loop {
            let request = lock_ignoring_poison(&self.shared.attach_wait).pop_front();
            let Some(AttachRequest { spid, options }) = request else {
                break;
            };
            let attached = Tracer::attach(spid, &options, self.epoch).and_then(|mut tracer| {
                tracer.init(None)?;
                Ok(tracer)
            });
            match attached {
                Ok(tracer) => self.adopt(tracer),
                Err(err) => self.faults.push(err),
            }
        }
    }
}
