//! Authoriser behaviour over synthetic notification streams: learning,
//! enforcement, child seating and violation handling.

use config::Policy;
use engine::{ProcessNotification, StackFrame, SyscallEntry, Termination};
use policy::{Authorizer, Decision, DecisionHandler, FleetControl, Violation};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const SYS_WRITE: i64 = libc::SYS_write;
const SYS_CLONE: i64 = libc::SYS_clone;
const SYS_EXIT_GROUP: i64 = libc::SYS_exit_group;

#[derive(Default)]
struct RecordingControl {
    authorised: Mutex<Vec<i64>>,
    kills: AtomicUsize,
}

impl RecordingControl {
    fn authorised_syscalls(&self) -> Vec<i64> {
        self.authorised.lock().unwrap().clone()
    }

    fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

struct SharedControl(Arc<RecordingControl>);

impl FleetControl for SharedControl {
    fn authorize(&self, entry: &SyscallEntry) -> Result<(), engine::Error> {
        self.0.authorised.lock().unwrap().push(entry.syscall_no());
        Ok(())
    }

    fn kill_fleet(&self) -> bool {
        self.0.kills.fetch_add(1, Ordering::SeqCst);
        true
    }
}

/// Plays back a fixed decision script, failing closed when it runs dry.
struct ScriptedHandler {
    script: Vec<Decision>,
    violations: Arc<Mutex<Vec<String>>>,
}

impl ScriptedHandler {
    fn new(script: Vec<Decision>) -> (Self, Arc<Mutex<Vec<String>>>) {
        let violations = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                script,
                violations: violations.clone(),
            },
            violations,
        )
    }
}

impl DecisionHandler for ScriptedHandler {
    fn decide(&mut self, violation: &Violation<'_>) -> Decision {
        let kind = match violation {
            Violation::Unauthorised { .. } => "unauthorised",
            Violation::NotFinalEntry { .. } => "not-final-entry",
            Violation::NotFinalStates { .. } => "not-final-states",
        };
        self.violations.lock().unwrap().push(kind.to_string());
        if self.script.is_empty() {
            Decision::Kill
        } else {
            self.script.remove(0)
        }
    }
}

fn policy_at(dir: &Path, learn: bool) -> Policy {
    Policy {
        authorizer: true,
        learn,
        nfa: dir.join("nfa.bin"),
        associations: dir.join("associations.txt"),
        dot: None,
        ..Policy::default()
    }
}

fn entry(origin: &str, pid: i32, spid: i32, syscall: i64, site: &str) -> ProcessNotification {
    ProcessNotification::Entry(SyscallEntry::synthetic(
        origin,
        pid,
        spid,
        0,
        syscall,
        vec![StackFrame::symbolic(0x1000, 0x1000, 0x2000, site.into(), 4)],
    ))
}

fn termination(origin: &str, pid: i32, spid: i32) -> ProcessNotification {
    ProcessNotification::Termination(Termination::synthetic(origin, pid, spid, 0))
}

fn learn(dir: &Path, stream: &[ProcessNotification]) {
    let control = Arc::new(RecordingControl::default());
    let (handler, _) = ScriptedHandler::new(Vec::new());
    let mut authorizer = Authorizer::new(
        &policy_at(dir, true),
        Box::new(handler),
        Box::new(SharedControl(control.clone())),
    )
    .unwrap();
    for notification in stream {
        authorizer.process(notification).unwrap();
    }
    authorizer.terminate().unwrap();
    assert_eq!(control.kill_count(), 0, "learning never kills");
}

#[test]
fn learning_authorises_everything_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let stream = vec![
        entry("/bin/app", 10, 10, SYS_WRITE, "emit"),
        entry("/bin/app", 10, 10, SYS_WRITE, "emit_again"),
        entry("/bin/app", 10, 10, SYS_EXIT_GROUP, "shutdown"),
        termination("/bin/app", 10, 10),
    ];

    let control = Arc::new(RecordingControl::default());
    let (handler, violations) = ScriptedHandler::new(Vec::new());
    let mut authorizer = Authorizer::new(
        &policy_at(dir.path(), true),
        Box::new(handler),
        Box::new(SharedControl(control.clone())),
    )
    .unwrap();
    for notification in &stream {
        authorizer.process(notification).unwrap();
    }
    authorizer.terminate().unwrap();

    // Every entry was released, nothing was flagged.
    assert_eq!(
        control.authorised_syscalls(),
        vec![SYS_WRITE, SYS_WRITE, SYS_EXIT_GROUP]
    );
    assert!(violations.lock().unwrap().is_empty());
    assert!(dir.path().join("nfa.bin").exists());
    let text = std::fs::read_to_string(dir.path().join("associations.txt")).unwrap();
    assert!(text.contains("Section begin: /bin/app"));
    assert!(text.contains("Section end"));
}

#[test]
fn learned_trace_replays_under_enforcement() {
    let dir = tempfile::tempdir().unwrap();
    let stream = vec![
        entry("/bin/app", 10, 10, SYS_WRITE, "emit"),
        entry("/bin/app", 10, 10, SYS_WRITE, "emit_again"),
        entry("/bin/app", 10, 10, SYS_EXIT_GROUP, "shutdown"),
        termination("/bin/app", 10, 10),
    ];
    learn(dir.path(), &stream);

    let control = Arc::new(RecordingControl::default());
    let (handler, violations) = ScriptedHandler::new(Vec::new());
    let mut authorizer = Authorizer::new(
        &policy_at(dir.path(), false),
        Box::new(handler),
        Box::new(SharedControl(control.clone())),
    )
    .unwrap();
    for notification in &stream {
        authorizer.process(notification).unwrap();
    }
    authorizer.terminate().unwrap();

    assert!(
        violations.lock().unwrap().is_empty(),
        "the learning run must replay cleanly"
    );
    assert_eq!(control.kill_count(), 0);
    assert_eq!(control.authorised_syscalls().len(), 3);

    // The constructed automaton has the single initial state 0 and the
    // final states include the last entry's association number.
    let automaton = policy::Automaton::load(dir.path().join("nfa.bin"))
        .unwrap()
        .expect("learned automaton on disk");
    assert_eq!(automaton.initial_states().len(), 1);
    assert!(automaton.initial_states().contains(&0));
    assert!(!automaton.final_states().is_empty());
}

#[test]
fn deviation_is_refused_and_kills() {
    let dir = tempfile::tempdir().unwrap();
    learn(
        dir.path(),
        &[
            entry("/bin/app", 10, 10, SYS_WRITE, "emit"),
            termination("/bin/app", 10, 10),
        ],
    );

    let control = Arc::new(RecordingControl::default());
    let (handler, violations) = ScriptedHandler::new(Vec::new()); // empty script: kill
    let mut authorizer = Authorizer::new(
        &policy_at(dir.path(), false),
        Box::new(handler),
        Box::new(SharedControl(control.clone())),
    )
    .unwrap();

    // A call site that was never learned.
    authorizer
        .process(&entry("/bin/app", 10, 10, SYS_WRITE, "sneaky"))
        .unwrap();

    assert_eq!(violations.lock().unwrap().as_slice(), ["unauthorised"]);
    assert_eq!(control.kill_count(), 1);
    assert!(
        control.authorised_syscalls().is_empty(),
        "a refused entry is never released"
    );
}

#[test]
fn admitting_a_deviation_extends_the_automaton() {
    let dir = tempfile::tempdir().unwrap();
    learn(
        dir.path(),
        &[
            entry("/bin/app", 10, 10, SYS_WRITE, "emit"),
            termination("/bin/app", 10, 10),
        ],
    );

    let control = Arc::new(RecordingControl::default());
    // Two admissions: the novel state itself, then its self-loop.
    let (handler, violations) =
        ScriptedHandler::new(vec![Decision::Admit, Decision::Admit]);
    let mut authorizer = Authorizer::new(
        &policy_at(dir.path(), false),
        Box::new(handler),
        Box::new(SharedControl(control.clone())),
    )
    .unwrap();

    let sneaky = entry("/bin/app", 10, 10, SYS_WRITE, "sneaky");
    authorizer.process(&sneaky).unwrap();
    authorizer.process(&sneaky).unwrap();
    // The second admission added the self transition, so the third pass is
    // clean.
    authorizer.process(&sneaky).unwrap();

    assert_eq!(
        violations.lock().unwrap().as_slice(),
        ["unauthorised", "unauthorised"]
    );
    assert_eq!(control.kill_count(), 0);
    assert_eq!(control.authorised_syscalls().len(), 3);
}

#[test]
fn child_is_seated_on_its_generator_state() {
    let dir = tempfile::tempdir().unwrap();

    // Learning run: the parent clones, the child works and both exit.
    let clone_entry = SyscallEntry::synthetic(
        "/bin/app",
        10,
        10,
        0,
        SYS_CLONE,
        vec![StackFrame::symbolic(0x1000, 0x1000, 0x2000, "spawn".into(), 4)],
    );
    clone_entry.record_spawn(11, 11);
    let stream = vec![
        entry("/bin/app", 10, 10, SYS_WRITE, "emit"),
        ProcessNotification::Entry(clone_entry.clone()),
        entry("/bin/app", 11, 11, SYS_WRITE, "child_emit"),
        termination("/bin/app", 11, 11),
        termination("/bin/app", 10, 10),
    ];
    learn(dir.path(), &stream);

    // Enforce: the child is seated on the clone's fingerprint id, first via
    // the completed-spawn shortcut, then via the generator list.
    let control = Arc::new(RecordingControl::default());
    let (handler, violations) = ScriptedHandler::new(Vec::new());
    let mut authorizer = Authorizer::new(
        &policy_at(dir.path(), false),
        Box::new(handler),
        Box::new(SharedControl(control.clone())),
    )
    .unwrap();
    for notification in &stream {
        authorizer.process(notification).unwrap();
    }
    authorizer.terminate().unwrap();
    assert!(violations.lock().unwrap().is_empty());
    assert_eq!(control.kill_count(), 0);

    // Same run, but the spawn is recorded only after the parent's entry was
    // processed, forcing the generator lookup path.
    let control = Arc::new(RecordingControl::default());
    let (handler, violations) = ScriptedHandler::new(Vec::new());
    let mut authorizer = Authorizer::new(
        &policy_at(dir.path(), false),
        Box::new(handler),
        Box::new(SharedControl(control.clone())),
    )
    .unwrap();

    let late_clone = SyscallEntry::synthetic(
        "/bin/app",
        10,
        10,
        0,
        SYS_CLONE,
        vec![StackFrame::symbolic(0x1000, 0x1000, 0x2000, "spawn".into(), 4)],
    );
    authorizer
        .process(&entry("/bin/app", 10, 10, SYS_WRITE, "emit"))
        .unwrap();
    authorizer
        .process(&ProcessNotification::Entry(late_clone.clone()))
        .unwrap();
    late_clone.record_spawn(11, 11);
    authorizer
        .process(&entry("/bin/app", 11, 11, SYS_WRITE, "child_emit"))
        .unwrap();
    authorizer.process(&termination("/bin/app", 11, 11)).unwrap();
    authorizer.process(&termination("/bin/app", 10, 10)).unwrap();

    assert!(violations.lock().unwrap().is_empty());
    assert_eq!(control.kill_count(), 0);
    assert_eq!(control.authorised_syscalls().len(), 3);
}

#[test]
fn unknown_thread_is_not_authorised() {
    let dir = tempfile::tempdir().unwrap();
    learn(
        dir.path(),
        &[
            entry("/bin/app", 10, 10, SYS_WRITE, "emit"),
            termination("/bin/app", 10, 10),
        ],
    );

    let control = Arc::new(RecordingControl::default());
    let (handler, violations) = ScriptedHandler::new(Vec::new());
    let mut authorizer = Authorizer::new(
        &policy_at(dir.path(), false),
        Box::new(handler),
        Box::new(SharedControl(control.clone())),
    )
    .unwrap();

    authorizer
        .process(&entry("/bin/app", 10, 10, SYS_WRITE, "emit"))
        .unwrap();
    // A second task appears without any generator announcing it.
    authorizer
        .process(&entry("/bin/app", 99, 99, SYS_WRITE, "emit"))
        .unwrap();

    assert_eq!(violations.lock().unwrap().as_slice(), ["unauthorised"]);
    assert_eq!(control.kill_count(), 1);
}

#[test]
fn non_final_termination_can_be_marked_final() {
    let dir = tempfile::tempdir().unwrap();
    learn(
        dir.path(),
        &[
            entry("/bin/app", 10, 10, SYS_WRITE, "emit"),
            entry("/bin/app", 10, 10, SYS_WRITE, "emit_late"),
            termination("/bin/app", 10, 10),
        ],
    );

    // Enforce a run that stops after the first call site: its state is not
    // final, the operator marks it.
    let control = Arc::new(RecordingControl::default());
    let (handler, violations) = ScriptedHandler::new(vec![Decision::Admit]);
    let mut authorizer = Authorizer::new(
        &policy_at(dir.path(), false),
        Box::new(handler),
        Box::new(SharedControl(control.clone())),
    )
    .unwrap();
    authorizer
        .process(&entry("/bin/app", 10, 10, SYS_WRITE, "emit"))
        .unwrap();
    authorizer.process(&termination("/bin/app", 10, 10)).unwrap();
    authorizer.terminate().unwrap();

    assert_eq!(violations.lock().unwrap().as_slice(), ["not-final-states"]);
    assert_eq!(control.kill_count(), 0);

    // The marking was persisted: the same truncated run now replays clean.
    let control = Arc::new(RecordingControl::default());
    let (handler, violations) = ScriptedHandler::new(Vec::new());
    let mut authorizer = Authorizer::new(
        &policy_at(dir.path(), false),
        Box::new(handler),
        Box::new(SharedControl(control.clone())),
    )
    .unwrap();
    authorizer
        .process(&entry("/bin/app", 10, 10, SYS_WRITE, "emit"))
        .unwrap();
    authorizer.process(&termination("/bin/app", 10, 10)).unwrap();
    authorizer.terminate().unwrap();
    assert!(violations.lock().unwrap().is_empty());
}

#[test]
fn exits_are_recorded_only() {
    let dir = tempfile::tempdir().unwrap();
    learn(
        dir.path(),
        &[
            entry("/bin/app", 10, 10, SYS_WRITE, "emit"),
            termination("/bin/app", 10, 10),
        ],
    );

    let control = Arc::new(RecordingControl::default());
    let (handler, violations) = ScriptedHandler::new(Vec::new());
    let mut authorizer = Authorizer::new(
        &policy_at(dir.path(), false),
        Box::new(handler),
        Box::new(SharedControl(control.clone())),
    )
    .unwrap();

    // An exit flows through without consulting the automaton or the engine.
    let exit = engine::SyscallExit::synthetic("/bin/app", 10, 10, 0, SYS_WRITE, 42);
    authorizer
        .process(&ProcessNotification::Exit(exit))
        .unwrap();
    assert!(violations.lock().unwrap().is_empty());
    assert!(control.authorised_syscalls().is_empty());
}

#[test]
fn enforce_mode_requires_a_learned_automaton() {
    let dir = tempfile::tempdir().unwrap();
    let control = Arc::new(RecordingControl::default());
    let (handler, _) = ScriptedHandler::new(Vec::new());
    let result = Authorizer::new(
        &policy_at(dir.path(), false),
        Box::new(handler),
        Box::new(SharedControl(control)),
    );
    assert!(matches!(result, Err(policy::Error::MissingAutomaton(_))));
}
