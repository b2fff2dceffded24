//! The policy front-end.
//!
//! In learning mode every observation is admitted and logged; the automaton
//! is (re)built at `terminate`. In enforce mode each entry advances a
//! per-task set of automaton states and a violation suspends the decision to
//! the configured handler.

use crate::StateId;
use crate::associations::FingerprintMap;
use crate::automaton::{Automaton, TransitionMap};
use crate::error::Error;
use crate::fingerprint::Fingerprint;
use crate::handler::{Decision, DecisionHandler, Violation};
use config::Policy;
use engine::{ChildStatus, ProcessNotification, SyscallEntry};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// The authoriser's feedback channel into the tracing engine.
pub trait FleetControl {
    /// Release a tracee suspended at this entry.
    fn authorize(&self, entry: &SyscallEntry) -> Result<(), engine::Error>;

    /// Kill every tracee. True iff every delivery succeeded.
    fn kill_fleet(&self) -> bool;
}

impl FleetControl for engine::EngineClient {
    fn authorize(&self, entry: &SyscallEntry) -> Result<(), engine::Error> {
        engine::EngineClient::authorize(self, entry)
    }

    fn kill_fleet(&self) -> bool {
        engine::EngineClient::kill_fleet(self)
    }
}

enum ModeState {
    Learning {
        /// Observation log in arrival order; exits are not recorded.
        log: Vec<ProcessNotification>,
        /// A previously learned automaton to extend, if any.
        existing: Option<Automaton>,
    },
    Enforce {
        automaton: Automaton,
        /// The set of states each task could presently be in, keyed by spid.
        current: FxHashMap<i32, BTreeSet<StateId>>,
        /// Unresolved task-generating entries awaiting the first
        /// notification of the task they spawned.
        generators: Vec<SyscallEntry>,
    },
}

enum Evaluation {
    Authorised,
    NotAuthorised,
    NotFinalEntry(StateId),
    NotFinalTermination(BTreeSet<StateId>),
}

/// Upper bound of the learning log. Once full, further observations are
/// admitted but no longer recorded, so the learned automaton only covers the
/// prefix of the run.
const LEARNING_LOG_CAPACITY: usize = 4_000_000;

pub struct Authorizer {
    mode: ModeState,
    associations: FingerprintMap,
    nfa_path: PathBuf,
    dot_path: Option<PathBuf>,
    handler: Box<dyn DecisionHandler>,
    control: Box<dyn FleetControl>,
}

impl Authorizer {
    pub fn new(
        policy: &Policy,
        handler: Box<dyn DecisionHandler>,
        control: Box<dyn FleetControl>,
    ) -> Result<Self, Error> {
        let associations = FingerprintMap::open(&policy.associations)?;
        let stored = Automaton::load(&policy.nfa)?;
        let mode = if policy.learn {
            ModeState::Learning {
                log: Vec::new(),
                existing: stored,
            }
        } else {
            let Some(automaton) = stored else {
                return Err(Error::MissingAutomaton(policy.nfa.clone()));
            };
            ModeState::Enforce {
                automaton,
                current: FxHashMap::default(),
                generators: Vec::new(),
            }
        };
        Ok(Self {
            mode,
            associations,
            nfa_path: policy.nfa.clone(),
            dot_path: policy.dot.clone(),
            handler,
            control,
        })
    }

    pub fn is_learning(&self) -> bool {
        matches!(self.mode, ModeState::Learning { .. })
    }

    /// The enforced automaton, if enforcing.
    pub fn automaton(&self) -> Option<&Automaton> {
        match &self.mode {
            ModeState::Enforce { automaton, .. } => Some(automaton),
            ModeState::Learning { .. } => None,
        }
    }

    pub fn associations(&self) -> &FingerprintMap {
        &self.associations
    }

    /// Decide on one notification and release or kill the tracee.
    pub fn process(&mut self, notification: &ProcessNotification) -> Result<(), Error> {
        match self.evaluate(notification) {
            Evaluation::Authorised => {}
            Evaluation::NotAuthorised => {
                let ProcessNotification::Entry(entry) = notification else {
                    return Ok(());
                };
                warn!(
                    spid = entry.spid().as_raw(),
                    syscall = %engine::syscalls::name(entry.syscall_no()),
                    "system call not admitted by the learned policy"
                );
                match self.handler.decide(&Violation::Unauthorised { entry }) {
                    Decision::Kill => {
                        self.kill();
                        return Ok(());
                    }
                    Decision::Admit => self.admit(entry)?,
                }
            }
            Evaluation::NotFinalEntry(state) => {
                let ProcessNotification::Entry(entry) = notification else {
                    return Ok(());
                };
                match self.handler.decide(&Violation::NotFinalEntry { entry, state }) {
                    Decision::Kill => {
                        self.kill();
                        return Ok(());
                    }
                    Decision::Admit => self.mark_states_final(&BTreeSet::from([state]))?,
                }
            }
            Evaluation::NotFinalTermination(states) => {
                let spid = notification.spid().as_raw();
                warn!(spid, ?states, "task ended outside every final state");
                let violation = Violation::NotFinalStates {
                    spid,
                    states: &states,
                };
                match self.handler.decide(&violation) {
                    Decision::Kill => {
                        self.kill();
                        return Ok(());
                    }
                    Decision::Admit => self.mark_states_final(&states)?,
                }
            }
        }
        if let ProcessNotification::Entry(entry) = notification {
            self.control.authorize(entry)?;
        }
        Ok(())
    }

    /// Final bookkeeping once the notification stream ended: in enforce
    /// mode check that every task rests on a final state, in learning mode
    /// rebuild the automaton; then persist automaton and associations.
    pub fn terminate(&mut self) -> Result<(), Error> {
        let automaton = if self.is_learning() {
            self.build_learned()?
        } else {
            self.check_final_states()?;
            match &self.mode {
                ModeState::Enforce { automaton, .. } => automaton.clone(),
                ModeState::Learning { .. } => {
                    return Err(Error::Automaton("mode changed during terminate".into()));
                }
            }
        };
        automaton.store(&self.nfa_path)?;
        info!(path = %self.nfa_path.display(), "automaton saved");
        if let Some(dot_path) = &self.dot_path {
            std::fs::write(dot_path, automaton.visualize())?;
            info!(path = %dot_path.display(), "automaton DOT dump written");
        }
        self.associations.save()?;
        Ok(())
    }

    fn kill(&mut self) {
        if !self.control.kill_fleet() {
            warn!("one or more tracees did not receive the kill signal");
        }
    }

    fn evaluate(&mut self, notification: &ProcessNotification) -> Evaluation {
        match &mut self.mode {
            ModeState::Learning { log, .. } => {
                // Exits report what already happened; they carry no label.
                if !matches!(notification, ProcessNotification::Exit(_))
                    && log.len() < LEARNING_LOG_CAPACITY
                {
                    log.push(notification.clone());
                    if log.len() == LEARNING_LOG_CAPACITY {
                        warn!("learning log is full, later observations will not be learned");
                    }
                }
                Evaluation::Authorised
            }
            ModeState::Enforce {
                automaton,
                current,
                generators,
            } => match notification {
                ProcessNotification::Exit(_) => Evaluation::Authorised,
                ProcessNotification::Termination(termination) => {
                    let states = current
                        .get(&termination.spid().as_raw())
                        .cloned()
                        .unwrap_or_default();
                    let accepting = states
                        .intersection(automaton.final_states())
                        .next()
                        .is_some();
                    if accepting {
                        Evaluation::Authorised
                    } else {
                        Evaluation::NotFinalTermination(states)
                    }
                }
                ProcessNotification::Entry(entry) => {
                    let spid = entry.spid().as_raw();
                    if !current.contains_key(&spid) {
                        if current.is_empty() {
                            // The first traced task starts at the automaton
                            // start state.
                            current.insert(spid, automaton.initial_states().clone());
                        } else {
                            // An unknown task must match a recorded
                            // generator; it is seated on the generator's
                            // fingerprint id.
                            let seat = generators.iter().position(|generator| {
                                generator
                                    .spawned_child()
                                    .is_some_and(|child| child.spid.as_raw() == spid)
                            });
                            let seat = seat.and_then(|index| {
                                let generator = &generators[index];
                                self.associations
                                    .find(generator.origin(), &Fingerprint::of(generator))
                                    .map(|label| (index, label))
                            });
                            match seat {
                                Some((index, label)) => {
                                    generators.remove(index);
                                    current.insert(spid, BTreeSet::from([label]));
                                }
                                None => {
                                    debug!(spid, "notification from an unknown task");
                                    return Evaluation::NotAuthorised;
                                }
                            }
                        }
                    }
                    let Some(label) = self
                        .associations
                        .find(entry.origin(), &Fingerprint::of(entry))
                    else {
                        debug!(spid, "fingerprint is not in the associations");
                        return Evaluation::NotAuthorised;
                    };
                    let Some(states) = current.get(&spid) else {
                        return Evaluation::NotAuthorised;
                    };
                    let next = automaton.transition(states, label);
                    if next.is_empty() {
                        debug!(spid, label, "no transition admits this entry");
                        return Evaluation::NotAuthorised;
                    }
                    debug!(spid, label, "transition authorised");
                    current.insert(spid, next.clone());
                    match entry.child() {
                        ChildStatus::Spawned(spawn) => {
                            // The clone already completed: seat the child on
                            // the parent's state set right away.
                            current.insert(spawn.spid.as_raw(), next);
                        }
                        ChildStatus::Possible => generators.push(entry.clone()),
                        ChildStatus::None => {}
                    }
                    if engine::syscalls::terminates_task(entry.syscall_no())
                        && !automaton.final_states().contains(&label)
                    {
                        return Evaluation::NotFinalEntry(label);
                    }
                    Evaluation::Authorised
                }
            },
        }
    }

    /// The operator admitted an unauthorised entry: intern its fingerprint,
    /// add a transition from every current state and rebuild the automaton.
    fn admit(&mut self, entry: &SyscallEntry) -> Result<(), Error> {
        let label = self
            .associations
            .insert(entry.origin(), Fingerprint::of(entry));
        let ModeState::Enforce {
            automaton, current, ..
        } = &mut self.mode
        else {
            return Ok(());
        };
        let spid = entry.spid().as_raw();
        let (_, mut transitions) = automaton.transition_maps();
        if let Some(states) = current.get(&spid) {
            for &state in states {
                info!(from = state, to = label, "transition admitted");
                transitions
                    .entry(state)
                    .or_default()
                    .entry(label)
                    .or_default()
                    .insert(label);
            }
        }
        current.insert(spid, BTreeSet::from([label]));
        let state_count = automaton.state_count().max(label + 1);
        *automaton = Automaton::construct(
            state_count,
            automaton.initial_states().clone(),
            automaton.final_states().clone(),
            transitions,
        )?;
        Ok(())
    }

    fn mark_states_final(&mut self, states: &BTreeSet<StateId>) -> Result<(), Error> {
        let ModeState::Enforce { automaton, .. } = &mut self.mode else {
            return Ok(());
        };
        let mut finals = automaton.final_states().clone();
        for &state in states {
            info!(state, "association number marked as final");
            finals.insert(state);
        }
        automaton.set_final_states(finals)
    }

    /// Last enforcement check: every task must rest on a final state.
    fn check_final_states(&mut self) -> Result<(), Error> {
        let pending: Vec<(i32, BTreeSet<StateId>)> = match &self.mode {
            ModeState::Enforce {
                automaton, current, ..
            } => current
                .iter()
                .filter(|(_, states)| {
                    states
                        .intersection(automaton.final_states())
                        .next()
                        .is_none()
                })
                .map(|(&spid, states)| (spid, states.clone()))
                .collect(),
            ModeState::Learning { .. } => Vec::new(),
        };
        for (spid, states) in pending {
            warn!(spid, ?states, "task ended outside every final state");
            let decision = self.handler.decide(&Violation::NotFinalStates {
                spid,
                states: &states,
            });
            if decision == Decision::Admit {
                self.mark_states_final(&states)?;
            }
        }
        Ok(())
    }

    /// Rebuild the automaton from the observation log, extending a
    /// previously learned automaton when one was on disk.
    fn build_learned(&mut self) -> Result<Automaton, Error> {
        let ModeState::Learning { log, existing } = &self.mode else {
            return Err(Error::Automaton("not in learning mode".into()));
        };
        let (initials, mut finals, mut transitions) = match existing {
            Some(automaton) => {
                let (_, forward) = automaton.transition_maps();
                (
                    automaton.initial_states().clone(),
                    automaton.final_states().clone(),
                    forward,
                )
            }
            None => (BTreeSet::from([0]), BTreeSet::new(), TransitionMap::new()),
        };
        info!(observations = log.len(), "building the automaton");

        // Last automaton state per (pid, spid); a task never seen before
        // starts from state 0.
        let mut last: FxHashMap<(i32, i32), StateId> = FxHashMap::default();
        for notification in log {
            match notification {
                ProcessNotification::Exit(_) => {}
                ProcessNotification::Termination(termination) => {
                    let key = (
                        termination.pid().as_raw(),
                        termination.spid().as_raw(),
                    );
                    finals.insert(*last.entry(key).or_insert(0));
                }
                ProcessNotification::Entry(entry) => {
                    let key = (entry.pid().as_raw(), entry.spid().as_raw());
                    let from = *last.entry(key).or_insert(0);
                    let label = self
                        .associations
                        .insert(entry.origin(), Fingerprint::of(entry));
                    transitions
                        .entry(from)
                        .or_default()
                        .entry(label)
                        .or_default()
                        .insert(label);
                    if let Some(spawn) = entry.spawned_child() {
                        // A new task continues from its generator's state.
                        last.insert((spawn.pid.as_raw(), spawn.spid.as_raw()), label);
                    }
                    last.insert(key, label);
                }
            }
        }
        // A task that never reported its death still accepts where it was
        // last seen.
        for &state in last.values() {
            finals.insert(state);
        }

        let automaton = Automaton::construct(
            self.associations.len() + 1,
            initials,
            finals,
            transitions,
        )?;
        info!(
            states = automaton.state_count(),
            finals = automaton.final_states().len(),
            "automaton construction finished"
        );
        Ok(automaton)
    }
}
