//! Decision handlers for policy violations.
//!
//! Interactive prompting is a debug affordance; batch deployments plug in a
//! deterministic handler instead.

use crate::StateId;
use engine::SyscallEntry;
use std::collections::BTreeSet;
use std::io::{BufRead, Write};

/// A policy violation surfaced to the operator.
#[derive(Debug)]
pub enum Violation<'a> {
    /// An entry the automaton does not admit.
    Unauthorised { entry: &'a SyscallEntry },
    /// An exiting syscall whose state is not accepting.
    NotFinalEntry {
        entry: &'a SyscallEntry,
        state: StateId,
    },
    /// A task ended while its state set contains no accepting state.
    NotFinalStates {
        spid: i32,
        states: &'a BTreeSet<StateId>,
    },
}

/// The operator's verdict. `Admit` means "add the transition" for an
/// unauthorised entry and "mark the states final" for a non-final one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Kill,
    Admit,
}

pub trait DecisionHandler {
    fn decide(&mut self, violation: &Violation<'_>) -> Decision;
}

/// Interactive stdin/stdout menu.
#[derive(Debug, Default)]
pub struct PromptHandler;

impl PromptHandler {
    fn choose(&self, admit_label: &str) -> Decision {
        let stdin = std::io::stdin();
        loop {
            println!("Possible actions:");
            println!("1 - Kill the traced processes");
            println!("2 - {admit_label}");
            print!("Choice: ");
            let _ = std::io::stdout().flush();
            let mut line = String::new();
            // On a closed stdin there is nobody to ask: fail closed.
            if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
                println!("Standard input closed, killing the traced processes");
                return Decision::Kill;
            }
            match line.trim() {
                "1" => return Decision::Kill,
                "2" => return Decision::Admit,
                _ => println!("Invalid choice"),
            }
        }
    }
}

impl DecisionHandler for PromptHandler {
    fn decide(&mut self, violation: &Violation<'_>) -> Decision {
        match violation {
            Violation::Unauthorised { entry } => {
                println!("Warning! Observed a system call that was never seen before!");
                println!();
                print!("{entry}");
                self.choose("Add the new state to the graph and allow it")
            }
            Violation::NotFinalEntry { entry, state } => {
                println!("Warning! A terminating system call is not marked as a final state");
                println!();
                print!("{entry}");
                println!("association number {state}");
                self.choose("Set the state as final")
            }
            Violation::NotFinalStates { spid, states } => {
                println!(
                    "Warning! The traced task {spid} stands on the association numbers {states:?}"
                );
                println!("but none of them is a final state");
                self.choose("Mark the states as final")
            }
        }
    }
}

/// Deterministic handler for unattended runs: every violation kills.
#[derive(Debug, Default)]
pub struct KillHandler;

impl DecisionHandler for KillHandler {
    fn decide(&mut self, _violation: &Violation<'_>) -> Decision {
        Decision::Kill
    }
}
