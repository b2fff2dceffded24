#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Authoriser settings: run mode and persistence locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Policy {
    /// Activate the authoriser subsystem. Without it every syscall is
    /// authorised immediately and only printed.
    pub authorizer: bool,

    /// Learning mode: build the automaton from this run instead of
    /// enforcing a previously learned one.
    pub learn: bool,

    /// Path of the serialised automaton.
    pub nfa: PathBuf,

    /// Path of the fingerprint associations file.
    pub associations: PathBuf,

    /// Optional DOT dump of the automaton, written at shutdown.
    pub dot: Option<PathBuf>,

    /// What to do when an observation violates the policy.
    pub on_violation: OnViolation,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            authorizer: false,
            learn: true,
            nfa: PathBuf::from("ptracer-nfa.bin"),
            associations: PathBuf::from("ptracer-associations.txt"),
            dot: None,
            on_violation: OnViolation::Prompt,
        }
    }
}

/// Reaction to a policy violation in enforce mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnViolation {
    /// Ask the operator interactively whether to kill or admit.
    #[serde(rename = "prompt")]
    Prompt,

    /// Kill the fleet without asking. Deterministic, for batch runs.
    #[serde(rename = "kill")]
    Kill,
}
