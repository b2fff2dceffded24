#![forbid(unsafe_code)]

//! Policy layer: syscall fingerprints, their interning into dense state
//! ids, the admissibility automaton and the authoriser that threads traced
//! tasks through it.

mod associations;
mod authorizer;
mod automaton;
mod error;
mod fingerprint;
mod handler;

pub use associations::FingerprintMap;
pub use authorizer::{Authorizer, FleetControl};
pub use automaton::{Automaton, TransitionMap};
pub use error::Error;
pub use fingerprint::{Fingerprint, FrameKey, FrameLabel};
pub use handler::{Decision, DecisionHandler, KillHandler, PromptHandler, Violation};

/// Dense automaton state id. State 0 is the distinguished start state;
/// every other id doubles as the label of the transitions landing on it.
pub type StateId = u32;
