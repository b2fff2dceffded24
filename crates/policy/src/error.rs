use std::path::PathBuf;

/// Represents all possible errors of the policy layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to perform I/O on a policy file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed associations file: {0}")]
    Associations(String),

    #[error("Malformed fingerprint: {0}")]
    Fingerprint(String),

    #[error("Malformed or inconsistent automaton: {0}")]
    Automaton(String),

    #[error("A learned automaton is required in enforce mode but {0} has none")]
    MissingAutomaton(PathBuf),

    #[error(transparent)]
    Engine(#[from] engine::Error),
}
