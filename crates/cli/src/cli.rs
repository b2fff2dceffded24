use clap::Parser;
use config::{Config, OnViolation};
use std::path::{Path, PathBuf};

/// Command line interface for ptracer-ng.
#[derive(Debug, Parser, Clone)]
#[command(name = "ptracer", about = "Trace and supervise system calls via ptrace", version)]
pub struct Cli {
    /// Attach to this kernel task instead of running a program.
    #[arg(long, conflicts_with = "run", value_name = "SPID")]
    pub pid: Option<i32>,

    /// Run and trace the given program; everything after the program name
    /// belongs to the tracee, so this must be the last option.
    #[arg(
        long,
        num_args = 1..,
        allow_hyphen_values = true,
        value_name = "PROG [ARGS]..."
    )]
    pub run: Option<Vec<String>>,

    /// Trace threads spawned by the tracee.
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    pub follow_threads: Option<bool>,

    /// Trace child processes of the tracee.
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    pub follow_children: Option<bool>,

    /// Kill the traced processes if ptracer dies.
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    pub jail: Option<bool>,

    /// Identify call sites by stack unwinding rather than by pc/sp.
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    pub backtrace: Option<bool>,

    /// Activate the authoriser subsystem.
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    pub authorizer: Option<bool>,

    /// Learning mode; pass false to enforce a learned automaton.
    #[arg(long, num_args = 0..=1, default_missing_value = "true", value_name = "BOOL")]
    pub learn: Option<bool>,

    /// Automaton persistence path.
    #[arg(long, value_name = "FILE")]
    pub nfa: Option<PathBuf>,

    /// Fingerprint associations persistence path.
    #[arg(long, value_name = "FILE")]
    pub associations: Option<PathBuf>,

    /// Optional DOT dump of the automaton, written at shutdown.
    #[arg(long, value_name = "FILE")]
    pub dot: Option<PathBuf>,

    /// Spool the content moved by read/write syscalls below this directory.
    #[arg(long, value_name = "DIR")]
    pub capture_io: Option<PathBuf>,

    /// Reaction to a policy violation in enforce mode.
    #[arg(long, value_name = "prompt|kill")]
    pub on_violation: Option<OnViolationArg>,

    /// Path to a configuration file.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OnViolationArg {
    Prompt,
    Kill,
}

impl Cli {
    /// Resolve configuration paths in precedence order (earlier overridden
    /// by later).
    pub fn resolve_config_paths(&self) -> Result<Vec<PathBuf>, std::io::Error> {
        let mut paths = Vec::new();

        if let Some(config) = &self.config {
            ensure_file_exists(config)?;
            paths.push(config.clone());
            return Ok(paths);
        }

        let system = PathBuf::from("/etc/ptracer-ng/config.toml");
        if system.exists() {
            paths.push(system);
        }
        let system_dir = Path::new("/etc/ptracer-ng/config.d");
        if system_dir.is_dir() {
            paths.extend(collect_toml(system_dir)?);
        }
        if let Some(user) = user_config_path()
            && user.exists()
        {
            paths.push(user);
        }
        let local = PathBuf::from("config.toml");
        if local.exists() {
            paths.push(local);
        }
        Ok(paths)
    }

    /// Overlay the explicitly given flags onto the file-derived config.
    pub fn apply(&self, config: &mut Config) {
        if let Some(value) = self.follow_threads {
            config.trace.follow_threads = value;
        }
        if let Some(value) = self.follow_children {
            config.trace.follow_children = value;
        }
        if let Some(value) = self.jail {
            config.trace.jail = value;
        }
        if let Some(value) = self.backtrace {
            config.trace.backtrace = value;
        }
        if let Some(dir) = &self.capture_io {
            config.trace.capture_io = Some(dir.clone());
        }
        if let Some(value) = self.authorizer {
            config.policy.authorizer = value;
        }
        if let Some(value) = self.learn {
            config.policy.learn = value;
        }
        if let Some(path) = &self.nfa {
            config.policy.nfa = path.clone();
        }
        if let Some(path) = &self.associations {
            config.policy.associations = path.clone();
        }
        if let Some(path) = &self.dot {
            config.policy.dot = Some(path.clone());
        }
        if let Some(choice) = self.on_violation {
            config.policy.on_violation = match choice {
                OnViolationArg::Prompt => OnViolation::Prompt,
                OnViolationArg::Kill => OnViolation::Kill,
            };
        }
    }
}

fn ensure_file_exists(path: &Path) -> Result<(), std::io::Error> {
    if path.exists() {
        Ok(())
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("config file not found: {}", path.display()),
        ))
    }
}

fn collect_toml(dir: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("toml") {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn user_config_path() -> Option<PathBuf> {
    let xdg = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")));
    xdg.map(|dir| dir.join("ptracer-ng").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_collects_trailing_arguments() {
        let cli = Cli::parse_from(["ptracer", "--learn", "false", "--run", "/bin/sh", "-c", ":"]);
        assert_eq!(cli.learn, Some(false));
        assert_eq!(
            cli.run,
            Some(vec!["/bin/sh".into(), "-c".into(), ":".into()])
        );
    }

    #[test]
    fn pid_and_run_are_mutually_exclusive() {
        assert!(Cli::try_parse_from(["ptracer", "--pid", "4", "--run", "/bin/true"]).is_err());
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "ptracer",
            "--jail",
            "--backtrace",
            "false",
            "--authorizer",
            "--on-violation",
            "kill",
            "--nfa",
            "/tmp/nfa.bin",
            "--run",
            "/bin/true",
        ]);
        let mut config = Config::default();
        cli.apply(&mut config);
        assert!(config.trace.jail);
        assert!(!config.trace.backtrace);
        assert!(config.policy.authorizer);
        assert_eq!(config.policy.on_violation, OnViolation::Kill);
        assert_eq!(config.policy.nfa, PathBuf::from("/tmp/nfa.bin"));
        // untouched options keep their defaults
        assert!(config.trace.follow_threads);
        assert!(config.policy.learn);
    }
}
