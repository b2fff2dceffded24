mod cli;
mod interrupt;

use crate::cli::Cli;
use anyhow::{Context, bail};
use clap::Parser;
use config::{Config, OnViolation};
use engine::{DecoderMapper, EngineHandle, ProcessNotification, TraceeSpec};
use policy::{Authorizer, DecisionHandler, KillHandler, PromptHandler};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error occurred: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let mut config = Config::load_multiple(cli.resolve_config_paths()?)?;
    cli.apply(&mut config);
    debug!(?config, "effective configuration");

    let spec = if let Some(spid) = cli.pid {
        info!(spid, "attaching to a running task");
        TraceeSpec::Attach { spid }
    } else if let Some(run) = &cli.run {
        let (program, args) = run
            .split_first()
            .context("--run needs at least the program path")?;
        info!(%program, ?args, "executing the tracee");
        TraceeSpec::Run {
            program: program.into(),
            args: args.to_vec(),
        }
    } else {
        bail!("either a PID or a command to run must be specified");
    };

    interrupt::install().context("installing the SIGINT handler")?;

    let decoders = DecoderMapper::with_io_capture(config.trace.capture_io.clone());
    let handle = engine::spawn(spec, config.trace.clone(), decoders)
        .context("starting the tracing engine")?;

    let interrupted = if config.policy.authorizer {
        authorizer_loop(&handle, &config)?
    } else {
        print_loop(&handle)?
    };

    if let Err(err) = handle.wait() {
        error!(%err, "the tracing worker failed");
        return Ok(ExitCode::FAILURE);
    }
    info!("tracing session finished");
    Ok(if interrupted {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    // The verbosity flag sets the default level; PTRACER_LOG can still
    // adjust individual crates, e.g. PTRACER_LOG=engine=trace.
    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.parse()?)
        .with_env_var("PTRACER_LOG")
        .from_env()?;

    let layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(layer)
        .with(env_filter)
        .init();
    Ok(())
}

/// The plain consumer: print every notification and wave every entry
/// through.
fn print_loop(handle: &EngineHandle) -> anyhow::Result<bool> {
    loop {
        if interrupt::triggered() {
            info!("interrupted, killing the fleet");
            handle.kill_fleet();
            drain(handle);
            return Ok(true);
        }
        match handle.recv_timeout(Duration::from_millis(100)) {
            Ok(notification) => {
                print_notification(&notification);
                if let ProcessNotification::Entry(entry) = &notification {
                    handle.authorize(entry).context("authorising an entry")?;
                }
            }
            Err(flume::RecvTimeoutError::Timeout) => continue,
            Err(flume::RecvTimeoutError::Disconnected) => return Ok(false),
        }
    }
}

/// The supervised consumer: every notification goes through the authoriser.
fn authorizer_loop(handle: &EngineHandle, config: &Config) -> anyhow::Result<bool> {
    let handler: Box<dyn DecisionHandler> = match config.policy.on_violation {
        OnViolation::Prompt => Box::new(PromptHandler),
        OnViolation::Kill => Box::new(KillHandler),
    };
    let mut authorizer = Authorizer::new(&config.policy, handler, Box::new(handle.client()))
        .context("setting up the authoriser")?;
    info!(learning = authorizer.is_learning(), "authoriser active");

    loop {
        if interrupt::triggered() {
            info!("interrupted, killing the fleet");
            handle.kill_fleet();
            drain(handle);
            return Ok(true);
        }
        match handle.recv_timeout(Duration::from_millis(100)) {
            Ok(notification) => authorizer
                .process(&notification)
                .context("processing a notification")?,
            Err(flume::RecvTimeoutError::Timeout) => continue,
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }
    authorizer.terminate().context("finalising the authoriser")?;
    Ok(false)
}

fn print_notification(notification: &ProcessNotification) {
    match notification {
        ProcessNotification::Entry(entry) => println!(
            "{} - PID: {} - SPID: {} - Syscall entry: {} ({})",
            entry.timestamp(),
            entry.pid(),
            entry.spid(),
            engine::syscalls::name(entry.syscall_no()),
            entry.syscall_no(),
        ),
        ProcessNotification::Exit(exit) => println!(
            "{} - PID: {} - SPID: {} - Syscall exit: {} = {}",
            exit.timestamp(),
            exit.pid(),
            exit.spid(),
            engine::syscalls::name(exit.syscall_no()),
            exit.return_value(),
        ),
        ProcessNotification::Termination(termination) => match termination.signal() {
            Some(signal) => println!(
                "PID: {} - SPID: {} - Terminated by signal {signal}",
                termination.pid(),
                termination.spid(),
            ),
            None => println!(
                "PID: {} - SPID: {} - Terminated with status {}",
                termination.pid(),
                termination.spid(),
                termination.exit_status(),
            ),
        },
    }
}

/// After a kill, let the death notifications flow out so the worker can
/// retire the fleet and close the stream.
fn drain(handle: &EngineHandle) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        match handle.recv_timeout(Duration::from_millis(100)) {
            Ok(_) | Err(flume::RecvTimeoutError::Timeout) => {}
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }
}
