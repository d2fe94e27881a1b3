//! `maloneyos-install`: installs MaloneyOS onto the disk chosen in the live session.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{info, warn};
use maloneyos_core::logging;
use maloneyos_core::progress::{ChannelSink, ProgressUpdate};
use maloneyos_core::workflow::{StepStatus, WorkflowLevel, WorkflowReport};
use maloneyos_core::{
    InstallationRequest, InstallerConfig, PipelineDriver, PipelineOutcome, DEFAULT_CONFIG_PATH,
};
use maloneyos_system::SystemExecutor;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;

const CONFIG_ENV: &str = "MALONEYOS_CONFIG";

/// The installer takes everything it needs from the handoff files written by
/// the graphical session, so it has no operational flags.
#[derive(Parser, Debug)]
#[command(
    name = "maloneyos-install",
    version,
    about = "Install MaloneyOS on a ZFS root pool"
)]
struct Cli {}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}

/// Load configuration and inputs, run the pipeline on a worker thread and
/// print its progress until it finishes.
fn run() -> Result<i32> {
    logging::init("info");
    let _cli = Cli::parse();

    let config_path = config_path();
    let config = InstallerConfig::load_or_default(&config_path).with_context(|| {
        format!(
            "failed to load configuration from {}",
            config_path.display()
        )
    })?;
    info!("{}", config_summary(&config, &config_path));
    let request = InstallationRequest::from_handoff(&config.handoff)
        .context("installer handoff files are incomplete")?;
    let executor = SystemExecutor::from_config(&config)?;

    println!(
        "Installing MaloneyOS on {} for {}",
        request.disk().display(),
        request.username()
    );

    let (tx, rx) = channel();
    let config = Arc::new(config);
    let worker = thread::Builder::new()
        .name("maloneyos-pipeline".into())
        .spawn(move || {
            PipelineDriver::new(config, executor, ChannelSink::new(tx)).run(&request)
        })
        .context("failed to start the installer thread")?;

    for update in rx {
        print_update(&update);
    }

    let outcome = worker
        .join()
        .map_err(|_| anyhow!("installer thread panicked"))?;
    match &outcome.failure {
        Some(failure) => warn!(
            "installation failed [{}] in state {}: {failure}",
            failure.code(),
            outcome.state
        ),
        None => info!("installation finished in state {}", outcome.state),
    }
    print_outcome(&outcome);
    Ok(outcome.exit_code())
}

/// `MALONEYOS_CONFIG` when set and non-empty, else the packaged default.
fn config_path() -> PathBuf {
    env::var_os(CONFIG_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

fn config_summary(config: &InstallerConfig, path: &Path) -> String {
    match &config.path {
        Some(loaded) => format!("loaded configuration from {}", loaded.display()),
        None => format!(
            "no configuration at {}; using built-in defaults",
            path.display()
        ),
    }
}

fn print_update(update: &ProgressUpdate) {
    match update {
        ProgressUpdate::State(state) => println!("==> {state}"),
        ProgressUpdate::Command(event) => {
            println!("[{}] {} (exit {})", event.phase, event.command, event.status);
            for line in event.output.lines() {
                println!("    {line}");
            }
        }
    }
}

fn print_outcome(outcome: &PipelineOutcome) {
    for report in &outcome.reports {
        print_warnings(report);
    }
    for step in &outcome.steps {
        match &step.status {
            StepStatus::Succeeded => println!("  [OK] {}", step.step),
            StepStatus::Failed { message, .. } => println!("  [ERR] {}: {message}", step.step),
        }
    }
    print_warnings(&outcome.teardown.report);

    if let Some(failure) = &outcome.failure {
        eprintln!("error: {failure}");
    }
    if outcome.succeeded() {
        println!("MaloneyOS installed ({}).", outcome.state);
    } else {
        println!("Installation failed ({}).", outcome.state);
    }
}

/// Only surface the events an operator has to act on.
fn print_warnings(report: &WorkflowReport) {
    let mut warnings = report.warnings().peekable();
    if warnings.peek().is_none() {
        return;
    }
    println!("{}", report.title);
    for event in warnings {
        println!("  [{}] {}", level_tag(event.level), event.message);
    }
}

fn level_tag(level: WorkflowLevel) -> &'static str {
    match level {
        WorkflowLevel::Info => "INFO",
        WorkflowLevel::Success => "OK",
        WorkflowLevel::Warn => "WARN",
        WorkflowLevel::Error => "ERR",
    }
}
