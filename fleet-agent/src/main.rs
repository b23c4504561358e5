//! Fleet Agent - Main entry point
//!
//! One invocation performs one job and exits. Scheduling belongs to the host
//! (systemd timer, cron, launchd).

use anyhow::Result;
use clap::{Parser, Subcommand};
use fleet_agent::daemon::shutdown::ShutdownCoordinator;
use fleet_agent::policy::PolicyErrorKind;
use fleet_agent::report::{JobKind, RunOutcome};
use fleet_agent::runner::Runner;
use fleet_agent::{config::Config, utils, AgentError};
use std::path::PathBuf;
use std::process::ExitCode;

const EXIT_FAILURE: u8 = 1;
const EXIT_DISABLED: u8 = 3;
const EXIT_REVOKED: u8 = 4;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a backup with the effective policy
    Backup {
        /// Initialize the repository if it does not exist
        #[arg(long)]
        auto_init: bool,
    },
    /// Apply the retention rule (forget, optionally prune)
    Retention,
    /// Show the last recorded runs
    Status,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    let (job, auto_init) = match args.command {
        Command::Backup { auto_init } => (JobKind::Backup, auto_init),
        Command::Retention => (JobKind::Retention, false),
        Command::Status => {
            print_status(&Runner::new(config, Default::default()))?;
            return Ok(ExitCode::SUCCESS);
        }
    };

    tracing::info!("Starting fleet-agent v{} ({})", env!("CARGO_PKG_VERSION"), job);

    let shutdown_coordinator = ShutdownCoordinator::new();
    let signal_handle = shutdown_coordinator.listen();
    let runner = Runner::new(config, shutdown_coordinator.token());

    let result = runner.run(job, auto_init).await;
    shutdown_coordinator.shutdown();
    let _ = signal_handle.await;

    match result {
        Ok(outcome) if outcome.is_success() => {
            tracing::info!("{} completed in {}ms", job, outcome.duration_ms);
            Ok(ExitCode::SUCCESS)
        }
        Ok(outcome) => {
            tracing::error!("{} failed: {}", job, outcome.error.as_deref().unwrap_or("unknown error"));
            Ok(ExitCode::from(EXIT_FAILURE))
        }
        Err(e) => {
            tracing::error!("{} not started: {}", job, e);
            Ok(ExitCode::from(exit_code(&e)))
        }
    }
}

fn exit_code(err: &AgentError) -> u8 {
    match err {
        AgentError::Policy(e) => match e.kind() {
            PolicyErrorKind::Disabled => EXIT_DISABLED,
            PolicyErrorKind::AuthRevoked => EXIT_REVOKED,
            _ => EXIT_FAILURE,
        },
        _ => EXIT_FAILURE,
    }
}

fn print_status(runner: &Runner) -> Result<()> {
    let state = runner.state();
    for job in [JobKind::Backup, JobKind::Retention] {
        match state.load(job)? {
            Some(outcome) => println!("{}", describe(&outcome)),
            None => println!("{:<10} never run", job.as_str()),
        }
    }
    Ok(())
}

fn describe(outcome: &RunOutcome) -> String {
    let mut line = format!(
        "{:<10} {:<8} {} ({}ms)",
        outcome.job.as_str(),
        outcome.status.as_str(),
        outcome.finished_at.to_rfc3339(),
        outcome.duration_ms
    );
    if let Some(snapshot) = &outcome.metrics.snapshot_id {
        line.push_str(&format!(" snapshot {}", snapshot));
    }
    if let Some(error) = &outcome.error {
        line.push_str(&format!("\n           {}", error.lines().next().unwrap_or_default()));
    }
    line
}
