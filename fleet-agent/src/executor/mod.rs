//! Backup engine adapter.
//!
//! The engine is an external, restic-compatible CLI. This module only builds
//! its command lines, runs it, and turns the result into metrics or an error.
//! Children are spawned with `kill_on_drop`, so dropping a run future (deadline
//! or cancellation) stops the engine too.

pub mod stats;

use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::policy::{Policy, RetentionRule};
use crate::report::RunMetrics;
use crate::utils::text::tail_utf8;

/// Engine output kept for error reports.
const OUTPUT_TAIL_BYTES: usize = 8192;

/// Bound on the pre-retention connectivity probe.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine binary not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Config(String),

    #[error("failed to start engine: {0}")]
    Spawn(std::io::Error),

    #[error("repository does not exist or is not initialized (enable auto_init or initialize it manually)")]
    RepositoryMissing,

    #[error("repository connection timeout: repository server appears to be unreachable")]
    ConnectTimeout,

    #[error("repository not reachable: {0}")]
    Unreachable(String),

    #[error("engine {action} failed: {detail}")]
    Failed { action: &'static str, detail: String },
}

/// Runs the external engine against the repository named in a policy.
#[derive(Debug, Clone)]
pub struct Engine {
    binary: PathBuf,
}

impl Engine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self { binary: binary.into() }
    }

    /// Back up the policy's include set. Returns metrics from the engine's summary, if it gave one.
    pub async fn backup(&self, policy: &Policy, auto_init: bool) -> Result<Option<RunMetrics>, EngineError> {
        check_repository(policy)?;
        if policy.include.is_empty() {
            return Err(EngineError::Config("no include paths configured".to_string()));
        }

        self.ensure_repository(policy, auto_init).await?;

        info!("Starting backup of {} path(s)", policy.include.len());
        let output = self.run(policy, &backup_args(policy)).await?;
        if !output.status.success() {
            return Err(failure("backup", &output));
        }

        let metrics = stats::parse_summary(&output.stdout);
        if metrics.is_none() {
            warn!("Engine produced no summary; reporting run without statistics");
        }
        Ok(metrics)
    }

    /// Apply the retention rule (`forget`, optionally `--prune`).
    pub async fn retention(&self, policy: &Policy) -> Result<(), EngineError> {
        check_repository(policy)?;
        let args = retention_args(&policy.retention)?;

        info!("Checking repository connectivity");
        match tokio::time::timeout(CONNECTIVITY_TIMEOUT, self.check_connectivity(policy)).await {
            Ok(result) => result?,
            Err(_) => return Err(EngineError::ConnectTimeout),
        }

        info!("Repository reachable, starting retention");
        let output = self.run(policy, &args).await?;
        if !output.status.success() {
            return Err(failure("forget/prune", &output));
        }
        Ok(())
    }

    async fn ensure_repository(&self, policy: &Policy, auto_init: bool) -> Result<(), EngineError> {
        let output = self.run(policy, &["cat", "config"]).await?;
        if output.status.success() {
            return Ok(());
        }
        if !auto_init {
            return Err(EngineError::RepositoryMissing);
        }

        info!("Repository not initialized, running init");
        let output = self.run(policy, &["init"]).await?;
        if output.status.success() {
            return Ok(());
        }

        let text = combined_output(&output);
        if text.contains("already initialized") || text.contains("config file already exists") {
            return Ok(());
        }
        Err(failure("init", &output))
    }

    async fn check_connectivity(&self, policy: &Policy) -> Result<(), EngineError> {
        let output = self.run(policy, &["snapshots", "--last", "1"]).await?;
        if output.status.success() {
            return Ok(());
        }

        // An empty repository also exits non-zero; only network-looking errors count.
        let text = combined_output(&output);
        if ["dial", "connection", "timeout", "refused"].iter().any(|m| text.contains(m)) {
            return Err(EngineError::Unreachable(tail_utf8(text.trim(), OUTPUT_TAIL_BYTES).to_string()));
        }
        debug!("Snapshot probe exited with {}, treating repository as reachable", output.status);
        Ok(())
    }

    async fn run<S: AsRef<str>>(&self, policy: &Policy, args: &[S]) -> Result<Output, EngineError> {
        let args: Vec<&str> = args.iter().map(|a| -> &str { a.as_ref() }).collect();
        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .env("RESTIC_REPOSITORY", &policy.repository.repository)
            .env("RESTIC_PASSWORD_FILE", expand_home(&policy.repository.password_file))
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        debug!("Running {} {}", self.binary.display(), args.first().copied().unwrap_or(""));
        cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::NotFound(self.binary.display().to_string())
            } else {
                EngineError::Spawn(e)
            }
        })
    }
}

fn check_repository(policy: &Policy) -> Result<(), EngineError> {
    if policy.repository.repository.trim().is_empty() {
        return Err(EngineError::Config("restic.repository is required".to_string()));
    }
    if policy.repository.password_file.trim().is_empty() {
        return Err(EngineError::Config("restic.password_file is required".to_string()));
    }
    Ok(())
}

/// `backup --json [--exclude X]... -- <includes>`. The `--` stops include
/// paths that start with `-` from being read as flags.
pub fn backup_args(policy: &Policy) -> Vec<String> {
    let mut args = vec!["backup".to_string(), "--json".to_string()];
    for pattern in &policy.exclude {
        args.push("--exclude".to_string());
        args.push(pattern.clone());
    }
    args.push("--".to_string());
    args.extend(policy.include.iter().cloned());
    args
}

/// `forget --keep-*... [--prune]`. Refuses an empty rule.
pub fn retention_args(rule: &RetentionRule) -> Result<Vec<String>, EngineError> {
    if rule.is_unset() {
        return Err(EngineError::Config(
            "retention policy not configured (set keep_* values)".to_string(),
        ));
    }

    let mut args = vec!["forget".to_string()];
    let keeps = [
        ("--keep-last", rule.keep_last),
        ("--keep-daily", rule.keep_daily),
        ("--keep-weekly", rule.keep_weekly),
        ("--keep-monthly", rule.keep_monthly),
        ("--keep-yearly", rule.keep_yearly),
    ];
    for (flag, count) in keeps {
        if count > 0 {
            args.push(flag.to_string());
            args.push(count.to_string());
        }
    }
    if rule.prune {
        args.push("--prune".to_string());
    }
    Ok(args)
}

/// Expand a leading `~` and make relative paths absolute.
pub fn expand_home(path: &str) -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let expanded = match (path, home) {
        ("~", Some(home)) => home,
        (p, Some(home)) if p.starts_with("~/") => home.join(&p[2..]),
        (p, _) => PathBuf::from(p),
    };

    if expanded.is_absolute() {
        return expanded;
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(&expanded))
        .unwrap_or(expanded)
}

fn combined_output(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stderr).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stdout));
    text
}

fn failure(action: &'static str, output: &Output) -> EngineError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    EngineError::Failed {
        action,
        detail: format!("{}\n{}", output.status, tail_utf8(stderr.trim(), OUTPUT_TAIL_BYTES)),
    }
}
