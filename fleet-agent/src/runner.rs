//! One scheduled run: resolve policy, run the engine, record and report.
//!
//! Only policy resolution can stop a run before the engine starts. Report
//! delivery happens after the outcome is fixed and never changes it.

use chrono::Utc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, DeviceIdentity};
use crate::executor::Engine;
use crate::policy::{DisabledBy, Policy, PolicyError, PolicySynchronizer};
use crate::report::{DeliveryQueue, JobKind, RunMetrics, RunOutcome, RunStatus};
use crate::state::RunState;
use crate::store::StorageLocations;
use crate::AgentError;

pub struct Runner {
    config: Config,
    locations: StorageLocations,
    engine: Engine,
    cancel: CancellationToken,
}

impl Runner {
    pub fn new(config: Config, cancel: CancellationToken) -> Self {
        let locations = config.storage_locations();
        let engine = Engine::new(&config.engine.binary);
        Self {
            config,
            locations,
            engine,
            cancel,
        }
    }

    pub fn state(&self) -> RunState {
        RunState::new(&self.locations.state_dir)
    }

    /// Execute `job` and return its outcome.
    ///
    /// `Err` means the run never started (no usable policy, device disabled,
    /// credential revoked). A failed engine run is an `Ok` outcome with
    /// [`RunStatus::Failure`].
    pub async fn run(&self, job: JobKind, auto_init: bool) -> crate::Result<RunOutcome> {
        let policy = self.resolve_policy().await?;
        let device = self.config.enrolled_device();

        let started_at = Utc::now();
        let result = self.execute(job, &policy, auto_init || self.config.engine.auto_init).await;
        let finished_at = Utc::now();

        let device_id = device.map(|d| d.device_id.clone()).unwrap_or_default();
        let outcome = match result {
            Ok(metrics) => RunOutcome::new(device_id, job, started_at, finished_at, RunStatus::Success)
                .with_metrics(metrics.unwrap_or_default()),
            Err(message) => {
                RunOutcome::new(device_id, job, started_at, finished_at, RunStatus::Failure).with_error(message)
            }
        };

        if let Err(e) = self.state().save(&outcome) {
            warn!("Failed to save last {} run: {}", job, e);
        }

        if let Some(device) = device {
            self.deliver(device, &outcome).await;
        }

        Ok(outcome)
    }

    async fn resolve_policy(&self) -> crate::Result<Policy> {
        let mut policy = match self.config.enrolled_device() {
            Some(device) => {
                let sync = PolicySynchronizer::with_timeout(
                    &self.locations,
                    self.config.network.guard,
                    self.config.request_timeout(),
                )?;
                let effective = sync.load_with_fallback(&device.authority_url, &device.credential).await?;
                if effective.is_degraded() {
                    warn!("Running with cached policy; authority could not be reached");
                }
                effective.policy
            }
            None => {
                info!("Device not enrolled, using local policy");
                let policy = self.config.policy.clone().ok_or_else(|| {
                    AgentError::Config("device is not enrolled and no [policy] is configured".to_string())
                })?;
                if policy.is_disabled() {
                    return Err(PolicyError::Disabled(DisabledBy::Local).into());
                }
                policy.validate()?;
                policy
            }
        };

        // The password file is a local path; the local setting always wins.
        if let Some(password_file) = &self.config.engine.password_file {
            policy.repository.password_file = password_file.clone();
        }
        Ok(policy)
    }

    async fn execute(&self, job: JobKind, policy: &Policy, auto_init: bool) -> Result<Option<RunMetrics>, String> {
        let deadline = Duration::from_secs(match job {
            JobKind::Backup => self.config.engine.backup_timeout_secs,
            JobKind::Retention => self.config.engine.retention_timeout_secs,
        });

        let work = async {
            match job {
                JobKind::Backup => self.engine.backup(policy, auto_init).await,
                JobKind::Retention => self.engine.retention(policy).await.map(|()| None),
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(format!("{} cancelled by shutdown signal", job)),
            result = tokio::time::timeout(deadline, work) => match result {
                Ok(Ok(metrics)) => Ok(metrics),
                Ok(Err(e)) => {
                    error!("{} failed: {}", job, e);
                    Err(e.to_string())
                }
                Err(_) => Err(format!("{} exceeded deadline of {}s", job, deadline.as_secs())),
            },
        }
    }

    /// Drain the spool, submit this outcome, prune old entries. Never fails.
    async fn deliver(&self, device: &DeviceIdentity, outcome: &RunOutcome) {
        let queue = match DeliveryQueue::with_timeout(
            &self.locations,
            self.config.network.guard,
            self.config.request_timeout(),
        ) {
            Ok(queue) => queue,
            Err(e) => {
                warn!("Report delivery unavailable: {}", e);
                return;
            }
        };

        if let Err(e) = queue
            .drain_pending(&device.authority_url, &device.credential, self.config.delivery.max_pending)
            .await
        {
            warn!("Could not drain pending reports: {}", e);
        }

        match queue.send_with_spool(&device.authority_url, &device.credential, outcome).await {
            Ok(()) => info!("{} report delivered", outcome.job),
            Err(e) => warn!("{} report not delivered: {}", outcome.job, e),
        }

        queue.cleanup_old_reports(self.config.max_report_age());
    }
}
