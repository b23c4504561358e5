//! Report delivery with spool-and-retry.
//!
//! Nothing in here is allowed to fail a backup or retention run. Callers log
//! the returned errors and move on; undelivered reports wait in the spool.

use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use super::spool::{Spool, SpoolError};
use super::RunOutcome;
use crate::authority::{self, EndpointError, DEFAULT_TIMEOUT};
use crate::guard::GuardMode;
use crate::store::StorageLocations;

const REPORT_PATH: &str = "v1/report";

/// Most spooled reports retried per run.
pub const DEFAULT_MAX_PENDING: usize = 20;

/// Pause between drained reports so a recovering authority is not flooded.
pub const DRAIN_SPACING: Duration = Duration::from_millis(100);

/// Spooled reports older than this are dropped.
pub const DEFAULT_MAX_REPORT_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("{0}")]
    Endpoint(#[from] EndpointError),

    #[error("report serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("report request failed: {0}")]
    Transport(String),

    #[error("report rejected (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("send failed and spool failed: send={send}, spool={spool}")]
    SpoolFailed {
        send: Box<DeliveryError>,
        spool: SpoolError,
    },
}

/// What one drain pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

pub struct DeliveryQueue {
    client: reqwest::Client,
    spool: Spool,
    guard: GuardMode,
    drain_spacing: Duration,
}

impl DeliveryQueue {
    pub fn new(locations: &StorageLocations, guard: GuardMode) -> crate::Result<Self> {
        Self::with_timeout(locations, guard, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(locations: &StorageLocations, guard: GuardMode, timeout: Duration) -> crate::Result<Self> {
        Ok(Self {
            client: authority::build_client(timeout)?,
            spool: Spool::new(&locations.spool_dir),
            guard,
            drain_spacing: DRAIN_SPACING,
        })
    }

    pub fn with_drain_spacing(mut self, spacing: Duration) -> Self {
        self.drain_spacing = spacing;
        self
    }

    pub fn spool(&self) -> &Spool {
        &self.spool
    }

    /// POST one report. Only a 200 counts as delivered.
    pub async fn send(&self, address: &str, credential: &str, outcome: &RunOutcome) -> Result<(), DeliveryError> {
        let url = authority::endpoint(address, credential, REPORT_PATH, self.guard)?;

        let mut report = outcome.clone();
        report.truncate_error();
        let body = serde_json::to_vec(&report)?;

        let response = self
            .client
            .post(url)
            .bearer_auth(credential)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            let message = authority::error_excerpt(response).await;
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        Ok(())
    }

    /// Send now, or spool for the next run. The send error is returned either way.
    pub async fn send_with_spool(
        &self,
        address: &str,
        credential: &str,
        outcome: &RunOutcome,
    ) -> Result<(), DeliveryError> {
        let err = match self.send(address, credential, outcome).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        warn!("Failed to send {} report: {}", outcome.job, err);
        match self.spool.spool(outcome) {
            Ok(name) => {
                info!("Report spooled for retry: {}", name);
                Err(err)
            }
            Err(spool_err) => {
                warn!("Failed to spool {} report: {}", outcome.job, spool_err);
                Err(DeliveryError::SpoolFailed {
                    send: Box::new(err),
                    spool: spool_err,
                })
            }
        }
    }

    /// Retry up to `max_count` spooled reports, oldest first.
    ///
    /// Delivered entries are deleted. Failed ones stay put, in order, for the
    /// next run. Each entry is attempted at most once per call.
    pub async fn drain_pending(
        &self,
        address: &str,
        credential: &str,
        max_count: usize,
    ) -> Result<DrainSummary, SpoolError> {
        let mut summary = DrainSummary::default();
        if address.is_empty() || credential.is_empty() {
            return Ok(summary);
        }

        let entries = self.spool.load_pending(max_count)?;
        if entries.is_empty() {
            return Ok(summary);
        }
        info!("Sending {} pending report(s)", entries.len());

        for (i, entry) in entries.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.drain_spacing).await;
            }
            summary.attempted += 1;

            if let Err(e) = self.send(address, credential, &entry.outcome).await {
                warn!("Failed to send pending report {}: {}", entry.name, e);
                summary.failed += 1;
                continue;
            }

            summary.delivered += 1;
            if let Err(e) = self.spool.delete(&entry.name) {
                warn!("Delivered report {} could not be removed from spool: {}", entry.name, e);
            }
        }

        if summary.delivered > 0 {
            info!("Delivered {} of {} pending report(s)", summary.delivered, summary.attempted);
        }
        Ok(summary)
    }

    /// Drop spooled reports past `max_age`. Errors are logged, never returned.
    pub fn cleanup_old_reports(&self, max_age: Duration) -> usize {
        match self.spool.cleanup_old_reports(max_age) {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!("Spool cleanup failed: {}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{JobKind, RunStatus};
    use crate::test_support::{closed_port_url, MockAuthority};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn queue(temp_dir: &TempDir) -> DeliveryQueue {
        let locations = StorageLocations::under(temp_dir.path());
        DeliveryQueue::with_timeout(&locations, GuardMode::Standard, Duration::from_secs(2))
            .unwrap()
            .with_drain_spacing(Duration::from_millis(5))
    }

    fn outcome(marker: &str) -> RunOutcome {
        let started = Utc.with_ymd_and_hms(2026, 6, 1, 2, 0, 0).unwrap();
        let finished = Utc.with_ymd_and_hms(2026, 6, 1, 2, 1, 0).unwrap();
        RunOutcome::new(marker, JobKind::Backup, started, finished, RunStatus::Success)
    }

    #[tokio::test]
    async fn test_send_posts_report_with_bearer() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue(&temp_dir);
        let authority = MockAuthority::start().await;

        queue.send(&authority.url, "secret", &outcome("dev-1")).await.unwrap();

        let state = authority.state();
        assert_eq!(state.reports.len(), 1);
        assert_eq!(state.reports[0]["device_id"], "dev-1");
        assert_eq!(state.reports[0]["job"], "backup");
        assert_eq!(state.auth_headers, vec!["Bearer secret"]);
    }

    #[tokio::test]
    async fn test_send_truncates_oversized_error() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue(&temp_dir);
        let authority = MockAuthority::start().await;

        let mut report = outcome("dev-1");
        report.error = Some("z".repeat(9000));
        queue.send(&authority.url, "secret", &report).await.unwrap();

        let sent = authority.state().reports[0]["error"].as_str().unwrap().len();
        assert_eq!(sent, 4096);
    }

    #[tokio::test]
    async fn test_rejection_message_is_bounded() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue(&temp_dir);
        let authority = MockAuthority::start().await;
        authority.with(|s| {
            s.report_status = 500;
            s.report_body = format!("boom\n{}", "q".repeat(10_000));
        });

        let err = queue.send(&authority.url, "secret", &outcome("dev-1")).await.unwrap_err();
        match &err {
            DeliveryError::Rejected { status, message } => {
                assert_eq!(*status, 500);
                assert!(message.chars().count() <= 256);
                assert!(!message.contains('\n'));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!err.to_string().contains('\n'));
    }

    #[tokio::test]
    async fn test_send_validates_inputs() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue(&temp_dir);

        let err = queue.send("", "secret", &outcome("d")).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Endpoint(EndpointError::MissingAddress)));
        let err = queue.send("ftp://example.com", "secret", &outcome("d")).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Endpoint(EndpointError::Guard(_))));
    }

    #[tokio::test]
    async fn test_failed_send_is_spooled() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue(&temp_dir);
        let url = closed_port_url().await;

        let err = queue.send_with_spool(&url, "secret", &outcome("dev-9")).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Transport(_)));

        let pending = queue.spool().load_pending(20).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].outcome, outcome("dev-9"));
    }

    #[tokio::test]
    async fn test_send_and_spool_both_failing() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue(&temp_dir);
        std::fs::write(temp_dir.path().join("spool"), b"not a directory").unwrap();
        let url = closed_port_url().await;

        let err = queue.send_with_spool(&url, "secret", &outcome("dev-9")).await.unwrap_err();
        match &err {
            DeliveryError::SpoolFailed { send, .. } => {
                assert!(matches!(**send, DeliveryError::Transport(_)));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(err.to_string().starts_with("send failed and spool failed"));
    }

    #[tokio::test]
    async fn test_successful_send_is_not_spooled() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue(&temp_dir);
        let authority = MockAuthority::start().await;

        queue.send_with_spool(&authority.url, "secret", &outcome("dev-1")).await.unwrap();
        assert!(queue.spool().pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drain_oldest_first_deletes_only_delivered() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue(&temp_dir);
        let authority = MockAuthority::start().await;
        authority.with(|s| s.reject_containing = vec!["dev-b".to_string()]);

        let base = 1_790_000_000;
        for (offset, device) in [(2, "dev-c"), (0, "dev-a"), (1, "dev-b")] {
            let at = Utc.timestamp_opt(base + offset, 0).unwrap();
            queue.spool().spool_at(&outcome(device), at).unwrap();
        }

        let summary = queue.drain_pending(&authority.url, "secret", 20).await.unwrap();
        assert_eq!(
            summary,
            DrainSummary {
                attempted: 3,
                delivered: 2,
                failed: 1
            }
        );

        let attempted: Vec<_> = authority
            .state()
            .report_attempts
            .iter()
            .map(|r| r["device_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(attempted, vec!["dev-a", "dev-b", "dev-c"]);

        let left = queue.spool().load_pending(20).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].outcome.device_id, "dev-b");
        assert_eq!(left[0].name, format!("{}-backup-success.json", base + 1));
    }

    #[tokio::test]
    async fn test_drain_respects_max_count() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue(&temp_dir);
        let authority = MockAuthority::start().await;

        for i in 0..25 {
            let at = Utc.timestamp_opt(1_790_000_000 + i, 0).unwrap();
            queue.spool().spool_at(&outcome(&format!("dev-{:02}", i)), at).unwrap();
        }

        let summary = queue.drain_pending(&authority.url, "secret", DEFAULT_MAX_PENDING).await.unwrap();
        assert_eq!(summary.attempted, 20);
        assert_eq!(summary.delivered, 20);

        let left: Vec<_> = queue
            .spool()
            .load_pending(20)
            .unwrap()
            .into_iter()
            .map(|e| e.outcome.device_id)
            .collect();
        assert_eq!(left, vec!["dev-20", "dev-21", "dev-22", "dev-23", "dev-24"]);
    }

    #[tokio::test]
    async fn test_drain_while_offline_keeps_everything() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue(&temp_dir);
        let url = closed_port_url().await;

        for i in 0..3 {
            let at = Utc.timestamp_opt(1_790_000_000 + i, 0).unwrap();
            queue.spool().spool_at(&outcome("dev-x"), at).unwrap();
        }

        let summary = queue.drain_pending(&url, "secret", 20).await.unwrap();
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.failed, 3);
        assert_eq!(queue.spool().pending().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_drain_without_credentials_is_noop() {
        let temp_dir = TempDir::new().unwrap();
        let queue = queue(&temp_dir);
        queue.spool().spool(&outcome("dev-1")).unwrap();

        let summary = queue.drain_pending("", "", 20).await.unwrap();
        assert_eq!(summary, DrainSummary::default());
        assert_eq!(queue.spool().pending().unwrap().len(), 1);
    }
}
