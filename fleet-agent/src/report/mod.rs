//! Run outcome reports and their delivery to the authority.

pub mod delivery;
pub mod spool;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::text::truncate_utf8_in_place;

pub use delivery::{DeliveryError, DeliveryQueue, DrainSummary};
pub use spool::{Spool, SpoolEntry, SpoolError};

/// Error text sent to the authority is capped at this many bytes.
pub const MAX_ERROR_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Backup,
    Retention,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Backup => "backup",
            JobKind::Retention => "retention",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Statistics reported by the engine for a backup run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub files_total: u64,

    /// Logical bytes processed
    #[serde(default, skip_serializing_if = "is_zero")]
    pub bytes_total: u64,

    /// Bytes newly stored in the repository
    #[serde(default, skip_serializing_if = "is_zero")]
    pub data_added_bytes: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// One backup or retention run, as reported to the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub device_id: String,
    pub job: JobKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub duration_ms: u64,

    #[serde(flatten)]
    pub metrics: RunMetrics,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn new(
        device_id: impl Into<String>,
        job: JobKind,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        status: RunStatus,
    ) -> Self {
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            device_id: device_id.into(),
            job,
            started_at,
            finished_at,
            status,
            duration_ms,
            metrics: RunMetrics::default(),
            error: None,
        }
    }

    pub fn with_metrics(mut self, metrics: RunMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.truncate_error();
        self
    }

    /// Cap `error` at [`MAX_ERROR_BYTES`] on a character boundary.
    pub fn truncate_error(&mut self) {
        if let Some(error) = self.error.as_mut() {
            truncate_utf8_in_place(error, MAX_ERROR_BYTES);
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}
