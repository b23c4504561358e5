//! On-disk queue of reports that could not be delivered.
//!
//! Each report is one file named `{unix_seconds}-{job}-{status}.json`. The
//! timestamp prefix makes lexicographic order equal creation order, and that
//! ordering is the only one the queue relies on.
//!
//! Assumes a single agent process at a time; there is no lock around the directory.

use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::RunOutcome;
use crate::store::{DurableStore, StoreError};
use crate::utils::text::truncate_utf8;

/// Hard ceiling on the spool directory's total size.
pub const MAX_SPOOL_BYTES: u64 = 100 * 1024 * 1024;

const MAX_FRAGMENT_BYTES: usize = 50;

/// Same-second collisions bump the timestamp; give up after this many tries.
const MAX_NAME_ATTEMPTS: i64 = 60;

#[derive(Error, Debug)]
pub enum SpoolError {
    #[error("spool directory too large: {size} bytes (max {limit} bytes)")]
    Full { size: u64, limit: u64 },

    #[error("spool store error: {0}")]
    Store(#[from] StoreError),

    #[error("spool serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A spooled report and the file name that identifies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoolEntry {
    pub name: String,
    pub outcome: RunOutcome,
}

#[derive(Debug, Clone)]
pub struct Spool {
    store: DurableStore,
    max_bytes: u64,
}

impl Spool {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self::with_limit(dir, MAX_SPOOL_BYTES)
    }

    pub fn with_limit(dir: impl AsRef<Path>, max_bytes: u64) -> Self {
        Self {
            store: DurableStore::new(dir.as_ref()),
            max_bytes,
        }
    }

    pub fn dir(&self) -> &Path {
        self.store.dir()
    }

    /// Persist a report for later delivery. Returns the entry name.
    pub fn spool(&self, outcome: &RunOutcome) -> Result<String, SpoolError> {
        self.spool_at(outcome, Utc::now())
    }

    pub fn spool_at(&self, outcome: &RunOutcome, now: DateTime<Utc>) -> Result<String, SpoolError> {
        self.store.ensure_dir()?;

        let mut report = outcome.clone();
        report.truncate_error();
        let data = serde_json::to_vec_pretty(&report)?;

        let size = self.store.total_size()?;
        if size.saturating_add(data.len() as u64) > self.max_bytes {
            return Err(SpoolError::Full {
                size,
                limit: self.max_bytes,
            });
        }

        let job = sanitize_fragment(report.job.as_str());
        let status = sanitize_fragment(report.status.as_str());
        let base = now.timestamp();

        for offset in 0..MAX_NAME_ATTEMPTS {
            let name = entry_name(base + offset, &job, &status);
            match self.store.create(&name, &data) {
                Ok(_) => {
                    debug!("Spooled report {}", name);
                    return Ok(name);
                }
                Err(StoreError::Exists(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::Exists(entry_name(base, &job, &status)).into())
    }

    /// Entry names, oldest first.
    pub fn pending(&self) -> Result<Vec<String>, SpoolError> {
        Ok(self.store.list()?)
    }

    pub fn read(&self, name: &str) -> Result<RunOutcome, SpoolError> {
        let data = self.store.read(name)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Up to `max_count` oldest entries. Unreadable files are skipped and left in place.
    pub fn load_pending(&self, max_count: usize) -> Result<Vec<SpoolEntry>, SpoolError> {
        let mut entries = Vec::new();
        for name in self.pending()?.into_iter().take(max_count) {
            match self.read(&name) {
                Ok(outcome) => entries.push(SpoolEntry { name, outcome }),
                Err(e) => warn!("Skipping unreadable spooled report {}: {}", name, e),
            }
        }
        Ok(entries)
    }

    /// Remove an entry by its name. Traversal attempts are refused before any I/O.
    pub fn delete(&self, name: &str) -> Result<(), SpoolError> {
        Ok(self.store.delete(name)?)
    }

    /// Delete entries older than `max_age`. Returns how many were removed.
    pub fn cleanup_old_reports(&self, max_age: Duration) -> Result<usize, SpoolError> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.cleanup_older_than(cutoff)
    }

    pub fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, SpoolError> {
        let cutoff = cutoff.timestamp();
        let mut deleted = 0;

        for name in self.pending()? {
            let Some(timestamp) = parse_timestamp(&name) else {
                warn!("Invalid timestamp in spool file name {}, leaving it", name);
                continue;
            };
            if timestamp >= cutoff {
                continue;
            }
            match self.delete(&name) {
                Ok(()) => deleted += 1,
                Err(e) => warn!("Failed to delete old report {}: {}", name, e),
            }
        }

        if deleted > 0 {
            info!("Cleaned up {} old report(s) from spool", deleted);
        }
        Ok(deleted)
    }
}

/// Make `raw` safe as a file name fragment: no separators, `..` or NUL, at most 50 bytes.
pub fn sanitize_fragment(raw: &str) -> String {
    let cleaned = raw
        .replace(['/', '\\', '\0'], "_")
        .replace(std::path::MAIN_SEPARATOR, "_")
        .replace("..", "_");
    truncate_utf8(&cleaned, MAX_FRAGMENT_BYTES).to_string()
}

pub fn entry_name(unix_seconds: i64, job: &str, status: &str) -> String {
    format!("{}-{}-{}.json", unix_seconds, job, status)
}

/// Leading `{unix_seconds}-` of an entry name.
pub fn parse_timestamp(name: &str) -> Option<i64> {
    let (prefix, _) = name.split_once('-')?;
    prefix.parse().ok()
}
