//! Last-run records shown by the `status` command.

use std::path::Path;

use crate::report::{JobKind, RunOutcome};
use crate::store::{DurableStore, StoreError};

/// Most recent outcome per job kind, one JSON file each.
#[derive(Debug, Clone)]
pub struct RunState {
    store: DurableStore,
}

impl RunState {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            store: DurableStore::new(dir.as_ref()),
        }
    }

    pub fn save(&self, outcome: &RunOutcome) -> crate::Result<()> {
        let data = serde_json::to_vec_pretty(outcome)?;
        self.store.put(&key(outcome.job), &data)?;
        Ok(())
    }

    /// `None` if this job has never run.
    pub fn load(&self, job: JobKind) -> crate::Result<Option<RunOutcome>> {
        match self.store.read(&key(job)) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

fn key(job: JobKind) -> String {
    format!("last_{}.json", job)
}
