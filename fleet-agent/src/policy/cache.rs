//! Last known-good policy, kept on disk for offline runs.

use std::path::{Path, PathBuf};

use super::Policy;
use crate::store::{DurableStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("no cached policy")]
    Missing,

    #[error("cache path has no file name: {0}")]
    BadPath(PathBuf),

    #[error("cached policy unreadable: {0}")]
    Store(#[from] StoreError),

    #[error("cached policy corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct PolicyCache {
    store: DurableStore,
    name: String,
}

impl PolicyCache {
    pub fn new(cache_file: &Path) -> Result<Self, CacheError> {
        let name = cache_file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CacheError::BadPath(cache_file.to_path_buf()))?;
        let dir = cache_file.parent().unwrap_or_else(|| Path::new("."));
        crate::store::validate_name(name)?;

        Ok(Self {
            store: DurableStore::new(dir),
            name: name.to_string(),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.store.dir().join(&self.name)
    }

    pub fn write(&self, policy: &Policy) -> Result<(), CacheError> {
        let data = serde_json::to_vec_pretty(policy)?;
        self.store.put(&self.name, &data)?;
        Ok(())
    }

    pub fn read(&self) -> Result<Policy, CacheError> {
        let data = match self.store.read(&self.name) {
            Ok(data) => data,
            Err(StoreError::NotFound(_)) => return Err(CacheError::Missing),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&data)?)
    }
}
