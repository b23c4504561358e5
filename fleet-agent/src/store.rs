//! Directory-backed blob store.
//!
//! Entries are flat files inside a single directory. Names are validated so an
//! entry can never resolve outside that directory. Directories are created
//! `0700` and files `0600` on Unix.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

const ENTRY_SUFFIX: &str = ".json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid entry name: {0}")]
    InvalidName(String),

    #[error("path traversal detected for entry: {0}")]
    Traversal(String),

    #[error("entry already exists: {0}")]
    Exists(String),

    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Where the agent keeps its local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLocations {
    /// Last known-good policy
    pub cache_file: PathBuf,

    /// Undelivered run reports
    pub spool_dir: PathBuf,

    /// Last-run records shown by `status`
    pub state_dir: PathBuf,
}

impl StorageLocations {
    /// Standard layout under a data directory.
    pub fn under(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            cache_file: data_dir.join("cache").join("policy_cache.json"),
            spool_dir: data_dir.join("spool"),
            state_dir: data_dir.join("state"),
        }
    }
}

/// A flat directory of `.json` blobs.
#[derive(Debug, Clone)]
pub struct DurableStore {
    dir: PathBuf,
}

impl DurableStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory (owner-only) if missing.
    pub fn ensure_dir(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        set_mode(&self.dir, 0o700)?;
        Ok(())
    }

    /// Write a new entry. Fails with [`StoreError::Exists`] instead of overwriting.
    pub fn create(&self, name: &str, data: &[u8]) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        self.ensure_dir()?;

        let path = self.dir.join(name);
        let mut file = match open_private(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StoreError::Exists(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        file.write_all(data)?;
        file.sync_all()?;
        Ok(path)
    }

    /// Write or replace an entry atomically.
    ///
    /// The data goes to a uniquely named temp file in the same directory,
    /// which is then renamed over the entry. The temp file is removed if any
    /// step fails.
    pub fn put(&self, name: &str, data: &[u8]) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        self.ensure_dir()?;

        let path = self.dir.join(name);
        let mut temp = NamedTempFile::new_in(&self.dir)?;
        set_mode(temp.path(), 0o600)?;
        temp.write_all(data)?;
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| StoreError::Io(e.error))?;
        Ok(path)
    }

    /// Entry names, sorted ascending. A missing directory is an empty store.
    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_name(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        validate_name(name)?;
        match fs::read(self.dir.join(name)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove an entry by name.
    ///
    /// The name is checked before anything is touched, and the resolved target
    /// (after following symlinks) must still sit inside the resolved store directory.
    pub fn delete(&self, name: &str) -> Result<(), StoreError> {
        validate_name(name)?;

        let target = self.dir.join(name);
        if let (Ok(resolved), Ok(dir_resolved)) = (fs::canonicalize(&target), fs::canonicalize(&self.dir)) {
            if resolved.parent() != Some(dir_resolved.as_path()) {
                return Err(StoreError::Traversal(name.to_string()));
            }
        }

        match fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Sum of the sizes of all regular files in the directory.
    pub fn total_size(&self) -> Result<u64, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut total = 0u64;
        for entry in entries.flatten() {
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    total += meta.len();
                }
            }
        }
        Ok(total)
    }
}

/// A bare `*.json` file name: no separators, no `..`, no NUL, not absolute.
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let bad = name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.contains('\0')
        || Path::new(name).is_absolute()
        || name.starts_with('.')
        || !name.ends_with(ENTRY_SUFFIX)
        || name.len() == ENTRY_SUFFIX.len();

    if bad {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Exclusive create, owner-only on Unix.
fn open_private(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
