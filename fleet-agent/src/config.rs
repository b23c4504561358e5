//! Configuration management for the fleet agent.
//!
//! Loads the agent-local TOML file. The backup policy itself comes from the
//! authority; this file only holds identity, local paths and tuning.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::guard::GuardMode;
use crate::policy::Policy;
use crate::store::StorageLocations;

/// Where the agent looks for its config when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fleet-agent/agent.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Enrollment result. Absent means the device was never enrolled.
    #[serde(default)]
    pub device: Option<DeviceIdentity>,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub log: LogConfig,

    /// Local policy for devices that are not enrolled
    #[serde(default)]
    pub policy: Option<Policy>,
}

/// Identity issued at enrollment. Never modified by the agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    #[serde(default)]
    pub tenant_id: String,

    pub device_id: String,

    /// Long-lived bearer credential
    pub credential: String,

    /// Authority base URL
    pub authority_url: String,
}

impl DeviceIdentity {
    pub fn is_enrolled(&self) -> bool {
        !self.device_id.is_empty() && !self.credential.is_empty() && !self.authority_url.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root for cache, spool and state
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub guard: GuardMode,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine executable, looked up in PATH when relative
    #[serde(default = "default_engine_binary")]
    pub binary: PathBuf,

    /// Local password file. Overrides whatever the policy names.
    #[serde(default)]
    pub password_file: Option<String>,

    /// Initialize the repository when it does not exist yet
    #[serde(default)]
    pub auto_init: bool,

    #[serde(default = "default_backup_timeout_secs")]
    pub backup_timeout_secs: u64,

    #[serde(default = "default_retention_timeout_secs")]
    pub retention_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Spooled reports retried per run
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    #[serde(default = "default_max_report_age_days")]
    pub max_report_age_days: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/fleet-agent")
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_engine_binary() -> PathBuf {
    PathBuf::from("restic")
}

fn default_backup_timeout_secs() -> u64 {
    6 * 60 * 60
}

fn default_retention_timeout_secs() -> u64 {
    2 * 60 * 60
}

fn default_max_pending() -> usize {
    20
}

fn default_max_report_age_days() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            guard: GuardMode::default(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: default_engine_binary(),
            password_file: None,
            auto_init: false,
            backup_timeout_secs: default_backup_timeout_secs(),
            retention_timeout_secs: default_retention_timeout_secs(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            max_report_age_days: default_max_report_age_days(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// `--config` if given, else the default path if it exists, else built-in defaults.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.exists() {
                    Self::from_file(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn storage_locations(&self) -> StorageLocations {
        StorageLocations::under(&self.storage.data_dir)
    }

    /// The device identity, if enrollment completed.
    pub fn enrolled_device(&self) -> Option<&DeviceIdentity> {
        self.device.as_ref().filter(|d| d.is_enrolled())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.network.request_timeout_secs.max(1))
    }

    pub fn max_report_age(&self) -> Duration {
        Duration::from_secs(self.delivery.max_report_age_days.saturating_mul(24 * 60 * 60))
    }
}
