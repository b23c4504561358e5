//! Crate-wide error type for process-level failures.
//!
//! Component errors (`PolicyError`, `DeliveryError`, `StoreError`, ...) live
//! beside their components; this enum is what the runner and entry point see.

use thiserror::Error;

use crate::policy::PolicyError;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid config file: {0}")]
    ConfigFormat(#[from] toml::de::Error),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),
}

pub type Result<T> = std::result::Result<T, AgentError>;
