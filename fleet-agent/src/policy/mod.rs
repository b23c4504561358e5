//! Backup policy issued by the authority, and its validation rules.

pub mod cache;
pub mod sync;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::authority::EndpointError;

pub use cache::PolicyCache;
pub use sync::{EffectivePolicy, PolicySource, PolicySynchronizer, SyncStatus};

pub const MAX_INCLUDE_PATHS: usize = 1000;
pub const MAX_EXCLUDE_PATHS: usize = 1000;
pub const MAX_PATH_BYTES: usize = 4096;

/// What to back up, where to, and how long to keep it.
///
/// Every field defaults so that a bare `{"enabled": false}` still parses and
/// the kill-switch can be honored before anything else is looked at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub schedule: Schedule,

    #[serde(default)]
    pub include: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,

    #[serde(default, rename = "restic")]
    pub repository: RepositoryConfig,

    #[serde(default)]
    pub retention: RetentionRule,

    /// `Some(false)` is the kill-switch. `None` means the authority did not say.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    /// Local wall-clock time, `HH:MM` (24h)
    #[serde(default)]
    pub daily_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Engine repository locator, e.g. `rest:https://backup.example.com/device-1/`
    #[serde(default)]
    pub repository: String,

    /// Local file holding the repository password
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password_file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionRule {
    #[serde(default)]
    pub keep_last: u32,
    #[serde(default)]
    pub keep_daily: u32,
    #[serde(default)]
    pub keep_weekly: u32,
    #[serde(default)]
    pub keep_monthly: u32,
    #[serde(default)]
    pub keep_yearly: u32,
    #[serde(default)]
    pub prune: bool,
}

impl RetentionRule {
    /// True when no keep-count is set; running `forget` with nothing to keep is refused.
    pub fn is_unset(&self) -> bool {
        self.keep_last == 0
            && self.keep_daily == 0
            && self.keep_weekly == 0
            && self.keep_monthly == 0
            && self.keep_yearly == 0
    }
}

impl Policy {
    /// The kill-switch is set only by an explicit `enabled: false`.
    pub fn is_disabled(&self) -> bool {
        self.enabled == Some(false)
    }

    /// Required-field and bound checks. Does not look at `enabled`.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.include.is_empty() {
            return Err(PolicyError::Invalid("missing required field: include".to_string()));
        }
        if self.repository.repository.trim().is_empty() {
            return Err(PolicyError::Invalid("missing required field: restic.repository".to_string()));
        }

        if self.include.len() > MAX_INCLUDE_PATHS {
            return Err(PolicyError::Invalid(format!(
                "too many include paths: {} (max {})",
                self.include.len(),
                MAX_INCLUDE_PATHS
            )));
        }
        if self.exclude.len() > MAX_EXCLUDE_PATHS {
            return Err(PolicyError::Invalid(format!(
                "too many exclude paths: {} (max {})",
                self.exclude.len(),
                MAX_EXCLUDE_PATHS
            )));
        }

        for (i, path) in self.include.iter().enumerate() {
            check_path(path).map_err(|e| PolicyError::Invalid(format!("include path at index {}: {}", i, e)))?;
        }
        for (i, path) in self.exclude.iter().enumerate() {
            check_path(path).map_err(|e| PolicyError::Invalid(format!("exclude path at index {}: {}", i, e)))?;
        }

        Ok(())
    }
}

fn check_path(path: &str) -> Result<(), &'static str> {
    if path.is_empty() || path.len() > MAX_PATH_BYTES {
        return Err("length must be 1-4096 bytes");
    }
    if path.contains('\0') {
        return Err("contains NUL byte");
    }
    Ok(())
}

/// Where a disabled directive was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisabledBy {
    Authority,
    Cache,
    /// `[policy]` in the agent config of an unenrolled device
    Local,
}

impl std::fmt::Display for DisabledBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisabledBy::Authority => write!(f, "authority"),
            DisabledBy::Cache => write!(f, "cached policy"),
            DisabledBy::Local => write!(f, "local config"),
        }
    }
}

/// Outcome class of a policy fetch, used to route the fallback decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyErrorKind {
    /// Empty address or credential. The caller's fault.
    Configuration,
    /// Kill-switch observed. Never falls back.
    Disabled,
    /// 401/403 from the authority. Never falls back.
    AuthRevoked,
    /// Transport failure, timeout or unexpected status.
    Unreachable,
    /// Bad URL, malformed body or a policy that fails validation.
    Invalid,
}

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("{0}")]
    Configuration(String),

    #[error("device is disabled (kill-switch set by {0})")]
    Disabled(DisabledBy),

    #[error("authentication failed (status {0}): device credential invalid or revoked")]
    AuthRevoked(u16),

    #[error("authority unreachable: {0}")]
    Unreachable(String),

    #[error("invalid policy: {0}")]
    Invalid(String),

    #[error("{fetch} (no usable cached policy: {cache})")]
    NoFallback {
        fetch: Box<PolicyError>,
        cache: String,
    },
}

impl PolicyError {
    pub fn kind(&self) -> PolicyErrorKind {
        match self {
            PolicyError::Configuration(_) => PolicyErrorKind::Configuration,
            PolicyError::Disabled(_) => PolicyErrorKind::Disabled,
            PolicyError::AuthRevoked(_) => PolicyErrorKind::AuthRevoked,
            PolicyError::Unreachable(_) => PolicyErrorKind::Unreachable,
            PolicyError::Invalid(_) => PolicyErrorKind::Invalid,
            PolicyError::NoFallback { fetch, .. } => fetch.kind(),
        }
    }

    /// Disabled and revoked devices must stop; everything else may be retried from cache.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            PolicyErrorKind::Configuration | PolicyErrorKind::Disabled | PolicyErrorKind::AuthRevoked
        )
    }
}

impl From<EndpointError> for PolicyError {
    fn from(err: EndpointError) -> Self {
        match err {
            EndpointError::MissingAddress | EndpointError::MissingCredential => {
                PolicyError::Configuration(err.to_string())
            }
            EndpointError::Guard(_) | EndpointError::Join(_) => PolicyError::Invalid(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_policy() -> Policy {
        Policy {
            include: vec!["/home/alice/Documents".to_string()],
            repository: RepositoryConfig {
                repository: "rest:https://backup.example.com/device-1/".to_string(),
                password_file: String::new(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_kill_switch_only_on_explicit_false() {
        let mut policy = valid_policy();
        assert!(!policy.is_disabled());
        policy.enabled = Some(true);
        assert!(!policy.is_disabled());
        policy.enabled = Some(false);
        assert!(policy.is_disabled());
    }

    #[test]
    fn test_bare_disabled_document_parses() {
        let policy: Policy = serde_json::from_str(r#"{"enabled": false}"#).unwrap();
        assert!(policy.is_disabled());
        assert!(policy.include.is_empty());
    }

    #[test]
    fn test_wire_format() {
        let json = r#"{
            "schedule": {"daily_at": "02:00"},
            "include": ["/srv/data"],
            "exclude": ["*.tmp"],
            "restic": {"repository": "rest:https://r.example.com/x/", "password_file": "~/.agent/pw"},
            "retention": {"keep_daily": 7, "keep_weekly": 4, "prune": true}
        }"#;
        let policy: Policy = serde_json::from_str(json).unwrap();
        assert_eq!(policy.schedule.daily_at, "02:00");
        assert_eq!(policy.repository.password_file, "~/.agent/pw");
        assert_eq!(policy.retention.keep_daily, 7);
        assert!(policy.retention.prune);
        assert_eq!(policy.enabled, None);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_required_fields() {
        let mut policy = valid_policy();
        policy.include.clear();
        assert!(matches!(policy.validate(), Err(PolicyError::Invalid(msg)) if msg.contains("include")));

        let mut policy = valid_policy();
        policy.repository.repository = "  ".to_string();
        assert!(matches!(policy.validate(), Err(PolicyError::Invalid(msg)) if msg.contains("repository")));
    }

    #[test]
    fn test_bounds() {
        let mut policy = valid_policy();
        policy.include = vec!["/a".to_string(); MAX_INCLUDE_PATHS];
        assert!(policy.validate().is_ok());
        policy.include.push("/b".to_string());
        assert!(policy.validate().is_err());

        let mut policy = valid_policy();
        policy.exclude = vec!["*.log".to_string(); MAX_EXCLUDE_PATHS + 1];
        assert!(policy.validate().is_err());

        let mut policy = valid_policy();
        policy.exclude = vec![String::new()];
        assert!(policy.validate().is_err());

        let mut policy = valid_policy();
        policy.include.push("x".repeat(MAX_PATH_BYTES + 1));
        assert!(policy.validate().is_err());

        let mut policy = valid_policy();
        policy.include.push("/etc\0/shadow".to_string());
        assert!(matches!(policy.validate(), Err(PolicyError::Invalid(msg)) if msg.contains("NUL")));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(PolicyError::Disabled(DisabledBy::Cache).kind(), PolicyErrorKind::Disabled);
        assert!(PolicyError::AuthRevoked(401).is_fatal());
        assert!(!PolicyError::Unreachable("timeout".into()).is_fatal());

        let wrapped = PolicyError::NoFallback {
            fetch: Box::new(PolicyError::Unreachable("refused".into())),
            cache: "not found".into(),
        };
        assert_eq!(wrapped.kind(), PolicyErrorKind::Unreachable);
        assert!(wrapped.to_string().contains("refused"));
        assert!(wrapped.to_string().contains("not found"));
    }

    #[test]
    fn test_retention_unset() {
        let mut rule = RetentionRule::default();
        assert!(rule.is_unset());
        rule.prune = true;
        assert!(rule.is_unset());
        rule.keep_weekly = 4;
        assert!(!rule.is_unset());
    }
}
