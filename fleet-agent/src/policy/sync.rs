//! Policy synchronization with offline fallback.
//!
//! Decision order on every run:
//! 1. fresh policy from the authority (cached on success)
//! 2. kill-switch or revoked credential: stop, the cache is never consulted
//! 3. anything else: last cached policy, unless that one is disabled too

use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::cache::PolicyCache;
use super::{DisabledBy, Policy, PolicyError};
use crate::authority::{self, DEFAULT_TIMEOUT};
use crate::guard::GuardMode;
use crate::store::StorageLocations;

const CONFIG_PATH: &str = "v1/config";

/// Where the effective policy came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicySource {
    Authority,
    Cache,
}

/// Health of the policy the run proceeds with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Ok,
    /// Authority could not be reached; running on the cached policy
    Degraded,
}

#[derive(Debug, Clone)]
pub struct EffectivePolicy {
    pub policy: Policy,
    pub source: PolicySource,
}

impl EffectivePolicy {
    pub fn status(&self) -> SyncStatus {
        match self.source {
            PolicySource::Authority => SyncStatus::Ok,
            PolicySource::Cache => SyncStatus::Degraded,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.status() == SyncStatus::Degraded
    }
}

pub struct PolicySynchronizer {
    client: reqwest::Client,
    cache: PolicyCache,
    guard: GuardMode,
}

impl PolicySynchronizer {
    pub fn new(locations: &StorageLocations, guard: GuardMode) -> crate::Result<Self> {
        Self::with_timeout(locations, guard, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(locations: &StorageLocations, guard: GuardMode, timeout: Duration) -> crate::Result<Self> {
        let cache = PolicyCache::new(&locations.cache_file)
            .map_err(|e| crate::AgentError::Config(e.to_string()))?;
        Ok(Self {
            client: authority::build_client(timeout)?,
            cache,
            guard,
        })
    }

    pub fn cache(&self) -> &PolicyCache {
        &self.cache
    }

    /// Fetch, validate and cache the policy. Disabled policies are never cached.
    pub async fn fetch_effective_policy(&self, address: &str, credential: &str) -> Result<Policy, PolicyError> {
        let policy = self.fetch(address, credential).await?;

        if let Err(e) = self.cache.write(&policy) {
            warn!("Failed to cache policy at {}: {}", self.cache.path().display(), e);
        }

        Ok(policy)
    }

    /// The policy this run should use, falling back to the cache only when
    /// the authority is unreachable or returned something unusable.
    pub async fn load_with_fallback(&self, address: &str, credential: &str) -> Result<EffectivePolicy, PolicyError> {
        let fetch_err = match self.fetch_effective_policy(address, credential).await {
            Ok(policy) => {
                info!("Policy fetched from authority and cached");
                return Ok(EffectivePolicy {
                    policy,
                    source: PolicySource::Authority,
                });
            }
            Err(e) => e,
        };

        if fetch_err.is_fatal() {
            return Err(fetch_err);
        }

        warn!("Policy fetch failed: {}", fetch_err);
        debug!("Trying cached policy at {}", self.cache.path().display());

        let cached = match self.cache.read() {
            Ok(policy) => policy,
            Err(cache_err) => {
                return Err(PolicyError::NoFallback {
                    fetch: Box::new(fetch_err),
                    cache: cache_err.to_string(),
                });
            }
        };

        if cached.is_disabled() {
            return Err(PolicyError::Disabled(DisabledBy::Cache));
        }

        warn!("Using cached policy (authority unreachable or policy unusable)");
        Ok(EffectivePolicy {
            policy: cached,
            source: PolicySource::Cache,
        })
    }

    async fn fetch(&self, address: &str, credential: &str) -> Result<Policy, PolicyError> {
        let url = authority::endpoint(address, credential, CONFIG_PATH, self.guard)?;

        let response = self
            .client
            .get(url)
            .bearer_auth(credential)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PolicyError::Unreachable(format!("request timed out: {}", e))
                } else {
                    PolicyError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(PolicyError::AuthRevoked(status.as_u16()));
        }
        if status != StatusCode::OK {
            let excerpt = authority::error_excerpt(response).await;
            return Err(PolicyError::Unreachable(format!("status {}: {}", status.as_u16(), excerpt)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| PolicyError::Unreachable(format!("reading policy body: {}", e)))?;
        let policy: Policy = serde_json::from_slice(&body)
            .map_err(|e| PolicyError::Invalid(format!("malformed policy body: {}", e)))?;

        // Kill-switch outranks every other check.
        if policy.is_disabled() {
            return Err(PolicyError::Disabled(DisabledBy::Authority));
        }
        policy.validate()?;

        Ok(policy)
    }
}
