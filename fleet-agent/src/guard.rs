//! Endpoint validation applied before any request to the authority.
//!
//! The guard never touches the network. It inspects the URL literally, so a
//! hostname that later resolves to a private address is not caught here.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use url::{Host, Url};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardError {
    #[error("invalid URL: {0}")]
    Malformed(String),

    #[error("scheme '{0}' not allowed (only http/https)")]
    Scheme(String),

    #[error("URL has no host")]
    MissingHost,

    #[error("localhost not allowed: {0}")]
    Localhost(String),

    #[error("private address not allowed in strict mode: {0}")]
    PrivateAddress(IpAddr),
}

/// How aggressively endpoints are filtered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardMode {
    /// Blocks the local host only. Internal authorities on private networks are allowed.
    #[default]
    Standard,
    /// Also blocks literal private, loopback and link-local addresses.
    Strict,
}

/// Validates `raw` and returns the parsed URL on success.
pub fn validate_endpoint(raw: &str, mode: GuardMode) -> Result<Url, GuardError> {
    let url = Url::parse(raw).map_err(|e| GuardError::Malformed(e.to_string()))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(GuardError::Scheme(url.scheme().to_string()));
    }

    let host = url.host().ok_or(GuardError::MissingHost)?;
    match host {
        Host::Domain(name) => {
            if name.eq_ignore_ascii_case("localhost") {
                return Err(GuardError::Localhost(name.to_string()));
            }
        }
        Host::Ipv4(ip) => check_ip(IpAddr::V4(ip), mode)?,
        Host::Ipv6(ip) => check_ip(IpAddr::V6(ip), mode)?,
    }

    Ok(url)
}

fn check_ip(ip: IpAddr, mode: GuardMode) -> Result<(), GuardError> {
    let ip = match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    };

    if ip == IpAddr::V4(Ipv4Addr::LOCALHOST) || ip == IpAddr::V6(Ipv6Addr::LOCALHOST) {
        return Err(GuardError::Localhost(ip.to_string()));
    }

    if mode == GuardMode::Strict && is_non_public(ip) {
        return Err(GuardError::PrivateAddress(ip));
    }

    Ok(())
}

fn is_non_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || (first & 0xfe00) == 0xfc00 // unique local fc00::/7
                || (first & 0xffc0) == 0xfe80 // link-local fe80::/10
        }
    }
}
