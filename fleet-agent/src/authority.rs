//! Shared plumbing for talking to the remote authority.

use std::time::Duration;
use url::Url;

use crate::guard::{self, GuardError, GuardMode};

/// Request timeout for every authority call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Most bytes of an error response body that are ever read.
const ERROR_BODY_READ_LIMIT: usize = 512;

/// Display cap for server-supplied error text, ellipsis included.
const ERROR_BODY_DISPLAY_CHARS: usize = 256;

/// Why a request was never sent.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("authority address is required")]
    MissingAddress,

    #[error("device credential is required")]
    MissingCredential,

    #[error("invalid authority address: {0}")]
    Guard(#[from] GuardError),

    #[error("cannot build endpoint URL: {0}")]
    Join(#[from] url::ParseError),
}

/// Build a client with a request-scoped timeout.
pub fn build_client(timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("fleet-agent/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Validate inputs, run the guard and join `path` onto the authority base.
///
/// Any path on the base address is kept, so `https://host/control` becomes
/// `https://host/control/v1/config`.
pub fn endpoint(address: &str, credential: &str, path: &str, mode: GuardMode) -> Result<Url, EndpointError> {
    if address.trim().is_empty() {
        return Err(EndpointError::MissingAddress);
    }
    if credential.trim().is_empty() {
        return Err(EndpointError::MissingCredential);
    }

    let base = guard::validate_endpoint(address.trim_end_matches('/'), mode)?;
    let joined = format!("{}/{}", base.as_str().trim_end_matches('/'), path.trim_start_matches('/'));
    Ok(Url::parse(&joined)?)
}

/// Read at most 512 bytes of an error body and make it safe to log.
pub async fn error_excerpt(mut response: reqwest::Response) -> String {
    let mut buf: Vec<u8> = Vec::with_capacity(ERROR_BODY_READ_LIMIT);
    while buf.len() < ERROR_BODY_READ_LIMIT {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = (ERROR_BODY_READ_LIMIT - buf.len()).min(chunk.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            _ => break,
        }
    }
    sanitize_error_body(&buf)
}

/// Collapse line breaks and control characters, then cap the display length.
pub fn sanitize_error_body(raw: &[u8]) -> String {
    let limited = &raw[..raw.len().min(ERROR_BODY_READ_LIMIT)];
    let text = String::from_utf8_lossy(limited);
    let flattened: String = text
        .trim()
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();

    if flattened.chars().count() <= ERROR_BODY_DISPLAY_CHARS {
        return flattened;
    }
    let mut capped: String = flattened.chars().take(ERROR_BODY_DISPLAY_CHARS - 3).collect();
    capped.push_str("...");
    capped
}
