//! Fleet Agent Library
//!
//! Unattended backup agent that keeps working when the authority is offline:
//! endpoint guarding, durable local storage, policy sync with cached fallback,
//! and a spooled report queue.

pub mod authority;
pub mod config;
pub mod daemon;
pub mod executor;
pub mod guard;
pub mod policy;
pub mod report;
pub mod runner;
pub mod state;
pub mod store;
pub mod utils;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::AgentError;
pub type Result<T> = std::result::Result<T, AgentError>;
