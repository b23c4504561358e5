//! Utility modules for the fleet agent.

pub mod errors;
pub mod logger;
pub mod text;

pub use errors::{AgentError, Result};
