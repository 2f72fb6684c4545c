//! Agent construction errors

use thiserror::Error;

/// Errors raised while building or configuring an agent
///
/// Execution problems never surface here; they are reported as an
/// [`Outcome`](super::Outcome).
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent {agent}: environment variable {var} is not set")]
    MissingApiKey { agent: String, var: String },

    #[error("Invalid agent configuration: {0}")]
    InvalidConfig(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}
