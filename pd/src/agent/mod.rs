//! Agent abstraction and concrete backends
//!
//! The Pool only ever holds `Arc<dyn Agent>`. Concrete types are built here
//! from configuration and never leak past registration.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

mod anthropic;
mod cli;
mod config;
mod error;
mod types;

pub use anthropic::{AnthropicAgent, classify_status};
pub use cli::{CliAgent, classify_output};
pub use config::{AgentConfig, AgentKind};
pub use error::AgentError;
pub use types::{Agent, AgentDescriptor, AgentHealth, AgentResponse, ExecutionContext, Outcome, UsageMetadata};

/// Create an agent for the configured kind
///
/// `default_rate_limit` is how long a backend stays throttled when it signals
/// a limit without a reset time.
pub fn create_agent(config: &AgentConfig, default_rate_limit: Duration) -> Result<Arc<dyn Agent>, AgentError> {
    debug!(id = %config.id, kind = %config.kind, "create_agent: called");
    if config.id.trim().is_empty() {
        return Err(AgentError::InvalidConfig("agent id must not be empty".to_string()));
    }
    match config.kind {
        AgentKind::ClaudeCli | AgentKind::GeminiCli => Ok(Arc::new(CliAgent::from_config(config, default_rate_limit)?)),
        AgentKind::AnthropicApi => Ok(Arc::new(AnthropicAgent::from_config(config, default_rate_limit)?)),
    }
}
