//! Agent trait and the values that flow through it

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Health as tracked by the Agent Pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    #[default]
    Available,
    /// At least one call in flight
    Busy,
    /// Excluded from routing until a health check succeeds
    Unreachable,
}

impl fmt::Display for AgentHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::Busy => write!(f, "busy"),
            Self::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Routing-relevant view of an agent
///
/// The Pool owns the mutable fields (`current_load`, `health`,
/// `avg_latency_ms`). Everything else comes from the agent itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,

    /// Service identity shared by agents drawing on the same quota
    pub backend: String,

    pub capability_tags: BTreeSet<String>,

    pub estimated_cost_per_call: f64,

    /// in_flight / max_concurrency, 0.0..=1.0
    pub current_load: f64,

    pub health: AgentHealth,

    pub max_concurrency: u32,

    /// Rolling average latency, unknown until the first call completes
    pub avg_latency_ms: Option<u64>,
}

impl AgentDescriptor {
    pub fn new(id: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            backend: backend.into(),
            capability_tags: BTreeSet::new(),
            estimated_cost_per_call: 0.0,
            current_load: 0.0,
            health: AgentHealth::Available,
            max_concurrency: 1,
            avg_latency_ms: None,
        }
    }

    pub fn with_capabilities<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capability_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.estimated_cost_per_call = cost;
        self
    }

    pub fn with_max_concurrency(mut self, max: u32) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    pub fn has_capability(&self, tag: &str) -> bool {
        self.capability_tags.contains(tag)
    }

    /// Routable: not unreachable and with headroom for one more call
    pub fn has_headroom(&self) -> bool {
        self.health != AgentHealth::Unreachable && self.current_load < 1.0
    }
}

/// Execution context handed to the agent verbatim
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub working_directory: String,
    pub context_files: Vec<String>,
    pub estimated_tokens: Option<u64>,
    /// Outputs of earlier members in a sequential group, as (agent id, output)
    pub prior_outputs: Vec<(String, String)>,
}

impl ExecutionContext {
    pub fn new(working_directory: impl Into<String>) -> Self {
        Self {
            working_directory: working_directory.into(),
            ..Default::default()
        }
    }

    /// Prompt text with context files and prior outputs appended
    pub fn render_prompt(&self, content: &str) -> String {
        let mut prompt = content.to_string();
        if !self.context_files.is_empty() {
            prompt.push_str("\n\nContext files:\n");
            for file in &self.context_files {
                prompt.push_str("- ");
                prompt.push_str(file);
                prompt.push('\n');
            }
        }
        for (agent_id, output) in &self.prior_outputs {
            prompt.push_str(&format!("\n\n## Previous output from {}\n{}", agent_id, output));
        }
        prompt
    }
}

/// Typed result of one execution attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Success(String),
    RetryableFailure(String),
    /// Backend refuses calls until this Unix-ms timestamp
    RateLimited(i64),
    FatalFailure {
        reason: String,
        /// The backend could not be reached at all (missing binary, bad
        /// credentials). Counts toward marking the agent unreachable.
        unreachable: bool,
    },
}

impl Outcome {
    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::FatalFailure {
            reason: reason.into(),
            unreachable: false,
        }
    }

    pub fn unreachable(reason: impl Into<String>) -> Self {
        Self::FatalFailure {
            reason: reason.into(),
            unreachable: true,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::RetryableFailure(_) => "retryable",
            Self::RateLimited(_) => "rate_limited",
            Self::FatalFailure { .. } => "fatal",
        }
    }
}

/// Token and cost accounting reported alongside an outcome
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

/// What an agent returns for one call
#[derive(Debug, Clone, PartialEq)]
pub struct AgentResponse {
    pub outcome: Outcome,
    pub usage: UsageMetadata,
}

impl AgentResponse {
    pub fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            usage: UsageMetadata::default(),
        }
    }

    pub fn with_usage(mut self, usage: UsageMetadata) -> Self {
        self.usage = usage;
        self
    }
}

impl From<Outcome> for AgentResponse {
    fn from(outcome: Outcome) -> Self {
        Self::new(outcome)
    }
}

/// An executor for prompts against one backend
///
/// Each call is independent. Implementations should honor `timeout`, but
/// the scheduler also enforces it externally.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Static description: id, backend, capabilities, cost, concurrency
    fn descriptor(&self) -> AgentDescriptor;

    /// Execute `content` and classify the result
    async fn execute(&self, content: &str, context: &ExecutionContext, timeout: Duration) -> AgentResponse;

    /// Cheap reachability probe used to restore unreachable agents
    async fn health_check(&self) -> bool {
        true
    }
}
