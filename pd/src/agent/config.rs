//! Agent definitions as they appear in the config file

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Backend implementation selected by `kind`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    ClaudeCli,
    GeminiCli,
    AnthropicApi,
}

impl AgentKind {
    /// Backend identifier used when the config does not name one
    pub fn default_backend(&self) -> &'static str {
        match self {
            Self::ClaudeCli => "claude",
            Self::GeminiCli => "gemini",
            Self::AnthropicApi => "anthropic",
        }
    }

    pub fn default_command(&self) -> Option<&'static str> {
        match self {
            Self::ClaudeCli => Some("claude"),
            Self::GeminiCli => Some("gemini"),
            Self::AnthropicApi => None,
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClaudeCli => write!(f, "claude-cli"),
            Self::GeminiCli => write!(f, "gemini-cli"),
            Self::AnthropicApi => write!(f, "anthropic-api"),
        }
    }
}

/// One `agents:` entry
///
/// Account selection is explicit: two Claude CLI agents with different
/// `account-dir` values should also declare different `backend` ids so their
/// rate limits are tracked separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,

    pub kind: AgentKind,

    /// Rate-limit scope; defaults per kind
    #[serde(default)]
    pub backend: Option<String>,

    /// Executable for CLI kinds
    #[serde(default)]
    pub command: Option<String>,

    /// Arguments placed before the prompt for CLI kinds
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    #[serde(default)]
    pub capabilities: Vec<String>,

    #[serde(rename = "cost-per-call", default)]
    pub cost_per_call: f64,

    #[serde(rename = "max-concurrency", default = "default_max_concurrency")]
    pub max_concurrency: u32,

    #[serde(default = "default_model")]
    pub model: String,

    /// Environment variable holding the API key
    #[serde(rename = "api-key-env", default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(rename = "base-url", default = "default_base_url")]
    pub base_url: String,

    #[serde(rename = "max-tokens", default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Per-agent account/config directory for CLI kinds
    #[serde(rename = "account-dir", default)]
    pub account_dir: Option<PathBuf>,
}

fn default_args() -> Vec<String> {
    vec!["-p".to_string()]
}

fn default_max_concurrency() -> u32 {
    1
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_max_tokens() -> u32 {
    16384
}

impl AgentConfig {
    pub fn new(id: impl Into<String>, kind: AgentKind) -> Self {
        Self {
            id: id.into(),
            kind,
            backend: None,
            command: None,
            args: default_args(),
            capabilities: Vec::new(),
            cost_per_call: 0.0,
            max_concurrency: default_max_concurrency(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            max_tokens: default_max_tokens(),
            account_dir: None,
        }
    }

    pub fn backend_id(&self) -> String {
        self.backend
            .clone()
            .unwrap_or_else(|| self.kind.default_backend().to_string())
    }
}
