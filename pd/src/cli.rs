//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

use crate::domain::{CoordinationMode, EntryState, RoutingStrategy};

/// promptd - persistent prompt queue and multi-agent scheduler
#[derive(Parser)]
#[command(
    name = "promptd",
    about = "Persistent prompt queue that schedules work across AI coding agents",
    version = env!("GIT_DESCRIBE"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Store directory (overrides storage.path)
    #[arg(short, long, global = true, help = "Store directory (overrides storage.path)")]
    pub store: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Queue a prompt
    Submit {
        /// Prompt text, or `-` to read it from stdin
        content: String,

        /// Higher runs first
        #[arg(short, long)]
        priority: Option<i32>,

        /// Directory the agent runs in
        #[arg(short, long)]
        working_dir: Option<String>,

        /// Extra files listed in the agent's context (repeatable)
        #[arg(short = 'f', long = "file")]
        context_files: Vec<String>,

        /// Retry budget for retryable failures
        #[arg(short = 'r', long)]
        max_retries: Option<u32>,

        /// Capability tag the agent must advertise
        #[arg(long)]
        capability: Option<String>,

        /// Routing strategy (capability, load-balanced, cost-optimized, speed-optimized)
        #[arg(long)]
        strategy: Option<RoutingStrategy>,

        /// Estimated token budget passed to the agent
        #[arg(long)]
        tokens: Option<u64>,

        /// Run on a group of agents (sequential, parallel)
        #[arg(long, value_name = "MODE")]
        group: Option<CoordinationMode>,

        /// Group member agent id, in run order (repeatable, implies --group parallel)
        #[arg(long = "agent")]
        agents: Vec<String>,

        /// Number of router-selected group members when no --agent is given
        #[arg(long, default_value = "2")]
        group_size: usize,
    },

    /// List entries in submission order
    List {
        /// Filter by state (queued, executing, rate_limited, completed, failed, cancelled)
        #[arg(short = 't', long)]
        state: Option<EntryState>,

        /// Output format
        #[arg(short = 'o', long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show one entry
    Show {
        /// Entry ID (or partial match)
        id: String,

        /// Output format
        #[arg(short = 'o', long, default_value = "text")]
        format: OutputFormat,
    },

    /// Cancel a queued or rate-limited entry
    Cancel {
        /// Entry ID (or partial match)
        id: String,
    },

    /// Show per-state counts and throttled backends
    Stats {
        /// Output format
        #[arg(short = 'o', long, default_value = "text")]
        format: OutputFormat,
    },

    /// List configured agents
    Agents {
        /// Probe each agent's backend
        #[arg(long)]
        check: bool,
    },

    /// Run the scheduler in the foreground until Ctrl-C
    Run,
}

/// Result of checking an agent executable
pub struct ToolCheck {
    pub name: &'static str,
    pub available: bool,
    pub version: Option<String>,
}

impl ToolCheck {
    /// Check if a tool is available and get its version
    pub fn check(name: &'static str, version_args: &[&str]) -> Self {
        debug!(name, ?version_args, "ToolCheck::check: called");
        let result = std::process::Command::new(name).args(version_args).output();

        match result {
            Ok(output) if output.status.success() => {
                let version_str = String::from_utf8_lossy(&output.stdout);
                Self {
                    name,
                    available: true,
                    version: Some(parse_version(&version_str)),
                }
            }
            _ => {
                debug!(name, "ToolCheck::check: tool not available");
                Self {
                    name,
                    available: false,
                    version: None,
                }
            }
        }
    }
}

/// Parse version from command output (extracts first version-like string)
fn parse_version(output: &str) -> String {
    for word in output.split_whitespace() {
        let word = word.trim_start_matches('v');
        if word.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            let version: String = word.chars().take_while(|c| c.is_ascii_digit() || *c == '.').collect();
            if !version.is_empty() {
                return version;
            }
        }
    }
    "unknown".to_string()
}

/// Check the agent CLIs promptd can drive
pub fn check_agent_tools() -> Vec<ToolCheck> {
    vec![
        ToolCheck::check("claude", &["--version"]),
        ToolCheck::check("gemini", &["--version"]),
    ]
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("promptd")
        .join("logs")
        .join("promptd.log")
}

/// Generate the after_help text with agent tool checks and the log path
pub fn generate_after_help() -> String {
    debug!("generate_after_help: called");
    let mut help = String::from("Agent CLIs:\n");
    for tool in check_agent_tools() {
        let icon = if tool.available { "\u{2705}" } else { "\u{274C}" };
        let version = tool.version.as_deref().unwrap_or("not found");
        help.push_str(&format!("  {} {:<10} {}\n", icon, tool.name, version));
    }

    help.push('\n');
    help.push_str(&format!("Logs are written to: {}\n", get_log_path().display()));
    help
}

/// Output format for list/show/stats
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}
