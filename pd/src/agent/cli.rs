//! Agents that shell out to a local AI CLI (`claude`, `gemini`)

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use super::config::{AgentConfig, AgentKind};
use super::error::AgentError;
use super::types::{Agent, AgentDescriptor, AgentResponse, ExecutionContext, Outcome, UsageMetadata};
use crate::domain::now_ms;

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Marker the Claude CLI prints when the account quota is spent, followed by
/// the reset time as Unix seconds
const CLAUDE_LIMIT_MARKER: &str = "usage limit reached|";

/// Runs `<command> <args...> <prompt>` in the entry's working directory
pub struct CliAgent {
    descriptor: AgentDescriptor,
    kind: AgentKind,
    command: String,
    args: Vec<String>,
    account_dir: Option<PathBuf>,
    default_rate_limit: Duration,
}

impl CliAgent {
    pub fn from_config(config: &AgentConfig, default_rate_limit: Duration) -> Result<Self, AgentError> {
        debug!(id = %config.id, kind = %config.kind, "CliAgent::from_config: called");
        let command = config
            .command
            .clone()
            .or_else(|| config.kind.default_command().map(str::to_string))
            .ok_or_else(|| AgentError::InvalidConfig(format!("agent {} has no command", config.id)))?;
        if command.trim().is_empty() {
            return Err(AgentError::InvalidConfig(format!("agent {} has an empty command", config.id)));
        }

        let descriptor = AgentDescriptor::new(&config.id, config.backend_id())
            .with_capabilities(config.capabilities.iter().cloned())
            .with_cost(config.cost_per_call)
            .with_max_concurrency(config.max_concurrency);

        Ok(Self {
            descriptor,
            kind: config.kind,
            command,
            args: config.args.clone(),
            account_dir: config.account_dir.clone(),
            default_rate_limit,
        })
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.account_dir {
            match self.kind {
                AgentKind::ClaudeCli => {
                    cmd.env("CLAUDE_CONFIG_DIR", dir);
                }
                _ => {
                    cmd.env("HOME", dir);
                }
            }
        }
        cmd
    }
}

#[async_trait]
impl Agent for CliAgent {
    fn descriptor(&self) -> AgentDescriptor {
        self.descriptor.clone()
    }

    async fn execute(&self, content: &str, context: &ExecutionContext, timeout: Duration) -> AgentResponse {
        debug!(agent = %self.descriptor.id, content_len = content.len(), ?timeout, "CliAgent::execute: called");

        let mut cmd = self.build_command();
        if !context.working_directory.is_empty() {
            let dir = Path::new(&context.working_directory);
            if !dir.is_dir() {
                return Outcome::fatal(format!("working directory {} does not exist", dir.display())).into();
            }
            cmd.current_dir(dir);
        }
        cmd.arg(context.render_prompt(content));

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(agent = %self.descriptor.id, error = %e, "CliAgent::execute: failed to spawn");
                let outcome = match e.kind() {
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                        Outcome::unreachable(format!("cannot run {}: {}", self.command, e))
                    }
                    _ => Outcome::RetryableFailure(format!("cannot run {}: {}", self.command, e)),
                };
                return outcome.into();
            }
            Err(_) => {
                debug!(agent = %self.descriptor.id, "CliAgent::execute: timed out");
                return Outcome::RetryableFailure("timeout".to_string()).into();
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let outcome = classify_output(
            self.kind,
            output.status.success(),
            &stdout,
            &stderr,
            now_ms(),
            self.default_rate_limit,
        );
        debug!(agent = %self.descriptor.id, kind = outcome.kind(), "CliAgent::execute: classified");

        AgentResponse::new(outcome).with_usage(UsageMetadata {
            cost: self.descriptor.estimated_cost_per_call,
            ..Default::default()
        })
    }

    async fn health_check(&self) -> bool {
        debug!(agent = %self.descriptor.id, "CliAgent::health_check: called");
        let mut cmd = Command::new(&self.command);
        cmd.arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        matches!(
            tokio::time::timeout(HEALTH_CHECK_TIMEOUT, cmd.status()).await,
            Ok(Ok(status)) if status.success()
        )
    }
}

/// Map CLI exit status and output to an outcome
///
/// `default_rate_limit` applies when throttling is detected but the output
/// carries no reset time.
pub fn classify_output(
    kind: AgentKind,
    success: bool,
    stdout: &str,
    stderr: &str,
    now: i64,
    default_rate_limit: Duration,
) -> Outcome {
    let combined = format!("{}\n{}", stdout, stderr);

    if kind == AgentKind::ClaudeCli {
        if let Some(resume_at) = parse_claude_reset(&combined) {
            return Outcome::RateLimited(resume_at);
        }
    }

    if success {
        return Outcome::Success(stdout.trim().to_string());
    }

    if looks_throttled(&combined) {
        let delay_ms = parse_retry_in(&combined)
            .unwrap_or_else(|| i64::try_from(default_rate_limit.as_millis()).unwrap_or(i64::MAX));
        return Outcome::RateLimited(now.saturating_add(delay_ms));
    }

    let reason = if stderr.trim().is_empty() {
        stdout.trim()
    } else {
        stderr.trim()
    };
    Outcome::RetryableFailure(if reason.is_empty() {
        "process exited with failure status".to_string()
    } else {
        reason.to_string()
    })
}

/// Parse `usage limit reached|<epoch-seconds>` into Unix ms
fn parse_claude_reset(text: &str) -> Option<i64> {
    let lower = text.to_lowercase();
    let start = lower.find(CLAUDE_LIMIT_MARKER)? + CLAUDE_LIMIT_MARKER.len();
    let digits: String = lower[start..].chars().take_while(|c| c.is_ascii_digit()).collect();
    let secs: i64 = digits.parse().ok()?;
    chrono::DateTime::from_timestamp(secs, 0).map(|dt| dt.timestamp_millis())
}

fn looks_throttled(text: &str) -> bool {
    let lower = text.to_lowercase();
    ["usage limit reached", "rate limit", "resource_exhausted", "quota", "429", "too many requests"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Parse a `retry in 12.5s` hint into milliseconds
fn parse_retry_in(text: &str) -> Option<i64> {
    let lower = text.to_lowercase();
    let start = lower.find("retry in ")? + "retry in ".len();
    let number: String = lower[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let rest = &lower[start + number.len()..];
    let secs: f64 = number.parse().ok()?;
    let millis = if rest.starts_with("ms") { secs } else { secs * 1000.0 };
    Some(millis.ceil() as i64)
}
