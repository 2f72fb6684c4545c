//! Collaborative execution of one entry by several agents
//!
//! Members never abort each other: every member runs to completion (or its
//! own timeout) and the aggregate is computed afterwards.

use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{debug, info};

use crate::agent::{ExecutionContext, Outcome, UsageMetadata};
use crate::domain::CoordinationMode;
use crate::pool::AgentLease;

/// Result of one group member
#[derive(Debug, Clone, PartialEq)]
pub struct MemberResult {
    pub agent_id: String,
    pub backend: String,
    pub outcome: Outcome,
    pub usage: UsageMetadata,
    pub duration: Duration,
}

/// Aggregate result of a group
#[derive(Debug, Clone, PartialEq)]
pub struct GroupOutcome {
    /// `Success` if any member succeeded, else `RetryableFailure`
    pub outcome: Outcome,
    pub members: Vec<MemberResult>,
}

impl GroupOutcome {
    fn aggregate(members: Vec<MemberResult>) -> Self {
        let successes: Vec<String> = members
            .iter()
            .filter_map(|m| match &m.outcome {
                Outcome::Success(output) => Some(format!("## {}\n{}", m.agent_id, output)),
                _ => None,
            })
            .collect();

        let outcome = if successes.is_empty() {
            let failures: Vec<String> = members
                .iter()
                .map(|m| format!("{}: {}", m.agent_id, describe(&m.outcome)))
                .collect();
            Outcome::RetryableFailure(format!(
                "all {} group members failed: {}",
                members.len(),
                failures.join("; ")
            ))
        } else {
            Outcome::Success(successes.join("\n\n"))
        };
        Self { outcome, members }
    }
}

fn describe(outcome: &Outcome) -> String {
    match outcome {
        Outcome::Success(_) => "success".to_string(),
        Outcome::RetryableFailure(reason) => reason.clone(),
        Outcome::RateLimited(resume_at) => format!("rate limited until {}", resume_at),
        Outcome::FatalFailure { reason, .. } => format!("fatal: {}", reason),
    }
}

async fn run_member(lease: AgentLease, content: &str, context: &ExecutionContext, timeout: Duration) -> MemberResult {
    let started = Instant::now();
    let response = match tokio::time::timeout(timeout, lease.agent().execute(content, context, timeout)).await {
        Ok(response) => response,
        Err(_) => Outcome::RetryableFailure("timeout".to_string()).into(),
    };
    let duration = started.elapsed();
    let agent_id = lease.agent_id().to_string();
    let backend = lease.backend().to_string();
    debug!(%agent_id, kind = response.outcome.kind(), ?duration, "run_member: finished");
    lease.complete(&response.outcome, duration);
    MemberResult {
        agent_id,
        backend,
        outcome: response.outcome,
        usage: response.usage,
        duration,
    }
}

/// Run `content` on every leased member
///
/// Sequential members run in lease order, each seeing the successful outputs
/// of the members before it. Parallel members run concurrently.
pub async fn execute_group(
    leases: Vec<AgentLease>,
    mode: CoordinationMode,
    content: &str,
    context: &ExecutionContext,
    timeout: Duration,
) -> GroupOutcome {
    info!(members = leases.len(), %mode, "Executing collaborative group");
    let members = match mode {
        CoordinationMode::Sequential => {
            let mut context = context.clone();
            let mut results = Vec::with_capacity(leases.len());
            for lease in leases {
                let result = run_member(lease, content, &context, timeout).await;
                if let Outcome::Success(output) = &result.outcome {
                    context.prior_outputs.push((result.agent_id.clone(), output.clone()));
                }
                results.push(result);
            }
            results
        }
        CoordinationMode::Parallel => {
            join_all(
                leases
                    .into_iter()
                    .map(|lease| run_member(lease, content, context, timeout)),
            )
            .await
        }
    };
    GroupOutcome::aggregate(members)
}
