//! Integration tests for promptd
//!
//! These tests drive the scheduler against scripted agents and check the
//! resulting entry states end to end.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use promptd::agent::{Agent, AgentDescriptor, AgentResponse, ExecutionContext, Outcome};
use promptd::domain::{
    Collaboration, CoordinationMode, EntryDraft, EntryState, EntryUpdate, ErrorKind, PromptEntry, QueueDefaults,
    RoutingStrategy, now_ms,
};
use promptd::events::EventBus;
use promptd::pool::AgentPool;
use promptd::ratelimit::BackoffPolicy;
use promptd::router::Router;
use promptd::scheduler::{DispatchResult, Scheduler, SchedulerConfig};
use promptd::state::StateManager;
use tempfile::TempDir;
use tokio::sync::{Notify, watch};

// =============================================================================
// Helpers
// =============================================================================

/// Agent that replays a script of outcomes, repeating the last one
struct ScriptedAgent {
    descriptor: AgentDescriptor,
    script: Mutex<VecDeque<Outcome>>,
    fallback: Outcome,
    calls: AtomicUsize,
    received: Mutex<Vec<String>>,
    gate: Option<Arc<Notify>>,
    healthy: bool,
}

impl ScriptedAgent {
    fn new(id: &str, backend: &str, script: Vec<Outcome>) -> Self {
        let fallback = script
            .last()
            .cloned()
            .unwrap_or_else(|| Outcome::Success("ok".to_string()));
        Self {
            descriptor: AgentDescriptor::new(id, backend),
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
            gate: None,
            healthy: true,
        }
    }

    fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    fn unhealthy(mut self) -> Self {
        self.healthy = false;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn descriptor(&self) -> AgentDescriptor {
        self.descriptor.clone()
    }

    async fn execute(&self, content: &str, _context: &ExecutionContext, _timeout: Duration) -> AgentResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.received.lock().unwrap().push(content.to_string());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        AgentResponse::new(outcome)
    }

    async fn health_check(&self) -> bool {
        self.healthy
    }
}

fn backoff(base_ms: u64) -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_millis(base_ms), Duration::from_millis(base_ms * 4), 0.0)
}

fn build_with(
    config: SchedulerConfig,
    state: StateManager,
    agents: &[Arc<ScriptedAgent>],
    backoff: BackoffPolicy,
) -> Arc<Scheduler> {
    let pool = Arc::new(AgentPool::new(3));
    for agent in agents {
        pool.register_agent(agent.clone());
    }
    let router = Router::new(pool, RoutingStrategy::LoadBalanced);
    Arc::new(Scheduler::new(config, state, router, backoff))
}

fn build(state: StateManager, agents: &[Arc<ScriptedAgent>], backoff: BackoffPolicy) -> Arc<Scheduler> {
    build_with(SchedulerConfig::default(), state, agents, backoff)
}

fn in_memory_with(config: SchedulerConfig, agents: &[Arc<ScriptedAgent>], backoff: BackoffPolicy) -> Arc<Scheduler> {
    let state = StateManager::in_memory(QueueDefaults::default(), Arc::new(EventBus::new(256))).unwrap();
    build_with(config, state, agents, backoff)
}

fn in_memory(agents: &[Arc<ScriptedAgent>], backoff: BackoffPolicy) -> Arc<Scheduler> {
    in_memory_with(SchedulerConfig::default(), agents, backoff)
}

/// One scheduling round: start what can start, then let it finish
async fn round(scheduler: &Arc<Scheduler>) -> usize {
    let dispatched = scheduler.dispatch_ready().await.unwrap();
    scheduler.wait_idle().await;
    dispatched
}

/// Run rounds until `id` reaches `target`
async fn drive_until(scheduler: &Arc<Scheduler>, id: &str, target: EntryState) -> PromptEntry {
    for _ in 0..200 {
        round(scheduler).await;
        let entry = scheduler.state().get_required(id).await.unwrap();
        if entry.state == target {
            return entry;
        }
        scheduler.sweep().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("entry {} never reached {}", id, target);
}

// =============================================================================
// Ordering
// =============================================================================

#[tokio::test]
async fn test_priority_then_fifo_order() {
    let agent = Arc::new(ScriptedAgent::new("solo", "claude", vec![]));
    let scheduler = in_memory(std::slice::from_ref(&agent), backoff(10));
    let state = scheduler.state();

    state.submit(EntryDraft::new("first")).await.unwrap();
    state.submit(EntryDraft::new("second")).await.unwrap();
    state.submit(EntryDraft::new("third")).await.unwrap();
    state.submit(EntryDraft::new("urgent").with_priority(10)).await.unwrap();

    let mut rounds = 0;
    while state.stats().await.unwrap().completed < 4 {
        rounds += 1;
        assert!(rounds <= 10, "queue did not drain");
        round(&scheduler).await;
    }

    assert_eq!(agent.received(), vec!["urgent", "first", "second", "third"]);
    let stats = state.stats().await.unwrap();
    assert_eq!(stats.completed, 4);
    assert_eq!(stats.queued, 0);
}

// =============================================================================
// Failure handling
// =============================================================================

#[tokio::test]
async fn test_retryable_failures_exhaust_retries() {
    let agent = Arc::new(ScriptedAgent::new(
        "flaky",
        "claude",
        vec![Outcome::RetryableFailure("connection reset".to_string())],
    ));
    let scheduler = in_memory(std::slice::from_ref(&agent), backoff(50));
    let state = scheduler.state();
    let id = state
        .submit(EntryDraft::new("Refactor the parser").with_priority(5).with_max_retries(2))
        .await
        .unwrap();

    let before = now_ms();
    assert_eq!(round(&scheduler).await, 1);
    let entry = state.get_required(&id).await.unwrap();
    assert_eq!(entry.state, EntryState::Queued);
    assert_eq!(entry.retry_count, 1);
    assert!(entry.eligible_at >= before + 50, "first retry waits the base delay");
    assert_eq!(entry.last_error.as_ref().map(|e| e.kind), Some(ErrorKind::Retryable));

    // Still backing off
    assert_eq!(round(&scheduler).await, 0);
    assert_eq!(agent.calls(), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(round(&scheduler).await, 1);
    let entry = state.get_required(&id).await.unwrap();
    assert_eq!(entry.state, EntryState::Failed);
    assert_eq!(entry.retry_count, 2);
    assert_eq!(entry.priority, 5);
    assert_eq!(agent.calls(), 2);
    assert!(entry.completed_at.is_some());
}

#[tokio::test]
async fn test_fatal_failure_fails_immediately() {
    let agent = Arc::new(ScriptedAgent::new(
        "strict",
        "claude",
        vec![Outcome::fatal("prompt rejected by policy")],
    ));
    let scheduler = in_memory(std::slice::from_ref(&agent), backoff(10));
    let id = scheduler
        .state()
        .submit(EntryDraft::new("task").with_max_retries(5))
        .await
        .unwrap();

    round(&scheduler).await;

    let entry = scheduler.state().get_required(&id).await.unwrap();
    assert_eq!(entry.state, EntryState::Failed);
    assert_eq!(entry.retry_count, 0);
    let error = entry.last_error.unwrap();
    assert_eq!(error.kind, ErrorKind::Fatal);
    assert!(error.message.contains("policy"));
    assert_eq!(agent.calls(), 1);
}

#[tokio::test]
async fn test_zero_agents_keeps_entry_queued() {
    let scheduler = in_memory(&[], backoff(10));
    let id = scheduler.state().submit(EntryDraft::new("nobody home")).await.unwrap();

    let result = scheduler.dispatch_next().await.unwrap();
    assert!(matches!(result, DispatchResult::Deferred { .. }));
    for _ in 0..3 {
        round(&scheduler).await;
    }

    let entry = scheduler.state().get_required(&id).await.unwrap();
    assert_eq!(entry.state, EntryState::Queued);
    assert_eq!(entry.retry_count, 0);
    assert!(entry.last_error.is_none());
    assert!(entry.eligible_at > now_ms());
}

#[tokio::test]
async fn test_stuck_agent_hits_execution_deadline() {
    // Never released: the agent ignores its own timeout argument
    let gate = Arc::new(Notify::new());
    let agent = Arc::new(ScriptedAgent::new("stuck", "claude", vec![]).gated(gate));
    let config = SchedulerConfig {
        execution_timeout_ms: 50,
        ..Default::default()
    };
    let scheduler = in_memory_with(config, std::slice::from_ref(&agent), backoff(10));
    let id = scheduler
        .state()
        .submit(EntryDraft::new("hang forever").with_max_retries(3))
        .await
        .unwrap();

    assert_eq!(round(&scheduler).await, 1);

    let entry = scheduler.state().get_required(&id).await.unwrap();
    assert_eq!(entry.state, EntryState::Queued);
    assert_eq!(entry.retry_count, 1);
    let error = entry.last_error.unwrap();
    assert_eq!(error.kind, ErrorKind::Timeout);
    assert_eq!(error.message, "timeout");
    assert_eq!(scheduler.pool().stats().busy, 0);
    assert_eq!(scheduler.stats().await.retried, 1);
}

// =============================================================================
// Rate limiting
// =============================================================================

#[tokio::test]
async fn test_rate_limit_parks_entries_for_same_backend() {
    let resume_at = now_ms() + 60_000;
    let agent = Arc::new(ScriptedAgent::new(
        "solo",
        "claude",
        vec![Outcome::RateLimited(resume_at), Outcome::Success("ok".to_string())],
    ));
    let scheduler = in_memory(std::slice::from_ref(&agent), backoff(10));
    let state = scheduler.state();
    let first = state.submit(EntryDraft::new("first")).await.unwrap();
    let second = state.submit(EntryDraft::new("second")).await.unwrap();

    assert_eq!(round(&scheduler).await, 1);
    let entry = state.get_required(&first).await.unwrap();
    assert_eq!(entry.state, EntryState::RateLimited);
    assert_eq!(entry.resume_at, Some(resume_at));
    assert_eq!(entry.retry_count, 0);
    assert_eq!(entry.rate_limit_cycles, 1);

    // The second entry is parked on the same window instead of being sent
    assert_eq!(round(&scheduler).await, 0);
    let entry = state.get_required(&second).await.unwrap();
    assert_eq!(entry.state, EntryState::RateLimited);
    assert_eq!(entry.resume_at, Some(resume_at));
    assert_eq!(agent.calls(), 1);

    assert_eq!(scheduler.sweep().await.unwrap(), 0);
    let windows = state.list_rate_limits().await.unwrap();
    assert_eq!(windows.len(), 1);
    assert_eq!(windows[0].backend_id, "claude");
    assert_eq!(windows[0].resume_at, resume_at);
}

#[tokio::test]
async fn test_rate_limited_entries_resume_after_window() {
    let resume_at = now_ms() + 50;
    let agent = Arc::new(ScriptedAgent::new(
        "solo",
        "claude",
        vec![Outcome::RateLimited(resume_at), Outcome::Success("ok".to_string())],
    ));
    let scheduler = in_memory(std::slice::from_ref(&agent), backoff(10));
    let state = scheduler.state();
    let first = state.submit(EntryDraft::new("first")).await.unwrap();
    let second = state.submit(EntryDraft::new("second")).await.unwrap();

    round(&scheduler).await;
    round(&scheduler).await;
    assert_eq!(agent.calls(), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(scheduler.sweep().await.unwrap(), 2);

    let first = drive_until(&scheduler, &first, EntryState::Completed).await;
    let second = drive_until(&scheduler, &second, EntryState::Completed).await;
    assert_eq!(first.retry_count, 0);
    assert_eq!(second.rate_limit_cycles, 0);
    assert_eq!(agent.calls(), 3);

    // A success on the backend clears its persisted window
    assert!(state.list_rate_limits().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_success_inside_live_window_keeps_it() {
    let gate = Arc::new(Notify::new());
    let resume_at = now_ms() + 60_000;
    let slow = Arc::new(ScriptedAgent::new("a-slow", "claude", vec![]).gated(gate.clone()));
    let limited = Arc::new(ScriptedAgent::new("b-lim", "claude", vec![Outcome::RateLimited(resume_at)]));
    let scheduler = in_memory(&[slow.clone(), limited.clone()], backoff(10));
    let state = scheduler.state();
    let first = state.submit(EntryDraft::new("first")).await.unwrap();
    let second = state.submit(EntryDraft::new("second")).await.unwrap();

    // first goes to a-slow and blocks, second hits the limit on b-lim
    assert_eq!(scheduler.dispatch_ready().await.unwrap(), 2);
    for _ in 0..200 {
        if state.get_required(&second).await.unwrap().state == EntryState::RateLimited {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(state.get_required(&second).await.unwrap().state, EntryState::RateLimited);
    assert!(!scheduler.tracker().is_available("claude", now_ms()));

    // The older call succeeds after the window was set
    gate.notify_one();
    scheduler.wait_idle().await;
    assert_eq!(state.get_required(&first).await.unwrap().state, EntryState::Completed);
    assert!(!scheduler.tracker().is_available("claude", now_ms()));
    assert_eq!(state.list_rate_limits().await.unwrap().len(), 1);

    let third = state.submit(EntryDraft::new("third")).await.unwrap();
    assert_eq!(round(&scheduler).await, 0);
    let entry = state.get_required(&third).await.unwrap();
    assert_eq!(entry.state, EntryState::RateLimited);
    assert_eq!(entry.resume_at, Some(resume_at));
    assert_eq!(slow.calls(), 1);
    assert_eq!(limited.calls(), 1);
}

#[tokio::test]
async fn test_request_window_caps_calls_per_window() {
    let agent = Arc::new(ScriptedAgent::new("solo", "claude", vec![]));
    let config = SchedulerConfig {
        concurrent_tasks: 1,
        max_requests_per_window: Some(2),
        rate_window_secs: 60,
        ..Default::default()
    };
    let scheduler = in_memory_with(config, std::slice::from_ref(&agent), backoff(10));
    let state = scheduler.state();
    for n in 0..5 {
        state.submit(EntryDraft::new(format!("task {}", n))).await.unwrap();
    }

    for _ in 0..10 {
        round(&scheduler).await;
    }

    assert_eq!(agent.calls(), 2);
    let stats = state.stats().await.unwrap();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.rate_limited, 3);
    assert!(!scheduler.tracker().is_available("claude", now_ms()));
}

#[tokio::test]
async fn test_busy_open_agent_preferred_over_throttled_backend() {
    let gate = Arc::new(Notify::new());
    let gem = Arc::new(ScriptedAgent::new("gem", "gemini", vec![]).gated(gate.clone()));
    let cl = Arc::new(ScriptedAgent::new("cl", "claude", vec![]));
    let scheduler = in_memory(&[gem.clone(), cl.clone()], backoff(10));
    scheduler
        .tracker()
        .mark_throttled("claude", now_ms() + 5 * 60 * 60 * 1000);
    let state = scheduler.state();
    let first = state.submit(EntryDraft::new("first")).await.unwrap();
    let second = state.submit(EntryDraft::new("second")).await.unwrap();

    assert_eq!(scheduler.dispatch_ready().await.unwrap(), 1);
    assert_eq!(state.get_required(&first).await.unwrap().state, EntryState::Executing);
    let entry = state.get_required(&second).await.unwrap();
    assert_eq!(entry.state, EntryState::Queued);
    assert!(entry.resume_at.is_none());

    gate.notify_one();
    scheduler.wait_idle().await;

    assert_eq!(scheduler.dispatch_ready().await.unwrap(), 1);
    gate.notify_one();
    scheduler.wait_idle().await;

    assert_eq!(state.get_required(&second).await.unwrap().state, EntryState::Completed);
    assert_eq!(gem.calls(), 2);
    assert_eq!(cl.calls(), 0);
}

#[tokio::test]
async fn test_rate_limit_cycles_bound_fails_entry() {
    let agent = Arc::new(ScriptedAgent::new(
        "solo",
        "claude",
        vec![Outcome::RateLimited(now_ms() + 30)],
    ));
    let config = SchedulerConfig {
        max_rate_limit_cycles: Some(1),
        ..Default::default()
    };
    let scheduler = in_memory_with(config, std::slice::from_ref(&agent), backoff(10));
    let id = scheduler.state().submit(EntryDraft::new("always throttled")).await.unwrap();

    let entry = drive_until(&scheduler, &id, EntryState::Failed).await;
    assert_eq!(entry.rate_limit_cycles, 2);
    assert_eq!(entry.retry_count, 0);
    assert_eq!(entry.last_error.map(|e| e.kind), Some(ErrorKind::RateLimit));
    assert_eq!(agent.calls(), 2);
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_cancel_rejected_while_executing() {
    let gate = Arc::new(Notify::new());
    let agent = Arc::new(ScriptedAgent::new("slow", "claude", vec![]).gated(gate.clone()));
    let scheduler = in_memory(std::slice::from_ref(&agent), backoff(10));
    let state = scheduler.state();
    let running = state.submit(EntryDraft::new("long task")).await.unwrap();
    let waiting = state.submit(EntryDraft::new("waiting task")).await.unwrap();

    assert_eq!(scheduler.dispatch_ready().await.unwrap(), 1);
    assert_eq!(state.get_required(&running).await.unwrap().state, EntryState::Executing);

    let err = state.cancel(&running).await.unwrap_err();
    assert!(err.is_invalid_transition());

    let cancelled = state.cancel(&waiting).await.unwrap();
    assert_eq!(cancelled.state, EntryState::Cancelled);

    gate.notify_one();
    scheduler.wait_idle().await;
    assert_eq!(state.get_required(&running).await.unwrap().state, EntryState::Completed);

    // Cancelled entries are never dispatched
    assert_eq!(round(&scheduler).await, 0);
    assert_eq!(agent.calls(), 1);
}

// =============================================================================
// Collaboration
// =============================================================================

#[tokio::test]
async fn test_parallel_group_succeeds_with_partial_failure() {
    let alpha = Arc::new(ScriptedAgent::new("alpha", "claude", vec![Outcome::Success("alpha says yes".into())]));
    let beta = Arc::new(ScriptedAgent::new("beta", "gemini", vec![Outcome::fatal("bad credentials")]));
    let gamma = Arc::new(ScriptedAgent::new("gamma", "anthropic", vec![Outcome::Success("gamma agrees".into())]));
    let scheduler = in_memory(&[alpha.clone(), beta.clone(), gamma.clone()], backoff(10));

    let collaboration = Collaboration::with_size(CoordinationMode::Parallel, 3);
    let id = scheduler
        .state()
        .submit(EntryDraft::new("Review this design").with_collaboration(collaboration))
        .await
        .unwrap();

    assert_eq!(round(&scheduler).await, 1);

    let entry = scheduler.state().get_required(&id).await.unwrap();
    assert_eq!(entry.state, EntryState::Completed);
    let result = entry.result.unwrap();
    assert!(result.contains("alpha says yes"));
    assert!(result.contains("gamma agrees"));
    assert!(!result.contains("bad credentials"));
    for agent in [&alpha, &beta, &gamma] {
        assert_eq!(agent.calls(), 1);
    }
    assert_eq!(scheduler.pool().stats().busy, 0);
}

// =============================================================================
// Restart
// =============================================================================

#[tokio::test]
async fn test_restart_requeues_executing_entries() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = temp_dir.path().join("store");

    let id = {
        let state = StateManager::spawn(&store, QueueDefaults::default(), Arc::new(EventBus::new(64))).unwrap();
        let id = state.submit(EntryDraft::new("interrupted task")).await.unwrap();
        state
            .transition(&id, EntryState::Executing, EntryUpdate::new().agent("gone"))
            .await
            .unwrap();
        state
            .transition(&id, EntryState::Queued, EntryUpdate::new().retry_count(1))
            .await
            .unwrap();
        state
            .transition(&id, EntryState::Executing, EntryUpdate::new().agent("gone"))
            .await
            .unwrap();
        state.shutdown().await.unwrap();
        id
    };

    let agent = Arc::new(ScriptedAgent::new("fresh", "claude", vec![Outcome::Success("resumed".into())]));
    let state = StateManager::spawn(&store, QueueDefaults::default(), Arc::new(EventBus::new(64))).unwrap();
    assert_eq!(state.get_required(&id).await.unwrap().state, EntryState::Executing);

    let scheduler = build(state, std::slice::from_ref(&agent), backoff(10));
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(Arc::clone(&scheduler).run(rx));

    let mut entry = None;
    for _ in 0..200 {
        let current = scheduler.state().get_required(&id).await.unwrap();
        if current.state == EntryState::Completed {
            entry = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler should stop")
        .unwrap()
        .unwrap();

    let entry = entry.expect("recovered entry should complete");
    assert_eq!(entry.retry_count, 1, "a crash does not consume a retry");
    assert_eq!(entry.result.as_deref(), Some("resumed"));
    assert_eq!(agent.received(), vec!["interrupted task"]);
}

#[tokio::test]
async fn test_unhealthy_agent_skipped_from_startup() {
    let down = Arc::new(ScriptedAgent::new("down", "claude", vec![]).unhealthy());
    let up = Arc::new(ScriptedAgent::new("up", "gemini", vec![Outcome::Success("served".into())]));
    let scheduler = in_memory(&[down.clone(), up.clone()], backoff(10));
    let id = scheduler.state().submit(EntryDraft::new("first call")).await.unwrap();

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(Arc::clone(&scheduler).run(rx));

    let mut completed = false;
    for _ in 0..200 {
        if scheduler.state().get_required(&id).await.unwrap().state == EntryState::Completed {
            completed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler should stop")
        .unwrap()
        .unwrap();

    assert!(completed);
    assert_eq!(down.calls(), 0);
    assert_eq!(up.calls(), 1);
    assert_eq!(
        scheduler.pool().descriptor("down").unwrap().health,
        promptd::agent::AgentHealth::Unreachable
    );
}
