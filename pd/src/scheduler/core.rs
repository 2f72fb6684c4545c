//! Scheduler implementation

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::eyre;
use tokio::sync::{Mutex, Notify, Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::config::SchedulerConfig;
use super::queue::{DispatchResult, SchedulerStats};
use crate::agent::{ExecutionContext, Outcome};
use crate::domain::{EntryError, EntryState, EntryUpdate, ErrorKind, PromptEntry, RateLimitWindow, now_ms};
use crate::events::{EventBus, QueueEvent};
use crate::pool::{AgentLease, AgentPool};
use crate::ratelimit::{BackoffPolicy, RateLimitTracker};
use crate::router::{Router, RouterError, execute_group};
use crate::state::{StateError, StateManager, StateResponse, recover};

/// How an eligible entry can be served right now
enum Binding {
    /// Capacity reserved on every member
    Bound(Vec<AgentLease>),
    /// Routed backend(s) throttled until this time
    Park(i64),
    /// No agent can serve the entry at all
    Defer(String),
    /// Capable agents exist but none has headroom
    Busy,
}

/// What came back from one execution attempt
struct Attempt {
    outcome: Outcome,
    /// Backend of a single-agent call
    backend: Option<String>,
    /// Backends that answered successfully
    succeeded: Vec<String>,
    timed_out: bool,
}

/// An entry that changed under us since it was listed
fn is_stale(e: &StateError) -> bool {
    matches!(
        e,
        StateError::InvalidTransition(_) | StateError::NotFound(_) | StateError::Validation(_)
    )
}

/// The Scheduler moves eligible entries through routing, execution and the
/// outcome-driven transitions.
pub struct Scheduler {
    config: SchedulerConfig,
    state: StateManager,
    router: Router,
    tracker: RateLimitTracker,
    backoff: BackoffPolicy,
    event_bus: Arc<EventBus>,
    capacity: usize,
    slots: Arc<Semaphore>,
    inflight: Mutex<JoinSet<()>>,
    stats: Mutex<SchedulerStats>,
    notify: Notify,
}

impl Scheduler {
    /// Create a new scheduler with the given configuration
    pub fn new(config: SchedulerConfig, state: StateManager, router: Router, backoff: BackoffPolicy) -> Self {
        debug!(?config, ?backoff, "Scheduler::new: called");
        let tracker = match config.request_window() {
            Some(window) => RateLimitTracker::with_request_window(window),
            None => RateLimitTracker::new(),
        };
        let capacity = config.concurrent_tasks.max(1);
        Self {
            event_bus: state.event_bus().clone(),
            config,
            state,
            router,
            tracker,
            backoff,
            capacity,
            slots: Arc::new(Semaphore::new(capacity)),
            inflight: Mutex::new(JoinSet::new()),
            stats: Mutex::new(SchedulerStats::default()),
            notify: Notify::new(),
        }
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn tracker(&self) -> &RateLimitTracker {
        &self.tracker
    }

    pub fn pool(&self) -> &Arc<AgentPool> {
        self.router.pool()
    }

    /// Executions currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.slots.available_permits())
    }

    pub async fn stats(&self) -> SchedulerStats {
        self.stats.lock().await.clone()
    }

    /// Wake the loop, e.g. after a local submit
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// Run until `shutdown` flips to true, then wait for in-flight calls
    ///
    /// Recovers entries left `executing`, restores persisted throttle windows
    /// and probes every agent before the first dispatch.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> eyre::Result<()> {
        info!(concurrent_tasks = self.capacity, agents = self.pool().len(), "Scheduler starting");

        let recovered = recover(&self.state).await?;
        let windows = self
            .state
            .list_rate_limits()
            .await
            .map_err(|e| eyre!("Failed to load rate-limit windows: {}", e))?;
        let restored = self.tracker.restore(windows, now_ms());
        info!(%recovered, restored, "Scheduler state restored");

        let unreachable = self.pool().probe_all().await;
        if !unreachable.is_empty() {
            warn!(?unreachable, "Agents unreachable at startup");
        }

        let mut poll = tokio::time::interval(self.config.poll_interval());
        let mut sweep = tokio::time::interval(self.config.sweep_interval());
        let mut health = tokio::time::interval(self.config.health_check_interval());
        for timer in [&mut poll, &mut sweep, &mut health] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Scheduler::run: shutdown signalled");
                        break Ok(());
                    }
                    continue;
                }
                _ = self.notify.notified() => {
                    debug!("Scheduler::run: notified");
                }
                _ = poll.tick() => {}
                _ = sweep.tick() => {
                    if let Err(e) = self.sweep().await {
                        break Err(eyre!("Rate-limit sweep failed: {}", e));
                    }
                }
                _ = health.tick() => {
                    let restored = self.pool().run_health_checks().await;
                    if !restored.is_empty() {
                        info!(?restored, "Agents restored by health check");
                    }
                }
            }

            if let Err(e) = self.dispatch_ready().await {
                break Err(eyre!("Dispatch failed: {}", e));
            }
        };

        info!(in_flight = self.in_flight(), "Scheduler stopping, waiting for in-flight executions");
        self.wait_idle().await;
        let stats = self.stats().await;
        info!(%stats, "Scheduler stopped");
        result
    }

    /// Dispatch until nothing more can start this cycle
    ///
    /// Returns the number of entries started.
    pub async fn dispatch_ready(self: &Arc<Self>) -> StateResponse<usize> {
        self.reap().await;
        let mut dispatched = 0;
        loop {
            match self.dispatch_next().await? {
                DispatchResult::Dispatched { .. } => dispatched += 1,
                result if result.made_progress() => {}
                _ => break,
            }
        }
        debug!(dispatched, "Scheduler::dispatch_ready: done");
        Ok(dispatched)
    }

    /// Try to start the best eligible entry
    ///
    /// Candidates are scanned in dispatch order; one whose agents are all busy
    /// is skipped so it does not block entries behind it.
    pub async fn dispatch_next(self: &Arc<Self>) -> StateResponse<DispatchResult> {
        let now = now_ms();
        let Ok(permit) = self.slots.clone().try_acquire_owned() else {
            debug!("Scheduler::dispatch_next: all slots in use");
            return Ok(DispatchResult::AtCapacity);
        };

        let candidates = self.state.eligible(now).await?;
        if candidates.is_empty() {
            debug!("Scheduler::dispatch_next: nothing eligible");
            return Ok(DispatchResult::Idle);
        }

        let throttled = self.tracker.throttled_backends(now);
        for entry in candidates {
            match self.bind(&entry, &throttled) {
                Binding::Busy => {
                    debug!(id = %entry.id, "Scheduler::dispatch_next: agents busy, trying next entry");
                }
                Binding::Defer(reason) => {
                    let delay = self.backoff.delay_ms(0).max(self.config.poll_interval_ms as i64);
                    let until = now.saturating_add(delay);
                    match self.state.defer(&entry.id, until).await {
                        Ok(_) => {}
                        Err(e) if is_stale(&e) => continue,
                        Err(e) => return Err(e),
                    }
                    info!(id = %entry.id, %reason, until, "No eligible agent, entry deferred");
                    self.stats.lock().await.deferred += 1;
                    return Ok(DispatchResult::Deferred {
                        entry_id: entry.id,
                        until,
                    });
                }
                Binding::Park(resume_at) => {
                    let update = EntryUpdate::new().resume_at(resume_at);
                    match self.state.transition(&entry.id, EntryState::RateLimited, update).await {
                        Ok(_) => {}
                        Err(e) if is_stale(&e) => continue,
                        Err(e) => return Err(e),
                    }
                    info!(id = %entry.id, resume_at, "Routed backend throttled, entry parked");
                    self.stats.lock().await.rate_limited += 1;
                    return Ok(DispatchResult::Parked {
                        entry_id: entry.id,
                        resume_at,
                    });
                }
                Binding::Bound(leases) => {
                    let agents: Vec<String> = leases.iter().map(|l| l.agent_id().to_string()).collect();
                    let update = EntryUpdate::new().agent(agents.join(","));
                    let entry = match self.state.transition(&entry.id, EntryState::Executing, update).await {
                        Ok(entry) => entry,
                        Err(e) if is_stale(&e) => continue,
                        Err(e) => return Err(e),
                    };

                    for lease in &leases {
                        if let Some(window) = self.tracker.record_request(lease.backend(), now) {
                            self.publish_window(window).await;
                        }
                    }

                    {
                        let mut stats = self.stats.lock().await;
                        stats.dispatched += 1;
                        stats.peak_concurrent = stats.peak_concurrent.max(self.in_flight());
                    }
                    info!(id = %entry.id, ?agents, priority = entry.priority, "Entry dispatched");

                    let entry_id = entry.id.clone();
                    let scheduler = Arc::clone(self);
                    self.inflight.lock().await.spawn(async move {
                        scheduler.execute(entry, leases).await;
                        drop(permit);
                        scheduler.notify.notify_one();
                    });
                    return Ok(DispatchResult::Dispatched { entry_id, agents });
                }
            }
        }

        Ok(DispatchResult::AtCapacity)
    }

    /// Route `entry` and reserve capacity on its agents
    fn bind(&self, entry: &PromptEntry, throttled: &HashMap<String, i64>) -> Binding {
        let strategy = self.router.strategy_for(entry);
        let decisions = match &entry.collaboration {
            Some(collaboration) => self.router.select_group(entry, strategy, collaboration, throttled),
            None => self
                .router
                .select_avoiding(entry, strategy, throttled)
                .map(|decision| vec![decision]),
        };
        let decisions = match decisions {
            Ok(decisions) => decisions,
            Err(RouterError::AtCapacity { .. }) => return Binding::Busy,
            Err(e) => return Binding::Defer(e.to_string()),
        };

        let throttled_until: Vec<i64> = decisions
            .iter()
            .filter_map(|d| throttled.get(d.backend()).copied())
            .collect();
        if throttled_until.len() == decisions.len() {
            if let Some(resume_at) = throttled_until.into_iter().min() {
                return Binding::Park(resume_at);
            }
        }

        let mut leases = Vec::with_capacity(decisions.len());
        for decision in decisions.iter().filter(|d| !throttled.contains_key(d.backend())) {
            match self.router.pool().try_acquire(decision.agent_id()) {
                Some(lease) => {
                    debug!(id = %entry.id, agent = %decision.agent_id(), reason = %decision.reason, "Scheduler::bind: reserved");
                    leases.push(lease);
                }
                // already-acquired leases release on drop
                None => return Binding::Busy,
            }
        }
        if leases.is_empty() {
            return Binding::Busy;
        }
        Binding::Bound(leases)
    }

    async fn execute(&self, entry: PromptEntry, mut leases: Vec<AgentLease>) {
        let mut context = ExecutionContext::new(entry.working_directory.clone());
        context.context_files = entry.context_files.clone();
        context.estimated_tokens = entry.estimated_tokens;
        let timeout = self.config.execution_timeout();

        let attempt = match &entry.collaboration {
            Some(collaboration) => {
                let group = execute_group(leases, collaboration.mode, &entry.content, &context, timeout).await;
                for member in &group.members {
                    if let Outcome::RateLimited(resume_at) = member.outcome {
                        self.throttle(&member.backend, resume_at).await;
                    }
                }
                Attempt {
                    succeeded: group
                        .members
                        .iter()
                        .filter(|m| m.outcome.is_success())
                        .map(|m| m.backend.clone())
                        .collect(),
                    outcome: group.outcome,
                    backend: None,
                    timed_out: false,
                }
            }
            None => match leases.pop() {
                Some(lease) => self.execute_single(lease, &entry, &context, timeout).await,
                None => Attempt {
                    outcome: Outcome::RetryableFailure("no agent bound".to_string()),
                    backend: None,
                    succeeded: Vec::new(),
                    timed_out: false,
                },
            },
        };

        if let Err(e) = self.finish(&entry, attempt).await {
            error!(id = %entry.id, error = %e, "Failed to record execution outcome");
        }
    }

    async fn execute_single(
        &self,
        lease: AgentLease,
        entry: &PromptEntry,
        context: &ExecutionContext,
        timeout: Duration,
    ) -> Attempt {
        let backend = lease.backend().to_string();
        let started = Instant::now();
        let call = lease.agent().execute(&entry.content, context, timeout);
        let (outcome, timed_out) = match tokio::time::timeout(timeout, call).await {
            Ok(response) => {
                debug!(
                    id = %entry.id,
                    input_tokens = response.usage.input_tokens,
                    output_tokens = response.usage.output_tokens,
                    cost = response.usage.cost,
                    "Scheduler::execute_single: usage"
                );
                (response.outcome, false)
            }
            Err(_) => {
                warn!(id = %entry.id, agent = %lease.agent_id(), ?timeout, "Agent call timed out");
                (Outcome::RetryableFailure("timeout".to_string()), true)
            }
        };
        lease.complete(&outcome, started.elapsed());

        let succeeded = if outcome.is_success() {
            vec![backend.clone()]
        } else {
            Vec::new()
        };
        Attempt {
            outcome,
            backend: Some(backend),
            succeeded,
            timed_out,
        }
    }

    /// Apply the transition an outcome calls for
    async fn finish(&self, entry: &PromptEntry, attempt: Attempt) -> StateResponse<()> {
        let id = entry.id.as_str();
        debug!(%id, kind = attempt.outcome.kind(), "Scheduler::finish: called");

        match attempt.outcome {
            Outcome::Success(result) => {
                self.state
                    .transition(id, EntryState::Completed, EntryUpdate::new().result(result))
                    .await?;
                // A live window outlasts calls that started before it was set
                let now = now_ms();
                for backend in &attempt.succeeded {
                    if self.tracker.is_available(backend, now) && self.tracker.clear(backend) {
                        self.state.clear_rate_limit(backend).await?;
                    }
                }
                self.stats.lock().await.completed += 1;
                info!(%id, "Entry completed");
            }
            Outcome::RetryableFailure(reason) => {
                let kind = if attempt.timed_out {
                    ErrorKind::Timeout
                } else {
                    ErrorKind::Retryable
                };
                let error = EntryError::new(kind, reason);
                let attempts = entry.retry_count.saturating_add(1);
                if attempts >= entry.max_retries {
                    let update = EntryUpdate::new()
                        .retry_count(attempts.min(entry.max_retries))
                        .error(error);
                    self.state.transition(id, EntryState::Failed, update).await?;
                    self.stats.lock().await.failed += 1;
                    warn!(%id, attempts, "Entry failed, retries exhausted");
                } else {
                    let eligible_at = now_ms().saturating_add(self.backoff.delay_ms(entry.retry_count));
                    let update = EntryUpdate::new()
                        .retry_count(attempts)
                        .eligible_at(eligible_at)
                        .error(error);
                    self.state.transition(id, EntryState::Queued, update).await?;
                    self.stats.lock().await.retried += 1;
                    info!(%id, attempts, eligible_at, "Entry requeued for retry");
                }
            }
            Outcome::RateLimited(resume_at) => {
                if let Some(backend) = &attempt.backend {
                    self.throttle(backend, resume_at).await;
                }
                let cycles = entry.rate_limit_cycles.saturating_add(1);
                if self.config.max_rate_limit_cycles.is_some_and(|max| cycles > max) {
                    let error = EntryError::new(
                        ErrorKind::RateLimit,
                        format!("rate limited {} times, last window until {}", cycles, resume_at),
                    );
                    let update = EntryUpdate::new().rate_limit_cycles(cycles).error(error);
                    self.state.transition(id, EntryState::Failed, update).await?;
                    self.stats.lock().await.failed += 1;
                    warn!(%id, cycles, "Entry failed, rate-limit cycles exhausted");
                } else {
                    let update = EntryUpdate::new().resume_at(resume_at).rate_limit_cycles(cycles);
                    self.state.transition(id, EntryState::RateLimited, update).await?;
                    self.stats.lock().await.rate_limited += 1;
                    info!(%id, resume_at, cycles, "Entry rate limited");
                }
            }
            Outcome::FatalFailure { reason, .. } => {
                let update = EntryUpdate::new().error(EntryError::new(ErrorKind::Fatal, reason));
                self.state.transition(id, EntryState::Failed, update).await?;
                self.stats.lock().await.failed += 1;
                warn!(%id, "Entry failed");
            }
        }
        Ok(())
    }

    async fn throttle(&self, backend: &str, resume_at: i64) {
        let window = self.tracker.mark_throttled(backend, resume_at);
        self.publish_window(window).await;
    }

    /// Announce and persist a throttle window
    async fn publish_window(&self, window: RateLimitWindow) {
        self.event_bus.emit(QueueEvent::BackendThrottled {
            backend_id: window.backend_id.clone(),
            resume_at: window.resume_at,
            timestamp: now_ms(),
        });
        let backend_id = window.backend_id.clone();
        if let Err(e) = self.state.save_rate_limit(window).await {
            warn!(%backend_id, error = %e, "Failed to persist rate-limit window");
        }
    }

    /// Move `rate_limited` entries whose window has elapsed back to `queued`
    ///
    /// Returns the number of entries resumed.
    pub async fn sweep(&self) -> StateResponse<usize> {
        let now = now_ms();
        let parked = self.state.list(Some(EntryState::RateLimited)).await?;
        debug!(parked = parked.len(), "Scheduler::sweep: called");

        let mut resumed = 0;
        for entry in parked {
            if entry.resume_at.is_some_and(|at| at > now) {
                continue;
            }
            match self.state.transition(&entry.id, EntryState::Queued, EntryUpdate::new()).await {
                Ok(_) => resumed += 1,
                Err(e) if is_stale(&e) => debug!(id = %entry.id, error = %e, "Scheduler::sweep: entry moved on"),
                Err(e) => return Err(e),
            }
        }

        if resumed > 0 {
            info!(resumed, "Rate-limited entries resumed");
            self.notify.notify_one();
        }
        Ok(resumed)
    }

    /// Collect finished execution tasks
    async fn reap(&self) {
        let mut inflight = self.inflight.lock().await;
        while let Some(result) = inflight.try_join_next() {
            if let Err(e) = result {
                error!(error = %e, "Execution task panicked");
            }
        }
    }

    /// Wait for every in-flight execution to finish
    pub async fn wait_idle(&self) {
        let mut inflight = self.inflight.lock().await;
        while let Some(result) = inflight.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Execution task panicked");
            }
        }
    }
}
