//! Pool registry
//!
//! Load counters are atomics so routing never waits on in-flight work.
//! Routing on a slightly stale load is fine; [`AgentPool::try_acquire`] is
//! the authoritative capacity check.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::lease::AgentLease;
use crate::agent::{Agent, AgentDescriptor, AgentHealth, Outcome};
use crate::domain::now_ms;
use crate::events::{EventBus, QueueEvent};

/// Consecutive reachability failures before an agent is marked unreachable
pub const DEFAULT_UNREACHABLE_AFTER: u32 = 3;

/// Weight of the newest sample in the latency average
const LATENCY_ALPHA: f64 = 0.3;

struct AgentSlot {
    descriptor: AgentDescriptor,
    agent: Arc<dyn Agent>,
    in_flight: AtomicU32,
    consecutive_unreachable: AtomicU32,
    unreachable: AtomicBool,
    total_calls: AtomicU64,
    avg_latency_ms: Mutex<Option<f64>>,
}

impl AgentSlot {
    fn new(descriptor: AgentDescriptor, agent: Arc<dyn Agent>) -> Self {
        Self {
            descriptor,
            agent,
            in_flight: AtomicU32::new(0),
            consecutive_unreachable: AtomicU32::new(0),
            unreachable: AtomicBool::new(false),
            total_calls: AtomicU64::new(0),
            avg_latency_ms: Mutex::new(None),
        }
    }

    fn latency(&self) -> Option<f64> {
        match self.avg_latency_ms.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn observe_latency(&self, duration: Duration) {
        let sample = duration.as_secs_f64() * 1000.0;
        let mut guard = match self.avg_latency_ms.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(match *guard {
            Some(avg) => avg + LATENCY_ALPHA * (sample - avg),
            None => sample,
        });
    }

    fn release(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }

    fn snapshot(&self) -> AgentDescriptor {
        let in_flight = self.in_flight.load(Ordering::Acquire);
        let max = self.descriptor.max_concurrency.max(1);
        let health = if self.unreachable.load(Ordering::Acquire) {
            AgentHealth::Unreachable
        } else if in_flight > 0 {
            AgentHealth::Busy
        } else {
            AgentHealth::Available
        };
        AgentDescriptor {
            current_load: (in_flight as f64 / max as f64).min(1.0),
            health,
            avg_latency_ms: self.latency().map(|ms| ms.round() as u64),
            ..self.descriptor.clone()
        }
    }
}

/// Aggregate pool view
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub busy: usize,
    pub unreachable: usize,
    pub capabilities: BTreeSet<String>,
    pub total_calls: u64,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} agents ({} available, {} busy, {} unreachable), {} calls",
            self.total, self.available, self.busy, self.unreachable, self.total_calls
        )
    }
}

/// Registry of live agents
pub struct AgentPool {
    slots: RwLock<HashMap<String, Arc<AgentSlot>>>,
    unreachable_after: u32,
    event_bus: Option<Arc<EventBus>>,
}

impl Default for AgentPool {
    fn default() -> Self {
        Self::new(DEFAULT_UNREACHABLE_AFTER)
    }
}

impl AgentPool {
    pub fn new(unreachable_after: u32) -> Self {
        debug!(unreachable_after, "AgentPool::new: called");
        Self {
            slots: RwLock::new(HashMap::new()),
            unreachable_after: unreachable_after.max(1),
            event_bus: None,
        }
    }

    /// Publish health changes on `event_bus`
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    fn read_slots(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<AgentSlot>>> {
        match self.slots.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_slots(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<AgentSlot>>> {
        match self.slots.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn slot(&self, id: &str) -> Option<Arc<AgentSlot>> {
        self.read_slots().get(id).cloned()
    }

    /// Register `agent` under `descriptor.id`, replacing any previous agent
    /// with that id
    pub fn register(&self, descriptor: AgentDescriptor, agent: Arc<dyn Agent>) {
        info!(id = %descriptor.id, backend = %descriptor.backend, "Registering agent");
        let id = descriptor.id.clone();
        let slot = Arc::new(AgentSlot::new(descriptor, agent));
        if self.write_slots().insert(id.clone(), slot).is_some() {
            debug!(%id, "AgentPool::register: replaced existing agent");
        }
    }

    /// Register using the agent's own descriptor
    pub fn register_agent(&self, agent: Arc<dyn Agent>) {
        let descriptor = agent.descriptor();
        self.register(descriptor, agent);
    }

    /// Remove an agent; in-flight leases finish against the removed slot
    pub fn deregister(&self, id: &str) -> bool {
        let removed = self.write_slots().remove(id).is_some();
        if removed {
            info!(%id, "Deregistered agent");
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read_slots().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.read_slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time view of all agents, sorted by id
    pub fn snapshot(&self) -> Vec<AgentDescriptor> {
        let mut descriptors: Vec<_> = self.read_slots().values().map(|slot| slot.snapshot()).collect();
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        descriptors
    }

    pub fn descriptor(&self, id: &str) -> Option<AgentDescriptor> {
        self.slot(id).map(|slot| slot.snapshot())
    }

    pub fn handle(&self, id: &str) -> Option<Arc<dyn Agent>> {
        self.slot(id).map(|slot| slot.agent.clone())
    }

    /// Reserve one unit of capacity on `id`
    ///
    /// Returns `None` when the agent is unknown, unreachable, or already at
    /// `max_concurrency`.
    pub fn try_acquire(self: &Arc<Self>, id: &str) -> Option<AgentLease> {
        let slot = self.slot(id)?;
        if slot.unreachable.load(Ordering::Acquire) {
            debug!(%id, "AgentPool::try_acquire: agent unreachable");
            return None;
        }
        let max = slot.descriptor.max_concurrency.max(1);
        let acquired = slot
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| if n < max { Some(n + 1) } else { None })
            .is_ok();
        if !acquired {
            debug!(%id, max, "AgentPool::try_acquire: at capacity");
            return None;
        }
        Some(AgentLease::new(self.clone(), slot.descriptor.clone(), slot.agent.clone()))
    }

    /// Return capacity reserved by `try_acquire` without recording a call
    pub fn release(&self, id: &str) {
        if let Some(slot) = self.slot(id) {
            slot.release();
        }
    }

    /// Record a finished call: decrement load, update latency and health
    pub fn record_execution(&self, id: &str, outcome: &Outcome, duration: Duration) {
        debug!(%id, kind = outcome.kind(), ?duration, "AgentPool::record_execution: called");
        let Some(slot) = self.slot(id) else {
            debug!(%id, "AgentPool::record_execution: agent no longer registered");
            return;
        };

        slot.release();
        slot.total_calls.fetch_add(1, Ordering::Relaxed);
        slot.observe_latency(duration);

        match outcome {
            Outcome::FatalFailure { unreachable: true, reason } => {
                let failures = slot.consecutive_unreachable.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.unreachable_after && !slot.unreachable.swap(true, Ordering::AcqRel) {
                    warn!(%id, failures, %reason, "Agent marked unreachable");
                    self.emit_health(id, AgentHealth::Unreachable);
                }
            }
            _ => {
                slot.consecutive_unreachable.store(0, Ordering::Release);
            }
        }
    }

    /// Force an agent's reachability, e.g. after a health probe
    pub fn set_reachable(&self, id: &str, reachable: bool) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let was_unreachable = slot.unreachable.swap(!reachable, Ordering::AcqRel);
        if reachable {
            slot.consecutive_unreachable.store(0, Ordering::Release);
        }
        if was_unreachable == reachable {
            let health = if reachable {
                AgentHealth::Available
            } else {
                AgentHealth::Unreachable
            };
            info!(%id, %health, "Agent health changed");
            self.emit_health(id, health);
        }
        true
    }

    /// Probe every registered agent once and mark the silent ones unreachable
    ///
    /// Returns the ids marked unreachable. Run before the first dispatch so a
    /// dead backend is not discovered through real calls.
    pub async fn probe_all(&self) -> Vec<String> {
        let slots: Vec<(String, Arc<AgentSlot>)> = self
            .read_slots()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        debug!(count = slots.len(), "AgentPool::probe_all: probing");

        let results = join_all(slots.iter().map(|(_, slot)| slot.agent.health_check())).await;
        let mut unreachable: Vec<String> = slots
            .into_iter()
            .zip(results)
            .filter(|(_, healthy)| !healthy)
            .map(|((id, _), _)| id)
            .collect();
        unreachable.sort();
        for id in &unreachable {
            warn!(%id, "Agent failed startup health check");
            self.set_reachable(id, false);
        }
        unreachable
    }

    /// Probe every unreachable agent and restore the ones that answer
    ///
    /// Returns the ids restored.
    pub async fn run_health_checks(&self) -> Vec<String> {
        let candidates: Vec<(String, Arc<AgentSlot>)> = self
            .read_slots()
            .iter()
            .filter(|(_, slot)| slot.unreachable.load(Ordering::Acquire))
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        debug!(count = candidates.len(), "AgentPool::run_health_checks: probing");

        let mut restored = Vec::new();
        for (id, slot) in candidates {
            if slot.agent.health_check().await {
                self.set_reachable(&id, true);
                restored.push(id);
            }
        }
        restored
    }

    pub fn stats(&self) -> PoolStats {
        let snapshot = self.snapshot();
        let mut stats = PoolStats {
            total: snapshot.len(),
            ..Default::default()
        };
        for descriptor in &snapshot {
            match descriptor.health {
                AgentHealth::Available => stats.available += 1,
                AgentHealth::Busy => stats.busy += 1,
                AgentHealth::Unreachable => stats.unreachable += 1,
            }
            stats.capabilities.extend(descriptor.capability_tags.iter().cloned());
        }
        stats.total_calls = self
            .read_slots()
            .values()
            .map(|slot| slot.total_calls.load(Ordering::Relaxed))
            .sum();
        stats
    }

    fn emit_health(&self, id: &str, health: AgentHealth) {
        if let Some(bus) = &self.event_bus {
            bus.emit(QueueEvent::AgentHealthChanged {
                agent_id: id.to_string(),
                health,
                timestamp: now_ms(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentResponse, ExecutionContext};
    use async_trait::async_trait;

    struct StubAgent {
        descriptor: AgentDescriptor,
        healthy: AtomicBool,
    }

    impl StubAgent {
        fn new(id: &str, max: u32) -> Arc<Self> {
            Arc::new(Self {
                descriptor: AgentDescriptor::new(id, "stub")
                    .with_capabilities(["testing"])
                    .with_max_concurrency(max),
                healthy: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Agent for StubAgent {
        fn descriptor(&self) -> AgentDescriptor {
            self.descriptor.clone()
        }

        async fn execute(&self, _content: &str, _ctx: &ExecutionContext, _timeout: Duration) -> AgentResponse {
            Outcome::Success("ok".to_string()).into()
        }

        async fn health_check(&self) -> bool {
            self.healthy.load(Ordering::SeqCst)
        }
    }

    fn pool_with(agents: &[(&str, u32)]) -> Arc<AgentPool> {
        let pool = Arc::new(AgentPool::new(2));
        for (id, max) in agents {
            pool.register_agent(StubAgent::new(id, *max));
        }
        pool
    }

    #[test]
    fn test_register_snapshot_deregister() {
        let pool = pool_with(&[("b", 1), ("a", 1)]);
        let ids: Vec<_> = pool.snapshot().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(pool.deregister("a"));
        assert!(!pool.deregister("a"));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_acquire_respects_max_concurrency() {
        let pool = pool_with(&[("a", 2)]);
        let first = pool.try_acquire("a").unwrap();
        assert_eq!(pool.descriptor("a").unwrap().current_load, 0.5);
        assert_eq!(pool.descriptor("a").unwrap().health, AgentHealth::Busy);

        let _second = pool.try_acquire("a").unwrap();
        assert_eq!(pool.descriptor("a").unwrap().current_load, 1.0);
        assert!(pool.try_acquire("a").is_none());

        drop(first);
        assert_eq!(pool.descriptor("a").unwrap().current_load, 0.5);
        assert!(pool.try_acquire("a").is_some());
    }

    #[test]
    fn test_acquire_unknown_agent() {
        let pool = pool_with(&[]);
        assert!(pool.try_acquire("ghost").is_none());
    }

    #[test]
    fn test_record_execution_decrements_and_tracks_latency() {
        let pool = pool_with(&[("a", 1)]);
        let lease = pool.try_acquire("a").unwrap();
        lease.complete(&Outcome::Success("x".into()), Duration::from_millis(100));

        let d = pool.descriptor("a").unwrap();
        assert_eq!(d.current_load, 0.0);
        assert_eq!(d.health, AgentHealth::Available);
        assert_eq!(d.avg_latency_ms, Some(100));

        let lease = pool.try_acquire("a").unwrap();
        lease.complete(&Outcome::Success("x".into()), Duration::from_millis(200));
        assert_eq!(pool.descriptor("a").unwrap().avg_latency_ms, Some(130));
        assert_eq!(pool.stats().total_calls, 2);
    }

    #[test]
    fn test_unreachable_after_consecutive_failures() {
        let pool = pool_with(&[("a", 1)]);
        let gone = Outcome::unreachable("no binary");

        pool.try_acquire("a").unwrap().complete(&gone, Duration::ZERO);
        assert_eq!(pool.descriptor("a").unwrap().health, AgentHealth::Available);

        pool.try_acquire("a").unwrap().complete(&gone, Duration::ZERO);
        assert_eq!(pool.descriptor("a").unwrap().health, AgentHealth::Unreachable);
        assert!(pool.try_acquire("a").is_none());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let pool = pool_with(&[("a", 1)]);
        let gone = Outcome::unreachable("timeout connecting");
        pool.try_acquire("a").unwrap().complete(&gone, Duration::ZERO);
        pool.try_acquire("a").unwrap().complete(&Outcome::Success("ok".into()), Duration::ZERO);
        pool.try_acquire("a").unwrap().complete(&gone, Duration::ZERO);
        assert_eq!(pool.descriptor("a").unwrap().health, AgentHealth::Available);
    }

    #[test]
    fn test_plain_fatal_does_not_mark_unreachable() {
        let pool = pool_with(&[("a", 1)]);
        for _ in 0..5 {
            pool.try_acquire("a")
                .unwrap()
                .complete(&Outcome::fatal("bad request"), Duration::ZERO);
        }
        assert_eq!(pool.descriptor("a").unwrap().health, AgentHealth::Available);
    }

    #[tokio::test]
    async fn test_health_check_restores_agent() {
        let pool = Arc::new(AgentPool::new(1));
        let agent = StubAgent::new("a", 1);
        pool.register_agent(agent.clone());

        pool.try_acquire("a")
            .unwrap()
            .complete(&Outcome::unreachable("gone"), Duration::ZERO);
        assert!(pool.run_health_checks().await.is_empty());
        assert_eq!(pool.stats().unreachable, 1);

        agent.healthy.store(true, Ordering::SeqCst);
        assert_eq!(pool.run_health_checks().await, vec!["a".to_string()]);
        assert_eq!(pool.descriptor("a").unwrap().health, AgentHealth::Available);
    }

    #[tokio::test]
    async fn test_probe_all_marks_silent_agents() {
        let pool = Arc::new(AgentPool::new(3));
        let up = StubAgent::new("up", 1);
        up.healthy.store(true, Ordering::SeqCst);
        pool.register_agent(up);
        pool.register_agent(StubAgent::new("down", 1));

        assert_eq!(pool.probe_all().await, vec!["down".to_string()]);
        assert_eq!(pool.descriptor("down").unwrap().health, AgentHealth::Unreachable);
        assert_eq!(pool.descriptor("up").unwrap().health, AgentHealth::Available);
        assert!(pool.try_acquire("down").is_none());
    }

    #[tokio::test]
    async fn test_health_change_emits_event() {
        let bus = Arc::new(EventBus::new(8));
        let mut rx = bus.subscribe();
        let pool = Arc::new(AgentPool::new(1).with_event_bus(bus.clone()));
        pool.register_agent(StubAgent::new("a", 1));

        pool.try_acquire("a")
            .unwrap()
            .complete(&Outcome::unreachable("gone"), Duration::ZERO);
        match rx.recv().await.unwrap() {
            QueueEvent::AgentHealthChanged { agent_id, health, .. } => {
                assert_eq!(agent_id, "a");
                assert_eq!(health, AgentHealth::Unreachable);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_stats() {
        let pool = pool_with(&[("a", 1), ("b", 1)]);
        let _lease = pool.try_acquire("a").unwrap();
        let stats = pool.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.busy, 1);
        assert_eq!(stats.available, 1);
        assert!(stats.capabilities.contains("testing"));
    }
}
