//! StateManager - actor owning the Entry Store
//!
//! Every successful state change is published on the [`EventBus`] by the
//! actor before the caller's reply is sent, so observers see transitions in
//! the order they were applied.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::messages::{StateCommand, StateError, StateResponse};
use crate::domain::{
    EntryDraft, EntryState, EntryUpdate, Filter, IdResolver, InvalidTransition, PromptEntry, QueueDefaults,
    RateLimitWindow, Store, now_ms,
};
use crate::events::{EventBus, QueueEvent};

/// Sequence name used for entry ids
const ENTRY_SEQUENCE: &str = "prompts";

/// Per-state entry counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub executing: usize,
    pub rate_limited: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
    /// Entries that reached `completed` or `failed`
    pub total_processed: usize,
}

impl QueueStats {
    fn count(&mut self, state: EntryState) {
        self.total += 1;
        match state {
            EntryState::Queued => self.queued += 1,
            EntryState::Executing => self.executing += 1,
            EntryState::RateLimited => self.rate_limited += 1,
            EntryState::Completed => self.completed += 1,
            EntryState::Failed => self.failed += 1,
            EntryState::Cancelled => self.cancelled += 1,
        }
        self.total_processed = self.completed + self.failed;
    }

    pub fn get(&self, state: EntryState) -> usize {
        match state {
            EntryState::Queued => self.queued,
            EntryState::Executing => self.executing,
            EntryState::RateLimited => self.rate_limited,
            EntryState::Completed => self.completed,
            EntryState::Failed => self.failed,
            EntryState::Cancelled => self.cancelled,
        }
    }
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "queued: {}, executing: {}, rate_limited: {}, completed: {}, failed: {}, cancelled: {}",
            self.queued, self.executing, self.rate_limited, self.completed, self.failed, self.cancelled
        )
    }
}

/// Raised inside a store transaction when `defer` targets a non-queued entry
#[derive(Debug, Error)]
#[error("only queued entries can be deferred, {id} is {state}")]
struct NotDeferrable {
    id: String,
    state: EntryState,
}

/// Handle to send commands to the StateManager
#[derive(Clone)]
pub struct StateManager {
    tx: mpsc::Sender<StateCommand>,
    event_bus: Arc<EventBus>,
}

impl StateManager {
    /// Spawn a StateManager over the store in `store_path`
    pub fn spawn(store_path: impl AsRef<Path>, defaults: QueueDefaults, event_bus: Arc<EventBus>) -> eyre::Result<Self> {
        debug!(store_path = %store_path.as_ref().display(), "StateManager::spawn: called");
        let mut store = Store::open(store_path.as_ref())?;

        let entry_count = store.rebuild_indexes::<PromptEntry>()?;
        let window_count = store.rebuild_indexes::<RateLimitWindow>()?;
        info!(entry_count, window_count, "Rebuilt indexes for PromptEntry and RateLimitWindow records");

        Ok(Self::start(store, defaults, event_bus))
    }

    /// Spawn a StateManager over a private in-memory store
    pub fn in_memory(defaults: QueueDefaults, event_bus: Arc<EventBus>) -> eyre::Result<Self> {
        debug!("StateManager::in_memory: called");
        Ok(Self::start(Store::open_in_memory()?, defaults, event_bus))
    }

    fn start(store: Store, defaults: QueueDefaults, event_bus: Arc<EventBus>) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(actor_loop(store, defaults, event_bus.clone(), rx));
        info!("StateManager spawned");
        Self { tx, event_bus }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Subscribe to state change events
    pub fn subscribe_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.event_bus.subscribe()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<StateResponse<T>>) -> StateCommand) -> StateResponse<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)?
    }

    /// Validate and persist a new entry in `queued`
    ///
    /// Returns the assigned id.
    pub async fn submit(&self, draft: EntryDraft) -> StateResponse<String> {
        self.submit_entry(draft).await.map(|entry| entry.id)
    }

    /// Like [`submit`](Self::submit) but returns the stored entry
    pub async fn submit_entry(&self, draft: EntryDraft) -> StateResponse<PromptEntry> {
        debug!(content_len = draft.content.len(), priority = ?draft.priority, "submit: called");
        self.request(|reply| StateCommand::Submit { draft, reply }).await
    }

    pub async fn get(&self, id: &str) -> StateResponse<Option<PromptEntry>> {
        debug!(%id, "get: called");
        let id = id.to_string();
        self.request(|reply| StateCommand::Get { id, reply }).await
    }

    /// Get an entry, failing with `NotFound` if it does not exist
    pub async fn get_required(&self, id: &str) -> StateResponse<PromptEntry> {
        self.get(id).await?.ok_or_else(|| StateError::NotFound(id.to_string()))
    }

    /// Entries in submission order, optionally restricted to one state
    pub async fn list(&self, state_filter: Option<EntryState>) -> StateResponse<Vec<PromptEntry>> {
        debug!(?state_filter, "list: called");
        self.request(|reply| StateCommand::List { state_filter, reply }).await
    }

    /// Dispatchable entries at `now`, best first
    pub async fn eligible(&self, now: i64) -> StateResponse<Vec<PromptEntry>> {
        debug!(now, "eligible: called");
        self.request(|reply| StateCommand::Eligible { now, reply }).await
    }

    /// Highest-priority, oldest queued entry that is eligible at `now`
    ///
    /// Backends are not known before routing, so throttling is re-checked by
    /// the scheduler after it routes the returned candidate.
    pub async fn next_eligible(&self, now: i64) -> StateResponse<Option<PromptEntry>> {
        Ok(self.eligible(now).await?.into_iter().next())
    }

    /// Apply a state transition atomically
    pub async fn transition(&self, id: &str, new_state: EntryState, update: EntryUpdate) -> StateResponse<PromptEntry> {
        debug!(%id, %new_state, "transition: called");
        let id = id.to_string();
        self.request(|reply| StateCommand::Transition {
            id,
            new_state,
            update,
            reply,
        })
        .await
    }

    /// Cancel a `queued` or `rate_limited` entry
    ///
    /// Fails with `InvalidTransition` for executing (no preemption) and
    /// terminal entries.
    pub async fn cancel(&self, id: &str) -> StateResponse<PromptEntry> {
        debug!(%id, "cancel: called");
        let id = id.to_string();
        self.request(|reply| StateCommand::Cancel { id, reply }).await
    }

    /// Push a queued entry's `eligible_at` forward without a state change
    pub async fn defer(&self, id: &str, until: i64) -> StateResponse<PromptEntry> {
        debug!(%id, until, "defer: called");
        let id = id.to_string();
        self.request(|reply| StateCommand::Defer { id, until, reply }).await
    }

    pub async fn stats(&self) -> StateResponse<QueueStats> {
        debug!("stats: called");
        self.request(|reply| StateCommand::Stats { reply }).await
    }

    /// Resolve a full id, sequence prefix, or slug fragment to one id
    pub async fn resolve_id(&self, reference: &str) -> StateResponse<String> {
        debug!(%reference, "resolve_id: called");
        let entries = self.list(None).await?;
        let ids = entries
            .into_iter()
            .map(|e| {
                let name = e.content.lines().next().unwrap_or_default().to_string();
                (e.id, name)
            })
            .collect();
        match IdResolver::new(&ids).resolve(reference) {
            Ok(Some(id)) => Ok(id),
            Ok(None) => Err(StateError::NotFound(reference.to_string())),
            Err(candidates) => Err(StateError::Validation(format!(
                "'{}' is ambiguous: {}",
                reference,
                candidates.join(", ")
            ))),
        }
    }

    // === Rate-limit windows ===

    pub async fn save_rate_limit(&self, window: RateLimitWindow) -> StateResponse<()> {
        debug!(backend_id = %window.backend_id, resume_at = window.resume_at, "save_rate_limit: called");
        self.request(|reply| StateCommand::SaveRateLimit { window, reply }).await
    }

    pub async fn list_rate_limits(&self) -> StateResponse<Vec<RateLimitWindow>> {
        debug!("list_rate_limits: called");
        self.request(|reply| StateCommand::ListRateLimits { reply }).await
    }

    pub async fn clear_rate_limit(&self, backend_id: &str) -> StateResponse<()> {
        debug!(%backend_id, "clear_rate_limit: called");
        let backend_id = backend_id.to_string();
        self.request(|reply| StateCommand::ClearRateLimit { backend_id, reply }).await
    }

    /// Stop the actor and wait until the store is closed
    pub async fn shutdown(&self) -> Result<(), StateError> {
        debug!("shutdown: called");
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(StateCommand::Shutdown { reply: reply_tx })
            .await
            .map_err(|_| StateError::ChannelError)?;
        reply_rx.await.map_err(|_| StateError::ChannelError)
    }
}

fn store_error(e: eyre::Report) -> StateError {
    match e.downcast::<InvalidTransition>() {
        Ok(invalid) => StateError::InvalidTransition(invalid),
        Err(e) => match e.downcast::<NotDeferrable>() {
            Ok(not_deferrable) => StateError::Validation(not_deferrable.to_string()),
            Err(e) => StateError::StoreError(e.to_string()),
        },
    }
}

struct Actor {
    store: Store,
    defaults: QueueDefaults,
    event_bus: Arc<EventBus>,
}

impl Actor {
    fn submit(&mut self, draft: EntryDraft) -> StateResponse<PromptEntry> {
        draft.validate(&self.defaults).map_err(StateError::Validation)?;
        let seq = self.store.next_sequence(ENTRY_SEQUENCE).map_err(store_error)?;
        let entry = PromptEntry::from_draft(seq, draft, &self.defaults);
        self.store.create(entry.clone()).map_err(store_error)?;
        info!(id = %entry.id, priority = entry.priority, "Entry submitted");
        self.event_bus.emit(QueueEvent::StateChanged {
            entry_id: entry.id.clone(),
            old_state: None,
            new_state: EntryState::Queued,
            timestamp: entry.created_at,
        });
        Ok(entry)
    }

    fn list(&self, state_filter: Option<EntryState>) -> StateResponse<Vec<PromptEntry>> {
        let filters: Vec<Filter> = state_filter
            .map(|state| Filter::eq("state", state.to_string()))
            .into_iter()
            .collect();
        let mut entries: Vec<PromptEntry> = self.store.list(&filters).map_err(store_error)?;
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }

    fn eligible(&self, now: i64) -> StateResponse<Vec<PromptEntry>> {
        let mut entries: Vec<PromptEntry> = self
            .list(Some(EntryState::Queued))?
            .into_iter()
            .filter(|e| e.is_eligible(now))
            .collect();
        entries.sort_by(|a, b| a.dispatch_order(b));
        Ok(entries)
    }

    fn transition(&mut self, id: &str, new_state: EntryState, update: EntryUpdate) -> StateResponse<PromptEntry> {
        let now = now_ms();
        let mut previous = None;
        let result = self.store.modify::<PromptEntry, _>(id, |entry| {
            previous = Some(entry.apply_transition(new_state, update, now)?);
            Ok(())
        });

        match (result.map_err(store_error)?, previous) {
            (Some(entry), Some(old_state)) => {
                info!(%id, %old_state, %new_state, "Entry transitioned");
                self.event_bus.emit(QueueEvent::StateChanged {
                    entry_id: entry.id.clone(),
                    old_state: Some(old_state),
                    new_state,
                    timestamp: now,
                });
                Ok(entry)
            }
            _ => Err(StateError::NotFound(id.to_string())),
        }
    }

    fn defer(&mut self, id: &str, until: i64) -> StateResponse<PromptEntry> {
        let now = now_ms();
        self.store
            .modify::<PromptEntry, _>(id, |entry| {
                if entry.state != EntryState::Queued {
                    return Err(NotDeferrable {
                        id: entry.id.clone(),
                        state: entry.state,
                    }
                    .into());
                }
                entry.eligible_at = entry.eligible_at.max(until);
                entry.updated_at = now;
                Ok(())
            })
            .map_err(store_error)?
            .ok_or_else(|| StateError::NotFound(id.to_string()))
    }

    fn stats(&self) -> StateResponse<QueueStats> {
        let mut stats = QueueStats::default();
        for entry in self.list(None)? {
            stats.count(entry.state);
        }
        Ok(stats)
    }

    fn handle(&mut self, cmd: StateCommand) {
        match cmd {
            StateCommand::Submit { draft, reply } => {
                debug!("actor_loop: Submit command");
                let _ = reply.send(self.submit(draft));
            }
            StateCommand::Get { id, reply } => {
                debug!(%id, "actor_loop: Get command");
                let _ = reply.send(self.store.get(&id).map_err(store_error));
            }
            StateCommand::List { state_filter, reply } => {
                debug!(?state_filter, "actor_loop: List command");
                let _ = reply.send(self.list(state_filter));
            }
            StateCommand::Eligible { now, reply } => {
                debug!(now, "actor_loop: Eligible command");
                let _ = reply.send(self.eligible(now));
            }
            StateCommand::Transition {
                id,
                new_state,
                update,
                reply,
            } => {
                debug!(%id, %new_state, "actor_loop: Transition command");
                let result = self.transition(&id, new_state, update);
                if let Err(e) = &result {
                    warn!(%id, %new_state, error = %e, "actor_loop: transition rejected");
                }
                let _ = reply.send(result);
            }
            StateCommand::Cancel { id, reply } => {
                debug!(%id, "actor_loop: Cancel command");
                let _ = reply.send(self.transition(&id, EntryState::Cancelled, EntryUpdate::new()));
            }
            StateCommand::Defer { id, until, reply } => {
                debug!(%id, until, "actor_loop: Defer command");
                let _ = reply.send(self.defer(&id, until));
            }
            StateCommand::Stats { reply } => {
                debug!("actor_loop: Stats command");
                let _ = reply.send(self.stats());
            }
            StateCommand::SaveRateLimit { window, reply } => {
                debug!(backend_id = %window.backend_id, "actor_loop: SaveRateLimit command");
                let _ = reply.send(self.store.upsert(window).map_err(store_error));
            }
            StateCommand::ListRateLimits { reply } => {
                debug!("actor_loop: ListRateLimits command");
                let _ = reply.send(self.store.list::<RateLimitWindow>(&[]).map_err(store_error));
            }
            StateCommand::ClearRateLimit { backend_id, reply } => {
                debug!(%backend_id, "actor_loop: ClearRateLimit command");
                let _ = reply.send(
                    self.store
                        .delete::<RateLimitWindow>(&backend_id)
                        .map_err(store_error),
                );
            }
            StateCommand::Shutdown { .. } => {}
        }
    }
}

/// The actor loop that owns the Store and processes commands
async fn actor_loop(store: Store, defaults: QueueDefaults, event_bus: Arc<EventBus>, mut rx: mpsc::Receiver<StateCommand>) {
    debug!("StateManager actor started");
    let mut actor = Actor {
        store,
        defaults,
        event_bus,
    };

    let mut shutdown_reply = None;
    while let Some(cmd) = rx.recv().await {
        if let StateCommand::Shutdown { reply } = cmd {
            info!("StateManager shutting down");
            shutdown_reply = Some(reply);
            break;
        }
        actor.handle(cmd);
    }

    drop(actor);
    if let Some(reply) = shutdown_reply {
        let _ = reply.send(());
    }
    debug!("StateManager actor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn bus() -> Arc<EventBus> {
        Arc::new(EventBus::new(64))
    }

    async fn manager() -> StateManager {
        StateManager::in_memory(QueueDefaults::default(), bus()).unwrap()
    }

    #[tokio::test]
    async fn test_submit_and_get() {
        let manager = manager().await;
        let id = manager
            .submit(EntryDraft::new("Write the docs").with_priority(5))
            .await
            .unwrap();
        assert!(id.starts_with("000001-"));

        let entry = manager.get_required(&id).await.unwrap();
        assert_eq!(entry.state, EntryState::Queued);
        assert_eq!(entry.priority, 5);
        assert_eq!(entry.max_retries, 3);
        assert_eq!(entry.retry_count, 0);
        assert!(entry.assigned_agent_id.is_none());
    }

    #[tokio::test]
    async fn test_submit_validation() {
        let manager = manager().await;
        assert!(matches!(
            manager.submit(EntryDraft::new("   ")).await,
            Err(StateError::Validation(_))
        ));
        assert!(matches!(
            manager.submit(EntryDraft::new("x").with_priority(101)).await,
            Err(StateError::Validation(_))
        ));
        assert!(manager.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_missing() {
        let manager = manager().await;
        assert!(manager.get("nope").await.unwrap().is_none());
        assert!(matches!(
            manager.get_required("nope").await,
            Err(StateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_eligible_order_priority_then_fifo() {
        let manager = manager().await;
        let a = manager.submit(EntryDraft::new("a")).await.unwrap();
        let b = manager.submit(EntryDraft::new("b")).await.unwrap();
        let high = manager.submit(EntryDraft::new("high").with_priority(10)).await.unwrap();
        let c = manager.submit(EntryDraft::new("c")).await.unwrap();

        let order: Vec<_> = manager
            .eligible(now_ms())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(order, vec![high.clone(), a, b, c]);
        assert_eq!(manager.next_eligible(now_ms()).await.unwrap().unwrap().id, high);
    }

    #[tokio::test]
    async fn test_transition_and_invalid_transition() {
        let manager = manager().await;
        let id = manager.submit(EntryDraft::new("task")).await.unwrap();

        let entry = manager
            .transition(&id, EntryState::Executing, EntryUpdate::new().agent("a1"))
            .await
            .unwrap();
        assert_eq!(entry.assigned_agent_id.as_deref(), Some("a1"));
        assert!(entry.started_at.is_some());

        let err = manager
            .transition(&id, EntryState::Cancelled, EntryUpdate::new())
            .await
            .unwrap_err();
        assert!(err.is_invalid_transition());

        manager
            .transition(&id, EntryState::Completed, EntryUpdate::new().result("done"))
            .await
            .unwrap();
        let err = manager
            .transition(&id, EntryState::Queued, EntryUpdate::new())
            .await
            .unwrap_err();
        assert!(err.is_invalid_transition());

        let entry = manager.get_required(&id).await.unwrap();
        assert_eq!(entry.state, EntryState::Completed);
        assert_eq!(entry.result.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_transition_missing_entry() {
        let manager = manager().await;
        assert!(matches!(
            manager
                .transition("ghost", EntryState::Executing, EntryUpdate::new())
                .await,
            Err(StateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_rules() {
        let manager = manager().await;
        let queued = manager.submit(EntryDraft::new("q")).await.unwrap();
        let executing = manager.submit(EntryDraft::new("e")).await.unwrap();
        manager
            .transition(&executing, EntryState::Executing, EntryUpdate::new())
            .await
            .unwrap();

        assert_eq!(manager.cancel(&queued).await.unwrap().state, EntryState::Cancelled);
        assert!(manager.cancel(&queued).await.unwrap_err().is_invalid_transition());

        let err = manager.cancel(&executing).await.unwrap_err();
        assert!(err.is_invalid_transition());
        assert_eq!(
            manager.get_required(&executing).await.unwrap().state,
            EntryState::Executing
        );
    }

    #[tokio::test]
    async fn test_cancel_rate_limited() {
        let manager = manager().await;
        let id = manager.submit(EntryDraft::new("r")).await.unwrap();
        manager
            .transition(&id, EntryState::Executing, EntryUpdate::new())
            .await
            .unwrap();
        manager
            .transition(&id, EntryState::RateLimited, EntryUpdate::new().resume_at(i64::MAX))
            .await
            .unwrap();
        assert_eq!(manager.cancel(&id).await.unwrap().state, EntryState::Cancelled);
    }

    #[tokio::test]
    async fn test_defer() {
        let manager = manager().await;
        let id = manager.submit(EntryDraft::new("later")).await.unwrap();
        let until = now_ms() + 60_000;
        let entry = manager.defer(&id, until).await.unwrap();
        assert_eq!(entry.eligible_at, until);
        assert_eq!(entry.state, EntryState::Queued);
        assert!(manager.next_eligible(now_ms()).await.unwrap().is_none());
        assert!(manager.next_eligible(until).await.unwrap().is_some());

        let executing = manager.submit(EntryDraft::new("busy")).await.unwrap();
        manager
            .transition(&executing, EntryState::Executing, EntryUpdate::new())
            .await
            .unwrap();
        assert!(matches!(
            manager.defer(&executing, until).await,
            Err(StateError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_events_published_in_order() {
        let bus = bus();
        let mut rx = bus.subscribe();
        let manager = StateManager::in_memory(QueueDefaults::default(), bus).unwrap();

        let id = manager.submit(EntryDraft::new("observe me")).await.unwrap();
        manager
            .transition(&id, EntryState::Executing, EntryUpdate::new())
            .await
            .unwrap();
        manager
            .transition(&id, EntryState::Completed, EntryUpdate::new())
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            match rx.recv().await.unwrap() {
                QueueEvent::StateChanged {
                    entry_id,
                    old_state,
                    new_state,
                    ..
                } => {
                    assert_eq!(entry_id, id);
                    seen.push((old_state, new_state));
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(
            seen,
            vec![
                (None, EntryState::Queued),
                (Some(EntryState::Queued), EntryState::Executing),
                (Some(EntryState::Executing), EntryState::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn test_stats() {
        let manager = manager().await;
        let a = manager.submit(EntryDraft::new("a")).await.unwrap();
        let b = manager.submit(EntryDraft::new("b")).await.unwrap();
        manager.submit(EntryDraft::new("c")).await.unwrap();
        manager.cancel(&a).await.unwrap();
        manager
            .transition(&b, EntryState::Executing, EntryUpdate::new())
            .await
            .unwrap();
        manager
            .transition(&b, EntryState::Failed, EntryUpdate::new())
            .await
            .unwrap();

        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total_processed, 1);
        assert_eq!(stats.get(EntryState::Queued), 1);
    }

    #[tokio::test]
    async fn test_list_filter() {
        let manager = manager().await;
        let a = manager.submit(EntryDraft::new("a")).await.unwrap();
        manager.submit(EntryDraft::new("b")).await.unwrap();
        manager.cancel(&a).await.unwrap();

        assert_eq!(manager.list(None).await.unwrap().len(), 2);
        let cancelled = manager.list(Some(EntryState::Cancelled)).await.unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].id, a);
    }

    #[tokio::test]
    async fn test_resolve_id() {
        let manager = manager().await;
        let login = manager.submit(EntryDraft::new("fix login bug")).await.unwrap();
        manager.submit(EntryDraft::new("fix logout bug")).await.unwrap();

        assert_eq!(manager.resolve_id("000001").await.unwrap(), login);
        assert_eq!(manager.resolve_id("login").await.unwrap(), login);
        assert!(matches!(
            manager.resolve_id("fix").await,
            Err(StateError::Validation(_))
        ));
        assert!(matches!(
            manager.resolve_id("nothing").await,
            Err(StateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rate_limit_windows() {
        let manager = manager().await;
        manager
            .save_rate_limit(RateLimitWindow::new("claude", 5_000))
            .await
            .unwrap();
        manager
            .save_rate_limit(RateLimitWindow::new("claude", 9_000))
            .await
            .unwrap();
        let windows = manager.list_rate_limits().await.unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].resume_at, 9_000);

        manager.clear_rate_limit("claude").await.unwrap();
        assert!(manager.list_rate_limits().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persistence_across_restart() {
        let temp = tempdir().unwrap();
        let id = {
            let manager = StateManager::spawn(temp.path(), QueueDefaults::default(), bus()).unwrap();
            let id = manager.submit(EntryDraft::new("survive")).await.unwrap();
            manager
                .save_rate_limit(RateLimitWindow::new("gemini", 42))
                .await
                .unwrap();
            manager.shutdown().await.unwrap();
            id
        };

        let manager = StateManager::spawn(temp.path(), QueueDefaults::default(), bus()).unwrap();
        let entry = manager.get_required(&id).await.unwrap();
        assert_eq!(entry.content, "survive");
        assert_eq!(manager.list_rate_limits().await.unwrap()[0].backend_id, "gemini");

        // sequence continues after restart
        let next = manager.submit(EntryDraft::new("next")).await.unwrap();
        assert!(next.starts_with("000002-"));
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_fail() {
        let manager = manager().await;
        manager.shutdown().await.unwrap();
        assert!(matches!(manager.stats().await, Err(StateError::ChannelError)));
    }
}
