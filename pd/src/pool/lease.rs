//! Capacity reservation on one agent

use std::sync::Arc;
use std::time::Duration;

use super::registry::AgentPool;
use crate::agent::{Agent, AgentDescriptor, Outcome};

/// One unit of an agent's capacity, held for the length of a call
///
/// [`complete`](Self::complete) records the call in the pool. Dropping an
/// uncompleted lease (cancelled or timed-out future) only returns the
/// capacity.
pub struct AgentLease {
    pool: Arc<AgentPool>,
    descriptor: AgentDescriptor,
    agent: Arc<dyn Agent>,
    done: bool,
}

impl AgentLease {
    pub(super) fn new(pool: Arc<AgentPool>, descriptor: AgentDescriptor, agent: Arc<dyn Agent>) -> Self {
        Self {
            pool,
            descriptor,
            agent,
            done: false,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn backend(&self) -> &str {
        &self.descriptor.backend
    }

    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    /// Record the call and give the capacity back
    pub fn complete(mut self, outcome: &Outcome, duration: Duration) {
        self.done = true;
        self.pool.record_execution(&self.descriptor.id, outcome, duration);
    }
}

impl Drop for AgentLease {
    fn drop(&mut self) {
        if !self.done {
            self.pool.release(&self.descriptor.id);
        }
    }
}

impl std::fmt::Debug for AgentLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLease")
            .field("agent_id", &self.descriptor.id)
            .field("done", &self.done)
            .finish()
    }
}
