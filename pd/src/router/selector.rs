//! Agent selection strategies

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, warn};

use super::capability::infer_capabilities;
use super::error::RouterError;
use crate::agent::{AgentDescriptor, AgentHealth};
use crate::domain::{Collaboration, PromptEntry, RoutingStrategy};
use crate::pool::AgentPool;

/// Outcome of a routing decision
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub agent: AgentDescriptor,
    pub strategy: RoutingStrategy,
    /// Human-readable reason for the decision
    pub reason: String,
    pub estimated_cost: f64,
    pub estimated_latency_ms: Option<u64>,
}

impl RouteDecision {
    fn new(agent: AgentDescriptor, strategy: RoutingStrategy, reason: String) -> Self {
        Self {
            estimated_cost: agent.estimated_cost_per_call,
            estimated_latency_ms: agent.avg_latency_ms,
            agent,
            strategy,
            reason,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent.id
    }

    pub fn backend(&self) -> &str {
        &self.agent.backend
    }
}

/// Selects agents for entries from pool snapshots
///
/// The router never mutates the pool; load and health flow back through
/// [`AgentPool::record_execution`].
pub struct Router {
    pool: Arc<AgentPool>,
    default_strategy: RoutingStrategy,
}

impl Router {
    pub fn new(pool: Arc<AgentPool>, default_strategy: RoutingStrategy) -> Self {
        debug!(%default_strategy, "Router::new: called");
        Self { pool, default_strategy }
    }

    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.pool
    }

    pub fn default_strategy(&self) -> RoutingStrategy {
        self.default_strategy
    }

    /// Per-entry override, else the router default
    pub fn strategy_for(&self, entry: &PromptEntry) -> RoutingStrategy {
        entry.strategy.unwrap_or(self.default_strategy)
    }

    /// Select one agent for `entry`
    pub fn select(&self, entry: &PromptEntry, strategy: RoutingStrategy) -> Result<RouteDecision, RouterError> {
        self.select_avoiding(entry, strategy, &HashMap::new())
    }

    /// Select one agent, preferring backends not in `throttled`
    ///
    /// An agent on a throttled backend is returned only when every capable
    /// agent is on a throttled backend. The caller then parks the entry. A
    /// capable agent on an open backend that is merely busy yields
    /// [`RouterError::AtCapacity`] instead.
    pub fn select_avoiding(
        &self,
        entry: &PromptEntry,
        strategy: RoutingStrategy,
        throttled: &HashMap<String, i64>,
    ) -> Result<RouteDecision, RouterError> {
        debug!(entry_id = %entry.id, %strategy, throttled = throttled.len(), "Router::select_avoiding: called");
        let (capable, basis) = self.candidates(entry, strategy)?;
        let (open, closed): (Vec<_>, Vec<_>) = rank(capable, strategy)
            .into_iter()
            .partition(|a| !throttled.contains_key(&a.backend));

        if !open.is_empty() {
            return match open.into_iter().find(|a| a.has_headroom()) {
                Some(agent) => {
                    let reason = format!("{} via {}", basis, strategy);
                    debug!(entry_id = %entry.id, agent = %agent.id, %reason, "Router::select_avoiding: selected");
                    Ok(RouteDecision::new(agent, strategy, reason))
                }
                None => Err(RouterError::AtCapacity {
                    entry_id: entry.id.clone(),
                }),
            };
        }

        match closed.into_iter().next() {
            Some(agent) => {
                let reason = format!("{} via {} (backend {} throttled)", basis, strategy, agent.backend);
                debug!(entry_id = %entry.id, agent = %agent.id, "Router::select_avoiding: only throttled agents left");
                Ok(RouteDecision::new(agent, strategy, reason))
            }
            None => Err(RouterError::AtCapacity {
                entry_id: entry.id.clone(),
            }),
        }
    }

    /// Select the members of a collaborative group
    ///
    /// Declared members keep the caller's order. Otherwise the top `size`
    /// agents by `strategy` are chosen. Agents on throttled backends are
    /// dropped unless every member would be throttled.
    pub fn select_group(
        &self,
        entry: &PromptEntry,
        strategy: RoutingStrategy,
        collaboration: &Collaboration,
        throttled: &HashMap<String, i64>,
    ) -> Result<Vec<RouteDecision>, RouterError> {
        debug!(
            entry_id = %entry.id,
            mode = %collaboration.mode,
            declared = collaboration.agents.len(),
            "Router::select_group: called"
        );

        let members = if collaboration.agents.is_empty() {
            let (capable, basis) = self.candidates(entry, strategy)?;
            let (open, closed): (Vec<_>, Vec<_>) = rank(capable, strategy)
                .into_iter()
                .partition(|a| !throttled.contains_key(&a.backend));
            let pick: Vec<_> = if open.is_empty() {
                closed
            } else {
                open.into_iter().filter(|a| a.has_headroom()).collect()
            };
            if pick.is_empty() {
                return Err(RouterError::AtCapacity {
                    entry_id: entry.id.clone(),
                });
            }
            pick.into_iter()
                .take(collaboration.size.max(1))
                .map(|agent| {
                    let reason = format!("group member, {} via {}", basis, strategy);
                    RouteDecision::new(agent, strategy, reason)
                })
                .collect::<Vec<_>>()
        } else {
            self.declared_members(entry, strategy, &collaboration.agents, throttled)?
        };

        debug!(entry_id = %entry.id, members = members.len(), "Router::select_group: selected");
        Ok(members)
    }

    fn declared_members(
        &self,
        entry: &PromptEntry,
        strategy: RoutingStrategy,
        declared: &[String],
        throttled: &HashMap<String, i64>,
    ) -> Result<Vec<RouteDecision>, RouterError> {
        let mut reachable = Vec::new();
        for id in declared {
            let agent = self
                .pool
                .descriptor(id)
                .ok_or_else(|| RouterError::UnknownAgent(id.clone()))?;
            if agent.health == AgentHealth::Unreachable {
                warn!(entry_id = %entry.id, agent = %id, "Router: declared group member unreachable, skipping");
                continue;
            }
            if agent.current_load >= 1.0 {
                return Err(RouterError::AtCapacity {
                    entry_id: entry.id.clone(),
                });
            }
            reachable.push(agent);
        }
        if reachable.is_empty() {
            return Err(RouterError::no_eligible(&entry.id, "all declared group members are unreachable"));
        }

        let any_open = reachable.iter().any(|a| !throttled.contains_key(&a.backend));
        Ok(reachable
            .into_iter()
            .filter(|a| !any_open || !throttled.contains_key(&a.backend))
            .map(|agent| RouteDecision::new(agent, strategy, "declared group member".to_string()))
            .collect())
    }

    /// Healthy, capability-matching agents, busy or not, plus a description
    /// of how they were filtered
    fn candidates(
        &self,
        entry: &PromptEntry,
        strategy: RoutingStrategy,
    ) -> Result<(Vec<AgentDescriptor>, String), RouterError> {
        let healthy: Vec<_> = self
            .pool
            .snapshot()
            .into_iter()
            .filter(|a| a.health != AgentHealth::Unreachable)
            .collect();
        if healthy.is_empty() {
            return Err(RouterError::no_eligible(&entry.id, "no healthy agents registered"));
        }

        let (capable, basis) = match &entry.required_capability {
            Some(tag) => {
                let capable: Vec<_> = healthy.into_iter().filter(|a| a.has_capability(tag)).collect();
                if capable.is_empty() {
                    return Err(RouterError::no_eligible(
                        &entry.id,
                        format!("no healthy agent advertises {}", tag),
                    ));
                }
                (capable, format!("requires {}", tag))
            }
            None if matches!(strategy, RoutingStrategy::Capability | RoutingStrategy::CostOptimized) => {
                let inferred = infer_capabilities(&entry.content);
                let capable = matching_any(&healthy, &inferred);
                if capable.is_empty() {
                    (healthy, "no capability match".to_string())
                } else {
                    let tags: Vec<_> = inferred.into_iter().collect();
                    (capable, format!("inferred {}", tags.join(",")))
                }
            }
            None => (healthy, "any healthy agent".to_string()),
        };

        Ok((capable, basis))
    }
}

fn matching_any(agents: &[AgentDescriptor], tags: &BTreeSet<String>) -> Vec<AgentDescriptor> {
    if tags.is_empty() {
        return Vec::new();
    }
    agents
        .iter()
        .filter(|a| tags.iter().any(|t| a.has_capability(t)))
        .cloned()
        .collect()
}

fn rank(mut agents: Vec<AgentDescriptor>, strategy: RoutingStrategy) -> Vec<AgentDescriptor> {
    agents.sort_by(|a, b| compare(a, b, strategy).then_with(|| a.id.cmp(&b.id)));
    agents
}

fn compare(a: &AgentDescriptor, b: &AgentDescriptor, strategy: RoutingStrategy) -> Ordering {
    let by_load = a.current_load.total_cmp(&b.current_load);
    let by_cost = a.estimated_cost_per_call.total_cmp(&b.estimated_cost_per_call);
    match strategy {
        RoutingStrategy::Capability => by_load.then(by_cost),
        RoutingStrategy::LoadBalanced => by_load,
        RoutingStrategy::CostOptimized => by_cost.then(by_load),
        // Unmeasured agents first so every agent gets a latency sample
        RoutingStrategy::SpeedOptimized => match (a.avg_latency_ms, b.avg_latency_ms) {
            (None, None) => by_load,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(&y).then(by_load),
        },
    }
}
