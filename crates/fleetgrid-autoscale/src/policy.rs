//! Policy engine: folds strategies over a snapshot, then clamps to bounds.
//!
//! Each rule returns a [`Transition`]: the new snapshot plus the explicit
//! list of changes it made. The engine concatenates the change lists so
//! the differencer can read removals directly instead of inferring them.

use serde::Serialize;
use tracing::{debug, warn};

use fleet_core::{
    AgentId, ClusterPolicy, ClusterState, IdleStrategy, QueueDepthStrategy, Strategy,
};

use crate::error::{AutoscaleError, AutoscaleResult};

/// One change made to a snapshot by a rule or by the clamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    /// Target raised; the agent set is untouched until the reconciler
    /// provisions new machines.
    Grow { queue: String, depth: u64, by: u32 },
    /// Target lowered by `by`; at most one concrete agent removed.
    Shrink {
        queue: String,
        depth: u64,
        by: u32,
        removed: Option<AgentId>,
    },
    /// Agent removed for exceeding the idle threshold.
    IdleRemoval { agent: AgentId, idle_seconds: u64 },
    /// Target forced into `[min_nodes, max_nodes]`.
    Clamp { from: u32, to: u32 },
}

impl Change {
    /// Concrete agent removed by this change, if any.
    pub fn removed_agent(&self) -> Option<&AgentId> {
        match self {
            Change::Shrink { removed, .. } => removed.as_ref(),
            Change::IdleRemoval { agent, .. } => Some(agent),
            Change::Grow { .. } | Change::Clamp { .. } => None,
        }
    }
}

/// Output of a single rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: ClusterState,
    pub changes: Vec<Change>,
}

/// A scaling rule evaluated once per tick.
pub trait ScalingRule {
    /// Name used for logging and error reporting.
    fn name(&self) -> &'static str;

    /// Produce the next snapshot. Never mutates `state`.
    fn apply(&self, state: &ClusterState) -> AutoscaleResult<Transition>;
}

impl ScalingRule for QueueDepthStrategy {
    fn name(&self) -> &'static str {
        "items"
    }

    fn apply(&self, state: &ClusterState) -> AutoscaleResult<Transition> {
        let depth = *state
            .queue_depths
            .get(&self.queue_name)
            .ok_or_else(|| AutoscaleError::MissingQueue {
                strategy: self.name().to_string(),
                queue: self.queue_name.clone(),
            })?;

        let mut next = state.clone();
        let mut changes = Vec::new();

        if depth >= self.grow_threshold {
            next.agent_count = next.agent_count.saturating_add(self.grow_by);
            changes.push(Change::Grow {
                queue: self.queue_name.clone(),
                depth,
                by: self.grow_by,
            });
        } else if depth <= self.shrink_threshold {
            if self.shrink_by > 1 {
                warn!(
                    queue = %self.queue_name,
                    shrink_by = self.shrink_by,
                    "shrink lowers the target by shrink_by but removes only one agent"
                );
            }
            next.agent_count = next.agent_count.saturating_sub(self.shrink_by);
            // Exactly one agent leaves the set: the most idle, ties by id.
            let removed = state.agents_by_idleness().first().map(|a| (*a).clone());
            if let Some(agent) = &removed {
                next.agents.remove(agent);
            }
            changes.push(Change::Shrink {
                queue: self.queue_name.clone(),
                depth,
                by: self.shrink_by,
                removed,
            });
        }

        Ok(Transition { state: next, changes })
    }
}

impl ScalingRule for IdleStrategy {
    fn name(&self) -> &'static str {
        "idle"
    }

    fn apply(&self, state: &ClusterState) -> AutoscaleResult<Transition> {
        let mut next = state.clone();
        let mut changes = Vec::new();

        for agent in &state.agents {
            let idle = state.idle_of(agent);
            if idle >= self.idle_threshold {
                next.agents.remove(agent);
                changes.push(Change::IdleRemoval {
                    agent: agent.clone(),
                    idle_seconds: idle,
                });
            }
        }
        next.agent_count = next.agents.len() as u32;

        Ok(Transition { state: next, changes })
    }
}

impl ScalingRule for Strategy {
    fn name(&self) -> &'static str {
        Strategy::name(self)
    }

    fn apply(&self, state: &ClusterState) -> AutoscaleResult<Transition> {
        match self {
            Strategy::QueueDepth(s) => s.apply(state),
            Strategy::Idle(s) => s.apply(state),
        }
    }
}

/// Force `agent_count` into `[min_nodes, max_nodes]`.
///
/// Only the scalar target moves; the agent set is never touched. When
/// `min_nodes > max_nodes` the floor wins.
pub fn clamp(state: &ClusterState, policy: &ClusterPolicy) -> Transition {
    let mut next = state.clone();
    if state.agent_count < policy.min_nodes {
        next.agent_count = policy.min_nodes;
    } else if state.agent_count > policy.max_nodes {
        next.agent_count = policy.max_nodes;
    }

    let changes = if next.agent_count != state.agent_count {
        vec![Change::Clamp {
            from: state.agent_count,
            to: next.agent_count,
        }]
    } else {
        Vec::new()
    };
    Transition { state: next, changes }
}

/// Desired snapshot and the changes that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub desired: ClusterState,
    pub changes: Vec<Change>,
}

impl Evaluation {
    /// Agents explicitly removed by a strategy, in change order.
    pub fn removed_agents(&self) -> impl Iterator<Item = &AgentId> {
        self.changes.iter().filter_map(Change::removed_agent)
    }
}

/// Fold the policy's strategies left-to-right, then clamp.
pub fn evaluate(state: &ClusterState, policy: &ClusterPolicy) -> AutoscaleResult<Evaluation> {
    let mut current = state.clone();
    let mut changes = Vec::new();

    for strategy in &policy.strategies {
        let transition = strategy.apply(&current)?;
        debug!(
            strategy = ScalingRule::name(strategy),
            agent_count = transition.state.agent_count,
            agents = transition.state.agents.len(),
            changes = transition.changes.len(),
            "strategy applied"
        );
        current = transition.state;
        changes.extend(transition.changes);
    }

    let clamped = clamp(&current, policy);
    if !clamped.changes.is_empty() {
        debug!(
            from = current.agent_count,
            to = clamped.state.agent_count,
            min = policy.min_nodes,
            max = policy.max_nodes,
            "bounds clamp applied"
        );
    }
    changes.extend(clamped.changes);

    Ok(Evaluation {
        desired: clamped.state,
        changes,
    })
}
