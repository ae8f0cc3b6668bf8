//! Differencer: turns an evaluation into a concrete action plan.

use std::collections::BTreeSet;

use fleet_core::{AgentId, CeilingRule, ClusterDiff, ClusterPolicy, ClusterState};
use tracing::{debug, info};

use crate::policy::Evaluation;

/// Compare the original snapshot with an evaluation's desired snapshot.
///
/// - `to_delete` holds the agents strategies removed explicitly, restricted
///   to the original agent set. Clamp effects never add deletions.
/// - `to_create` is the positive growth of the target count.
/// - Floor correction: when fewer than `min_nodes` concrete agents remain,
///   `to_create` is overridden to make up the difference.
/// - With `CeilingRule::MostIdle`, concrete agents above `max_nodes` are
///   added to `to_delete`, most idle first. `CeilingRule::None` leaves the
///   ceiling unenforced on the agent set.
pub fn diff(
    original: &ClusterState,
    evaluation: &Evaluation,
    policy: &ClusterPolicy,
    ceiling: CeilingRule,
) -> ClusterDiff {
    let desired = &evaluation.desired;

    let mut to_delete: BTreeSet<AgentId> = evaluation
        .removed_agents()
        .filter(|agent| original.agents.contains(*agent))
        .cloned()
        .collect();

    let mut to_create = desired.agent_count.saturating_sub(original.agent_count);

    let remaining = desired.agents.len() as u32;
    if remaining < policy.min_nodes {
        let corrected = policy.min_nodes - remaining;
        if corrected != to_create {
            debug!(from = to_create, to = corrected, min = policy.min_nodes, "floor correction");
        }
        to_create = corrected;
    }

    if ceiling == CeilingRule::MostIdle
        && policy.min_nodes <= policy.max_nodes
        && remaining > policy.max_nodes
    {
        let excess = (remaining - policy.max_nodes) as usize;
        let victims: Vec<AgentId> = desired
            .agents_by_idleness()
            .into_iter()
            .filter(|agent| original.agents.contains(*agent))
            .take(excess)
            .cloned()
            .collect();
        info!(
            excess,
            max = policy.max_nodes,
            agents = ?victims,
            "ceiling rule selected agents for removal"
        );
        to_delete.extend(victims);
    }

    ClusterDiff {
        to_create,
        to_delete,
    }
}
