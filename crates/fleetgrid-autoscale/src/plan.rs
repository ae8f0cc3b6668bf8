//! One-call planning: snapshot in, action plan out.

use serde::Serialize;
use tracing::info;

use fleet_core::{ClusterDiff, ClusterSpec, ClusterState, ControlSettings};

use crate::diff::diff;
use crate::error::AutoscaleResult;
use crate::policy::{Change, evaluate};

/// Everything a tick decided, before any action is taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub original: ClusterState,
    pub desired: ClusterState,
    pub changes: Vec<Change>,
    pub diff: ClusterDiff,
}

/// Evaluate a cluster's policy over a snapshot and diff the result.
pub fn plan(
    original: ClusterState,
    spec: &ClusterSpec,
    settings: &ControlSettings,
) -> AutoscaleResult<Plan> {
    let evaluation = evaluate(&original, &spec.policy)?;
    let diff = diff(&original, &evaluation, &spec.policy, settings.ceiling_rule);

    info!(
        cluster = %spec.name,
        current = original.agent_count,
        desired = evaluation.desired.agent_count,
        to_create = diff.to_create,
        to_delete = diff.to_delete.len(),
        "plan computed"
    );

    Ok(Plan {
        original,
        desired: evaluation.desired,
        changes: evaluation.changes,
        diff,
    })
}
