//! Per-tick outcome reporting.

use serde::Serialize;

use fleet_core::{AgentId, MachineId};
use fleetgrid_autoscale::Plan;

/// Result of one create, destroy, or orphan-sweep unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UnitOutcome {
    Created {
        machine_id: MachineId,
        agent_id: AgentId,
        /// The agent had registered itself before we did.
        already_registered: bool,
    },
    CreateFailed {
        /// Set when the machine exists but never became a live agent.
        machine_id: Option<MachineId>,
        error: String,
    },
    Destroyed {
        agent_id: AgentId,
        machine_id: MachineId,
        /// The registry no longer knew the agent; the id was passed to the
        /// provider as a machine id.
        drift: bool,
    },
    DestroyFailed {
        agent_id: AgentId,
        error: String,
    },
    OrphanDestroyed {
        machine_id: MachineId,
    },
    OrphanDestroyFailed {
        machine_id: MachineId,
        error: String,
    },
}

impl UnitOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            UnitOutcome::CreateFailed { .. }
                | UnitOutcome::DestroyFailed { .. }
                | UnitOutcome::OrphanDestroyFailed { .. }
        )
    }
}

/// What one tick of one cluster did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub cluster: String,
    /// Another holder owned the cluster lease; nothing was done.
    pub skipped: bool,
    pub plan: Option<Plan>,
    pub outcomes: Vec<UnitOutcome>,
    /// Set when listing machines for the orphan sweep failed.
    pub sweep_error: Option<String>,
}

impl TickReport {
    pub fn skipped(cluster: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            skipped: true,
            plan: None,
            outcomes: Vec::new(),
            sweep_error: None,
        }
    }

    pub fn created(&self) -> usize {
        self.count(|o| matches!(o, UnitOutcome::Created { .. }))
    }

    pub fn destroyed(&self) -> usize {
        self.count(|o| {
            matches!(
                o,
                UnitOutcome::Destroyed { .. } | UnitOutcome::OrphanDestroyed { .. }
            )
        })
    }

    pub fn failures(&self) -> usize {
        self.count(UnitOutcome::is_failure)
    }

    /// True when every unit succeeded and the sweep could run.
    pub fn is_success(&self) -> bool {
        self.failures() == 0 && self.sweep_error.is_none()
    }

    fn count(&self, pred: impl Fn(&UnitOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }
}
