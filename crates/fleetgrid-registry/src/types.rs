//! Registry record types that are not part of the shared domain model.

use serde::{Deserialize, Serialize};

pub use fleet_core::{AgentId, AgentNode, MachineId, MachineInstance};

/// A named backlog of pending work items.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    /// Number of pending items.
    pub length: u64,
}

/// Last time an agent finished a job from a queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentActivity {
    pub agent_id: AgentId,
    pub queue: String,
    /// Unix timestamp (seconds).
    pub last_job_at: u64,
}

/// A job currently being processed by an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkRecord {
    pub agent_id: AgentId,
    pub job_id: String,
    pub queue: String,
    pub started_at: u64,
}

/// Exclusive right to tick a cluster until `expires_at`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Lease {
    pub cluster: String,
    pub holder: String,
    /// Unix timestamp (seconds).
    pub expires_at: u64,
}

impl AgentActivity {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.agent_id, self.queue)
    }
}

impl WorkRecord {
    pub fn table_key(&self) -> String {
        format!("{}:{}", self.agent_id, self.job_id)
    }
}
