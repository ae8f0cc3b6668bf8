//! The registry contract consumed by the control loop.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::error::RegistryResult;
use crate::types::*;

/// Authoritative store of live agents, machines, and queue depths.
///
/// Every tick re-reads the registry from scratch; nothing read here is
/// cached across ticks.
pub trait Registry: Send + Sync {
    /// Agent ids registered for a cluster.
    fn list_agents(&self, cluster: &str) -> RegistryResult<BTreeSet<AgentId>>;

    /// Look up an agent by id.
    fn get(&self, agent_id: &str) -> RegistryResult<Option<AgentNode>>;

    /// Queue handle with its current length. Unknown queues are empty.
    fn get_queue(&self, name: &str) -> RegistryResult<QueueInfo>;

    /// Seconds since each agent last processed a job from any of `queues`.
    fn idle_seconds(
        &self,
        agents: &BTreeSet<AgentId>,
        queues: &[QueueInfo],
    ) -> RegistryResult<BTreeMap<AgentId, u64>>;

    /// Insert or update a machine record.
    fn register_machine(&self, instance: &MachineInstance) -> RegistryResult<()>;

    fn get_machine(&self, machine_id: &str) -> RegistryResult<Option<MachineInstance>>;

    /// Machines registered for a cluster.
    fn list_machines(&self, cluster: &str) -> RegistryResult<Vec<MachineInstance>>;

    /// Register an agent unless one with the same id exists.
    ///
    /// Returns false when the agent was already registered.
    fn register_agent(&self, agent: &AgentNode) -> RegistryResult<bool>;

    /// Remove an agent. Returns true if it existed.
    fn unregister(&self, agent: &AgentNode) -> RegistryResult<bool>;

    /// Remove a machine record. Returns true if it existed.
    fn unregister_machine(&self, machine_id: &str) -> RegistryResult<bool>;

    /// Stop any in-flight work on an agent. Returns the number of jobs stopped.
    fn stop_work(&self, agent_id: &str) -> RegistryResult<u32>;

    /// Take the tick lease for a cluster.
    ///
    /// Succeeds when no lease exists, the existing lease expired, or
    /// `holder` already owns it.
    fn try_acquire_lease(&self, cluster: &str, holder: &str, ttl: Duration)
        -> RegistryResult<bool>;

    /// Drop the tick lease if `holder` owns it.
    fn release_lease(&self, cluster: &str, holder: &str) -> RegistryResult<bool>;
}
