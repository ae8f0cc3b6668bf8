//! State builder: snapshots a cluster from the registry.

use std::collections::BTreeMap;

use fleet_core::{ClusterSpec, ClusterState, Strategy};
use fleetgrid_registry::{QueueInfo, Registry, RegistryError};
use tracing::debug;

use crate::error::{AutoscaleError, AutoscaleResult};

/// Build the current snapshot of a cluster.
///
/// Reads the live agent set, the depth of every queue named in the spec,
/// and per-agent idle time. Any registry failure aborts the tick with
/// `RegistryUnavailable`; the next tick retries from scratch.
pub fn build_state<R: Registry + ?Sized>(
    registry: &R,
    spec: &ClusterSpec,
) -> AutoscaleResult<ClusterState> {
    let unavailable = |source: RegistryError| AutoscaleError::RegistryUnavailable {
        cluster: spec.name.clone(),
        source,
    };

    let agents = registry.list_agents(&spec.name).map_err(unavailable)?;

    let queues: Vec<QueueInfo> = spec
        .queue_names
        .iter()
        .map(|name| registry.get_queue(name))
        .collect::<Result<_, _>>()
        .map_err(unavailable)?;
    let queue_depths: BTreeMap<String, u64> =
        queues.iter().map(|q| (q.name.clone(), q.length)).collect();

    let idle_seconds = registry
        .idle_seconds(&agents, &queues)
        .map_err(unavailable)?;

    for strategy in &spec.policy.strategies {
        if let Strategy::QueueDepth(s) = strategy
            && !queue_depths.contains_key(&s.queue_name)
        {
            return Err(AutoscaleError::MissingQueue {
                strategy: strategy.name().to_string(),
                queue: s.queue_name.clone(),
            });
        }
    }

    let state = ClusterState::new(agents, queue_depths, idle_seconds);
    debug!(
        cluster = %spec.name,
        agents = state.agent_count,
        queues = ?state.queue_depths,
        "cluster state built"
    );
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::time::Duration;

    use fleet_core::{
        AgentId, AgentNode, ClusterPolicy, MachineInstance, MachineTemplate, QueueDepthStrategy,
    };
    use fleetgrid_registry::{RegistryResult, RegistryStore};

    fn test_spec(queues: &[&str], strategies: Vec<Strategy>) -> ClusterSpec {
        ClusterSpec {
            name: "cpu".to_string(),
            provider: "local".to_string(),
            queue_names: queues.iter().map(|q| q.to_string()).collect(),
            machine: MachineTemplate {
                name: "small".to_string(),
                size: None,
                image: None,
                region: None,
                worker_procs: 1,
                docker_version: None,
                labels: BTreeMap::new(),
            },
            policy: ClusterPolicy {
                min_nodes: 0,
                max_nodes: 10,
                strategies,
            },
        }
    }

    fn test_agent(id: &str, cluster: &str) -> AgentNode {
        AgentNode {
            agent_id: id.to_string(),
            cluster: cluster.to_string(),
            machine_id: id.to_string(),
            queues: vec!["default".to_string()],
            registered_at: 0,
        }
    }

    /// A registry whose backend cannot be reached.
    struct Unreachable;

    fn down<T>() -> RegistryResult<T> {
        Err(RegistryError::Unavailable("connection refused".to_string()))
    }

    impl Registry for Unreachable {
        fn list_agents(&self, _: &str) -> RegistryResult<BTreeSet<AgentId>> {
            down()
        }
        fn get(&self, _: &str) -> RegistryResult<Option<AgentNode>> {
            down()
        }
        fn get_queue(&self, _: &str) -> RegistryResult<QueueInfo> {
            down()
        }
        fn idle_seconds(
            &self,
            _: &BTreeSet<AgentId>,
            _: &[QueueInfo],
        ) -> RegistryResult<BTreeMap<AgentId, u64>> {
            down()
        }
        fn register_machine(&self, _: &MachineInstance) -> RegistryResult<()> {
            down()
        }
        fn get_machine(&self, _: &str) -> RegistryResult<Option<MachineInstance>> {
            down()
        }
        fn list_machines(&self, _: &str) -> RegistryResult<Vec<MachineInstance>> {
            down()
        }
        fn register_agent(&self, _: &AgentNode) -> RegistryResult<bool> {
            down()
        }
        fn unregister(&self, _: &AgentNode) -> RegistryResult<bool> {
            down()
        }
        fn unregister_machine(&self, _: &str) -> RegistryResult<bool> {
            down()
        }
        fn stop_work(&self, _: &str) -> RegistryResult<u32> {
            down()
        }
        fn try_acquire_lease(&self, _: &str, _: &str, _: Duration) -> RegistryResult<bool> {
            down()
        }
        fn release_lease(&self, _: &str, _: &str) -> RegistryResult<bool> {
            down()
        }
    }

    #[test]
    fn builds_snapshot_from_registry() {
        let store = RegistryStore::open_in_memory().unwrap();
        store.register_agent(&test_agent("a1", "cpu")).unwrap();
        store.register_agent(&test_agent("a2", "cpu")).unwrap();
        store.register_agent(&test_agent("g1", "gpu")).unwrap();
        store
            .put_queue(&QueueInfo { name: "default".to_string(), length: 7 })
            .unwrap();

        let state = build_state(&store, &test_spec(&["default", "control"], vec![])).unwrap();

        assert_eq!(state.agent_count, 2);
        assert_eq!(state.agents.len(), 2);
        assert_eq!(state.queue_depths["default"], 7);
        assert_eq!(state.queue_depths["control"], 0);
        assert!(state.idle_seconds.contains_key("a1"));
        assert!(state.idle_seconds.contains_key("a2"));
    }

    #[test]
    fn unreachable_registry_aborts() {
        let result = build_state(&Unreachable, &test_spec(&["default"], vec![]));
        assert!(matches!(
            result,
            Err(AutoscaleError::RegistryUnavailable { cluster, .. }) if cluster == "cpu"
        ));
    }

    #[test]
    fn strategy_queue_must_be_in_snapshot() {
        let store = RegistryStore::open_in_memory().unwrap();
        let spec = test_spec(
            &["default"],
            vec![Strategy::QueueDepth(QueueDepthStrategy {
                queue_name: "gpu".to_string(),
                grow_threshold: 5,
                grow_by: 1,
                shrink_threshold: 0,
                shrink_by: 1,
            })],
        );

        let result = build_state(&store, &spec);
        assert!(matches!(
            result,
            Err(AutoscaleError::MissingQueue { queue, .. }) if queue == "gpu"
        ));
    }
}
