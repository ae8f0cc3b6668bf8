//! Test doubles for the provider and deployer contracts.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use fleet_core::{
    AgentNode, ClusterPolicy, ClusterSpec, IdleStrategy, MachineInstance, MachineTemplate,
    QueueDepthStrategy, Strategy,
};
use fleetgrid_registry::{Registry, RegistryStore};

use crate::deploy::{DeployOutcome, DeployRequest, Deployer};
use crate::error::{DeployError, ProviderError};
use crate::provider::{MachineHandle, MachineRequest, Provider};

#[derive(Default)]
pub struct FakeProvider {
    machines: Mutex<BTreeMap<String, MachineInstance>>,
    destroyed: Mutex<Vec<String>>,
    failing_creates: Mutex<u32>,
    failing_destroys: Mutex<BTreeSet<String>>,
    delay: Option<Duration>,
}

impl FakeProvider {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Fail the next `n` create calls.
    pub fn fail_creates(&self, n: u32) {
        *self.failing_creates.lock().unwrap() = n;
    }

    pub fn fail_destroy(&self, machine_id: &str) {
        self.failing_destroys
            .lock()
            .unwrap()
            .insert(machine_id.to_string());
    }

    pub fn machine_count(&self) -> usize {
        self.machines.lock().unwrap().len()
    }

    /// Ids passed to successful destroy calls, sorted.
    pub fn destroyed(&self) -> Vec<String> {
        let mut ids = self.destroyed.lock().unwrap().clone();
        ids.sort();
        ids
    }
}

#[async_trait]
impl Provider for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create_machine(
        &self,
        request: &MachineRequest,
    ) -> Result<MachineInstance, ProviderError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        {
            let mut failing = self.failing_creates.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(ProviderError::Create("quota exceeded".to_string()));
            }
        }
        let instance = MachineInstance {
            machine_id: request.machine_name.clone(),
            cluster: request.cluster.clone(),
            private_addrs: vec!["10.0.0.1".to_string()],
            public_addrs: vec![],
            labels: BTreeMap::new(),
            created_at: 0,
        };
        self.machines
            .lock()
            .unwrap()
            .insert(instance.machine_id.clone(), instance.clone());
        Ok(instance)
    }

    async fn destroy_machine(&self, machine: &MachineHandle) -> Result<(), ProviderError> {
        if self.failing_destroys.lock().unwrap().contains(machine.id()) {
            return Err(ProviderError::Destroy {
                machine: machine.id().to_string(),
                message: "api error".to_string(),
            });
        }
        self.machines.lock().unwrap().remove(machine.id());
        self.destroyed.lock().unwrap().push(machine.id().to_string());
        Ok(())
    }

    async fn list_machines(&self, cluster: &str) -> Result<Vec<MachineInstance>, ProviderError> {
        Ok(self
            .machines
            .lock()
            .unwrap()
            .values()
            .filter(|m| m.cluster == cluster)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct FakeDeployer {
    fail: bool,
    /// (machine id, deployed locally)
    calls: Mutex<Vec<(String, bool)>>,
}

impl FakeDeployer {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, bool)> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, request: &DeployRequest, local: bool) -> Result<DeployOutcome, DeployError> {
        self.calls
            .lock()
            .unwrap()
            .push((request.machine_id.clone(), local));
        if self.fail {
            return Err(DeployError::Failed {
                status: "exit status: 1".to_string(),
                stderr: "connection refused".to_string(),
            });
        }
        Ok(DeployOutcome::default())
    }
}

#[async_trait]
impl Deployer for FakeDeployer {
    async fn deploy_local(&self, request: &DeployRequest) -> Result<DeployOutcome, DeployError> {
        self.record(request, true)
    }

    async fn deploy_remote(&self, request: &DeployRequest) -> Result<DeployOutcome, DeployError> {
        self.record(request, false)
    }
}

fn template() -> MachineTemplate {
    MachineTemplate {
        name: "small".to_string(),
        size: None,
        image: None,
        region: None,
        worker_procs: 1,
        docker_version: None,
        labels: BTreeMap::new(),
    }
}

fn spec(min_nodes: u32, max_nodes: u32, strategies: Vec<Strategy>) -> ClusterSpec {
    ClusterSpec {
        name: "default".to_string(),
        provider: "fake".to_string(),
        queue_names: vec!["default".to_string()],
        machine: template(),
        policy: ClusterPolicy {
            min_nodes,
            max_nodes,
            strategies,
        },
    }
}

/// Grow by 2 at depth >= 5, shrink by 1 at depth <= 1.
pub fn queue_spec(min_nodes: u32, max_nodes: u32) -> ClusterSpec {
    spec(
        min_nodes,
        max_nodes,
        vec![Strategy::QueueDepth(QueueDepthStrategy {
            queue_name: "default".to_string(),
            grow_threshold: 5,
            grow_by: 2,
            shrink_threshold: 1,
            shrink_by: 1,
        })],
    )
}

pub fn idle_spec(min_nodes: u32, max_nodes: u32, idle_threshold: u64) -> ClusterSpec {
    spec(
        min_nodes,
        max_nodes,
        vec![Strategy::Idle(IdleStrategy { idle_threshold })],
    )
}

/// Register agents whose machine id equals their agent id.
pub fn seed_agents(registry: &RegistryStore, ids: &[&str]) {
    for id in ids {
        registry
            .register_agent(&AgentNode {
                agent_id: id.to_string(),
                cluster: "default".to_string(),
                machine_id: id.to_string(),
                queues: vec!["default".to_string()],
                registered_at: 0,
            })
            .unwrap();
    }
}
