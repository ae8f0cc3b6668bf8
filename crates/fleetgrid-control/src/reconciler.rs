//! Reconciler: executes a diff against the provider and the registry.
//!
//! Each create or destroy is an independent unit. Units run concurrently
//! up to the configured bound; the steps inside one unit run strictly in
//! order. A unit failure is recorded in its outcome and never stops the
//! other units.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};

use fleet_core::{AgentNode, ClusterDiff, ClusterSpec, ControlSettings, MachineInstance};
use fleetgrid_registry::Registry;

use crate::deploy::{DeployRequest, Deployer};
use crate::error::{DeployError, ProviderError, UnitError};
use crate::provider::{MachineHandle, MachineRequest, Provider};
use crate::report::UnitOutcome;

pub struct Reconciler<'a> {
    spec: &'a ClusterSpec,
    settings: &'a ControlSettings,
    registry: &'a dyn Registry,
    provider: &'a dyn Provider,
    deployer: &'a dyn Deployer,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        spec: &'a ClusterSpec,
        settings: &'a ControlSettings,
        registry: &'a dyn Registry,
        provider: &'a dyn Provider,
        deployer: &'a dyn Deployer,
    ) -> Self {
        Self {
            spec,
            settings,
            registry,
            provider,
            deployer,
        }
    }

    /// Run every unit of `diff`: creates first, then destroys.
    pub async fn reconcile(&self, diff: &ClusterDiff) -> Vec<UnitOutcome> {
        if diff.is_empty() {
            debug!(cluster = %self.spec.name, "nothing to reconcile");
            return Vec::new();
        }

        let limit = self.settings.concurrency();
        let mut outcomes: Vec<UnitOutcome> = stream::iter(0..diff.to_create)
            .map(|_| self.create_unit())
            .buffer_unordered(limit)
            .collect()
            .await;

        let destroyed: Vec<UnitOutcome> = stream::iter(diff.to_delete.iter().cloned())
            .map(|agent_id| async move { self.destroy_unit(&agent_id).await })
            .buffer_unordered(limit)
            .collect()
            .await;
        outcomes.extend(destroyed);
        outcomes
    }

    async fn create_unit(&self) -> UnitOutcome {
        match self.create_instance().await {
            Ok((instance, fresh)) => UnitOutcome::Created {
                agent_id: instance.machine_id.clone(),
                machine_id: instance.machine_id,
                already_registered: !fresh,
            },
            Err(e) => {
                warn!(cluster = %self.spec.name, error = %e, "create failed");
                UnitOutcome::CreateFailed {
                    machine_id: e.machine_id().cloned(),
                    error: e.to_string(),
                }
            }
        }
    }

    async fn destroy_unit(&self, agent_id: &str) -> UnitOutcome {
        match self.destroy_instance(agent_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(cluster = %self.spec.name, agent_id, error = %e, "destroy failed");
                UnitOutcome::DestroyFailed {
                    agent_id: agent_id.to_string(),
                    error: e.to_string(),
                }
            }
        }
    }

    /// Provision, deploy, and register one machine.
    ///
    /// The agent is registered under the machine id. Returns the instance
    /// and whether this call performed the agent registration.
    pub async fn create_instance(&self) -> Result<(MachineInstance, bool), UnitError> {
        let request = MachineRequest::for_cluster(self.spec);
        let instance = with_timeout(
            self.settings.call_timeout(),
            self.provider.create_machine(&request),
            ProviderError::Timeout,
        )
        .await?;
        info!(
            cluster = %self.spec.name,
            machine_id = %instance.machine_id,
            "machine created"
        );

        let address = instance
            .address(self.settings.use_public_address)
            .ok_or_else(|| UnitError::NoAddress(instance.machine_id.clone()))?;
        let deploy = DeployRequest::new(
            self.spec,
            &instance.machine_id,
            address,
            &self.settings.deploy,
        );
        let deployed = if self.settings.deploy_local {
            with_timeout(
                self.settings.call_timeout(),
                self.deployer.deploy_local(&deploy),
                DeployError::Timeout,
            )
            .await
        } else {
            with_timeout(
                self.settings.call_timeout(),
                self.deployer.deploy_remote(&deploy),
                DeployError::Timeout,
            )
            .await
        };
        deployed.map_err(|source| UnitError::Deploy {
            machine_id: instance.machine_id.clone(),
            source,
        })?;

        self.registry.register_machine(&instance)?;
        let agent = AgentNode {
            agent_id: instance.machine_id.clone(),
            cluster: self.spec.name.clone(),
            machine_id: instance.machine_id.clone(),
            queues: self.spec.queue_names.clone(),
            registered_at: epoch_secs(),
        };
        let fresh = self.registry.register_agent(&agent)?;
        if !fresh {
            debug!(agent_id = %agent.agent_id, "agent already registered");
        }

        info!(
            cluster = %self.spec.name,
            machine_id = %instance.machine_id,
            address,
            "agent deployed"
        );
        Ok((instance, fresh))
    }

    /// Stop, unregister, and destroy one agent's machine.
    ///
    /// An agent the registry no longer knows is still handed to the
    /// provider, its id taken as the machine id.
    pub async fn destroy_instance(&self, agent_id: &str) -> Result<UnitOutcome, UnitError> {
        let Some(agent) = self.registry.get(agent_id)? else {
            warn!(
                cluster = %self.spec.name,
                agent_id,
                "agent missing from registry, destroying by id"
            );
            if let Err(e) = self.registry.unregister_machine(agent_id) {
                warn!(agent_id, error = %e, "failed to drop machine record");
            }
            self.destroy_machine(MachineHandle::Id(agent_id.to_string()))
                .await?;
            return Ok(UnitOutcome::Destroyed {
                agent_id: agent_id.to_string(),
                machine_id: agent_id.to_string(),
                drift: true,
            });
        };

        let stopped = self.registry.stop_work(&agent.agent_id)?;
        if stopped > 0 {
            info!(agent_id = %agent.agent_id, jobs = stopped, "stopped in-flight work");
        }
        let handle = match self.registry.get_machine(&agent.machine_id)? {
            Some(instance) => MachineHandle::Instance(instance),
            None => MachineHandle::Id(agent.machine_id.clone()),
        };
        self.registry.unregister(&agent)?;
        self.registry.unregister_machine(&agent.machine_id)?;
        self.destroy_machine(handle).await?;

        info!(
            cluster = %self.spec.name,
            agent_id = %agent.agent_id,
            machine_id = %agent.machine_id,
            "agent destroyed"
        );
        Ok(UnitOutcome::Destroyed {
            agent_id: agent.agent_id,
            machine_id: agent.machine_id,
            drift: false,
        })
    }

    /// Destroy a machine no registered agent runs on.
    ///
    /// Its machine record, if any, is dropped once the provider confirms.
    pub async fn destroy_orphan(&self, instance: MachineInstance) -> UnitOutcome {
        let machine_id = instance.machine_id.clone();
        match self.destroy_machine(MachineHandle::Instance(instance)).await {
            Ok(()) => {
                if let Err(e) = self.registry.unregister_machine(&machine_id) {
                    warn!(machine_id = %machine_id, error = %e, "failed to drop machine record");
                }
                info!(cluster = %self.spec.name, machine_id = %machine_id, "orphan destroyed");
                UnitOutcome::OrphanDestroyed { machine_id }
            }
            Err(e) => {
                warn!(cluster = %self.spec.name, machine_id = %machine_id, error = %e, "orphan destroy failed");
                UnitOutcome::OrphanDestroyFailed {
                    machine_id,
                    error: e.to_string(),
                }
            }
        }
    }

    async fn destroy_machine(&self, handle: MachineHandle) -> Result<(), ProviderError> {
        with_timeout(
            self.settings.call_timeout(),
            self.provider.destroy_machine(&handle),
            ProviderError::Timeout,
        )
        .await
    }
}

/// Bound a provider or deployer call.
pub(crate) async fn with_timeout<T, E>(
    limit: Duration,
    call: impl Future<Output = Result<T, E>>,
    on_timeout: impl FnOnce(Duration) -> E,
) -> Result<T, E> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout(limit)),
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
