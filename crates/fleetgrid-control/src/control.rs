//! Cluster control: one tick, or a loop of them.

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use fleet_core::{ClusterSpec, ClusterState, ControlSettings, MachineInstance};
use fleetgrid_autoscale::{AutoscaleError, Plan, build_state, plan};
use fleetgrid_registry::Registry;

use crate::deploy::Deployer;
use crate::error::{ControlError, ControlResult, ProviderError};
use crate::provider::Provider;
use crate::reconciler::{Reconciler, with_timeout};
use crate::report::{TickReport, UnitOutcome};

/// Drives one cluster toward its policy.
pub struct ClusterControl {
    spec: ClusterSpec,
    settings: ControlSettings,
    registry: Arc<dyn Registry>,
    provider: Arc<dyn Provider>,
    deployer: Arc<dyn Deployer>,
    /// Lease holder identity of this process.
    holder: String,
}

impl ClusterControl {
    pub fn new(
        spec: ClusterSpec,
        settings: ControlSettings,
        registry: Arc<dyn Registry>,
        provider: Arc<dyn Provider>,
        deployer: Arc<dyn Deployer>,
    ) -> Self {
        Self {
            spec,
            settings,
            registry,
            provider,
            deployer,
            holder: default_holder(),
        }
    }

    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    pub fn spec(&self) -> &ClusterSpec {
        &self.spec
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Fresh snapshot of the cluster from the registry.
    pub fn build_state(&self) -> ControlResult<ClusterState> {
        Ok(build_state(self.registry.as_ref(), &self.spec)?)
    }

    /// Plan the next tick without acting on it.
    pub fn plan(&self) -> ControlResult<Plan> {
        let original = self.build_state()?;
        Ok(plan(original, &self.spec, &self.settings)?)
    }

    /// Run one reconciliation cycle.
    ///
    /// Skips the cycle when another holder owns the cluster lease. Fails
    /// only when no plan could be made; unit failures are reported.
    pub async fn tick(&self) -> ControlResult<TickReport> {
        let acquired = self
            .registry
            .try_acquire_lease(&self.spec.name, &self.holder, self.settings.lease_ttl())
            .map_err(|source| AutoscaleError::RegistryUnavailable {
                cluster: self.spec.name.clone(),
                source,
            })?;
        if !acquired {
            warn!(cluster = %self.spec.name, "cluster lease held elsewhere, skipping tick");
            return Ok(TickReport::skipped(&self.spec.name));
        }

        let result = tokio::select! {
            result = self.tick_locked() => result,
            lost = self.hold_lease() => Err(lost),
        };

        if let Err(e) = self.registry.release_lease(&self.spec.name, &self.holder) {
            warn!(cluster = %self.spec.name, error = %e, "failed to release cluster lease");
        }
        result
    }

    /// Renew the tick lease until it is lost.
    ///
    /// Never returns while renewals succeed. A renewal that errors is
    /// retried on the next beat; a lease taken by another holder ends the
    /// tick.
    async fn hold_lease(&self) -> ControlError {
        let ttl = self.settings.lease_ttl();
        let mut beat = tokio::time::interval(self.settings.lease_renew_interval());
        beat.tick().await;
        loop {
            beat.tick().await;
            match self.registry.try_acquire_lease(&self.spec.name, &self.holder, ttl) {
                Ok(true) => debug!(cluster = %self.spec.name, "cluster lease renewed"),
                Ok(false) => {
                    error!(cluster = %self.spec.name, "cluster lease lost mid-tick, aborting");
                    return ControlError::LeaseLost(self.spec.name.clone());
                }
                Err(e) => warn!(cluster = %self.spec.name, error = %e, "lease renewal failed"),
            }
        }
    }

    async fn tick_locked(&self) -> ControlResult<TickReport> {
        let plan = self.plan()?;
        let reconciler = self.reconciler();
        let mut outcomes = reconciler.reconcile(&plan.diff).await;

        let mut sweep_error = None;
        if self.settings.orphan_sweep {
            match self.sweep_orphans().await {
                Ok(swept) => outcomes.extend(swept),
                Err(e) => {
                    warn!(cluster = %self.spec.name, error = %e, "orphan sweep failed");
                    sweep_error = Some(e.to_string());
                }
            }
        }

        let report = TickReport {
            cluster: self.spec.name.clone(),
            skipped: false,
            plan: Some(plan),
            outcomes,
            sweep_error,
        };
        info!(
            cluster = %self.spec.name,
            created = report.created(),
            destroyed = report.destroyed(),
            failures = report.failures(),
            "tick finished"
        );
        Ok(report)
    }

    /// Destroy provider machines of this cluster that no registered agent
    /// runs on.
    ///
    /// Catches machines left behind by creates that failed after the
    /// provider call succeeded, whether or not their machine record was
    /// written.
    pub async fn sweep_orphans(&self) -> ControlResult<Vec<UnitOutcome>> {
        let machines = with_timeout(
            self.settings.call_timeout(),
            self.provider.list_machines(&self.spec.name),
            ProviderError::Timeout,
        )
        .await?;

        let mut in_use = BTreeSet::new();
        for agent_id in self.registry.list_agents(&self.spec.name)? {
            if let Some(agent) = self.registry.get(&agent_id)? {
                in_use.insert(agent.machine_id);
            }
        }
        let orphans: Vec<MachineInstance> = machines
            .into_iter()
            .filter(|m| !in_use.contains(&m.machine_id))
            .collect();
        if orphans.is_empty() {
            return Ok(Vec::new());
        }
        debug!(cluster = %self.spec.name, count = orphans.len(), "sweeping orphan machines");

        let reconciler = self.reconciler();
        Ok(stream::iter(orphans)
            .map(|machine| reconciler.destroy_orphan(machine))
            .buffer_unordered(self.settings.concurrency())
            .collect()
            .await)
    }

    /// Tick every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            cluster = %self.spec.name,
            interval_secs = interval.as_secs(),
            "cluster control started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.tick().await {
                        Ok(report) if !report.is_success() => {
                            warn!(
                                cluster = %self.spec.name,
                                failures = report.failures(),
                                "tick finished with failures"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            error!(cluster = %self.spec.name, error = %e, "tick aborted");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!(cluster = %self.spec.name, "cluster control shutting down");
                    break;
                }
            }
        }
    }

    fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(
            &self.spec,
            &self.settings,
            self.registry.as_ref(),
            self.provider.as_ref(),
            self.deployer.as_ref(),
        )
    }
}

/// `fleetd-{pid}-{hash}`, unique per process.
fn default_holder() -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    std::process::id().hash(&mut hasher);
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    format!("fleetd-{}-{:08x}", std::process::id(), hasher.finish() as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use std::collections::BTreeMap;

    use fleet_core::{AgentId, AgentNode};
    use fleetgrid_registry::{
        QueueInfo, RegistryError, RegistryResult, RegistryStore, WorkRecord,
    };

    /// Registry whose agent registrations always fail.
    struct RejectingAgents(RegistryStore);

    impl Registry for RejectingAgents {
        fn list_agents(&self, cluster: &str) -> RegistryResult<BTreeSet<AgentId>> {
            self.0.list_agents(cluster)
        }
        fn get(&self, agent_id: &str) -> RegistryResult<Option<AgentNode>> {
            self.0.get(agent_id)
        }
        fn get_queue(&self, name: &str) -> RegistryResult<QueueInfo> {
            self.0.get_queue(name)
        }
        fn idle_seconds(
            &self,
            agents: &BTreeSet<AgentId>,
            queues: &[QueueInfo],
        ) -> RegistryResult<BTreeMap<AgentId, u64>> {
            self.0.idle_seconds(agents, queues)
        }
        fn register_machine(&self, instance: &MachineInstance) -> RegistryResult<()> {
            self.0.register_machine(instance)
        }
        fn get_machine(&self, machine_id: &str) -> RegistryResult<Option<MachineInstance>> {
            self.0.get_machine(machine_id)
        }
        fn list_machines(&self, cluster: &str) -> RegistryResult<Vec<MachineInstance>> {
            self.0.list_machines(cluster)
        }
        fn register_agent(&self, _agent: &AgentNode) -> RegistryResult<bool> {
            Err(RegistryError::Write("disk full".to_string()))
        }
        fn unregister(&self, agent: &AgentNode) -> RegistryResult<bool> {
            self.0.unregister(agent)
        }
        fn unregister_machine(&self, machine_id: &str) -> RegistryResult<bool> {
            self.0.unregister_machine(machine_id)
        }
        fn stop_work(&self, agent_id: &str) -> RegistryResult<u32> {
            self.0.stop_work(agent_id)
        }
        fn try_acquire_lease(
            &self,
            cluster: &str,
            holder: &str,
            ttl: Duration,
        ) -> RegistryResult<bool> {
            self.0.try_acquire_lease(cluster, holder, ttl)
        }
        fn release_lease(&self, cluster: &str, holder: &str) -> RegistryResult<bool> {
            self.0.release_lease(cluster, holder)
        }
    }

    fn control(
        spec: ClusterSpec,
        settings: ControlSettings,
        registry: &RegistryStore,
        provider: &Arc<FakeProvider>,
        deployer: &Arc<FakeDeployer>,
    ) -> ClusterControl {
        ClusterControl::new(
            spec,
            settings,
            Arc::new(registry.clone()),
            provider.clone(),
            deployer.clone(),
        )
        .with_holder("test")
    }

    #[tokio::test]
    async fn tick_grows_cluster_and_registers_agents() {
        let registry = RegistryStore::open_in_memory().unwrap();
        seed_agents(&registry, &["a1", "a2", "a3"]);
        registry.put_queue(&QueueInfo { name: "default".to_string(), length: 10 }).unwrap();
        let provider = Arc::new(FakeProvider::default());
        let deployer = Arc::new(FakeDeployer::default());
        let ctl = control(queue_spec(1, 10), ControlSettings::default(), &registry, &provider, &deployer);

        let report = ctl.tick().await.unwrap();

        assert!(report.is_success());
        assert_eq!(report.created(), 2);
        assert_eq!(registry.list_agents("default").unwrap().len(), 5);
        assert_eq!(registry.list_machines("default").unwrap().len(), 2);
        assert_eq!(provider.machine_count(), 2);
        let calls = deployer.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls.iter().all(|(_, local)| !local));
    }

    #[tokio::test]
    async fn second_tick_is_idempotent() {
        let registry = RegistryStore::open_in_memory().unwrap();
        seed_agents(&registry, &["a1", "a2", "a3"]);
        registry.put_queue(&QueueInfo { name: "default".to_string(), length: 10 }).unwrap();
        let provider = Arc::new(FakeProvider::default());
        let deployer = Arc::new(FakeDeployer::default());
        let ctl = control(queue_spec(1, 10), ControlSettings::default(), &registry, &provider, &deployer);

        ctl.tick().await.unwrap();
        registry.put_queue(&QueueInfo { name: "default".to_string(), length: 3 }).unwrap();
        let report = ctl.tick().await.unwrap();

        assert!(report.plan.as_ref().unwrap().diff.is_empty());
        assert!(report.outcomes.is_empty());
        assert_eq!(provider.machine_count(), 2);
    }

    #[tokio::test]
    async fn deploy_local_setting_selects_local_path() {
        let registry = RegistryStore::open_in_memory().unwrap();
        let provider = Arc::new(FakeProvider::default());
        let deployer = Arc::new(FakeDeployer::default());
        let settings = ControlSettings {
            deploy_local: true,
            ..ControlSettings::default()
        };
        let ctl = control(queue_spec(1, 3), settings, &registry, &provider, &deployer);

        let report = ctl.tick().await.unwrap();

        assert_eq!(report.created(), 1);
        assert_eq!(deployer.calls().len(), 1);
        assert!(deployer.calls()[0].1);
    }

    #[tokio::test]
    async fn failed_deploy_is_reported_and_swept() {
        let registry = RegistryStore::open_in_memory().unwrap();
        let provider = Arc::new(FakeProvider::default());
        let deployer = Arc::new(FakeDeployer::failing());
        let ctl = control(queue_spec(2, 3), ControlSettings::default(), &registry, &provider, &deployer);

        let report = ctl.tick().await.unwrap();

        let failed = report
            .outcomes
            .iter()
            .filter(|o| matches!(o, UnitOutcome::CreateFailed { machine_id: Some(_), .. }))
            .count();
        assert_eq!(failed, 2);
        let swept = report
            .outcomes
            .iter()
            .filter(|o| matches!(o, UnitOutcome::OrphanDestroyed { .. }))
            .count();
        assert_eq!(swept, 2);
        assert!(registry.list_agents("default").unwrap().is_empty());
        assert_eq!(provider.machine_count(), 0);
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn orphan_sweep_can_be_disabled() {
        let registry = RegistryStore::open_in_memory().unwrap();
        let provider = Arc::new(FakeProvider::default());
        let deployer = Arc::new(FakeDeployer::failing());
        let settings = ControlSettings {
            orphan_sweep: false,
            ..ControlSettings::default()
        };
        let ctl = control(queue_spec(1, 3), settings, &registry, &provider, &deployer);

        ctl.tick().await.unwrap();

        assert_eq!(provider.machine_count(), 1);
    }

    #[tokio::test]
    async fn provider_create_failure_leaves_no_machine() {
        let registry = RegistryStore::open_in_memory().unwrap();
        let provider = Arc::new(FakeProvider::default());
        provider.fail_creates(1);
        let deployer = Arc::new(FakeDeployer::default());
        let ctl = control(queue_spec(2, 3), ControlSettings::default(), &registry, &provider, &deployer);

        let report = ctl.tick().await.unwrap();

        assert_eq!(report.created(), 1);
        assert!(report.outcomes.iter().any(|o| matches!(
            o,
            UnitOutcome::CreateFailed { machine_id: None, .. }
        )));
        assert_eq!(registry.list_agents("default").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn idle_agents_are_stopped_unregistered_and_destroyed() {
        let registry = RegistryStore::open_in_memory().unwrap();
        seed_agents(&registry, &["a1", "a2"]);
        registry
            .put_work(&WorkRecord {
                agent_id: "a1".to_string(),
                job_id: "j1".to_string(),
                queue: "default".to_string(),
                started_at: 0,
            })
            .unwrap();
        let provider = Arc::new(FakeProvider::default());
        let deployer = Arc::new(FakeDeployer::default());
        let ctl = control(idle_spec(0, 5, 0), ControlSettings::default(), &registry, &provider, &deployer);

        let report = ctl.tick().await.unwrap();

        assert_eq!(report.destroyed(), 2);
        assert!(registry.list_agents("default").unwrap().is_empty());
        assert!(registry.get_machine("a1").unwrap().is_none());
        assert!(registry.list_work("a1").unwrap().is_empty());
        assert_eq!(provider.destroyed(), vec!["a1".to_string(), "a2".to_string()]);
    }

    #[tokio::test]
    async fn destroy_failure_does_not_block_other_units() {
        let registry = RegistryStore::open_in_memory().unwrap();
        seed_agents(&registry, &["a1", "a2"]);
        let provider = Arc::new(FakeProvider::default());
        provider.fail_destroy("a1");
        let deployer = Arc::new(FakeDeployer::default());
        let ctl = control(idle_spec(0, 5, 0), ControlSettings::default(), &registry, &provider, &deployer);

        let report = ctl.tick().await.unwrap();

        assert_eq!(report.failures(), 1);
        assert!(report.outcomes.iter().any(|o| matches!(
            o,
            UnitOutcome::DestroyFailed { agent_id, .. } if agent_id == "a1"
        )));
        assert_eq!(provider.destroyed(), vec!["a2".to_string()]);
    }

    #[tokio::test]
    async fn held_lease_skips_tick() {
        let registry = RegistryStore::open_in_memory().unwrap();
        registry
            .try_acquire_lease("default", "someone-else", Duration::from_secs(60))
            .unwrap();
        let provider = Arc::new(FakeProvider::default());
        let deployer = Arc::new(FakeDeployer::default());
        let ctl = control(queue_spec(2, 3), ControlSettings::default(), &registry, &provider, &deployer);

        let report = ctl.tick().await.unwrap();

        assert!(report.skipped);
        assert_eq!(provider.machine_count(), 0);
    }

    #[tokio::test]
    async fn lease_is_released_after_tick() {
        let registry = RegistryStore::open_in_memory().unwrap();
        let provider = Arc::new(FakeProvider::default());
        let deployer = Arc::new(FakeDeployer::default());
        let ctl = control(queue_spec(0, 3), ControlSettings::default(), &registry, &provider, &deployer);

        ctl.tick().await.unwrap();

        assert!(registry.get_lease("default").unwrap().is_none());
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let registry = RegistryStore::open_in_memory().unwrap();
        let provider = Arc::new(FakeProvider::with_delay(Duration::from_secs(5)));
        let deployer = Arc::new(FakeDeployer::default());
        let settings = ControlSettings {
            call_timeout_secs: 1,
            orphan_sweep: false,
            ..ControlSettings::default()
        };
        let ctl = control(queue_spec(1, 3), settings, &registry, &provider, &deployer);

        let report = ctl.tick().await.unwrap();

        assert_eq!(report.failures(), 1);
        match &report.outcomes[0] {
            UnitOutcome::CreateFailed { error, .. } => assert!(error.contains("timed out")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_agent_registration_leaves_no_machine() {
        let store = RegistryStore::open_in_memory().unwrap();
        let provider = Arc::new(FakeProvider::default());
        let deployer = Arc::new(FakeDeployer::default());
        let ctl = ClusterControl::new(
            queue_spec(1, 3),
            ControlSettings::default(),
            Arc::new(RejectingAgents(store.clone())),
            provider.clone(),
            deployer.clone(),
        )
        .with_holder("test");

        let report = ctl.tick().await.unwrap();

        assert_eq!(report.failures(), 1);
        assert_eq!(report.destroyed(), 1);
        assert_eq!(provider.machine_count(), 0);
        assert!(store.list_machines("default").unwrap().is_empty());
    }

    #[tokio::test]
    async fn lease_is_renewed_while_tick_runs() {
        let registry = RegistryStore::open_in_memory().unwrap();
        let provider = Arc::new(FakeProvider::with_delay(Duration::from_millis(3500)));
        let deployer = Arc::new(FakeDeployer::default());
        let settings = ControlSettings {
            lease_ttl_secs: 2,
            ..ControlSettings::default()
        };
        let first = control(queue_spec(2, 3), settings.clone(), &registry, &provider, &deployer)
            .with_holder("first");
        let second = control(queue_spec(2, 3), settings, &registry, &provider, &deployer)
            .with_holder("second");

        let running = tokio::spawn(async move { first.tick().await });
        tokio::time::sleep(Duration::from_millis(2500)).await;
        let contender = second.tick().await.unwrap();
        let report = running.await.unwrap().unwrap();

        assert!(contender.skipped);
        assert_eq!(report.created(), 2);
        assert_eq!(provider.machine_count(), 2);
        assert_eq!(registry.list_agents("default").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn lost_lease_aborts_tick() {
        let registry = RegistryStore::open_in_memory().unwrap();
        let provider = Arc::new(FakeProvider::with_delay(Duration::from_secs(3)));
        let deployer = Arc::new(FakeDeployer::default());
        let settings = ControlSettings {
            lease_ttl_secs: 1,
            ..ControlSettings::default()
        };
        let ctl = control(queue_spec(1, 3), settings, &registry, &provider, &deployer);

        let running = tokio::spawn(async move { ctl.tick().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        // A holder whose clock is far ahead sees the lease as expired.
        assert!(
            registry
                .try_acquire_lease_at("default", "other", Duration::from_secs(3600), u64::MAX / 2)
                .unwrap()
        );

        let result = running.await.unwrap();

        assert!(matches!(result, Err(ControlError::LeaseLost(cluster)) if cluster == "default"));
        assert_eq!(provider.machine_count(), 0);
    }

    #[tokio::test]
    async fn spawned_tick_destroys_idle_agents() {
        let registry = RegistryStore::open_in_memory().unwrap();
        seed_agents(&registry, &["a1", "a2"]);
        let provider = Arc::new(FakeProvider::default());
        let deployer = Arc::new(FakeDeployer::default());
        let ctl = control(idle_spec(0, 5, 0), ControlSettings::default(), &registry, &provider, &deployer);

        let report = tokio::spawn(async move { ctl.tick().await })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.destroyed(), 2);
        assert!(registry.list_agents("default").unwrap().is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let registry = RegistryStore::open_in_memory().unwrap();
        let provider = Arc::new(FakeProvider::default());
        let deployer = Arc::new(FakeDeployer::default());
        let ctl = control(queue_spec(0, 3), ControlSettings::default(), &registry, &provider, &deployer);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move { ctl.run(Duration::from_millis(10), rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
