//! Provider contract: where machines come from.
//!
//! A provider creates, destroys and lists compute instances for a
//! cluster. Implementations are selected by the `kind` of an inventory
//! entry; only the `local` kind is built in.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use fleet_core::{ClusterSpec, Inventory, MachineId, MachineInstance, MachineTemplate};

use crate::error::ProviderError;

/// Request for one new machine.
#[derive(Debug, Clone)]
pub struct MachineRequest {
    pub cluster: String,
    /// Name the machine must carry; becomes its machine id.
    pub machine_name: MachineId,
    pub template: MachineTemplate,
    pub queues: Vec<String>,
}

impl MachineRequest {
    /// Request a freshly named machine for a cluster.
    pub fn for_cluster(spec: &ClusterSpec) -> Self {
        Self {
            cluster: spec.name.clone(),
            machine_name: machine_name(&spec.name, &spec.machine.name),
            template: spec.machine.clone(),
            queues: spec.queue_names.clone(),
        }
    }
}

/// What a destroy call knows about its target.
///
/// A full instance when the registry still had it, the bare id when the
/// registry had already forgotten the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineHandle {
    Instance(MachineInstance),
    Id(MachineId),
}

impl MachineHandle {
    pub fn id(&self) -> &str {
        match self {
            MachineHandle::Instance(instance) => &instance.machine_id,
            MachineHandle::Id(id) => id,
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Inventory name of this provider.
    fn name(&self) -> &str;

    /// Provision a machine named `request.machine_name`.
    async fn create_machine(&self, request: &MachineRequest)
        -> Result<MachineInstance, ProviderError>;

    /// Tear a machine down. Destroying a machine that no longer exists
    /// succeeds.
    async fn destroy_machine(&self, machine: &MachineHandle) -> Result<(), ProviderError>;

    /// Machines this provider currently runs for a cluster.
    async fn list_machines(&self, cluster: &str) -> Result<Vec<MachineInstance>, ProviderError>;
}

/// Resolve the provider a cluster refers to.
///
/// Without an inventory the provider name doubles as its kind. The
/// `local` kind reads an optional `address` parameter.
pub fn provider_for(
    spec: &ClusterSpec,
    inventory: Option<&Inventory>,
) -> Result<Arc<dyn Provider>, ProviderError> {
    let config = inventory.and_then(|inv| inv.get_provider(&spec.provider));
    let kind = config
        .map(|config| config.kind.as_str())
        .unwrap_or(spec.provider.as_str());

    match kind {
        "local" => {
            let mut provider = LocalProvider::new(&spec.provider);
            if let Some(address) = config.and_then(|c| c.param_str("address")) {
                provider = provider.with_address(address);
            }
            Ok(Arc::new(provider))
        }
        other => Err(ProviderError::UnsupportedKind {
            name: spec.provider.clone(),
            kind: other.to_string(),
        }),
    }
}

/// Machine name: `{cluster}-{template}-{hash}`.
///
/// The hash mixes the current time with a process-wide counter so names
/// stay unique across concurrent creates within one tick.
pub fn machine_name(cluster: &str, template: &str) -> MachineId {
    static SEQ: AtomicU64 = AtomicU64::new(0);

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    cluster.hash(&mut hasher);
    template.hash(&mut hasher);
    epoch_nanos().hash(&mut hasher);
    SEQ.fetch_add(1, Ordering::Relaxed).hash(&mut hasher);
    format!("{cluster}-{template}-{:08x}", hasher.finish() as u32)
}

// ── Local provider ─────────────────────────────────────────────────

/// In-process provider that books machines on one host address,
/// loopback unless configured.
///
/// Useful for single-host setups (paired with `deploy_local`) and as the
/// default backend in tests.
pub struct LocalProvider {
    name: String,
    address: String,
    machines: Mutex<BTreeMap<MachineId, MachineInstance>>,
}

impl LocalProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            address: "127.0.0.1".to_string(),
            machines: Mutex::new(BTreeMap::new()),
        }
    }

    /// Book machines on `address` instead of loopback.
    pub fn with_address(mut self, address: &str) -> Self {
        self.address = address.to_string();
        self
    }

    /// Adopt an existing machine, as if created by an earlier run.
    pub async fn insert(&self, instance: MachineInstance) {
        self.machines
            .lock()
            .await
            .insert(instance.machine_id.clone(), instance);
    }

    pub async fn contains(&self, machine_id: &str) -> bool {
        self.machines.lock().await.contains_key(machine_id)
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_machine(
        &self,
        request: &MachineRequest,
    ) -> Result<MachineInstance, ProviderError> {
        let mut machines = self.machines.lock().await;
        if machines.contains_key(&request.machine_name) {
            return Err(ProviderError::Create(format!(
                "machine {} already exists",
                request.machine_name
            )));
        }

        let mut labels = request.template.labels.clone();
        labels.insert("template".to_string(), request.template.name.clone());
        let instance = MachineInstance {
            machine_id: request.machine_name.clone(),
            cluster: request.cluster.clone(),
            private_addrs: vec![self.address.clone()],
            public_addrs: vec![self.address.clone()],
            labels,
            created_at: epoch_secs(),
        };
        machines.insert(instance.machine_id.clone(), instance.clone());

        info!(
            provider = %self.name,
            machine_id = %instance.machine_id,
            cluster = %instance.cluster,
            "local machine created"
        );
        Ok(instance)
    }

    async fn destroy_machine(&self, machine: &MachineHandle) -> Result<(), ProviderError> {
        let removed = self.machines.lock().await.remove(machine.id());
        match removed {
            Some(_) => info!(provider = %self.name, machine_id = machine.id(), "local machine destroyed"),
            None => debug!(provider = %self.name, machine_id = machine.id(), "machine already gone"),
        }
        Ok(())
    }

    async fn list_machines(&self, cluster: &str) -> Result<Vec<MachineInstance>, ProviderError> {
        Ok(self
            .machines
            .lock()
            .await
            .values()
            .filter(|m| m.cluster == cluster)
            .cloned()
            .collect())
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn epoch_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}
