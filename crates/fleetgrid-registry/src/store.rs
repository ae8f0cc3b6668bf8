//! RegistryStore: redb-backed registry for fleetgrid.
//!
//! Provides typed operations over agents, machines, queues, activity,
//! in-flight work, and tick leases. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{RegistryError, RegistryResult};
use crate::registry::Registry;
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `RegistryError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| RegistryError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe registry backed by redb.
#[derive(Clone)]
pub struct RegistryStore {
    db: Arc<Database>,
}

impl RegistryStore {
    /// Open (or create) a persistent registry at the given path.
    pub fn open(path: &Path) -> RegistryResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "registry opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory registry (for testing).
    pub fn open_in_memory() -> RegistryResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory registry opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> RegistryResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Unavailable))?;
        for table in [AGENTS, MACHINES, QUEUES, ACTIVITY, WORK, LEASES] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic record access ──────────────────────────────────────

    fn get_record<T: DeserializeOwned>(&self, table: Table, key: &str) -> RegistryResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Unavailable))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn put_record<T: Serialize>(&self, table: Table, key: &str, record: &T) -> RegistryResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Unavailable))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn remove_record(&self, table: Table, key: &str) -> RegistryResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Unavailable))?;
        let existed;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// All records of a table, optionally restricted to a key prefix.
    fn scan<T: DeserializeOwned>(&self, table: Table, prefix: Option<&str>) -> RegistryResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Unavailable))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if prefix.is_none_or(|p| key.value().starts_with(p)) {
                let record = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(record);
            }
        }
        Ok(results)
    }

    // ── Queues, activity, work ─────────────────────────────────────

    /// Insert or update a queue's pending length.
    pub fn put_queue(&self, queue: &QueueInfo) -> RegistryResult<()> {
        self.put_record(QUEUES, &queue.name, queue)
    }

    /// Record that an agent finished a job from a queue.
    pub fn record_activity(&self, activity: &AgentActivity) -> RegistryResult<()> {
        self.put_record(ACTIVITY, &activity.table_key(), activity)
    }

    /// Record a job in flight on an agent.
    pub fn put_work(&self, work: &WorkRecord) -> RegistryResult<()> {
        self.put_record(WORK, &work.table_key(), work)
    }

    /// In-flight work for an agent.
    pub fn list_work(&self, agent_id: &str) -> RegistryResult<Vec<WorkRecord>> {
        self.scan(WORK, Some(&format!("{agent_id}:")))
    }

    pub fn get_lease(&self, cluster: &str) -> RegistryResult<Option<Lease>> {
        self.get_record(LEASES, cluster)
    }

    /// Idle seconds computed against an explicit clock.
    ///
    /// Idle time runs from the later of the agent's registration and its
    /// last job on any of `queues`. Agents with in-flight work are never idle.
    pub fn idle_seconds_at(
        &self,
        agents: &BTreeSet<AgentId>,
        queues: &[QueueInfo],
        now: u64,
    ) -> RegistryResult<BTreeMap<AgentId, u64>> {
        let txn = self.db.begin_read().map_err(map_err!(Unavailable))?;
        let agents_table = txn.open_table(AGENTS).map_err(map_err!(Table))?;
        let activity_table = txn.open_table(ACTIVITY).map_err(map_err!(Table))?;
        let work_table = txn.open_table(WORK).map_err(map_err!(Table))?;

        let mut busy = BTreeSet::new();
        for entry in work_table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let work: WorkRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            busy.insert(work.agent_id);
        }

        let mut idle = BTreeMap::new();
        for agent_id in agents {
            if busy.contains(agent_id) {
                idle.insert(agent_id.clone(), 0);
                continue;
            }

            let mut last_seen = match agents_table.get(agent_id.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let agent: AgentNode =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    agent.registered_at
                }
                None => now,
            };

            for queue in queues {
                let key = format!("{agent_id}:{}", queue.name);
                if let Some(guard) = activity_table.get(key.as_str()).map_err(map_err!(Read))? {
                    let activity: AgentActivity =
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                    last_seen = last_seen.max(activity.last_job_at);
                }
            }

            idle.insert(agent_id.clone(), now.saturating_sub(last_seen));
        }
        Ok(idle)
    }

    /// Lease acquisition against an explicit clock.
    pub fn try_acquire_lease_at(
        &self,
        cluster: &str,
        holder: &str,
        ttl: Duration,
        now: u64,
    ) -> RegistryResult<bool> {
        let lease = Lease {
            cluster: cluster.to_string(),
            holder: holder.to_string(),
            expires_at: now + ttl.as_secs(),
        };
        let value = serde_json::to_vec(&lease).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Unavailable))?;
        let acquired;
        {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let current: Option<Lease> = match table.get(cluster).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };

            acquired = match current {
                Some(l) if l.holder != holder && l.expires_at > now => false,
                _ => {
                    table
                        .insert(cluster, value.as_slice())
                        .map_err(map_err!(Write))?;
                    true
                }
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%cluster, %holder, acquired, "lease acquisition");
        Ok(acquired)
    }
}

impl Registry for RegistryStore {
    fn list_agents(&self, cluster: &str) -> RegistryResult<BTreeSet<AgentId>> {
        let agents: Vec<AgentNode> = self.scan(AGENTS, None)?;
        Ok(agents
            .into_iter()
            .filter(|a| a.cluster == cluster)
            .map(|a| a.agent_id)
            .collect())
    }

    fn get(&self, agent_id: &str) -> RegistryResult<Option<AgentNode>> {
        self.get_record(AGENTS, agent_id)
    }

    fn get_queue(&self, name: &str) -> RegistryResult<QueueInfo> {
        Ok(self.get_record(QUEUES, name)?.unwrap_or_else(|| QueueInfo {
            name: name.to_string(),
            length: 0,
        }))
    }

    fn idle_seconds(
        &self,
        agents: &BTreeSet<AgentId>,
        queues: &[QueueInfo],
    ) -> RegistryResult<BTreeMap<AgentId, u64>> {
        self.idle_seconds_at(agents, queues, epoch_secs())
    }

    fn register_machine(&self, instance: &MachineInstance) -> RegistryResult<()> {
        self.put_record(MACHINES, &instance.machine_id, instance)?;
        debug!(machine = %instance.machine_id, cluster = %instance.cluster, "machine registered");
        Ok(())
    }

    fn get_machine(&self, machine_id: &str) -> RegistryResult<Option<MachineInstance>> {
        self.get_record(MACHINES, machine_id)
    }

    fn list_machines(&self, cluster: &str) -> RegistryResult<Vec<MachineInstance>> {
        let machines: Vec<MachineInstance> = self.scan(MACHINES, None)?;
        Ok(machines.into_iter().filter(|m| m.cluster == cluster).collect())
    }

    fn register_agent(&self, agent: &AgentNode) -> RegistryResult<bool> {
        let value = serde_json::to_vec(agent).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Unavailable))?;
        let inserted;
        {
            let mut table = txn.open_table(AGENTS).map_err(map_err!(Table))?;
            let exists = table
                .get(agent.agent_id.as_str())
                .map_err(map_err!(Read))?
                .is_some();
            inserted = !exists;
            if inserted {
                table
                    .insert(agent.agent_id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if inserted {
            info!(agent = %agent.agent_id, cluster = %agent.cluster, "agent registered");
        }
        Ok(inserted)
    }

    fn unregister(&self, agent: &AgentNode) -> RegistryResult<bool> {
        let prefix = format!("{}:", agent.agent_id);
        let txn = self.db.begin_write().map_err(map_err!(Unavailable))?;
        let existed;
        {
            let mut agents = txn.open_table(AGENTS).map_err(map_err!(Table))?;
            existed = agents
                .remove(agent.agent_id.as_str())
                .map_err(map_err!(Write))?
                .is_some();

            let mut activity = txn.open_table(ACTIVITY).map_err(map_err!(Table))?;
            let keys: Vec<String> = activity
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect();
            for key in &keys {
                activity.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(agent = %agent.agent_id, existed, "agent unregistered");
        Ok(existed)
    }

    fn unregister_machine(&self, machine_id: &str) -> RegistryResult<bool> {
        let existed = self.remove_record(MACHINES, machine_id)?;
        debug!(machine = %machine_id, existed, "machine unregistered");
        Ok(existed)
    }

    fn stop_work(&self, agent_id: &str) -> RegistryResult<u32> {
        let prefix = format!("{agent_id}:");
        let txn = self.db.begin_write().map_err(map_err!(Unavailable))?;
        let count;
        {
            let mut table = txn.open_table(WORK).map_err(map_err!(Table))?;
            let keys: Vec<String> = table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect();
            count = keys.len() as u32;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if count > 0 {
            info!(agent = %agent_id, jobs = count, "stopped in-flight work");
        }
        Ok(count)
    }

    fn try_acquire_lease(
        &self,
        cluster: &str,
        holder: &str,
        ttl: Duration,
    ) -> RegistryResult<bool> {
        self.try_acquire_lease_at(cluster, holder, ttl, epoch_secs())
    }

    fn release_lease(&self, cluster: &str, holder: &str) -> RegistryResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Unavailable))?;
        let released;
        {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let current: Option<Lease> = match table.get(cluster).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            released = matches!(current, Some(ref l) if l.holder == holder);
            if released {
                table.remove(cluster).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(released)
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
