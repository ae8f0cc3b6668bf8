//! Cluster file parser.
//!
//! A cluster file is a single TOML document:
//!
//! ```toml
//! [control]
//! max_concurrency = 4
//!
//! [inventory.providers.local]
//! kind = "local"
//!
//! [clusters.cpu]
//! provider = "local"
//! queue_names = ["default", "control"]
//!
//! [clusters.cpu.machine]
//! name = "small"
//!
//! [clusters.cpu.policy]
//! min_nodes = 1
//! max_nodes = 5
//!
//! [[clusters.cpu.policy.strategies]]
//! name = "items"
//! queue_name = "default"
//! grow_threshold = 5
//! grow_by = 1
//! shrink_threshold = 0
//! shrink_by = 1
//! ```
//!
//! Each cluster is validated on its own. A bad cluster is recorded in
//! `ClusterFile::rejected` and the remaining clusters still load.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{ConfigError, ConfigResult};
use crate::inventory::Inventory;
use crate::settings::ControlSettings;
use crate::types::{ClusterPolicy, ClusterSpec, MachineTemplate, Strategy};

/// A parsed cluster file.
#[derive(Debug)]
pub struct ClusterFile {
    /// Clusters that passed validation, by name.
    pub clusters: BTreeMap<String, ClusterSpec>,
    /// Clusters that failed validation, with the reason.
    pub rejected: BTreeMap<String, ConfigError>,
    pub inventory: Option<Inventory>,
    pub control: ControlSettings,
}

#[derive(Deserialize)]
struct RawClusterFile {
    #[serde(default)]
    clusters: BTreeMap<String, toml::Value>,
    inventory: Option<Inventory>,
    #[serde(default)]
    control: ControlSettings,
}

#[derive(Deserialize)]
struct RawCluster {
    provider: String,
    #[serde(alias = "qnames")]
    queue_names: Vec<String>,
    machine: MachineTemplate,
    policy: RawPolicy,
}

#[derive(Deserialize)]
struct RawPolicy {
    min_nodes: u32,
    max_nodes: u32,
    #[serde(default)]
    strategies: Vec<toml::Value>,
}

impl ClusterFile {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let raw: RawClusterFile =
            toml::from_str(content).map_err(|e| ConfigError::Syntax(e.to_string()))?;

        let mut clusters = BTreeMap::new();
        let mut rejected = BTreeMap::new();
        for (name, value) in raw.clusters {
            match load_spec(&name, value, raw.inventory.as_ref()) {
                Ok(spec) => {
                    debug!(cluster = %name, strategies = spec.policy.strategies.len(), "cluster loaded");
                    clusters.insert(name, spec);
                }
                Err(e) => {
                    warn!(cluster = %name, error = %e, "cluster rejected");
                    rejected.insert(name, e);
                }
            }
        }

        Ok(Self {
            clusters,
            rejected,
            inventory: raw.inventory,
            control: raw.control,
        })
    }

    /// Look up a loaded cluster by name.
    pub fn cluster(&self, name: &str) -> ConfigResult<&ClusterSpec> {
        self.clusters
            .get(name)
            .ok_or_else(|| ConfigError::ClusterNotFound(name.to_string()))
    }
}

/// Parse and validate one `[clusters.<name>]` table.
///
/// Strategy names are resolved to their variants here, so an unknown name
/// or a malformed field never reaches a tick.
pub fn load_spec(
    name: &str,
    value: toml::Value,
    inventory: Option<&Inventory>,
) -> ConfigResult<ClusterSpec> {
    let invalid = |message: String| ConfigError::InvalidCluster {
        cluster: name.to_string(),
        message,
    };

    if name.trim().is_empty() {
        return Err(invalid("cluster name must not be empty".to_string()));
    }
    let raw: RawCluster = value.try_into().map_err(|e| invalid(e.to_string()))?;

    let mut queue_names: Vec<String> = Vec::with_capacity(raw.queue_names.len());
    for queue in raw.queue_names {
        if queue.is_empty() {
            return Err(invalid("queue names must not be empty".to_string()));
        }
        if !queue_names.contains(&queue) {
            queue_names.push(queue);
        }
    }

    let mut strategies = Vec::with_capacity(raw.policy.strategies.len());
    for (index, entry) in raw.policy.strategies.into_iter().enumerate() {
        let strategy_name = entry
            .get("name")
            .and_then(toml::Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| invalid(format!("strategy #{index} has no `name`")))?;

        if !Strategy::KNOWN_NAMES.contains(&strategy_name.as_str()) {
            return Err(ConfigError::UnknownStrategy {
                cluster: name.to_string(),
                name: strategy_name,
            });
        }

        let strategy: Strategy = entry
            .try_into()
            .map_err(|e| invalid(format!("strategy `{strategy_name}`: {e}")))?;

        if let Strategy::QueueDepth(s) = &strategy {
            if !queue_names.contains(&s.queue_name) {
                return Err(ConfigError::UnknownQueue {
                    cluster: name.to_string(),
                    strategy: strategy_name,
                    queue: s.queue_name.clone(),
                });
            }
            if s.shrink_by > 1 {
                warn!(
                    cluster = %name,
                    queue = %s.queue_name,
                    shrink_by = s.shrink_by,
                    "shrink_by > 1 lowers the target by shrink_by but removes a single agent per tick"
                );
            }
        }

        strategies.push(strategy);
    }

    if let Some(inventory) = inventory
        && inventory.get_provider(&raw.provider).is_none()
    {
        return Err(ConfigError::UnknownProvider {
            cluster: name.to_string(),
            provider: raw.provider,
        });
    }

    if raw.policy.min_nodes > raw.policy.max_nodes {
        warn!(
            cluster = %name,
            min_nodes = raw.policy.min_nodes,
            max_nodes = raw.policy.max_nodes,
            "min_nodes exceeds max_nodes; the floor wins"
        );
    }

    Ok(ClusterSpec {
        name: name.to_string(),
        provider: raw.provider,
        queue_names,
        machine: raw.machine,
        policy: ClusterPolicy {
            min_nodes: raw.policy.min_nodes,
            max_nodes: raw.policy.max_nodes,
            strategies,
        },
    })
}
