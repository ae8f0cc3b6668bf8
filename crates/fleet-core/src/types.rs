//! Domain types for fleetgrid.
//!
//! `ClusterSpec` and friends are loaded once per process run and treated
//! as read-only. `ClusterState` and `ClusterDiff` are per-tick values that
//! are rebuilt from the registry every tick and never persisted.
//! `AgentNode` and `MachineInstance` are the durable registry entities.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Unique identifier for an agent registered in a cluster.
pub type AgentId = String;

/// Unique identifier for a provisioned machine.
pub type MachineId = String;

// ── Cluster spec ───────────────────────────────────────────────────

/// A named group of agents sharing one policy and queue set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterSpec {
    pub name: String,
    /// Inventory name of the provider that creates this cluster's machines.
    pub provider: String,
    /// Queues the cluster's agents pull work from.
    pub queue_names: Vec<String>,
    /// Template handed to the provider for every new machine.
    pub machine: MachineTemplate,
    pub policy: ClusterPolicy,
}

/// Machine template for a cluster's agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MachineTemplate {
    /// Template name, used as the middle segment of generated machine names.
    pub name: String,
    /// Provider-specific size/flavor (e.g. "s-1vcpu-1gb").
    pub size: Option<String>,
    /// Provider-specific base image.
    pub image: Option<String>,
    pub region: Option<String>,
    /// Worker processes the agent starts on the machine.
    #[serde(default = "default_worker_procs")]
    pub worker_procs: u32,
    /// Docker version installed by the deployer, if any.
    pub docker_version: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_worker_procs() -> u32 {
    1
}

/// Scaling policy of a cluster.
///
/// `min_nodes <= max_nodes` is not checked here; the bounds pass of the
/// policy engine enforces it on every evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterPolicy {
    pub min_nodes: u32,
    pub max_nodes: u32,
    /// Applied in order, each consuming the previous one's output.
    #[serde(default)]
    pub strategies: Vec<Strategy>,
}

/// A configurable scaling rule, resolved from its name at load time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "name")]
pub enum Strategy {
    #[serde(rename = "items", alias = "queue_depth")]
    QueueDepth(QueueDepthStrategy),
    #[serde(rename = "idle")]
    Idle(IdleStrategy),
}

impl Strategy {
    /// Names accepted in the `name` field of a strategy entry.
    pub const KNOWN_NAMES: &'static [&'static str] = &["items", "queue_depth", "idle"];

    /// Canonical name of the strategy.
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::QueueDepth(_) => "items",
            Strategy::Idle(_) => "idle",
        }
    }
}

/// Grow or shrink by a fixed step based on one queue's depth.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueDepthStrategy {
    #[serde(alias = "qname")]
    pub queue_name: String,
    /// Grow when depth >= this value.
    #[serde(alias = "items_gt")]
    pub grow_threshold: u64,
    #[serde(alias = "increase_by")]
    pub grow_by: u32,
    /// Shrink when depth <= this value.
    #[serde(alias = "items_lt")]
    pub shrink_threshold: u64,
    #[serde(alias = "decrease_by")]
    pub shrink_by: u32,
}

/// Remove every agent idle for at least `idle_threshold` seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdleStrategy {
    #[serde(alias = "idle_time_gt")]
    pub idle_threshold: u64,
}

// ── Per-tick snapshot ──────────────────────────────────────────────

/// Point-in-time view of a cluster.
///
/// A value type: every stage of the pipeline returns a new snapshot and
/// never mutates its input. `agent_count` starts equal to `agents.len()`
/// and then diverges when a stage adjusts the scalar target only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterState {
    pub agent_count: u32,
    pub agents: BTreeSet<AgentId>,
    pub queue_depths: BTreeMap<String, u64>,
    pub idle_seconds: BTreeMap<AgentId, u64>,
}

impl ClusterState {
    /// Build a snapshot whose `agent_count` matches the agent set.
    pub fn new(
        agents: BTreeSet<AgentId>,
        queue_depths: BTreeMap<String, u64>,
        idle_seconds: BTreeMap<AgentId, u64>,
    ) -> Self {
        Self {
            agent_count: agents.len() as u32,
            agents,
            queue_depths,
            idle_seconds,
        }
    }

    /// Idle seconds recorded for an agent (0 when unknown).
    pub fn idle_of(&self, agent: &str) -> u64 {
        self.idle_seconds.get(agent).copied().unwrap_or(0)
    }

    /// Agents ordered from most idle to least idle, ties by agent id.
    pub fn agents_by_idleness(&self) -> Vec<&AgentId> {
        let mut agents: Vec<&AgentId> = self.agents.iter().collect();
        agents.sort_by(|a, b| self.idle_of(b).cmp(&self.idle_of(a)).then_with(|| a.cmp(b)));
        agents
    }
}

/// Concrete action plan derived from an original and a desired snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterDiff {
    /// Number of new machines to provision.
    pub to_create: u32,
    /// Agents to tear down; always a subset of the original agent set.
    pub to_delete: BTreeSet<AgentId>,
}

impl ClusterDiff {
    pub fn is_empty(&self) -> bool {
        self.to_create == 0 && self.to_delete.is_empty()
    }
}

// ── Registry entities ──────────────────────────────────────────────

/// An agent process registered for a cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentNode {
    pub agent_id: AgentId,
    pub cluster: String,
    /// Machine backing this agent.
    pub machine_id: MachineId,
    pub queues: Vec<String>,
    /// Unix timestamp (seconds) of registration.
    pub registered_at: u64,
}

/// A provisioned compute resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineInstance {
    pub machine_id: MachineId,
    pub cluster: String,
    pub private_addrs: Vec<String>,
    pub public_addrs: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Unix timestamp (seconds) when the provider created the machine.
    pub created_at: u64,
}

impl MachineInstance {
    /// First private address, or first public one when `use_public` is set.
    pub fn address(&self, use_public: bool) -> Option<&str> {
        let addrs = if use_public {
            &self.public_addrs
        } else {
            &self.private_addrs
        };
        addrs.first().map(String::as_str)
    }
}
