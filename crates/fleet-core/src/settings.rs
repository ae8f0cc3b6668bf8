//! Control settings threaded explicitly into every tick.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Settings shared by the policy engine and the reconciler.
///
/// Parsed from the optional `[control]` block of the cluster file; CLI
/// flags may override individual fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlSettings {
    /// Deploy against the machine's public address instead of its private one.
    pub use_public_address: bool,
    /// Run the deployer on this host instead of over ssh.
    pub deploy_local: bool,
    /// Upper bound on concurrent create/destroy units within one tick.
    pub max_concurrency: usize,
    /// Timeout applied to every provider and deployer call.
    pub call_timeout_secs: u64,
    /// Lifetime of the per-cluster tick lease.
    pub lease_ttl_secs: u64,
    /// How agents above `max_nodes` are selected for removal.
    pub ceiling_rule: CeilingRule,
    /// Destroy provider machines the registry does not know about.
    pub orphan_sweep: bool,
    pub deploy: DeploySettings,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            use_public_address: false,
            deploy_local: false,
            max_concurrency: 4,
            call_timeout_secs: 600,
            lease_ttl_secs: 900,
            ceiling_rule: CeilingRule::None,
            orphan_sweep: true,
            deploy: DeploySettings::default(),
        }
    }
}

impl ControlSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    /// How often a running tick renews its lease: a third of the TTL.
    pub fn lease_renew_interval(&self) -> Duration {
        (self.lease_ttl() / 3).max(Duration::from_millis(100))
    }

    /// Concurrency bound, never below one.
    pub fn concurrency(&self) -> usize {
        self.max_concurrency.max(1)
    }
}

/// Selection rule for agents above the ceiling.
///
/// The bounds clamp only lowers the scalar target; without a rule no
/// concrete agent is picked for removal and the ceiling is not enforced
/// on the agent set.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CeilingRule {
    #[default]
    None,
    /// Remove the most idle agents first, ties broken by agent id.
    MostIdle,
}

/// How the agent software is installed and started on a new machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeploySettings {
    /// Command line that starts the agent. Cluster, queues, machine id and
    /// worker count are appended as flags.
    pub command: String,
    /// Remote user for ssh deployments.
    pub ssh_user: Option<String>,
    /// Extra options passed to ssh before the destination.
    pub ssh_options: Vec<String>,
    /// Environment passed to the agent command.
    pub env: BTreeMap<String, String>,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            command: "fleet-agent".to_string(),
            ssh_user: None,
            ssh_options: vec![
                "-o".to_string(),
                "StrictHostKeyChecking=accept-new".to_string(),
            ],
            env: BTreeMap::new(),
        }
    }
}
