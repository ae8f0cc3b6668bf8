//! Deployer contract: starting the agent on a fresh machine.
//!
//! [`CommandDeployer`] runs the configured agent command either on this
//! host or on the target machine over ssh.

use std::collections::BTreeMap;
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use fleet_core::{ClusterSpec, DeploySettings, MachineId};

use crate::error::DeployError;

/// Everything needed to start an agent on one machine.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployRequest {
    /// Address the deployer connects to.
    pub address: String,
    pub machine_id: MachineId,
    pub cluster: String,
    pub queues: Vec<String>,
    pub worker_procs: u32,
    pub docker_version: Option<String>,
    pub settings: DeploySettings,
}

impl DeployRequest {
    pub fn new(
        spec: &ClusterSpec,
        machine_id: &str,
        address: &str,
        settings: &DeploySettings,
    ) -> Self {
        Self {
            address: address.to_string(),
            machine_id: machine_id.to_string(),
            cluster: spec.name.clone(),
            queues: spec.queue_names.clone(),
            worker_procs: spec.machine.worker_procs,
            docker_version: spec.machine.docker_version.clone(),
            settings: settings.clone(),
        }
    }

    /// Agent command line with the machine's identity appended as flags.
    pub fn agent_args(&self) -> Result<Vec<String>, DeployError> {
        let mut args: Vec<String> = self
            .settings
            .command
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if args.is_empty() {
            return Err(DeployError::InvalidCommand("empty agent command".to_string()));
        }

        args.extend([
            "--cluster".to_string(),
            self.cluster.clone(),
            "--queues".to_string(),
            self.queues.join(","),
            "--machine-id".to_string(),
            self.machine_id.clone(),
            "--workers".to_string(),
            self.worker_procs.to_string(),
        ]);
        if let Some(version) = &self.docker_version {
            args.push("--docker-version".to_string());
            args.push(version.clone());
        }
        Ok(args)
    }

    /// ssh destination, `user@address` when a user is configured.
    pub fn ssh_destination(&self) -> String {
        match &self.settings.ssh_user {
            Some(user) => format!("{user}@{}", self.address),
            None => self.address.clone(),
        }
    }

    /// Remote shell command: environment assignments then the agent.
    pub fn remote_command(&self) -> Result<String, DeployError> {
        let env = self
            .settings
            .env
            .iter()
            .map(|(key, value)| format!("{key}={}", shell_quote(value)));
        let args = self.agent_args()?.into_iter().map(|arg| shell_quote(&arg));
        Ok(env.chain(args).collect::<Vec<_>>().join(" "))
    }
}

/// Captured output of a successful deploy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployOutcome {
    pub stdout: String,
}

#[async_trait]
pub trait Deployer: Send + Sync {
    /// Start the agent on this host.
    async fn deploy_local(&self, request: &DeployRequest) -> Result<DeployOutcome, DeployError>;

    /// Start the agent on the machine at `request.address`.
    async fn deploy_remote(&self, request: &DeployRequest)
        -> Result<DeployOutcome, DeployError>;
}

/// Runs the agent command as a child process, locally or through ssh.
#[derive(Debug, Clone, Default)]
pub struct CommandDeployer;

#[async_trait]
impl Deployer for CommandDeployer {
    async fn deploy_local(&self, request: &DeployRequest) -> Result<DeployOutcome, DeployError> {
        let args = request.agent_args()?;
        debug!(
            machine_id = %request.machine_id,
            command = ?args,
            env = ?redacted_env(&request.settings.env),
            "deploying agent locally"
        );

        let mut command = Command::new(&args[0]);
        command.args(&args[1..]).envs(&request.settings.env);
        let output = run(&mut command, &args[0]).await?;

        info!(machine_id = %request.machine_id, "agent started locally");
        Ok(output)
    }

    async fn deploy_remote(&self, request: &DeployRequest) -> Result<DeployOutcome, DeployError> {
        let destination = request.ssh_destination();
        let remote = request.remote_command()?;
        debug!(
            machine_id = %request.machine_id,
            destination = %destination,
            env = ?redacted_env(&request.settings.env),
            "deploying agent over ssh"
        );

        let mut command = Command::new("ssh");
        command
            .args(&request.settings.ssh_options)
            .arg(&destination)
            .arg(&remote);
        let output = run(&mut command, "ssh").await?;

        info!(machine_id = %request.machine_id, destination = %destination, "agent started remotely");
        Ok(output)
    }
}

async fn run(command: &mut Command, program: &str) -> Result<DeployOutcome, DeployError> {
    let Output {
        status,
        stdout,
        stderr,
    } = command
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| DeployError::Spawn {
            command: program.to_string(),
            source,
        })?;

    if !status.success() {
        return Err(DeployError::Failed {
            status: status.to_string(),
            stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
        });
    }
    Ok(DeployOutcome {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
    })
}

/// Quote an argument for a POSIX shell unless it is plainly safe.
fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Environment shown in logs with values hidden.
pub fn redacted_env(env: &BTreeMap<String, String>) -> Vec<&str> {
    env.keys().map(String::as_str).collect()
}
