//! fleetd: the fleetgrid daemon.
//!
//! Loads a cluster file, opens the registry, and drives every cluster
//! toward its scaling policy:
//! - `check`  validate the cluster file
//! - `status` print each cluster's plan without acting on it
//! - `tick`   run one reconciliation cycle and exit
//! - `run`    tick on an interval until Ctrl-C
//!
//! # Usage
//!
//! ```text
//! fleetd --config fleet.toml --data-dir /var/lib/fleetgrid run --interval 60
//! ```

mod fleet;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::fleet::Fleet;

#[derive(Parser)]
#[command(name = "fleetd", about = "fleetgrid cluster autoscaler")]
struct Cli {
    /// Cluster file (TOML).
    #[arg(long, short, global = true, default_value = "fleet.toml")]
    config: PathBuf,

    /// Data directory for the registry database.
    #[arg(long, global = true, default_value = "/var/lib/fleetgrid")]
    data_dir: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the cluster file and report rejected clusters.
    Check,

    /// Print the plan of each cluster without acting on it.
    Status {
        /// Restrict to one cluster.
        #[arg(long)]
        cluster: Option<String>,
    },

    /// Run one reconciliation cycle.
    Tick {
        #[arg(long)]
        cluster: Option<String>,

        #[command(flatten)]
        overrides: Overrides,
    },

    /// Tick every cluster on an interval until interrupted.
    Run {
        #[arg(long)]
        cluster: Option<String>,

        /// Seconds between ticks.
        #[arg(long, default_value = "60")]
        interval: u64,

        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Command-line overrides of the `[control]` block.
#[derive(Args, Debug, Default)]
pub struct Overrides {
    /// Start agents on this host instead of over ssh.
    #[arg(long)]
    pub deploy_local: bool,

    /// Deploy against public addresses.
    #[arg(long)]
    pub use_public: bool,

    /// Concurrent create/destroy units per tick.
    #[arg(long)]
    pub max_concurrency: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Check => check(&cli.config),
        Command::Status { cluster } => {
            let fleet = Fleet::load(&cli.config, &cli.data_dir, &Overrides::default())?;
            status(&fleet, cluster.as_deref())
        }
        Command::Tick { cluster, overrides } => {
            let fleet = Fleet::load(&cli.config, &cli.data_dir, &overrides)?;
            tick(&fleet, cluster.as_deref()).await
        }
        Command::Run {
            cluster,
            interval,
            overrides,
        } => {
            let fleet = Fleet::load(&cli.config, &cli.data_dir, &overrides)?;
            run(fleet, cluster.as_deref(), Duration::from_secs(interval)).await
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetd=debug,fleetgrid=debug"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn check(config: &std::path::Path) -> anyhow::Result<ExitCode> {
    let file = fleet_core::ClusterFile::from_file(config)?;
    for (name, spec) in &file.clusters {
        println!(
            "ok        {name}  provider={} min={} max={} strategies={}",
            spec.provider,
            spec.policy.min_nodes,
            spec.policy.max_nodes,
            spec.policy.strategies.len()
        );
    }
    for (name, err) in &file.rejected {
        println!("rejected  {name}  {err}");
    }
    Ok(exit_code(file.rejected.is_empty()))
}

fn status(fleet: &Fleet, only: Option<&str>) -> anyhow::Result<ExitCode> {
    fleet.log_rejected();
    let mut ok = fleet.all_loaded();
    for control in fleet.controls(only)? {
        match control.plan() {
            Ok(plan) => println!("{}", serde_json::to_string_pretty(&plan)?),
            Err(e) => {
                error!(cluster = %control.spec().name, error = %e, "planning failed");
                ok = false;
            }
        }
    }
    Ok(exit_code(ok))
}

async fn tick(fleet: &Fleet, only: Option<&str>) -> anyhow::Result<ExitCode> {
    fleet.log_rejected();
    let mut ok = fleet.all_loaded();
    let controls = fleet.controls(only)?;
    let results = futures::future::join_all(controls.iter().map(|c| c.tick())).await;

    for (control, result) in controls.iter().zip(results) {
        match result {
            Ok(report) => {
                ok &= report.is_success();
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            Err(e) => {
                error!(cluster = %control.spec().name, error = %e, "tick aborted");
                ok = false;
            }
        }
    }
    Ok(exit_code(ok))
}

async fn run(fleet: Fleet, only: Option<&str>, interval: Duration) -> anyhow::Result<ExitCode> {
    info!(interval_secs = interval.as_secs(), "fleetd starting");
    if !fleet.all_loaded() {
        fleet.log_rejected();
        warn!("some clusters were rejected and will not be scaled");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();
    for control in fleet.controls(only)? {
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            control.run(interval, shutdown).await;
        }));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }
    info!("fleetd stopped");
    Ok(ExitCode::SUCCESS)
}

fn exit_code(ok: bool) -> ExitCode {
    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}
