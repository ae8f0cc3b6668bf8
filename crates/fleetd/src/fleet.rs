//! Process assembly: cluster file, registry, providers, and controls.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use fleet_core::{ClusterFile, ConfigError, ControlSettings};
use fleetgrid_control::{ClusterControl, CommandDeployer, Deployer, Provider, provider_for};
use fleetgrid_registry::{Registry, RegistryStore};

use crate::Overrides;

pub struct Fleet {
    file: ClusterFile,
    settings: ControlSettings,
    registry: Arc<dyn Registry>,
    providers: BTreeMap<String, Arc<dyn Provider>>,
    deployer: Arc<dyn Deployer>,
}

impl Fleet {
    /// Load the cluster file and open the registry under `data_dir`.
    pub fn load(config: &Path, data_dir: &Path, overrides: &Overrides) -> anyhow::Result<Self> {
        let file = ClusterFile::from_file(config)
            .with_context(|| format!("loading cluster file {}", config.display()))?;
        info!(
            path = ?config,
            clusters = file.clusters.len(),
            rejected = file.rejected.len(),
            "cluster file loaded"
        );

        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;
        let db_path = data_dir.join("fleetgrid.redb");
        let registry = RegistryStore::open(&db_path)?;
        info!(path = ?db_path, "registry opened");

        let settings = apply_overrides(file.control.clone(), overrides);
        Self::assemble(file, settings, Arc::new(registry))
    }

    /// Resolve one provider per inventory name, shared by its clusters.
    ///
    /// A cluster whose provider cannot be built is moved to the rejected
    /// set; the others still load.
    fn assemble(
        mut file: ClusterFile,
        settings: ControlSettings,
        registry: Arc<dyn Registry>,
    ) -> anyhow::Result<Self> {
        let mut providers: BTreeMap<String, Arc<dyn Provider>> = BTreeMap::new();
        let mut unusable = Vec::new();
        for spec in file.clusters.values() {
            if providers.contains_key(&spec.provider) {
                continue;
            }
            match provider_for(spec, file.inventory.as_ref()) {
                Ok(provider) => {
                    providers.insert(spec.provider.clone(), provider);
                }
                Err(e) => unusable.push((spec.name.clone(), e.to_string())),
            }
        }
        for (cluster, message) in unusable {
            file.clusters.remove(&cluster);
            warn!(cluster = %cluster, error = %message, "cluster rejected");
            file.rejected.insert(
                cluster.clone(),
                ConfigError::InvalidCluster { cluster, message },
            );
        }

        Ok(Self {
            file,
            settings,
            registry,
            providers,
            deployer: Arc::new(CommandDeployer),
        })
    }

    /// True when every cluster in the file loaded.
    pub fn all_loaded(&self) -> bool {
        self.file.rejected.is_empty()
    }

    pub fn log_rejected(&self) {
        for (name, err) in &self.file.rejected {
            warn!(cluster = %name, error = %err, "cluster rejected");
        }
    }

    /// Controls for every loaded cluster, or only `only`.
    pub fn controls(&self, only: Option<&str>) -> anyhow::Result<Vec<ClusterControl>> {
        let specs = match only {
            Some(name) => vec![self.file.cluster(name)?],
            None => self.file.clusters.values().collect(),
        };

        specs
            .into_iter()
            .map(|spec| {
                let provider = self
                    .providers
                    .get(&spec.provider)
                    .cloned()
                    .with_context(|| format!("no provider `{}` resolved", spec.provider))?;
                Ok(ClusterControl::new(
                    spec.clone(),
                    self.settings.clone(),
                    self.registry.clone(),
                    provider,
                    self.deployer.clone(),
                ))
            })
            .collect()
    }
}

/// Layer command-line flags over the file's `[control]` block.
pub fn apply_overrides(mut settings: ControlSettings, overrides: &Overrides) -> ControlSettings {
    settings.deploy_local |= overrides.deploy_local;
    settings.use_public_address |= overrides.use_public;
    if let Some(n) = overrides.max_concurrency {
        settings.max_concurrency = n;
    }
    settings
}
