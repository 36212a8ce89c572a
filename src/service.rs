use crate::{
    cleanup::CleanupScheduler,
    config::ServiceConfig,
    errors::Result,
    kernel::{KernelLauncher, KernelSettings, ProcessKernelLauncher},
    mirror::BaseEnvironmentMirror,
    provisioner::EnvironmentProvisioner,
    registry::SandboxRegistry,
    resolver::DependencyResolver,
};
use std::sync::Arc;
use tracing::info;

/// A running sandbox pool: mirror, registry and cleanup scheduler
pub struct SandboxService {
    registry: Arc<SandboxRegistry>,
    mirror: Arc<BaseEnvironmentMirror>,
    scheduler: CleanupScheduler,
}

impl SandboxService {
    /// Build (or reuse) the base mirror and start serving. A mirror that cannot
    /// be built is fatal: no sandbox could ever be created.
    pub async fn start(config: ServiceConfig) -> Result<Self> {
        config.validate()?;
        info!("[SERVICE] Starting sandbox pool under {:?}", config.root_dir);
        tokio::fs::create_dir_all(&config.root_dir).await?;

        let resolver = Arc::new(DependencyResolver::detect(&config)?);
        let mirror = Arc::new(BaseEnvironmentMirror::build(&config, &resolver).await?);
        let launcher = Arc::new(ProcessKernelLauncher::new(KernelSettings::from_config(
            &config,
        )));
        Self::start_with(config, mirror, resolver, launcher).await
    }

    /// Start around an existing mirror and a chosen kernel launcher
    pub async fn start_with(
        config: ServiceConfig,
        mirror: Arc<BaseEnvironmentMirror>,
        resolver: Arc<DependencyResolver>,
        launcher: Arc<dyn KernelLauncher>,
    ) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(config.sandboxes_dir()).await?;

        let provisioner = Arc::new(EnvironmentProvisioner::new(
            mirror.clone(),
            resolver,
            config.install_timeout,
        ));
        let sweep_period = config.sweep_period;
        let registry = Arc::new(SandboxRegistry::new(config, provisioner, launcher));

        // Registry state does not survive restarts; whatever is on disk is stale.
        let orphans = registry.remove_orphans().await;
        if orphans > 0 {
            info!("[SERVICE] Removed {} sandboxes left by a previous run", orphans);
        }

        let scheduler = CleanupScheduler::start(registry.clone(), sweep_period);
        info!(
            "[SERVICE] Ready (mirror {:?}, {} packages)",
            mirror.root(),
            mirror.packages().len()
        );
        Ok(Self {
            registry,
            mirror,
            scheduler,
        })
    }

    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    pub fn mirror(&self) -> &BaseEnvironmentMirror {
        &self.mirror
    }

    /// Stop sweeping, then close every sandbox
    pub async fn stop(&mut self) {
        info!("[SERVICE] Stopping");
        self.scheduler.stop().await;
        self.registry.shutdown_all().await;
    }
}
