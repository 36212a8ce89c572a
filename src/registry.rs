use crate::{
    config::ServiceConfig,
    errors::{Result, SandboxError},
    kernel::{Kernel, KernelLauncher, LaunchSpec},
    output::ExecutionResult,
    provisioner::EnvironmentProvisioner,
    resolver::InstallReport,
    sandbox::{
        ActivityGuard, ProvisionFailure, SandboxId, SandboxInfo, SandboxRecord, SandboxStatus,
    },
    workspace::WorkspaceEntry,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

/// What one cleanup pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub expired: Vec<SandboxId>,
    pub orphans_removed: usize,
}

/// Authoritative map of live sandboxes.
///
/// The map lock only guards insert/remove/lookup and is never held across an
/// await. Each record's `lifecycle` mutex serializes its structural transitions:
/// provisioning holds it until the sandbox is Active or rolled back, and close,
/// expiry and degradation take it before changing status.
pub struct SandboxRegistry {
    config: ServiceConfig,
    provisioner: Arc<EnvironmentProvisioner>,
    launcher: Arc<dyn KernelLauncher>,
    sandboxes: RwLock<HashMap<SandboxId, Arc<SandboxRecord>>>,
}

impl SandboxRegistry {
    pub fn new(
        config: ServiceConfig,
        provisioner: Arc<EnvironmentProvisioner>,
        launcher: Arc<dyn KernelLauncher>,
    ) -> Self {
        Self {
            config,
            provisioner,
            launcher,
            sandboxes: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Register a new sandbox and start provisioning it in the background.
    /// Returns as soon as the record exists.
    pub fn create(self: &Arc<Self>) -> Result<SandboxId> {
        let record = {
            let mut map = self.sandboxes.write().unwrap_or_else(PoisonError::into_inner);
            let mut id = SandboxId::new();
            while map.contains_key(&id) {
                id = SandboxId::new();
            }
            let record = Arc::new(SandboxRecord::new(
                id,
                self.config.env_dir(&id),
                self.config.workspace_dir(&id),
            ));
            map.insert(id, record.clone());
            record
        };

        // Nobody else can hold a fresh record's lock.
        let guard = record.lifecycle.clone().try_lock_owned().map_err(|_| {
            SandboxError::InternalError(format!("lifecycle of {} already locked", record.id))
        })?;

        let id = record.id;
        info!("[REGISTRY] Sandbox {} created, provisioning", id);
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            registry.provision(record, guard).await;
        });
        Ok(id)
    }

    async fn provision(&self, record: Arc<SandboxRecord>, _lifecycle: OwnedMutexGuard<()>) {
        let started = Instant::now();
        let limit = self.config.provisioning_timeout;
        let outcome = match tokio::time::timeout(limit, self.bring_up(&record)).await {
            Ok(Ok(kernel)) => Ok(kernel),
            Ok(Err(e)) => Err(ProvisionFailure::Failed(e.to_string())),
            Err(_) => Err(ProvisionFailure::TimedOut(limit)),
        };
        match outcome {
            Ok(kernel) => {
                record.set_kernel(kernel);
                record.transition(SandboxStatus::Active);
                record.touch();
                info!(
                    "[REGISTRY] Sandbox {} active after {}ms",
                    record.id,
                    started.elapsed().as_millis()
                );
            }
            Err(failure) => {
                error!(
                    "[REGISTRY] Sandbox {} failed to provision: {:?}",
                    record.id, failure
                );
                record.set_failure(failure);
                self.forget(record.id);
                self.release_directories(&record).await;
                record.transition(SandboxStatus::Closed);
            }
        }
    }

    async fn bring_up(&self, record: &SandboxRecord) -> Result<Arc<dyn Kernel>> {
        self.provisioner.clone_mirror_into(&record.env_path).await?;
        let workspace = record.workspace.clone();
        tokio::task::spawn_blocking(move || workspace.create()).await??;
        self.launcher
            .launch(LaunchSpec {
                sandbox_id: record.id,
                env_path: record.env_path.clone(),
                workspace_root: record.workspace.root().to_path_buf(),
            })
            .await
    }

    fn lookup(&self, id: SandboxId) -> Result<Arc<SandboxRecord>> {
        self.sandboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or_else(|| SandboxError::SandboxNotFound(id.to_string()))
    }

    fn forget(&self, id: SandboxId) {
        self.sandboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn snapshot(&self) -> Vec<Arc<SandboxRecord>> {
        self.sandboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Look up `id` and wait, bounded by the provisioning timeout, until it has
    /// left Provisioning.
    async fn settled(&self, id: SandboxId) -> Result<Arc<SandboxRecord>> {
        let record = self.lookup(id)?;
        let mut status = record.subscribe();
        let timeout = self.config.provisioning_timeout;
        let waited = tokio::time::timeout(timeout, async {
            status
                .wait_for(|s| *s != SandboxStatus::Provisioning)
                .await
                .map(|s| *s)
        })
        .await;
        match waited {
            Ok(Ok(_)) => Ok(record),
            Ok(Err(_)) => Err(SandboxError::SandboxNotFound(id.to_string())),
            Err(_) => {
                warn!(
                    "[REGISTRY] Sandbox {} still provisioning after {:?}",
                    id, timeout
                );
                Err(SandboxError::ProvisionTimeout(timeout))
            }
        }
    }

    fn unavailable(&self, record: &SandboxRecord) -> SandboxError {
        match record.status() {
            SandboxStatus::Degraded => SandboxError::Degraded(record.id.to_string()),
            SandboxStatus::Provisioning => {
                SandboxError::ProvisionTimeout(self.config.provisioning_timeout)
            }
            _ => match record.failure() {
                Some(ProvisionFailure::TimedOut(limit)) => SandboxError::ProvisionTimeout(limit),
                Some(ProvisionFailure::Failed(reason)) => SandboxError::ProvisionFailed {
                    id: record.id.to_string(),
                    reason,
                },
                None => SandboxError::SandboxNotFound(record.id.to_string()),
            },
        }
    }

    /// Mark an operation in progress on an Active sandbox. Taking the lifecycle
    /// lock orders this against expiry, which checks the in-flight count under it.
    async fn begin<'a>(&self, record: &'a SandboxRecord) -> Result<ActivityGuard<'a>> {
        let _lifecycle = record.lifecycle.lock().await;
        if record.status() == SandboxStatus::Active {
            Ok(record.begin_activity())
        } else {
            Err(self.unavailable(record))
        }
    }

    /// Block until the sandbox is Active
    pub async fn wait_ready(&self, id: SandboxId) -> Result<SandboxInfo> {
        let record = self.settled(id).await?;
        if record.status() == SandboxStatus::Active {
            Ok(record.info())
        } else {
            Err(self.unavailable(&record))
        }
    }

    pub fn get(&self, id: SandboxId) -> Result<SandboxInfo> {
        self.lookup(id).map(|record| record.info())
    }

    /// Point-in-time view of every registered sandbox, oldest first
    pub fn list(&self) -> Vec<SandboxInfo> {
        let mut infos: Vec<SandboxInfo> = self.snapshot().iter().map(|r| r.info()).collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    /// Run `code` in the sandbox's kernel. `timeout` defaults to the configured
    /// execution timeout. Failures of the code itself come back in the result.
    pub async fn execute(
        &self,
        id: SandboxId,
        code: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        let record = self.settled(id).await?;
        let _activity = self.begin(&record).await?;
        let kernel = record
            .kernel()
            .ok_or_else(|| SandboxError::SandboxNotFound(id.to_string()))?;
        let timeout = timeout.unwrap_or(self.config.execution_timeout);

        debug!("[REGISTRY] Sandbox {}: execute ({} bytes)", id, code.len());
        match kernel.submit(code, timeout).await {
            Ok(result) => Ok(result),
            Err(_) if record.status().is_retiring() => {
                Err(SandboxError::SandboxNotFound(id.to_string()))
            }
            Err(e) if e.is_kernel_fatal() => {
                self.degrade(&record, &e).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn degrade(&self, record: &SandboxRecord, cause: &SandboxError) {
        let _lifecycle = record.lifecycle.lock().await;
        if record.status() == SandboxStatus::Active && record.transition(SandboxStatus::Degraded)
        {
            error!(
                "[REGISTRY] Sandbox {} degraded: {}; only close is allowed",
                record.id, cause
            );
        }
    }

    /// Install a package into this sandbox's environment only.
    /// An unsuccessful install is reported, not raised.
    pub async fn install(&self, id: SandboxId, package: &str) -> Result<InstallReport> {
        let record = self.settled(id).await?;
        let _activity = self.begin(&record).await?;
        info!("[REGISTRY] Sandbox {}: installing {}", id, package);
        match self.provisioner.install(&record.env_path, package).await {
            Ok(report) => Ok(report),
            Err(SandboxError::InstallFailure(reason)) => {
                warn!("[REGISTRY] Sandbox {}: install rejected: {}", id, reason);
                Ok(InstallReport::failed(package, reason))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn upload(&self, id: SandboxId, path: &str, data: Vec<u8>) -> Result<()> {
        let record = self.settled(id).await?;
        let _activity = self.begin(&record).await?;
        let workspace = record.workspace.clone();
        let relative = path.to_string();
        tokio::task::spawn_blocking(move || workspace.upload(&relative, &data)).await??;
        Ok(())
    }

    pub async fn download(&self, id: SandboxId, path: &str) -> Result<Vec<u8>> {
        let record = self.settled(id).await?;
        let _activity = self.begin(&record).await?;
        let workspace = record.workspace.clone();
        let relative = path.to_string();
        tokio::task::spawn_blocking(move || workspace.download(&relative)).await?
    }

    pub async fn list_files(&self, id: SandboxId) -> Result<Vec<WorkspaceEntry>> {
        let record = self.settled(id).await?;
        let _activity = self.begin(&record).await?;
        let workspace = record.workspace.clone();
        tokio::task::spawn_blocking(move || workspace.list()).await?
    }

    /// Tear the sandbox down. Unknown, already closed and expired ids fail with
    /// `SandboxNotFound`; of two racing closes exactly one succeeds.
    pub async fn close(&self, id: SandboxId) -> Result<()> {
        let record = self.lookup(id)?;
        // Waits out provisioning, which holds the lock until it settles.
        let _lifecycle = record.lifecycle.lock().await;
        match record.status() {
            status if status.is_retiring() => {
                return Err(SandboxError::SandboxNotFound(id.to_string()))
            }
            SandboxStatus::Degraded => {}
            _ => {
                record.transition(SandboxStatus::Closing);
            }
        }
        info!("[REGISTRY] Closing sandbox {}", id);
        self.teardown(&record).await;
        Ok(())
    }

    /// Release everything the sandbox owns. Callers hold its lifecycle lock.
    /// Directory removal failures are left for the orphan sweep.
    async fn teardown(&self, record: &SandboxRecord) {
        if let Some(kernel) = record.take_kernel() {
            if let Err(e) = kernel.shutdown().await {
                warn!(
                    "[REGISTRY] Sandbox {}: kernel shutdown failed: {}",
                    record.id, e
                );
            }
        }
        self.forget(record.id);
        self.release_directories(record).await;
        record.transition(SandboxStatus::Closed);
        info!("[REGISTRY] Sandbox {} closed", record.id);
    }

    /// Remove the sandbox's environment, workspace and finally its own directory
    async fn release_directories(&self, record: &SandboxRecord) {
        if let Err(e) = self.provisioner.remove(&record.env_path).await {
            warn!(
                "[REGISTRY] Sandbox {}: failed to remove environment: {}",
                record.id, e
            );
        }
        let workspace = record.workspace.clone();
        match tokio::task::spawn_blocking(move || workspace.remove()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(
                "[REGISTRY] Sandbox {}: failed to remove workspace: {}",
                record.id, e
            ),
            Err(e) => warn!(
                "[REGISTRY] Sandbox {}: workspace removal task failed: {}",
                record.id, e
            ),
        }
        self.remove_sandbox_dir(record.id).await;
    }

    async fn remove_sandbox_dir(&self, id: SandboxId) {
        let dir = self.config.sandbox_dir(&id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!("[REGISTRY] Removed {:?}", dir),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "[REGISTRY] Failed to remove {:?} ({}), will retry on next sweep",
                dir, e
            ),
        }
    }

    /// Expire sandboxes idle longer than the TTL, then remove orphaned directories.
    ///
    /// Candidates are re-checked under their lifecycle lock, so a sandbox used
    /// between the scan and the teardown survives.
    pub async fn sweep_expired(&self) -> SweepReport {
        let ttl = self.config.ttl;
        let now = SystemTime::now();
        let candidates: Vec<_> = self
            .snapshot()
            .into_iter()
            .filter(|r| is_expirable(r.status()) && r.idle_for(now) > ttl)
            .collect();

        let mut report = SweepReport::default();
        for record in candidates {
            let _lifecycle = record.lifecycle.lock().await;
            let status = record.status();
            if !is_expirable(status)
                || record.in_flight() > 0
                || record.idle_for(SystemTime::now()) <= ttl
            {
                debug!(
                    "[CLEANUP] Sandbox {} became active again, keeping it",
                    record.id
                );
                continue;
            }
            info!(
                "[CLEANUP] Sandbox {} idle for more than {:?}, expiring",
                record.id, ttl
            );
            if status == SandboxStatus::Active {
                record.transition(SandboxStatus::Expired);
            }
            self.teardown(&record).await;
            report.expired.push(record.id);
        }

        report.orphans_removed = self.remove_orphans().await;
        report
    }

    /// Remove sandbox directories that no registry entry owns: leftovers of a
    /// previous run or of a teardown whose removal failed.
    pub async fn remove_orphans(&self) -> usize {
        let root = self.config.sandboxes_dir();
        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!("[CLEANUP] Cannot scan {:?}: {}", root, e);
                return 0;
            }
        };

        let mut removed = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("[CLEANUP] Cannot scan {:?}: {}", root, e);
                    break;
                }
            };
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<SandboxId>().ok())
            else {
                continue;
            };
            if self.lookup(id).is_ok() {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => {
                    info!("[CLEANUP] Removed orphaned sandbox directory {}", id);
                    removed += 1;
                }
                Err(e) => warn!("[CLEANUP] Failed to remove orphan {}: {}", id, e),
            }
        }
        removed
    }

    /// Close every sandbox, waiting for any still provisioning
    pub async fn shutdown_all(&self) {
        let records = self.snapshot();
        info!("[REGISTRY] Closing {} sandboxes", records.len());
        for record in records {
            match self.close(record.id).await {
                Ok(()) | Err(SandboxError::SandboxNotFound(_)) => {}
                Err(e) => warn!("[REGISTRY] Failed to close {}: {}", record.id, e),
            }
        }
    }
}

/// Active sandboxes expire; Degraded ones are also reclaimed once idle past the TTL.
fn is_expirable(status: SandboxStatus) -> bool {
    matches!(status, SandboxStatus::Active | SandboxStatus::Degraded)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::kernel::KernelState;
    use crate::mirror::BaseEnvironmentMirror;
    use crate::resolver::DependencyResolver;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio_test::assert_ok;

    /// Echoes code back as stdout. `crash` kills it, `sleep` takes a while.
    pub(crate) struct FakeKernel {
        state: Mutex<KernelState>,
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Kernel for FakeKernel {
        async fn submit(&self, code: &str, _timeout: Duration) -> Result<ExecutionResult> {
            if self.state() == KernelState::Terminated {
                return Err(SandboxError::KernelCrashed("terminated".into()));
            }
            match code {
                "crash" => {
                    *self.state.lock().unwrap() = KernelState::Terminated;
                    Err(SandboxError::KernelCrashed("segfault".into()))
                }
                "sleep" => {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(ExecutionResult::default())
                }
                _ => Ok(ExecutionResult {
                    stdout: vec![format!("{}\n", code)],
                    ..Default::default()
                }),
            }
        }

        async fn interrupt(&self) -> Result<()> {
            Ok(())
        }

        async fn shutdown(&self) -> Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            *self.state.lock().unwrap() = KernelState::Terminated;
            Ok(())
        }

        fn state(&self) -> KernelState {
            *self.state.lock().unwrap()
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeLauncher {
        pub fail: bool,
        pub delay: Duration,
        pub shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl KernelLauncher for FakeLauncher {
        async fn launch(&self, spec: LaunchSpec) -> Result<Arc<dyn Kernel>> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(SandboxError::KernelStartFailure("no interpreter".into()));
            }
            assert!(spec.env_path.exists());
            assert!(spec.workspace_root.exists());
            Ok(Arc::new(FakeKernel {
                state: Mutex::new(KernelState::Idle),
                shutdowns: self.shutdowns.clone(),
            }))
        }
    }

    pub(crate) fn registry_with(
        dir: &TempDir,
        launcher: FakeLauncher,
        configure: impl FnOnce(&mut ServiceConfig),
    ) -> Arc<SandboxRegistry> {
        let mut config = ServiceConfig::rooted_at(dir.path());
        configure(&mut config);

        let mirror_root = config.mirror_dir();
        std::fs::create_dir_all(mirror_root.join("lib")).unwrap();
        std::fs::write(mirror_root.join("lib/base.py"), "BASE = True\n").unwrap();
        let mirror = BaseEnvironmentMirror::adopt(mirror_root, vec![]).unwrap();
        let provisioner = EnvironmentProvisioner::new(
            Arc::new(mirror),
            Arc::new(DependencyResolver::Pip {
                python: PathBuf::from("/nonexistent/python"),
            }),
            config.install_timeout,
        );
        Arc::new(SandboxRegistry::new(
            config,
            Arc::new(provisioner),
            Arc::new(launcher),
        ))
    }

    fn registry(dir: &TempDir) -> Arc<SandboxRegistry> {
        registry_with(dir, FakeLauncher::default(), |_| {})
    }

    #[tokio::test]
    async fn test_created_ids_are_distinct() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let ids: HashSet<_> = (0..20).map(|_| registry.create().unwrap()).collect();
        assert_eq!(ids.len(), 20);
        registry.shutdown_all().await;
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_execute_waits_for_provisioning() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(
            &dir,
            FakeLauncher {
                delay: Duration::from_millis(200),
                ..Default::default()
            },
            |_| {},
        );
        let id = registry.create().unwrap();
        assert_eq!(registry.get(id).unwrap().status, SandboxStatus::Provisioning);

        let result = registry.execute(id, "x = 1", None).await.unwrap();
        assert_eq!(result.stdout, vec!["x = 1\n"]);
        assert_eq!(registry.get(id).unwrap().status, SandboxStatus::Active);

        // The clone carries the mirror's files.
        let env = registry.config().env_dir(&id);
        assert!(env.join("lib/base.py").exists());
    }

    #[tokio::test]
    async fn test_close_twice_reports_not_found() {
        let dir = TempDir::new().unwrap();
        let launcher = FakeLauncher::default();
        let shutdowns = launcher.shutdowns.clone();
        let registry = registry_with(&dir, launcher, |_| {});
        let id = registry.create().unwrap();
        assert_ok!(registry.wait_ready(id).await);

        assert_ok!(registry.close(id).await);
        assert!(matches!(
            registry.close(id).await,
            Err(SandboxError::SandboxNotFound(_))
        ));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert!(!registry.config().sandbox_dir(&id).exists());
        assert!(matches!(registry.get(id), Err(SandboxError::SandboxNotFound(_))));
        assert!(matches!(
            registry.execute(id, "1", None).await,
            Err(SandboxError::SandboxNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_racing_closes_release_once() {
        let dir = TempDir::new().unwrap();
        let launcher = FakeLauncher::default();
        let shutdowns = launcher.shutdowns.clone();
        let registry = registry_with(&dir, launcher, |_| {});
        let id = registry.create().unwrap();

        // Both start while the sandbox is still provisioning.
        let (a, b) = tokio::join!(registry.close(id), registry.close(id));
        assert!(a.is_ok() ^ b.is_ok());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_unknown_id() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        assert!(matches!(
            registry.close(SandboxId::new()).await,
            Err(SandboxError::SandboxNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_idle_sandbox_expires() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, FakeLauncher::default(), |c| {
            c.ttl = Duration::from_millis(50);
        });
        let id = registry.create().unwrap();
        registry.wait_ready(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        let report = registry.sweep_expired().await;
        assert_eq!(report.expired, vec![id]);
        assert!(matches!(
            registry.execute(id, "1", None).await,
            Err(SandboxError::SandboxNotFound(_))
        ));
        assert!(!registry.config().sandbox_dir(&id).exists());
    }

    #[tokio::test]
    async fn test_recently_used_sandbox_survives_sweep() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, FakeLauncher::default(), |c| {
            c.ttl = Duration::from_secs(60);
        });
        let id = registry.create().unwrap();
        registry.wait_ready(id).await.unwrap();
        registry.execute(id, "1", None).await.unwrap();

        assert!(registry.sweep_expired().await.expired.is_empty());
        assert_eq!(registry.get(id).unwrap().status, SandboxStatus::Active);
    }

    #[tokio::test]
    async fn test_busy_sandbox_is_not_expired() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(&dir, FakeLauncher::default(), |c| {
            c.ttl = Duration::from_millis(50);
        });
        let id = registry.create().unwrap();
        registry.wait_ready(id).await.unwrap();

        let running = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.execute(id, "sleep", None).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(registry.sweep_expired().await.expired.is_empty());
        assert!(running.await.unwrap().is_ok());
        assert_eq!(registry.get(id).unwrap().status, SandboxStatus::Active);
    }

    #[tokio::test]
    async fn test_crash_degrades_only_that_sandbox() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let a = registry.create().unwrap();
        let b = registry.create().unwrap();
        registry.wait_ready(a).await.unwrap();
        registry.wait_ready(b).await.unwrap();

        let err = registry.execute(a, "crash", None).await.unwrap_err();
        assert!(matches!(err, SandboxError::KernelCrashed(_)));
        assert_eq!(registry.get(a).unwrap().status, SandboxStatus::Degraded);
        assert!(matches!(
            registry.execute(a, "1", None).await,
            Err(SandboxError::Degraded(_))
        ));
        assert!(matches!(
            registry.upload(a, "f.txt", b"x".to_vec()).await,
            Err(SandboxError::Degraded(_))
        ));

        assert!(registry.execute(b, "1", None).await.is_ok());

        assert_ok!(registry.close(a).await);
        assert!(matches!(registry.get(a), Err(SandboxError::SandboxNotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_provisioning_rolls_back() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(
            &dir,
            FakeLauncher {
                fail: true,
                ..Default::default()
            },
            |_| {},
        );
        let id = registry.create().unwrap();
        let err = registry.wait_ready(id).await.unwrap_err();
        match err {
            SandboxError::ProvisionFailed { reason, .. } => assert!(reason.contains("no interpreter")),
            other => panic!("unexpected error {:?}", other),
        }
        assert!(matches!(registry.get(id), Err(SandboxError::SandboxNotFound(_))));
        assert!(!registry.config().sandbox_dir(&id).exists());
    }

    #[tokio::test]
    async fn test_slow_provisioning_times_out() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(
            &dir,
            FakeLauncher {
                delay: Duration::from_secs(5),
                ..Default::default()
            },
            |c| c.provisioning_timeout = Duration::from_millis(100),
        );
        let id = registry.create().unwrap();
        assert!(matches!(
            registry.execute(id, "1", None).await,
            Err(SandboxError::ProvisionTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_stuck_provisioning_is_abandoned() {
        let dir = TempDir::new().unwrap();
        let registry = registry_with(
            &dir,
            FakeLauncher {
                delay: Duration::from_secs(30),
                ..Default::default()
            },
            |c| c.provisioning_timeout = Duration::from_millis(100),
        );
        let id = registry.create().unwrap();

        // Close waits on provisioning, which gives up after its own bound.
        let closed = tokio::time::timeout(Duration::from_secs(5), registry.close(id)).await;
        assert!(matches!(closed, Ok(Err(SandboxError::SandboxNotFound(_)))));
        assert!(matches!(registry.get(id), Err(SandboxError::SandboxNotFound(_))));
        assert!(!registry.config().sandbox_dir(&id).exists());
    }

    #[tokio::test]
    async fn test_workspace_operations() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let id = registry.create().unwrap();

        let data = vec![0u8, 159, 146, 150, 42];
        registry.upload(id, "data/f.bin", data.clone()).await.unwrap();
        assert_eq!(registry.download(id, "data/f.bin").await.unwrap(), data);

        let files = registry.list_files(id).await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "data/f.bin");
        assert_eq!(files[0].size, 5);

        assert!(matches!(
            registry.download(id, "missing.txt").await,
            Err(SandboxError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_traversal_upload_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let id = registry.create().unwrap();

        assert!(matches!(
            registry.upload(id, "../outside.txt", b"x".to_vec()).await,
            Err(SandboxError::PathRejected(_))
        ));
        assert!(!registry.config().sandbox_dir(&id).join("outside.txt").exists());
        assert!(registry.list_files(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sandboxes_are_disjoint() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let a = registry.create().unwrap();
        let b = registry.create().unwrap();

        registry.upload(a, "only_a.txt", b"a".to_vec()).await.unwrap();
        assert!(registry.list_files(b).await.unwrap().is_empty());
        assert!(matches!(
            registry.download(b, "only_a.txt").await,
            Err(SandboxError::FileNotFound(_))
        ));
        let config = registry.config();
        assert!(!config.env_dir(&a).starts_with(config.sandbox_dir(&b)));
    }

    #[tokio::test]
    async fn test_orphans_are_removed() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let live = registry.create().unwrap();
        registry.wait_ready(live).await.unwrap();

        let orphan = registry.config().sandbox_dir(&SandboxId::new());
        std::fs::create_dir_all(orphan.join("env")).unwrap();
        let unrelated = registry.config().sandboxes_dir().join("keep-me");
        std::fs::create_dir_all(&unrelated).unwrap();

        assert_eq!(registry.remove_orphans().await, 1);
        assert!(!orphan.exists());
        assert!(unrelated.exists());
        assert!(registry.config().sandbox_dir(&live).exists());
    }

    #[tokio::test]
    async fn test_list_is_a_snapshot() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let a = registry.create().unwrap();
        let b = registry.create().unwrap();
        registry.wait_ready(a).await.unwrap();
        registry.wait_ready(b).await.unwrap();

        let listed = registry.list();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|s| s.status == SandboxStatus::Active));
        registry.close(a).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn test_install_failure_is_reported_not_raised() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let id = registry.create().unwrap();
        let report = registry.install(id, "--index-url=http://x").await.unwrap();
        assert!(!report.success);
        assert!(report.reason().is_some());
        assert_eq!(registry.get(id).unwrap().status, SandboxStatus::Active);
    }
}
