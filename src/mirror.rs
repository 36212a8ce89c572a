use crate::{
    config::ServiceConfig,
    errors::{Result, SandboxError},
    resolver::DependencyResolver,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

const MARKER_FILE: &str = ".mirror.json";

#[derive(Debug, Serialize, Deserialize)]
struct MirrorMarker {
    packages: Vec<String>,
    built_at_secs: u64,
}

/// Shared, read-only template environment that sandboxes are cloned from
#[derive(Debug, Clone)]
pub struct BaseEnvironmentMirror {
    root: PathBuf,
    packages: Vec<String>,
    built_at: SystemTime,
}

impl BaseEnvironmentMirror {
    /// Build the mirror under the config's root, or reuse a complete one with the
    /// same package set. Any failure is fatal to the service.
    pub async fn build(config: &ServiceConfig, resolver: &DependencyResolver) -> Result<Self> {
        let root = config.mirror_dir();
        let mut packages = config.packages.clone();
        packages.sort();
        packages.dedup();

        if let Some(existing) = Self::reuse(&root, &packages) {
            info!(
                "[MIRROR] Base environment already exists at {:?}, skipping creation",
                root
            );
            return Ok(existing);
        }

        if root.exists() {
            warn!("[MIRROR] Removing stale or incomplete mirror at {:?}", root);
            tokio::fs::remove_dir_all(&root).await?;
        }
        if let Some(parent) = root.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!("[MIRROR] Creating base environment at {:?}", root);
        resolver
            .create_environment(&root, config.install_timeout)
            .await
            .map_err(|e| SandboxError::MirrorBuild(e.to_string()))?;

        if !packages.is_empty() {
            info!("[MIRROR] Installing common packages: {}", packages.join(", "));
            // The curated set is larger than a single interactive install.
            let budget = config.install_timeout * (packages.len() as u32).max(1);
            let report = resolver.install(&root, &packages, budget).await?;
            if !report.success {
                return Err(SandboxError::MirrorBuild(format!(
                    "{}: {}",
                    report.message,
                    report.reason().unwrap_or("unknown error")
                )));
            }
        }

        let built_at = SystemTime::now();
        let marker = MirrorMarker {
            packages: packages.clone(),
            built_at_secs: built_at
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        tokio::fs::write(root.join(MARKER_FILE), serde_json::to_vec_pretty(&marker)?).await?;
        info!("[MIRROR] Base environment created successfully");

        Ok(Self {
            root,
            packages,
            built_at,
        })
    }

    /// Wrap an environment that was prepared out of band
    pub fn adopt(root: PathBuf, packages: Vec<String>) -> Result<Self> {
        if !root.is_dir() {
            return Err(SandboxError::MirrorBuild(format!(
                "mirror directory {} does not exist",
                root.display()
            )));
        }
        Ok(Self {
            root,
            packages,
            built_at: SystemTime::now(),
        })
    }

    fn reuse(root: &Path, packages: &[String]) -> Option<Self> {
        let raw = std::fs::read(root.join(MARKER_FILE)).ok()?;
        let marker: MirrorMarker = serde_json::from_slice(&raw).ok()?;
        if marker.packages != packages {
            info!(
                "[MIRROR] Package set changed ({:?} -> {:?}), rebuilding",
                marker.packages, packages
            );
            return None;
        }
        Some(Self {
            root: root.to_path_buf(),
            packages: marker.packages,
            built_at: UNIX_EPOCH + Duration::from_secs(marker.built_at_secs),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn packages(&self) -> &[String] {
        &self.packages
    }

    pub fn built_at(&self) -> SystemTime {
        self.built_at
    }
}
