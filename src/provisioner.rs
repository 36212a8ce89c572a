use crate::{
    errors::{Result, SandboxError},
    mirror::BaseEnvironmentMirror,
    resolver::{DependencyResolver, InstallReport},
};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Scripts larger than this are binaries, not relocatable text.
const MAX_RELOCATE_BYTES: u64 = 1024 * 1024;

/// Clones the base mirror into private per-sandbox environments and installs into them
pub struct EnvironmentProvisioner {
    mirror: Arc<BaseEnvironmentMirror>,
    resolver: Arc<DependencyResolver>,
    install_timeout: Duration,
}

impl EnvironmentProvisioner {
    pub fn new(
        mirror: Arc<BaseEnvironmentMirror>,
        resolver: Arc<DependencyResolver>,
        install_timeout: Duration,
    ) -> Self {
        Self {
            mirror,
            resolver,
            install_timeout,
        }
    }

    pub fn mirror(&self) -> &BaseEnvironmentMirror {
        &self.mirror
    }

    /// Clone the mirror into `dest`, which must not exist yet
    pub async fn clone_mirror_into(&self, dest: &Path) -> Result<()> {
        let source = self.mirror.root().to_path_buf();
        if !source.is_dir() {
            return Err(SandboxError::CloneFailure(format!(
                "mirror {} is missing",
                source.display()
            )));
        }
        if dest.exists() {
            return Err(SandboxError::CloneFailure(format!(
                "destination {} already exists",
                dest.display()
            )));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SandboxError::CloneFailure(e.to_string()))?;
        }

        let started = Instant::now();
        if let Err(e) = system_clone(&source, dest).await {
            warn!(
                "[PROVISION] System copy of {:?} failed ({}), falling back to recursive copy",
                source, e
            );
            let (src, dst) = (source.clone(), dest.to_path_buf());
            tokio::task::spawn_blocking(move || {
                let _ = fs::remove_dir_all(&dst);
                copy_tree(&src, &dst)
            })
            .await?
            .map_err(|e| SandboxError::CloneFailure(e.to_string()))?;
        }

        let (src, dst) = (source.clone(), dest.to_path_buf());
        let rewritten = tokio::task::spawn_blocking(move || relocate(&src, &dst))
            .await?
            .map_err(|e| SandboxError::CloneFailure(e.to_string()))?;

        info!(
            "[PROVISION] Cloned base environment to {:?} in {}ms ({} scripts relocated)",
            dest,
            started.elapsed().as_millis(),
            rewritten
        );
        Ok(())
    }

    /// Install `package` into the environment at `env`. Only that environment changes.
    ///
    /// A resolver failure comes back as an unsuccessful report; a rejected
    /// specifier or target is an `InstallFailure`.
    pub async fn install(&self, env: &Path, package: &str) -> Result<InstallReport> {
        if env.starts_with(self.mirror.root()) {
            return Err(SandboxError::InstallFailure(
                "refusing to install into the base mirror".to_string(),
            ));
        }
        self.resolver
            .install(env, &[package.to_string()], self.install_timeout)
            .await
    }

    /// Remove a sandbox environment; removing an absent one succeeds
    pub async fn remove(&self, env: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(env).await {
            Ok(()) => {
                debug!("[PROVISION] Removed environment {:?}", env);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Copy with the platform's cheapest mechanism: reflinks on Linux, clonefile on macOS
async fn system_clone(source: &Path, dest: &Path) -> Result<()> {
    let mut cmd = Command::new("cp");
    #[cfg(target_os = "macos")]
    cmd.arg("-c").arg("-a");
    #[cfg(not(target_os = "macos"))]
    cmd.arg("-a").arg("--reflink=auto");
    // Trailing "/." copies the contents into a fresh `dest`.
    cmd.arg(source.join("."))
        .arg(dest)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    fs::create_dir_all(dest)?;
    let output = cmd.output().await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(SandboxError::CloneFailure(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ))
    }
}

/// Recursive copy preserving symlinks as symlinks
fn copy_tree(source: &Path, dest: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(source).follow_links(false) {
        let entry = entry?;
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };
        let target = dest.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &target)?;
            #[cfg(not(unix))]
            {
                let _ = link;
                fs::copy(entry.path(), &target)?;
            }
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Point scripts and config that embed the mirror's path at the clone instead, so
/// console scripts run inside a sandbox use the clone's interpreter.
fn relocate(mirror: &Path, clone: &Path) -> std::io::Result<usize> {
    let from = mirror.to_string_lossy().into_owned();
    let to = clone.to_string_lossy().into_owned();
    let mut candidates: Vec<PathBuf> = vec![clone.join("pyvenv.cfg")];
    for dir in ["bin", "Scripts"] {
        if let Ok(entries) = fs::read_dir(clone.join(dir)) {
            candidates.extend(entries.filter_map(|e| e.ok()).map(|e| e.path()));
        }
    }

    let mut rewritten = 0;
    for path in candidates {
        let Ok(meta) = fs::symlink_metadata(&path) else {
            continue;
        };
        if !meta.is_file() || meta.len() > MAX_RELOCATE_BYTES {
            continue;
        }
        let Ok(text) = fs::read_to_string(&path) else {
            continue;
        };
        if text.contains(&from) {
            fs::write(&path, text.replace(&from, &to))?;
            rewritten += 1;
        }
    }
    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_mirror(dir: &Path) -> PathBuf {
        let root = dir.join("mirror");
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::create_dir_all(root.join("lib/site-packages/pkg")).unwrap();
        fs::write(root.join("lib/site-packages/pkg/__init__.py"), "VALUE = 1\n").unwrap();
        fs::write(
            root.join("bin/pip"),
            format!("#!{}/bin/python\nimport pip\n", root.display()),
        )
        .unwrap();
        fs::write(
            root.join("pyvenv.cfg"),
            format!("home = /usr/bin\ncommand = python -m venv {}\n", root.display()),
        )
        .unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("/usr/bin/python3", root.join("bin/python")).unwrap();
        root
    }

    fn provisioner(mirror_root: PathBuf) -> EnvironmentProvisioner {
        let mirror = BaseEnvironmentMirror::adopt(mirror_root, vec![]).unwrap();
        EnvironmentProvisioner::new(
            Arc::new(mirror),
            Arc::new(DependencyResolver::Pip {
                python: PathBuf::from("/nonexistent/python"),
            }),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_clone_copies_tree_and_relocates_scripts() {
        let dir = TempDir::new().unwrap();
        let mirror_root = fake_mirror(dir.path());
        let prov = provisioner(mirror_root.clone());
        let dest = dir.path().join("sandboxes/a/env");

        prov.clone_mirror_into(&dest).await.unwrap();

        assert_eq!(
            fs::read_to_string(dest.join("lib/site-packages/pkg/__init__.py")).unwrap(),
            "VALUE = 1\n"
        );
        let pip = fs::read_to_string(dest.join("bin/pip")).unwrap();
        assert!(pip.starts_with(&format!("#!{}/bin/python", dest.display())));
        let cfg = fs::read_to_string(dest.join("pyvenv.cfg")).unwrap();
        assert!(!cfg.contains(&mirror_root.display().to_string()));
        #[cfg(unix)]
        assert!(fs::symlink_metadata(dest.join("bin/python"))
            .unwrap()
            .file_type()
            .is_symlink());

        // The mirror itself is untouched.
        let mirror_pip = fs::read_to_string(mirror_root.join("bin/pip")).unwrap();
        assert!(mirror_pip.contains(&mirror_root.display().to_string()));
    }

    #[tokio::test]
    async fn test_clones_are_independent() {
        let dir = TempDir::new().unwrap();
        let prov = provisioner(fake_mirror(dir.path()));
        let a = dir.path().join("sandboxes/a/env");
        let b = dir.path().join("sandboxes/b/env");
        prov.clone_mirror_into(&a).await.unwrap();
        prov.clone_mirror_into(&b).await.unwrap();

        fs::write(a.join("lib/site-packages/only_in_a.py"), "").unwrap();
        assert!(!b.join("lib/site-packages/only_in_a.py").exists());
        assert!(!prov.mirror().root().join("lib/site-packages/only_in_a.py").exists());
    }

    #[tokio::test]
    async fn test_clone_failures() {
        let dir = TempDir::new().unwrap();
        let mirror_root = fake_mirror(dir.path());
        let prov = provisioner(mirror_root.clone());
        let dest = dir.path().join("env");
        prov.clone_mirror_into(&dest).await.unwrap();

        assert!(matches!(
            prov.clone_mirror_into(&dest).await,
            Err(SandboxError::CloneFailure(_))
        ));

        fs::remove_dir_all(&mirror_root).unwrap();
        assert!(matches!(
            prov.clone_mirror_into(&dir.path().join("other")).await,
            Err(SandboxError::CloneFailure(_))
        ));
    }

    #[test]
    fn test_copy_tree_fallback() {
        let dir = TempDir::new().unwrap();
        let src = fake_mirror(dir.path());
        let dst = dir.path().join("copy");
        copy_tree(&src, &dst).unwrap();
        assert!(dst.join("lib/site-packages/pkg/__init__.py").exists());
        #[cfg(unix)]
        assert_eq!(
            fs::read_link(dst.join("bin/python")).unwrap(),
            PathBuf::from("/usr/bin/python3")
        );
        assert_eq!(relocate(&src, &dst).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_install_never_targets_mirror() {
        let dir = TempDir::new().unwrap();
        let mirror_root = fake_mirror(dir.path());
        let prov = provisioner(mirror_root.clone());
        assert!(matches!(
            prov.install(&mirror_root, "numpy").await,
            Err(SandboxError::InstallFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_install_rejects_bad_specifier() {
        let dir = TempDir::new().unwrap();
        let prov = provisioner(fake_mirror(dir.path()));
        let env = dir.path().join("env");
        prov.clone_mirror_into(&env).await.unwrap();
        let err = prov.install(&env, "--upgrade").await.unwrap_err();
        assert!(matches!(err, SandboxError::InstallFailure(_)));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let prov = provisioner(fake_mirror(dir.path()));
        let env = dir.path().join("env");
        prov.clone_mirror_into(&env).await.unwrap();
        prov.remove(&env).await.unwrap();
        prov.remove(&env).await.unwrap();
        assert!(!env.exists());
    }

    /// Writes a minimal pure-python wheel for `localpkg` to argv[1].
    const WHEEL_BUILDER: &str = r#"
import base64, hashlib, sys, zipfile
files = {
    "localpkg.py": "MARKER = 'installed'\n",
    "localpkg-1.0.dist-info/METADATA": "Metadata-Version: 2.1\nName: localpkg\nVersion: 1.0\n",
    "localpkg-1.0.dist-info/WHEEL": "Wheel-Version: 1.0\nGenerator: test\nRoot-Is-Purelib: true\nTag: py3-none-any\n",
}
record = []
with zipfile.ZipFile(sys.argv[1], "w") as whl:
    for name, text in files.items():
        data = text.encode()
        digest = base64.urlsafe_b64encode(hashlib.sha256(data).digest()).rstrip(b"=").decode()
        record.append(f"{name},sha256={digest},{len(data)}")
        whl.writestr(name, data)
    record.append("localpkg-1.0.dist-info/RECORD,,")
    whl.writestr("localpkg-1.0.dist-info/RECORD", "\n".join(record) + "\n")
"#;

    async fn imports_localpkg(env: &Path) -> bool {
        Command::new(DependencyResolver::env_python(env))
            .arg("-c")
            .arg("import localpkg")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_install_into_one_clone_stays_there() {
        let Ok(python) = which::which("python3") else {
            return;
        };
        let dir = TempDir::new().unwrap();
        let resolver = DependencyResolver::Pip {
            python: python.clone(),
        };
        let mirror_root = dir.path().join("mirror");
        // Hosts without venv/ensurepip cannot build a real mirror.
        if resolver
            .create_environment(&mirror_root, Duration::from_secs(120))
            .await
            .is_err()
        {
            return;
        }
        let wheel = dir.path().join("localpkg-1.0-py3-none-any.whl");
        let built = std::process::Command::new(&python)
            .arg("-c")
            .arg(WHEEL_BUILDER)
            .arg(&wheel)
            .status()
            .unwrap();
        assert!(built.success());

        let mirror = BaseEnvironmentMirror::adopt(mirror_root.clone(), vec![]).unwrap();
        let prov = EnvironmentProvisioner::new(
            Arc::new(mirror),
            Arc::new(resolver),
            Duration::from_secs(120),
        );
        let a = dir.path().join("sandboxes/a/env");
        let b = dir.path().join("sandboxes/b/env");
        prov.clone_mirror_into(&a).await.unwrap();
        prov.clone_mirror_into(&b).await.unwrap();

        let report = prov.install(&a, wheel.to_str().unwrap()).await.unwrap();
        assert!(report.success, "install failed: {:?}", report.reason());

        assert!(imports_localpkg(&a).await);
        assert!(!imports_localpkg(&b).await);
        assert!(!imports_localpkg(&mirror_root).await);
    }
}
