use crate::{
    config::{ResolverKind, ServiceConfig},
    errors::{Result, SandboxError},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

const MAX_SPECIFIER_LEN: usize = 256;

/// Outcome of one install call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallReport {
    pub package: String,
    pub success: bool,
    pub message: String,
    pub stdout: String,
    pub stderr: String,
}

impl InstallReport {
    pub fn failed(package: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            package: package.to_string(),
            success: false,
            message: format!("Failed to install package: {}", package),
            stdout: String::new(),
            stderr: reason,
        }
    }

    /// Why the install failed, if it did
    pub fn reason(&self) -> Option<&str> {
        if self.success {
            None
        } else if self.stderr.trim().is_empty() {
            Some(self.message.as_str())
        } else {
            Some(self.stderr.trim())
        }
    }
}

/// External process that creates environments and resolves packages into them
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyResolver {
    Uv { uv: PathBuf, python: PathBuf },
    Pip { python: PathBuf },
}

impl DependencyResolver {
    /// Pick the resolver named by the config, locating binaries on PATH
    pub fn detect(config: &ServiceConfig) -> Result<Self> {
        let python = match &config.python_path {
            Some(path) if path.exists() => path.clone(),
            Some(_) => return Err(SandboxError::PythonNotFound),
            None => which::which("python3")
                .or_else(|_| which::which("python"))
                .map_err(|_| SandboxError::PythonNotFound)?,
        };

        let resolver = match config.resolver {
            ResolverKind::Pip => DependencyResolver::Pip { python },
            ResolverKind::Uv => {
                let uv = which::which("uv")
                    .map_err(|_| SandboxError::ResolverNotFound("uv".to_string()))?;
                DependencyResolver::Uv { uv, python }
            }
            ResolverKind::Auto => match which::which("uv") {
                Ok(uv) => DependencyResolver::Uv { uv, python },
                Err(_) => DependencyResolver::Pip { python },
            },
        };
        info!("[RESOLVER] Using {}", resolver.name());
        Ok(resolver)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DependencyResolver::Uv { .. } => "uv",
            DependencyResolver::Pip { .. } => "pip",
        }
    }

    /// Interpreter inside an environment rooted at `env`
    pub fn env_python(env: &Path) -> PathBuf {
        #[cfg(windows)]
        {
            env.join("Scripts").join("python.exe")
        }
        #[cfg(not(windows))]
        {
            env.join("bin").join("python")
        }
    }

    /// Create a fresh, empty environment at `path`
    pub async fn create_environment(&self, path: &Path, timeout: Duration) -> Result<()> {
        let mut cmd = match self {
            DependencyResolver::Uv { uv, python } => {
                let mut cmd = Command::new(uv);
                cmd.arg("venv").arg("--python").arg(python).arg(path);
                cmd
            }
            DependencyResolver::Pip { python } => {
                let mut cmd = Command::new(python);
                cmd.arg("-m").arg("venv").arg(path);
                cmd
            }
        };
        let output = run(&mut cmd, timeout).await?;
        if output.success {
            debug!("[RESOLVER] Created environment at {:?}", path);
            Ok(())
        } else {
            Err(SandboxError::MirrorBuild(format!(
                "environment creation at {} failed: {}",
                path.display(),
                output.stderr.trim()
            )))
        }
    }

    /// Install `packages` into the environment rooted at `env`
    pub async fn install(
        &self,
        env: &Path,
        packages: &[String],
        timeout: Duration,
    ) -> Result<InstallReport> {
        for package in packages {
            validate_specifier(package)?;
        }
        let label = packages.join(" ");
        let env_python = Self::env_python(env);

        let mut cmd = match self {
            DependencyResolver::Uv { uv, .. } => {
                let mut cmd = Command::new(uv);
                cmd.arg("pip").arg("install").arg("--python").arg(&env_python);
                cmd
            }
            DependencyResolver::Pip { .. } => {
                let mut cmd = Command::new(&env_python);
                cmd.arg("-m")
                    .arg("pip")
                    .arg("install")
                    .arg("--disable-pip-version-check");
                cmd
            }
        };
        cmd.args(packages).env("VIRTUAL_ENV", env);

        let output = match run(&mut cmd, timeout).await {
            Ok(output) => output,
            Err(e) => return Ok(InstallReport::failed(&label, e.to_string())),
        };

        if output.success {
            info!("[RESOLVER] Installed {} into {:?}", label, env);
            Ok(InstallReport {
                package: label.clone(),
                success: true,
                message: format!("Successfully installed package: {}", label),
                stdout: output.stdout,
                stderr: output.stderr,
            })
        } else {
            warn!("[RESOLVER] Install of {} into {:?} failed", label, env);
            Ok(InstallReport {
                package: label.clone(),
                success: false,
                message: format!("Failed to install package: {}", label),
                stdout: output.stdout,
                stderr: output.stderr,
            })
        }
    }
}

/// Reject specifiers that could be read as resolver flags or smuggle extra arguments
pub fn validate_specifier(package: &str) -> Result<()> {
    let reject = |why: &str| -> Result<()> {
        Err(SandboxError::InstallFailure(format!("{:?}: {}", package, why)))
    };
    if package.is_empty() {
        return reject("empty package name");
    }
    if package.len() > MAX_SPECIFIER_LEN {
        return reject("package specifier too long");
    }
    if package.starts_with('-') {
        return reject("package name may not start with '-'");
    }
    if package.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return reject("package name may not contain whitespace");
    }
    Ok(())
}

struct CommandOutput {
    success: bool,
    stdout: String,
    stderr: String,
}

async fn run(cmd: &mut Command, timeout: Duration) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let child = cmd.spawn()?;
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }),
        Ok(Err(e)) => Err(SandboxError::IoError(e)),
        Err(_) => Err(SandboxError::InstallFailure(format!(
            "resolver did not finish within {:?}",
            timeout
        ))),
    }
}
