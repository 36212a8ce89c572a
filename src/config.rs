use crate::errors::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sandbox::SandboxId;

/// Packages preinstalled into the base environment mirror
pub const DEFAULT_PACKAGES: &[&str] = &["numpy", "pandas", "matplotlib", "scipy", "seaborn"];

/// Which external dependency resolver drives environment creation and installs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolverKind {
    /// Use uv when it is on PATH, otherwise fall back to venv + pip
    #[default]
    Auto,
    /// Always use uv (`uv venv`, `uv pip install`)
    Uv,
    /// Always use the interpreter's own venv and pip modules
    Pip,
}

impl ResolverKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "uv" => Some(Self::Uv),
            "pip" => Some(Self::Pip),
            _ => None,
        }
    }
}

/// Resource limits applied to every kernel process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Address-space cap in MB (unset means no cap; numeric stacks reserve a lot of
    /// virtual memory, so this is opt-in)
    pub memory_mb: Option<usize>,
    /// Maximum number of threads for scientific libraries
    pub max_threads: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: None,
            max_threads: 4,
        }
    }
}

/// Service-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Directory holding the mirror and every sandbox's env/workspace
    pub root_dir: PathBuf,
    /// Idle time after which a sandbox expires
    pub ttl: Duration,
    /// How often the cleanup sweep runs
    pub sweep_period: Duration,
    /// How long callers wait for a Provisioning sandbox to become Active
    pub provisioning_timeout: Duration,
    /// Default wall-clock budget for one execution
    pub execution_timeout: Duration,
    /// How long a new kernel has to report ready
    pub kernel_startup_timeout: Duration,
    /// How long an interrupted kernel has to yield before it is killed
    pub interrupt_grace: Duration,
    /// Wall-clock budget for one package install
    pub install_timeout: Duration,
    /// Submissions allowed to wait behind a running execution
    pub queue_depth: usize,
    /// Curated package set of the base mirror
    pub packages: Vec<String>,
    /// Interpreter used to create environments (PATH lookup when unset)
    pub python_path: Option<PathBuf>,
    pub resolver: ResolverKind,
    pub limits: ResourceLimits,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            root_dir: std::env::temp_dir().join("pysandbox-pool"),
            ttl: Duration::from_secs(24 * 60 * 60),
            sweep_period: Duration::from_secs(60 * 60),
            provisioning_timeout: Duration::from_secs(180),
            execution_timeout: Duration::from_secs(600),
            kernel_startup_timeout: Duration::from_secs(60),
            interrupt_grace: Duration::from_secs(5),
            install_timeout: Duration::from_secs(120),
            queue_depth: 8,
            packages: DEFAULT_PACKAGES.iter().map(|s| s.to_string()).collect(),
            python_path: None,
            resolver: ResolverKind::default(),
            limits: ResourceLimits::default(),
        }
    }
}

impl ServiceConfig {
    /// Defaults overridden by `SANDBOX_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `SANDBOX_*` key
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let secs = |key: &str| -> Result<Option<Duration>> {
            get(key)
                .map(|v| {
                    v.parse::<u64>().map(Duration::from_secs).map_err(|_| {
                        SandboxError::InvalidConfig(format!("{} must be whole seconds: {}", key, v))
                    })
                })
                .transpose()
        };

        if let Some(root) = get("SANDBOX_ROOT_DIR") {
            config.root_dir = PathBuf::from(root);
        }
        if let Some(v) = secs("SANDBOX_TTL_SECS")? {
            config.ttl = v;
        }
        if let Some(v) = secs("SANDBOX_SWEEP_SECS")? {
            config.sweep_period = v;
        }
        if let Some(v) = secs("SANDBOX_PROVISION_TIMEOUT_SECS")? {
            config.provisioning_timeout = v;
        }
        if let Some(v) = secs("SANDBOX_EXEC_TIMEOUT_SECS")? {
            config.execution_timeout = v;
        }
        if let Some(v) = secs("SANDBOX_KERNEL_STARTUP_SECS")? {
            config.kernel_startup_timeout = v;
        }
        if let Some(v) = secs("SANDBOX_INTERRUPT_GRACE_SECS")? {
            config.interrupt_grace = v;
        }
        if let Some(v) = secs("SANDBOX_INSTALL_TIMEOUT_SECS")? {
            config.install_timeout = v;
        }
        if let Some(v) = get("SANDBOX_QUEUE_DEPTH") {
            config.queue_depth = v.parse().map_err(|_| {
                SandboxError::InvalidConfig(format!("SANDBOX_QUEUE_DEPTH is not a number: {}", v))
            })?;
        }
        if let Some(v) = get("SANDBOX_PACKAGES") {
            config.packages = v
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
        }
        if let Some(v) = get("SANDBOX_PYTHON") {
            config.python_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("SANDBOX_RESOLVER") {
            config.resolver = ResolverKind::parse(&v).ok_or_else(|| {
                SandboxError::InvalidConfig(format!("unknown resolver: {}", v))
            })?;
        }
        if let Some(v) = get("SANDBOX_MEMORY_MB") {
            config.limits.memory_mb = Some(v.parse().map_err(|_| {
                SandboxError::InvalidConfig(format!("SANDBOX_MEMORY_MB is not a number: {}", v))
            })?);
        }
        if let Some(v) = get("SANDBOX_MAX_THREADS") {
            config.limits.max_threads = v.parse().map_err(|_| {
                SandboxError::InvalidConfig(format!("SANDBOX_MAX_THREADS is not a number: {}", v))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.root_dir.is_absolute() {
            return Err(SandboxError::InvalidConfig(format!(
                "root_dir must be absolute: {}",
                self.root_dir.display()
            )));
        }
        let durations = [
            ("ttl", self.ttl),
            ("sweep_period", self.sweep_period),
            ("provisioning_timeout", self.provisioning_timeout),
            ("execution_timeout", self.execution_timeout),
            ("kernel_startup_timeout", self.kernel_startup_timeout),
            ("interrupt_grace", self.interrupt_grace),
            ("install_timeout", self.install_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(SandboxError::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }
        if self.limits.max_threads == 0 {
            return Err(SandboxError::InvalidConfig(
                "limits.max_threads must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn mirror_dir(&self) -> PathBuf {
        self.root_dir.join("mirror")
    }

    pub fn sandboxes_dir(&self) -> PathBuf {
        self.root_dir.join("sandboxes")
    }

    pub fn sandbox_dir(&self, id: &SandboxId) -> PathBuf {
        self.sandboxes_dir().join(id.to_string())
    }

    pub fn env_dir(&self, id: &SandboxId) -> PathBuf {
        self.sandbox_dir(id).join("env")
    }

    pub fn workspace_dir(&self, id: &SandboxId) -> PathBuf {
        self.sandbox_dir(id).join("workspace")
    }

    /// Config rooted at `root`, keeping every other default
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            root_dir: root.to_path_buf(),
            ..Default::default()
        }
    }
}
