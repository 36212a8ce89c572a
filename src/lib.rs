//! Pool of isolated, stateful Python sandboxes.
//!
//! Each sandbox owns a virtual environment cloned from a shared, pre-built base
//! mirror, a private workspace directory and one long-lived interpreter kernel
//! whose variables and imports persist across executions. Sandboxes are created,
//! used and closed through [`SandboxRegistry`]; idle ones are reclaimed by the
//! [`CleanupScheduler`]. [`SandboxService`] wires everything together.
//!
//! ```no_run
//! use pysandbox_pool::{SandboxService, ServiceConfig};
//!
//! # async fn run() -> pysandbox_pool::Result<()> {
//! let mut service = SandboxService::start(ServiceConfig::from_env()?).await?;
//! let registry = service.registry().clone();
//!
//! let id = registry.create()?;
//! registry.execute(id, "x = 40", None).await?;
//! let result = registry.execute(id, "x + 2", None).await?;
//! assert_eq!(result.text().as_deref(), Some("42"));
//!
//! registry.close(id).await?;
//! service.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod cleanup;
pub mod config;
pub mod errors;
pub mod kernel;
pub mod mirror;
pub mod output;
pub mod protocol;
pub mod provisioner;
pub mod registry;
pub mod resolver;
pub mod sandbox;
pub mod service;
pub mod workspace;

pub use cleanup::CleanupScheduler;
pub use config::{ResolverKind, ResourceLimits, ServiceConfig};
pub use errors::{Result, SandboxError};
pub use kernel::{
    Kernel, KernelLauncher, KernelSession, KernelSettings, KernelState, LaunchSpec,
    ProcessKernelLauncher,
};
pub use mirror::BaseEnvironmentMirror;
pub use output::{
    ErrorDescriptor, ExecutionResult, MimeType, OutputAggregator, RichPayload, RichResult,
};
pub use provisioner::EnvironmentProvisioner;
pub use registry::{SandboxRegistry, SweepReport};
pub use resolver::{DependencyResolver, InstallReport};
pub use sandbox::{SandboxId, SandboxInfo, SandboxStatus};
pub use service::SandboxService;
pub use workspace::{Workspace, WorkspaceEntry};
