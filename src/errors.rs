use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Sandbox not found: {0}")]
    SandboxNotFound(String),

    #[error("File not found in workspace: {0}")]
    FileNotFound(String),

    #[error("Sandbox was not ready within {0:?}")]
    ProvisionTimeout(Duration),

    #[error("Provisioning failed for sandbox {id}: {reason}")]
    ProvisionFailed { id: String, reason: String },

    #[error("Failed to clone base environment: {0}")]
    CloneFailure(String),

    #[error("Kernel failed to start: {0}")]
    KernelStartFailure(String),

    #[error("Path rejected: {0}")]
    PathRejected(String),

    #[error("Sandbox is busy: execution queue is full")]
    Busy,

    #[error("Execution timeout exceeded ({0:?})")]
    ExecutionTimeout(Duration),

    #[error("Kernel crashed: {0}")]
    KernelCrashed(String),

    #[error("Sandbox {0} is degraded; only close is allowed")]
    Degraded(String),

    #[error("Package installation failed: {0}")]
    InstallFailure(String),

    #[error("Failed to build base environment mirror: {0}")]
    MirrorBuild(String),

    #[error("Python not installed or not found in PATH")]
    PythonNotFound,

    #[error("Dependency resolver not found: {0}")]
    ResolverNotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Kernel protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Background task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl SandboxError {
    /// Whether the error leaves the kernel unusable, which degrades its sandbox.
    pub fn is_kernel_fatal(&self) -> bool {
        matches!(self, SandboxError::KernelCrashed(_))
    }

    /// Short stable code for host protocols.
    pub fn code(&self) -> &'static str {
        match self {
            SandboxError::SandboxNotFound(_) | SandboxError::FileNotFound(_) => "not_found",
            SandboxError::ProvisionTimeout(_) => "provision_timeout",
            SandboxError::ProvisionFailed { .. } | SandboxError::CloneFailure(_) => {
                "provision_failed"
            }
            SandboxError::KernelStartFailure(_) => "kernel_start_failure",
            SandboxError::PathRejected(_) => "path_rejected",
            SandboxError::Busy => "busy",
            SandboxError::ExecutionTimeout(_) => "execution_timeout",
            SandboxError::KernelCrashed(_) => "kernel_crashed",
            SandboxError::Degraded(_) => "degraded",
            SandboxError::InstallFailure(_) => "install_failure",
            SandboxError::MirrorBuild(_) => "mirror_build",
            SandboxError::PythonNotFound | SandboxError::ResolverNotFound(_) => "not_installed",
            SandboxError::InvalidConfig(_) => "invalid_config",
            SandboxError::Protocol(_) => "protocol",
            SandboxError::IoError(_)
            | SandboxError::JsonError(_)
            | SandboxError::TaskFailed(_)
            | SandboxError::InternalError(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_fatal_classification() {
        assert!(SandboxError::KernelCrashed("eof".into()).is_kernel_fatal());
        assert!(!SandboxError::ExecutionTimeout(Duration::from_secs(1)).is_kernel_fatal());
        assert!(!SandboxError::Busy.is_kernel_fatal());
    }

    #[test]
    fn test_not_found_codes_share_a_code() {
        assert_eq!(SandboxError::SandboxNotFound("a".into()).code(), "not_found");
        assert_eq!(SandboxError::FileNotFound("f.txt".into()).code(), "not_found");
        assert_eq!(SandboxError::PathRejected("..".into()).code(), "path_rejected");
    }
}
