//! Sandbox identity, lifecycle states and the registry's per-sandbox record.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::warn;
use uuid::Uuid;

use crate::kernel::Kernel;
use crate::workspace::Workspace;

/// Opaque, globally unique sandbox identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(Uuid);

impl SandboxId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SandboxId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Lifecycle state of a sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Provisioning,
    Active,
    Closing,
    Closed,
    Expired,
    Degraded,
}

impl SandboxStatus {
    /// Provisioning -> Active -> {Closing -> Closed | Expired -> Closed}.
    /// Any live state may fall to Degraded; Degraded only reaches Closed.
    /// Provisioning may go straight to Closed when provisioning is rolled back.
    pub fn can_transition_to(self, next: SandboxStatus) -> bool {
        use SandboxStatus::*;
        match (self, next) {
            (Provisioning, Active) | (Provisioning, Closing) | (Provisioning, Closed) => true,
            (Active, Closing) | (Active, Expired) => true,
            (Closing, Closed) | (Expired, Closed) => true,
            (Degraded, Closed) => true,
            (Closed, _) | (Degraded, _) => false,
            (_, Degraded) => true,
            _ => false,
        }
    }

    /// Whether teardown has started or finished
    pub fn is_retiring(self) -> bool {
        matches!(
            self,
            SandboxStatus::Closing | SandboxStatus::Closed | SandboxStatus::Expired
        )
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxStatus::Provisioning => "provisioning",
            SandboxStatus::Active => "active",
            SandboxStatus::Closing => "closing",
            SandboxStatus::Closed => "closed",
            SandboxStatus::Expired => "expired",
            SandboxStatus::Degraded => "degraded",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of one sandbox
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxInfo {
    pub id: SandboxId,
    pub status: SandboxStatus,
    pub created_at: SystemTime,
    pub last_active_at: SystemTime,
}

/// Why provisioning did not produce an Active sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ProvisionFailure {
    TimedOut(Duration),
    Failed(String),
}

/// Registry-owned record for one sandbox.
///
/// `lifecycle` serializes structural transitions (provisioning, close, expiry);
/// `status` publishes the current state to waiters without taking that lock.
pub(crate) struct SandboxRecord {
    pub id: SandboxId,
    pub created_at: SystemTime,
    pub env_path: PathBuf,
    pub workspace: Workspace,
    pub lifecycle: Arc<tokio::sync::Mutex<()>>,
    status: watch::Sender<SandboxStatus>,
    last_active_at: Mutex<SystemTime>,
    in_flight: AtomicUsize,
    kernel: Mutex<Option<Arc<dyn Kernel>>>,
    failure: Mutex<Option<ProvisionFailure>>,
}

impl SandboxRecord {
    pub fn new(id: SandboxId, env_path: PathBuf, workspace_root: PathBuf) -> Self {
        let now = SystemTime::now();
        let (status, _) = watch::channel(SandboxStatus::Provisioning);
        Self {
            id,
            created_at: now,
            env_path,
            workspace: Workspace::new(workspace_root),
            lifecycle: Arc::new(tokio::sync::Mutex::new(())),
            status,
            last_active_at: Mutex::new(now),
            in_flight: AtomicUsize::new(0),
            kernel: Mutex::new(None),
            failure: Mutex::new(None),
        }
    }

    pub fn status(&self) -> SandboxStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SandboxStatus> {
        self.status.subscribe()
    }

    /// Apply a transition; callers hold `lifecycle`. Invalid transitions are refused.
    pub fn transition(&self, next: SandboxStatus) -> bool {
        let current = self.status();
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            warn!(
                "[SANDBOX] Refused transition {} -> {} for sandbox {}",
                current, next, self.id
            );
            return false;
        }
        self.status.send_replace(next);
        true
    }

    pub fn touch(&self) {
        *self
            .last_active_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = SystemTime::now();
    }

    pub fn last_active_at(&self) -> SystemTime {
        *self
            .last_active_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn idle_for(&self, now: SystemTime) -> Duration {
        now.duration_since(self.last_active_at()).unwrap_or_default()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Mark an operation in progress until the guard drops
    pub fn begin_activity(&self) -> ActivityGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touch();
        ActivityGuard { record: self }
    }

    pub fn kernel(&self) -> Option<Arc<dyn Kernel>> {
        self.kernel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_kernel(&self, kernel: Arc<dyn Kernel>) {
        *self.kernel.lock().unwrap_or_else(PoisonError::into_inner) = Some(kernel);
    }

    pub fn take_kernel(&self) -> Option<Arc<dyn Kernel>> {
        self.kernel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn failure(&self) -> Option<ProvisionFailure> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set_failure(&self, reason: ProvisionFailure) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
    }

    pub fn info(&self) -> SandboxInfo {
        SandboxInfo {
            id: self.id,
            status: self.status(),
            created_at: self.created_at,
            last_active_at: self.last_active_at(),
        }
    }
}

pub(crate) struct ActivityGuard<'a> {
    record: &'a SandboxRecord,
}

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        self.record.touch();
        self.record.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SandboxStatus::*;

    fn record() -> SandboxRecord {
        SandboxRecord::new(
            SandboxId::new(),
            PathBuf::from("/tmp/env"),
            PathBuf::from("/tmp/workspace"),
        )
    }

    #[test]
    fn test_ids_parse_back() {
        let id = SandboxId::new();
        let parsed: SandboxId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-sandbox".parse::<SandboxId>().is_err());
    }

    #[test]
    fn test_lifecycle_transitions() {
        assert!(Provisioning.can_transition_to(Active));
        assert!(Active.can_transition_to(Closing));
        assert!(Active.can_transition_to(Expired));
        assert!(Closing.can_transition_to(Closed));
        assert!(Expired.can_transition_to(Closed));
        assert!(Active.can_transition_to(Degraded));
        assert!(Provisioning.can_transition_to(Degraded));

        assert!(Degraded.can_transition_to(Closed));
        assert!(!Degraded.can_transition_to(Active));
        assert!(!Degraded.can_transition_to(Closing));
        assert!(!Closed.can_transition_to(Active));
        assert!(!Closed.can_transition_to(Degraded));
        assert!(!Active.can_transition_to(Provisioning));
        assert!(!Expired.can_transition_to(Active));
    }

    #[test]
    fn test_record_refuses_invalid_transition() {
        let record = record();
        assert!(record.transition(Active));
        assert!(record.transition(Degraded));
        assert!(!record.transition(Active));
        assert_eq!(record.status(), Degraded);
        assert!(record.transition(Closed));
    }

    #[test]
    fn test_activity_guard_tracks_in_flight() {
        let record = record();
        assert_eq!(record.in_flight(), 0);
        {
            let _a = record.begin_activity();
            let _b = record.begin_activity();
            assert_eq!(record.in_flight(), 2);
        }
        assert_eq!(record.in_flight(), 0);
        assert!(record.idle_for(SystemTime::now()) < Duration::from_secs(5));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&Provisioning).unwrap(), "\"provisioning\"");
        assert_eq!(Degraded.to_string(), "degraded");
    }
}
