use crate::registry::SandboxRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Periodic TTL sweep, tied to the service's lifetime
pub struct CleanupScheduler {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl CleanupScheduler {
    /// Sweep every `period`, first one `period` after start
    pub fn start(registry: Arc<SandboxRegistry>, period: Duration) -> Self {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("[CLEANUP] Sweeping every {:?}", period);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = registry.sweep_expired().await;
                        if report.expired.is_empty() && report.orphans_removed == 0 {
                            debug!("[CLEANUP] Nothing to clean up");
                        } else {
                            info!(
                                "[CLEANUP] Expired {} sandboxes, removed {} orphaned directories",
                                report.expired.len(),
                                report.orphans_removed
                            );
                        }
                    }
                }
            }
            debug!("[CLEANUP] Scheduler stopped");
        });
        Self {
            token,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancel the loop and wait for an in-progress sweep to finish
    pub async fn stop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("[CLEANUP] Scheduler task failed: {}", e);
            }
        }
    }
}

impl Drop for CleanupScheduler {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
