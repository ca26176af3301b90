use crate::supervisor::{ConnectionSupervisor, LifecycleState};
use log::{debug, info, warn};
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;

/// Outcome of one health sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub checked: usize,
    pub healthy: usize,
    pub repaired: Vec<String>,
    pub permanently_failed: Vec<String>,
}

/// Periodic safety net that pushes stuck accounts back to connecting.
///
/// It never resets failure counters and never touches permanently failed
/// accounts; the per-account retry timers stay in charge of normal recovery.
#[derive(Clone)]
pub struct HealthMonitor {
    supervisor: ConnectionSupervisor,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(supervisor: ConnectionSupervisor, interval: Duration) -> Self {
        Self {
            supervisor,
            interval,
        }
    }

    pub fn sweep(&self) -> HealthReport {
        debug!("health check: sweeping connections");
        let mut report = HealthReport::default();

        for status in self.supervisor.all_statuses() {
            report.checked += 1;
            match status.state {
                LifecycleState::Ready => report.healthy += 1,
                LifecycleState::PermanentlyFailed => {
                    report.permanently_failed.push(status.account_id)
                }
                state => {
                    warn!(
                        "health check: {} is {}, requesting reconnect",
                        status.account_id, state
                    );
                    // the account may have been removed since the snapshot
                    if self.supervisor.repair(&status.account_id).is_ok() {
                        report.repaired.push(status.account_id);
                    }
                }
            }
        }

        info!(
            "health check: {} checked, {} healthy, {} repaired, {} permanently failed",
            report.checked,
            report.healthy,
            report.repaired.len(),
            report.permanently_failed.len()
        );
        report
    }

    /// Run [`sweep`](Self::sweep) every interval until `shutdown` fires.
    /// The first sweep happens one full interval after start.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            info!("health monitor started ({:?} interval)", self.interval);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                }
            }

            info!("health monitor stopped");
        })
    }
}
