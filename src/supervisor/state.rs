use rocket_okapi::okapi::schemars::JsonSchema;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tokio::time::Instant;

/// Connection lifecycle of one supervised account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum LifecycleState {
    Disconnected,
    Connecting,
    Ready,
    Error,
    Reconnecting,
    /// Retry budget exhausted. Only a fresh registration brings it back.
    PermanentlyFailed,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::PermanentlyFailed)
    }

    /// Whether the health sweep should push this account to reconnect.
    pub fn needs_repair(&self) -> bool {
        !matches!(
            self,
            LifecycleState::Ready | LifecycleState::PermanentlyFailed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Disconnected => "disconnected",
            LifecycleState::Connecting => "connecting",
            LifecycleState::Ready => "ready",
            LifecycleState::Error => "error",
            LifecycleState::Reconnecting => "reconnecting",
            LifecycleState::PermanentlyFailed => "permanentlyFailed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one account, safe to expose (no credentials).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatus {
    pub account_id: String,
    pub email: String,
    pub state: LifecycleState,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Milliseconds until the scheduled reconnect, when one is pending.
    pub next_retry_in_ms: Option<u64>,
}

/// Aggregate counters across every supervised account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorStatistics {
    pub total_accounts: usize,
    pub active_connections: usize,
    pub reconnecting: usize,
    pub permanently_failed: usize,
    /// Accounts that are not currently `ready`.
    pub failed_connections: usize,
    pub reconnect_attempts: BTreeMap<String, u32>,
}

impl SupervisorStatistics {
    pub(crate) fn from_statuses(statuses: &[AccountStatus]) -> Self {
        let mut stats = SupervisorStatistics {
            total_accounts: statuses.len(),
            ..Default::default()
        };

        for status in statuses {
            match status.state {
                LifecycleState::Ready => stats.active_connections += 1,
                LifecycleState::Reconnecting => stats.reconnecting += 1,
                LifecycleState::PermanentlyFailed => stats.permanently_failed += 1,
                _ => {}
            }
            stats
                .reconnect_attempts
                .insert(status.account_id.clone(), status.consecutive_failures);
        }

        stats.failed_connections = stats.total_accounts - stats.active_connections;
        stats
    }
}

/// Shared cell the account actor publishes into after every transition.
#[derive(Debug, Clone)]
pub(crate) struct StatusCell {
    pub account_id: String,
    pub email: String,
    pub state: LifecycleState,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub retry_at: Option<Instant>,
}

impl StatusCell {
    pub fn new(account_id: &str, email: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            email: email.to_string(),
            state: LifecycleState::Disconnected,
            consecutive_failures: 0,
            last_error: None,
            retry_at: None,
        }
    }

    pub fn snapshot(&self) -> AccountStatus {
        let now = Instant::now();
        AccountStatus {
            account_id: self.account_id.clone(),
            email: self.email.clone(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            last_error: self.last_error.clone(),
            next_retry_in_ms: self
                .retry_at
                .map(|at| at.saturating_duration_since(now).as_millis() as u64),
        }
    }
}
