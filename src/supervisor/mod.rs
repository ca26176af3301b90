//! Per-account connection supervision.
//!
//! Every registered account is owned by its own actor task. Session outcomes
//! drive the lifecycle: errors back off exponentially up to a retry budget,
//! clean ends and idle timeouts retry after the base delay.

mod actor;
pub mod events;
pub mod session;
pub mod state;

pub use crate::config::SupervisorConfig;
pub use events::SupervisorEvent;
pub use session::{SessionConnector, SessionSink};
pub use state::{AccountStatus, LifecycleState, SupervisorStatistics};

use crate::models::MailAccount;
use actor::{AccountActor, Command};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{info, warn};
use parking_lot::RwLock;
use state::StatusCell;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("unknown account `{0}`")]
    UnknownAccount(String),
    #[error("connection supervisor is shut down")]
    Stopped,
}

struct AccountSlot {
    status: Arc<RwLock<StatusCell>>,
    commands: UnboundedSender<Command>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct SupervisorInner {
    connector: Arc<dyn SessionConnector>,
    config: SupervisorConfig,
    accounts: DashMap<String, AccountSlot>,
    events: UnboundedSender<SupervisorEvent>,
    shutdown: CancellationToken,
}

/// Keeps one live session per registered [`MailAccount`].
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ConnectionSupervisor {
    /// Build a supervisor and the receiving end of its event channel.
    pub fn new(
        connector: Arc<dyn SessionConnector>,
        config: SupervisorConfig,
    ) -> (Self, UnboundedReceiver<SupervisorEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let supervisor = Self {
            inner: Arc::new(SupervisorInner {
                connector,
                config,
                accounts: DashMap::new(),
                events,
                shutdown: CancellationToken::new(),
            }),
        };
        (supervisor, receiver)
    }

    /// Start supervising `account` and connect it. Registering an id that is
    /// already supervised does nothing and returns `Ok(false)`.
    pub fn register(&self, account: MailAccount) -> Result<bool, SupervisorError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SupervisorError::Stopped);
        }

        let slot = match self.inner.accounts.entry(account.id.clone()) {
            Entry::Occupied(_) => {
                warn!("account {} is already registered", account.id);
                return Ok(false);
            }
            Entry::Vacant(slot) => slot,
        };

        let status = Arc::new(RwLock::new(StatusCell::new(&account.id, &account.email)));
        let (commands, command_rx) = mpsc::unbounded_channel();
        let cancel = self.inner.shutdown.child_token();

        info!("registering account {} ({})", account.id, account.email);
        let actor = AccountActor::new(
            Arc::new(account),
            self.inner.connector.clone(),
            self.inner.config.clone(),
            status.clone(),
            self.inner.events.clone(),
            command_rx,
            cancel.clone(),
        );
        let handle = tokio::spawn(actor.run());

        let _ = commands.send(Command::Connect);
        slot.insert(AccountSlot {
            status,
            commands,
            cancel,
            handle,
        });

        Ok(true)
    }

    /// Register each account in turn; returns how many were newly added.
    pub fn initialize_accounts(
        &self,
        accounts: impl IntoIterator<Item = MailAccount>,
    ) -> Result<usize, SupervisorError> {
        let mut added = 0;
        for account in accounts {
            if self.register(account)? {
                added += 1;
            }
        }
        info!("initialized {added} mail account(s)");
        Ok(added)
    }

    pub fn connect(&self, account_id: &str) -> Result<(), SupervisorError> {
        self.send(account_id, Command::Connect)
    }

    /// Reconnect one account right away, skipping any scheduled delay. The
    /// failure counter is left as is. Permanently failed accounts stay failed.
    pub fn reconnect(&self, account_id: &str) -> Result<(), SupervisorError> {
        self.send(account_id, Command::ForceReconnect)
    }

    /// Reconnect `account_id` if it is neither ready nor permanently failed.
    pub fn repair(&self, account_id: &str) -> Result<(), SupervisorError> {
        self.send(account_id, Command::Repair)
    }

    /// Force a reconnect of every account that is not permanently failed.
    /// Returns the number of accounts asked to reconnect.
    pub fn reconnect_all(&self) -> usize {
        info!("force reconnecting all accounts");
        let mut count = 0;
        for entry in self.inner.accounts.iter() {
            if entry.status.read().state.is_terminal() {
                continue;
            }
            if entry.commands.send(Command::ForceReconnect).is_ok() {
                count += 1;
            }
        }
        count
    }

    /// Stop supervising `account_id`: closes its session, cancels any pending
    /// retry and forgets its state.
    pub async fn remove(&self, account_id: &str) -> Result<(), SupervisorError> {
        let (_, slot) = self
            .inner
            .accounts
            .remove(account_id)
            .ok_or_else(|| SupervisorError::UnknownAccount(account_id.to_string()))?;

        slot.cancel.cancel();
        let _ = slot.handle.await;
        info!("removed account {account_id}");
        Ok(())
    }

    pub fn status_of(&self, account_id: &str) -> Option<AccountStatus> {
        self.inner
            .accounts
            .get(account_id)
            .map(|slot| slot.status.read().snapshot())
    }

    /// Every account's status, ordered by id.
    pub fn all_statuses(&self) -> Vec<AccountStatus> {
        let mut statuses: Vec<AccountStatus> = self
            .inner
            .accounts
            .iter()
            .map(|slot| slot.status.read().snapshot())
            .collect();
        statuses.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        statuses
    }

    pub fn account_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .accounts
            .iter()
            .map(|slot| slot.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn statistics(&self) -> SupervisorStatistics {
        SupervisorStatistics::from_statuses(&self.all_statuses())
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop every account actor and wait for them to wind down.
    pub async fn shutdown(&self) {
        info!("shutting down connection supervisor");
        self.inner.shutdown.cancel();

        let ids: Vec<String> = self
            .inner
            .accounts
            .iter()
            .map(|slot| slot.key().clone())
            .collect();
        for id in ids {
            if let Some((_, slot)) = self.inner.accounts.remove(&id) {
                let _ = slot.handle.await;
            }
        }

        info!("connection supervisor shut down");
    }

    fn send(&self, account_id: &str, command: Command) -> Result<(), SupervisorError> {
        let slot = self
            .inner
            .accounts
            .get(account_id)
            .ok_or_else(|| SupervisorError::UnknownAccount(account_id.to_string()))?;
        slot.commands
            .send(command)
            .map_err(|_| SupervisorError::Stopped)
    }
}
