use super::events::SupervisorEvent;
use super::session::{SessionConnector, SessionMessage, SessionSignal, SessionSink};
use super::state::{LifecycleState, StatusCell};
use crate::config::SupervisorConfig;
use crate::models::MailAccount;
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Command {
    Connect,
    /// Reconnect now unless permanently failed, skipping any scheduled delay.
    ForceReconnect,
    /// Reconnect now only if the account is neither ready nor permanently failed.
    Repair,
}

struct ActiveSession {
    generation: u64,
    cancel: CancellationToken,
}

/// Runtime record for one account. Only the owning actor touches it.
struct ConnectionState {
    lifecycle: LifecycleState,
    failures: u32,
    retry_at: Option<Instant>,
    generation: u64,
    session: Option<ActiveSession>,
    last_error: Option<String>,
}

pub(crate) struct AccountActor {
    account: Arc<MailAccount>,
    account_id: Arc<str>,
    connector: Arc<dyn SessionConnector>,
    config: SupervisorConfig,
    status: Arc<RwLock<StatusCell>>,
    events: UnboundedSender<SupervisorEvent>,
    signals_tx: UnboundedSender<SessionMessage>,
    signals_rx: UnboundedReceiver<SessionMessage>,
    commands: UnboundedReceiver<Command>,
    cancel: CancellationToken,
    state: ConnectionState,
}

impl AccountActor {
    pub(crate) fn new(
        account: Arc<MailAccount>,
        connector: Arc<dyn SessionConnector>,
        config: SupervisorConfig,
        status: Arc<RwLock<StatusCell>>,
        events: UnboundedSender<SupervisorEvent>,
        commands: UnboundedReceiver<Command>,
        cancel: CancellationToken,
    ) -> Self {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let account_id: Arc<str> = Arc::from(account.id.as_str());

        Self {
            account,
            account_id,
            connector,
            config,
            status,
            events,
            signals_tx,
            signals_rx,
            commands,
            cancel,
            state: ConnectionState {
                lifecycle: LifecycleState::Disconnected,
                failures: 0,
                retry_at: None,
                generation: 0,
                session: None,
                last_error: None,
            },
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let retry_at = self.state.retry_at;

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(message) = self.signals_rx.recv() => self.handle_signal(message),
                _ = wait_for_retry(retry_at) => {
                    debug!("{}: retry timer fired", self.account_id);
                    self.state.retry_at = None;
                    self.connect();
                }
            }
        }

        self.close_session();
        self.state.retry_at = None;
        if !self.state.lifecycle.is_terminal() {
            self.state.lifecycle = LifecycleState::Disconnected;
        }
        self.publish();
        debug!("{}: supervisor task stopped", self.account_id);
    }

    fn handle_command(&mut self, command: Command) {
        if self.state.lifecycle.is_terminal() {
            debug!(
                "{}: ignoring {:?}, account is permanently failed",
                self.account_id, command
            );
            return;
        }

        match command {
            Command::Connect => self.connect(),
            Command::ForceReconnect => {
                info!("{}: forced reconnect", self.account_id);
                self.connect();
            }
            Command::Repair if self.state.lifecycle.needs_repair() => {
                warn!(
                    "{}: health check found account {}, reconnecting",
                    self.account_id, self.state.lifecycle
                );
                self.connect();
            }
            Command::Repair => {
                debug!("{}: health check passed", self.account_id);
            }
        }
    }

    fn handle_signal(&mut self, message: SessionMessage) {
        let current = self
            .state
            .session
            .as_ref()
            .is_some_and(|session| session.generation == message.generation);
        if !current {
            debug!(
                "{}: ignoring {:?} from superseded session {}",
                self.account_id, message.signal, message.generation
            );
            return;
        }

        match message.signal {
            SessionSignal::Ready => self.on_ready(),
            SessionSignal::Error(cause) => self.on_error(cause),
            SessionSignal::End => {
                warn!("{}: connection ended", self.account_id);
                self.close_session();
                self.schedule_fixed_retry();
            }
            SessionSignal::Timeout => {
                warn!("{}: connection timed out, closing it", self.account_id);
                self.close_session();
                self.schedule_fixed_retry();
            }
            SessionSignal::Closed => {
                warn!(
                    "{}: session exited without reporting why",
                    self.account_id
                );
                self.state.session = None;
                self.set_lifecycle(LifecycleState::Disconnected);
            }
        }
    }

    fn connect(&mut self) {
        self.close_session();
        self.state.retry_at = None;
        self.state.generation += 1;

        let generation = self.state.generation;
        let cancel = self.cancel.child_token();
        self.state.session = Some(ActiveSession {
            generation,
            cancel: cancel.clone(),
        });
        self.set_lifecycle(LifecycleState::Connecting);
        info!(
            "{}: connecting to {}:{} (attempt {})",
            self.account_id, self.account.host, self.account.port, generation
        );

        let sink = SessionSink::new(
            self.account_id.clone(),
            generation,
            self.signals_tx.clone(),
            self.events.clone(),
        );
        let connector = self.connector.clone();
        let account = self.account.clone();
        tokio::spawn(async move {
            connector.run(account, sink.clone(), cancel).await;
            sink.closed();
        });
    }

    fn on_ready(&mut self) {
        self.state.failures = 0;
        self.state.last_error = None;
        self.set_lifecycle(LifecycleState::Ready);
        info!("{}: connection ready", self.account_id);

        let _ = self.events.send(SupervisorEvent::Ready {
            account_id: self.account.id.clone(),
        });
    }

    fn on_error(&mut self, cause: String) {
        self.close_session();
        self.state.last_error = Some(cause.clone());
        self.set_lifecycle(LifecycleState::Error);

        if self.state.failures >= self.config.max_attempts {
            error!(
                "{}: giving up after {} reconnect attempts: {}",
                self.account_id, self.state.failures, cause
            );
            self.state.retry_at = None;
            self.set_lifecycle(LifecycleState::PermanentlyFailed);
            let _ = self.events.send(SupervisorEvent::Failed {
                account_id: self.account.id.clone(),
                cause,
            });
            return;
        }

        let delay = backoff_delay(self.config.base_delay, self.state.failures);
        self.state.failures += 1;
        warn!(
            "{}: connection error: {}; reconnect attempt {}/{} in {:?}",
            self.account_id, cause, self.state.failures, self.config.max_attempts, delay
        );
        self.schedule_retry(delay);
    }

    fn schedule_fixed_retry(&mut self) {
        info!(
            "{}: reconnecting in {:?}",
            self.account_id, self.config.base_delay
        );
        self.schedule_retry(self.config.base_delay);
    }

    fn schedule_retry(&mut self, delay: Duration) {
        self.state.retry_at = Some(Instant::now() + delay);
        self.set_lifecycle(LifecycleState::Reconnecting);
    }

    fn close_session(&mut self) {
        if let Some(session) = self.state.session.take() {
            session.cancel.cancel();
        }
    }

    fn set_lifecycle(&mut self, lifecycle: LifecycleState) {
        if self.state.lifecycle != lifecycle {
            debug!(
                "{}: {} -> {}",
                self.account_id, self.state.lifecycle, lifecycle
            );
        }
        self.state.lifecycle = lifecycle;
        self.publish();
    }

    fn publish(&self) {
        let mut status = self.status.write();
        status.state = self.state.lifecycle;
        status.consecutive_failures = self.state.failures;
        status.last_error = self.state.last_error.clone();
        status.retry_at = self.state.retry_at;
    }
}

/// `base * 2^failures`, saturating instead of overflowing.
pub(crate) fn backoff_delay(base: Duration, failures: u32) -> Duration {
    let multiplier = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
    base.saturating_mul(multiplier)
}

async fn wait_for_retry(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
