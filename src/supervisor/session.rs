use super::events::SupervisorEvent;
use crate::models::{EmailDocument, MailAccount};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

/// Opens and drives one live mailbox session.
///
/// `run` reports what happens to the session through `sink` and returns when
/// the session is over. It must return promptly once `shutdown` is cancelled.
/// Returning without reporting `error`, `end` or `timeout` leaves the account
/// `disconnected` until the health sweep picks it up.
#[async_trait]
pub trait SessionConnector: Send + Sync + 'static {
    async fn run(&self, account: Arc<MailAccount>, sink: SessionSink, shutdown: CancellationToken);
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SessionSignal {
    Ready,
    Error(String),
    End,
    Timeout,
    /// The connector's `run` returned.
    Closed,
}

#[derive(Debug)]
pub(crate) struct SessionMessage {
    pub generation: u64,
    pub signal: SessionSignal,
}

/// Reporting handle given to a [`SessionConnector`] for a single attempt.
///
/// Signals are tagged with the attempt they belong to, so anything a
/// superseded session reports is ignored.
#[derive(Debug, Clone)]
pub struct SessionSink {
    account_id: Arc<str>,
    generation: u64,
    signals: UnboundedSender<SessionMessage>,
    events: UnboundedSender<SupervisorEvent>,
}

impl SessionSink {
    pub(crate) fn new(
        account_id: Arc<str>,
        generation: u64,
        signals: UnboundedSender<SessionMessage>,
        events: UnboundedSender<SupervisorEvent>,
    ) -> Self {
        Self {
            account_id,
            generation,
            signals,
            events,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn ready(&self) {
        self.signal(SessionSignal::Ready);
    }

    pub fn error(&self, cause: impl Into<String>) {
        self.signal(SessionSignal::Error(cause.into()));
    }

    pub fn end(&self) {
        self.signal(SessionSignal::End);
    }

    pub fn timeout(&self) {
        self.signal(SessionSignal::Timeout);
    }

    /// Hand a parsed message to the indexing side. Returns `false` once
    /// nobody is listening any more.
    pub fn deliver(&self, document: EmailDocument) -> bool {
        self.events
            .send(SupervisorEvent::Document(Box::new(document)))
            .is_ok()
    }

    pub(crate) fn closed(&self) {
        self.signal(SessionSignal::Closed);
    }

    fn signal(&self, signal: SessionSignal) {
        let _ = self.signals.send(SessionMessage {
            generation: self.generation,
            signal,
        });
    }
}
