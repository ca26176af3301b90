use crate::models::EmailDocument;

/// Outbound events of the supervisor, consumed through its channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    /// A session for this account finished connecting.
    Ready { account_id: String },
    /// The account exhausted its retry budget. No further automatic retries.
    Failed { account_id: String, cause: String },
    /// A message observed by a live session, ready for indexing.
    Document(Box<EmailDocument>),
}

impl SupervisorEvent {
    pub fn account_id(&self) -> &str {
        match self {
            SupervisorEvent::Ready { account_id } | SupervisorEvent::Failed { account_id, .. } => {
                account_id
            }
            SupervisorEvent::Document(document) => &document.account_id,
        }
    }
}
