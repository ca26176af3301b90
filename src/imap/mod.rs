//! IMAP transport: live mailbox sessions and RFC 5322 parsing.

pub mod connector;
pub mod parser;

pub use connector::{ImapConnector, SessionOutcome};
pub use parser::{MessageContext, ParseMessageError, document_id, parse_message};
