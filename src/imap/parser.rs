//! RFC 5322 message parsing into [`EmailDocument`]s.
//!
//! Parsing is lenient about headers. A missing subject becomes `(No Subject)`,
//! a sender that is not a single mailbox is kept as its raw header text, and
//! an unreadable date becomes the time of ingestion. A message without a
//! text/plain part falls back to its root body. Only messages whose MIME
//! structure cannot be parsed at all are rejected.

use crate::models::{Category, EmailDocument};
use chrono::{DateTime, Utc};
use mailparse::{DispositionType, MailHeaderMap, ParsedMail, parse_mail};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Where a raw message came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    pub account_id: String,
    pub folder: String,
    pub uid: u32,
    pub flags: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ParseMessageError {
    #[error("failed to parse MIME structure: {0}")]
    MimeParse(#[from] mailparse::MailParseError),
}

/// Remove NUL bytes and surrounding whitespace.
fn sanitize_text(text: &str) -> String {
    text.replace('\0', "").trim().to_string()
}

fn normalize_message_id(msg_id: Option<String>) -> Option<String> {
    msg_id.and_then(|id| {
        let cleaned = id.trim().trim_matches(&['<', '>'][..]).trim();
        if cleaned.is_empty() {
            None
        } else {
            Some(sanitize_text(cleaned))
        }
    })
}

fn hex_digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Stable document id: the same message seen again maps to the same id.
pub fn document_id(context: &MessageContext, message_id: Option<&str>) -> String {
    match message_id {
        Some(message_id) => hex_digest(&[&context.account_id, message_id]),
        None => hex_digest(&[
            &context.account_id,
            &context.folder,
            &context.uid.to_string(),
        ]),
    }
}

fn parse_addresses(header_value: &str) -> Vec<String> {
    let mut addresses = Vec::new();
    if let Ok(list) = mailparse::addrparse(header_value) {
        for entry in list.iter() {
            match entry {
                mailparse::MailAddr::Single(info) => addresses.push(info.addr.to_lowercase()),
                mailparse::MailAddr::Group(group) => addresses.extend(
                    group.addrs.iter().map(|info| info.addr.to_lowercase()),
                ),
            }
        }
    }
    addresses
}

/// `Name <address>` for a single mailbox, otherwise the header as written
/// (group syntax such as `undisclosed-recipients:;` or malformed values).
fn parse_sender(header_value: &str) -> String {
    let single = mailparse::addrparse(header_value)
        .ok()
        .and_then(|list| match list.iter().next() {
            Some(mailparse::MailAddr::Single(info)) => Some(info.clone()),
            _ => None,
        });

    match single {
        Some(info) => {
            let address = info.addr.to_lowercase();
            match info.display_name.as_deref().map(sanitize_text) {
                Some(name) if !name.is_empty() => format!("{name} <{address}>"),
                _ => address,
            }
        }
        None => sanitize_text(header_value),
    }
}

fn parse_date(raw: Option<String>) -> DateTime<Utc> {
    let raw = raw.unwrap_or_default();
    if raw.trim().is_empty() {
        return Utc::now();
    }

    match dateparser::parse(&raw) {
        Ok(date) => date.with_timezone(&Utc),
        Err(err) => {
            log::debug!("unparseable Date header `{}`: {}", raw, err);
            Utc::now()
        }
    }
}

fn is_attachment(part: &ParsedMail<'_>) -> bool {
    part.get_content_disposition().disposition == DispositionType::Attachment
}

fn find_plain_text(part: &ParsedMail<'_>) -> Option<String> {
    if part.subparts.is_empty() {
        if part.ctype.mimetype == "text/plain" && !is_attachment(part) {
            return part.get_body().ok();
        }
        return None;
    }

    part.subparts.iter().find_map(find_plain_text)
}

fn has_attachments(part: &ParsedMail<'_>) -> bool {
    is_attachment(part) || part.subparts.iter().any(has_attachments)
}

/// Build an [`EmailDocument`] from raw message bytes.
pub fn parse_message(raw: &[u8], context: &MessageContext) -> Result<EmailDocument, ParseMessageError> {
    let parsed = parse_mail(raw)?;

    let from = parsed
        .headers
        .get_first_value("From")
        .map(|value| parse_sender(&value))
        .unwrap_or_default();

    let message_id = normalize_message_id(parsed.headers.get_first_value("Message-ID"));

    let subject = parsed
        .headers
        .get_first_value("Subject")
        .map(|s| sanitize_text(&s))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "(No Subject)".to_string());

    let body = find_plain_text(&parsed)
        .or_else(|| parsed.get_body().ok())
        .unwrap_or_default();

    let to = parsed
        .headers
        .get_first_value("To")
        .map(|value| parse_addresses(&value))
        .unwrap_or_default();

    let cc = parsed
        .headers
        .get_first_value("Cc")
        .map(|value| parse_addresses(&value))
        .filter(|addresses| !addresses.is_empty());

    Ok(EmailDocument {
        id: document_id(context, message_id.as_deref()),
        account_id: context.account_id.clone(),
        folder: context.folder.clone(),
        subject,
        body: sanitize_text(&body),
        from,
        to,
        cc,
        date: parse_date(parsed.headers.get_first_value("Date")),
        ai_category: Category::Uncategorized,
        indexed_at: Utc::now(),
        has_attachments: has_attachments(&parsed),
        flags: context.flags.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn context(uid: u32) -> MessageContext {
        MessageContext {
            account_id: "account-1".into(),
            folder: "INBOX".into(),
            uid,
            flags: vec!["\\Seen".into()],
        }
    }

    #[test]
    fn parses_simple_message() {
        let raw = concat!(
            "Message-ID: <abc@example.com>\r\n",
            "Subject: Quarterly numbers\r\n",
            "From: Alice Example <Alice@Example.com>\r\n",
            "To: bob@example.com, Carol <carol@example.com>\r\n",
            "Cc: dave@example.com\r\n",
            "Date: Tue, 14 May 2024 10:00:00 +0000\r\n",
            "\r\n",
            "Hello\0 there\r\n"
        );

        let doc = parse_message(raw.as_bytes(), &context(7)).unwrap();
        assert_eq!(doc.subject, "Quarterly numbers");
        assert_eq!(doc.from, "Alice Example <alice@example.com>");
        assert_eq!(doc.to, vec!["bob@example.com", "carol@example.com"]);
        assert_eq!(doc.cc, Some(vec!["dave@example.com".to_string()]));
        assert_eq!(doc.body, "Hello there");
        assert_eq!(doc.date, Utc.with_ymd_and_hms(2024, 5, 14, 10, 0, 0).unwrap());
        assert_eq!(doc.ai_category, Category::Uncategorized);
        assert_eq!(doc.flags, vec!["\\Seen".to_string()]);
        assert!(!doc.has_attachments);
        assert_eq!(doc.id.len(), 64);
    }

    #[test]
    fn id_is_stable_per_account_and_message_id() {
        let raw = "Message-ID: <same@example.com>\r\nFrom: a@example.com\r\n\r\nbody\r\n";
        let first = parse_message(raw.as_bytes(), &context(1)).unwrap();
        let again = parse_message(raw.as_bytes(), &context(99)).unwrap();
        assert_eq!(first.id, again.id);

        let other_account = MessageContext {
            account_id: "account-2".into(),
            ..context(1)
        };
        let other = parse_message(raw.as_bytes(), &other_account).unwrap();
        assert_ne!(first.id, other.id);
    }

    #[test]
    fn missing_message_id_falls_back_to_folder_and_uid() {
        let raw = "From: a@example.com\r\n\r\nbody\r\n";
        let doc = parse_message(raw.as_bytes(), &context(5)).unwrap();
        assert_eq!(doc.id, document_id(&context(5), None));
        assert_ne!(doc.id, document_id(&context(6), None));
        assert_eq!(doc.subject, "(No Subject)");
    }

    #[test]
    fn multipart_prefers_plain_text_and_detects_attachments() {
        let raw = concat!(
            "Message-ID: <multi@example.com>\r\n",
            "From: a@example.com\r\n",
            "Subject: Report\r\n",
            "Date: garbage\r\n",
            "Content-Type: multipart/mixed; boundary=\"outer\"\r\n",
            "\r\n",
            "--outer\r\n",
            "Content-Type: multipart/alternative; boundary=\"inner\"\r\n",
            "\r\n",
            "--inner\r\n",
            "Content-Type: text/html\r\n",
            "\r\n",
            "<p>html</p>\r\n",
            "--inner\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "plain body\r\n",
            "--inner--\r\n",
            "--outer\r\n",
            "Content-Type: application/pdf\r\n",
            "Content-Disposition: attachment; filename=\"report.pdf\"\r\n",
            "\r\n",
            "PDFDATA\r\n",
            "--outer--\r\n"
        );

        let before = Utc::now();
        let doc = parse_message(raw.as_bytes(), &context(3)).unwrap();
        assert_eq!(doc.body, "plain body");
        assert!(doc.has_attachments);
        assert!(doc.date >= before);
    }

    #[test]
    fn messages_without_a_mailbox_sender_are_still_indexed() {
        let raw = "Subject: nobody\r\n\r\nbody\r\n";
        let doc = parse_message(raw.as_bytes(), &context(9)).unwrap();
        assert_eq!(doc.from, "");
        assert_eq!(doc.subject, "nobody");

        let raw = "From: undisclosed-recipients:;\r\nSubject: bulk\r\n\r\nbody\r\n";
        let doc = parse_message(raw.as_bytes(), &context(10)).unwrap();
        assert_eq!(doc.from, "undisclosed-recipients:;");
        assert_eq!(doc.body, "body");
    }
}
