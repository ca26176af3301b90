use chrono::{DateTime, Utc};
use rocket_okapi::okapi::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

// ===== Account Models =====

/// Connection identity for one mailbox. Loaded from configuration and never
/// mutated afterwards.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailAccount {
    pub id: String,
    pub email: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub tls: bool,
}

impl fmt::Debug for MailAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailAccount")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("tls", &self.tls)
            .finish()
    }
}

// ===== Document Models =====

/// Classification label attached to every indexed message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Category {
    Interested,
    #[serde(rename = "Meeting Booked")]
    MeetingBooked,
    #[serde(rename = "Not Interested")]
    NotInterested,
    Spam,
    #[serde(rename = "Out of Office")]
    OutOfOffice,
    #[default]
    Uncategorized,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Interested => "Interested",
            Category::MeetingBooked => "Meeting Booked",
            Category::NotInterested => "Not Interested",
            Category::Spam => "Spam",
            Category::OutOfOffice => "Out of Office",
            Category::Uncategorized => "Uncategorized",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "interested" => Ok(Category::Interested),
            "meeting booked" | "meeting_booked" => Ok(Category::MeetingBooked),
            "not interested" | "not_interested" => Ok(Category::NotInterested),
            "spam" => Ok(Category::Spam),
            "out of office" | "out_of_office" => Ok(Category::OutOfOffice),
            "uncategorized" | "unclassified" => Ok(Category::Uncategorized),
            other => Err(format!("unknown category `{other}`")),
        }
    }
}

/// One ingested message as stored in the search index.
///
/// `id` is the idempotency key for every store write: submitting the same id
/// again overwrites the stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmailDocument {
    pub id: String,
    pub account_id: String,
    pub folder: String,
    pub subject: String,
    pub body: String,
    pub from: String,
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cc: Option<Vec<String>>,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub ai_category: Category,
    pub indexed_at: DateTime<Utc>,
    #[serde(default)]
    pub has_attachments: bool,
    #[serde(default)]
    pub flags: Vec<String>,
}

/// Partial update applied to a stored document. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DocumentUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_category: Option<Category>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_attachments: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<Vec<String>>,
}

impl DocumentUpdate {
    pub fn category(category: Category) -> Self {
        Self {
            ai_category: Some(category),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Apply the set fields onto `document`.
    pub fn apply_to(&self, document: &mut EmailDocument) {
        if let Some(folder) = &self.folder {
            document.folder = folder.clone();
        }
        if let Some(subject) = &self.subject {
            document.subject = subject.clone();
        }
        if let Some(body) = &self.body {
            document.body = body.clone();
        }
        if let Some(category) = self.ai_category {
            document.ai_category = category;
        }
        if let Some(has_attachments) = self.has_attachments {
            document.has_attachments = has_attachments;
        }
        if let Some(flags) = &self.flags {
            document.flags = flags.clone();
        }
    }
}

// ===== Bulk / Stats Models =====

/// Store-side rejection of a single item inside a bulk request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BulkItemError {
    pub status: u16,
    pub kind: String,
    pub reason: String,
}

impl fmt::Display for BulkItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind, self.status, self.reason)
    }
}

/// A rejected bulk item mapped back to the document that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BulkFailure {
    pub email_id: String,
    pub error: BulkItemError,
}

/// Outcome of one bulk upsert call that reached the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BulkIndexResult {
    pub success: usize,
    pub failed: usize,
    pub errors: Vec<BulkFailure>,
}

/// Read-only aggregate over the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    pub total_emails: u64,
    pub index_size: String,
    pub index_size_bytes: u64,
    pub category_counts: HashMap<String, u64>,
}

/// Render a byte count as a short human readable string (base 1024).
pub fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 Bytes".to_string();
    }

    const UNITS: [&str; 5] = ["Bytes", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rounded = (value * 100.0).round() / 100.0;
    format!("{} {}", rounded, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_serializes_with_display_names() {
        let json = serde_json::to_string(&Category::MeetingBooked).unwrap();
        assert_eq!(json, "\"Meeting Booked\"");
        assert_eq!(Category::default(), Category::Uncategorized);
        assert_eq!("out of office".parse::<Category>(), Ok(Category::OutOfOffice));
        assert!("nope".parse::<Category>().is_err());
    }

    #[test]
    fn account_debug_redacts_password() {
        let account = MailAccount {
            id: "account-1".into(),
            email: "a@example.com".into(),
            host: "imap.example.com".into(),
            port: 993,
            user: "a@example.com".into(),
            password: "hunter2".into(),
            tls: true,
        };

        let rendered = format!("{account:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!serde_json::to_string(&account).unwrap().contains("hunter2"));
    }

    #[test]
    fn update_applies_only_set_fields() {
        let mut doc = EmailDocument {
            id: "1".into(),
            account_id: "account-1".into(),
            folder: "INBOX".into(),
            subject: "Hello".into(),
            body: "Body".into(),
            from: "x@example.com".into(),
            to: vec![],
            cc: None,
            date: Utc::now(),
            ai_category: Category::Uncategorized,
            indexed_at: Utc::now(),
            has_attachments: false,
            flags: vec![],
        };

        DocumentUpdate::category(Category::Spam).apply_to(&mut doc);
        assert_eq!(doc.ai_category, Category::Spam);
        assert_eq!(doc.subject, "Hello");
        assert!(DocumentUpdate::default().is_empty());
    }

    #[test]
    fn format_bytes_uses_binary_units() {
        assert_eq!(format_bytes(0), "0 Bytes");
        assert_eq!(format_bytes(512), "512 Bytes");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1024 * 1024), "1 MB");
    }
}
