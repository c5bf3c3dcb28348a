use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::attachment::{Attachment, CreateAttachment};
use super::content::Content;
use super::history::HistoryEntry;

/// Delivery channel of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum NotificationType {
    Email,
    Text,
}

impl NotificationType {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationType::Email => "EMAIL",
            NotificationType::Text => "TEXT",
        }
    }
}

/// Lifecycle state of a notification.
///
/// `PENDING -> FORWARDED -> DELIVERED | FAILURE`, with `FORWARDED -> PENDING`
/// on a retriable delivery error. `DELIVERED` and `FAILURE` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum NotificationStatus {
    Pending,
    Forwarded,
    Delivered,
    Failure,
}

impl NotificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationStatus::Pending => "PENDING",
            NotificationStatus::Forwarded => "FORWARDED",
            NotificationStatus::Delivered => "DELIVERED",
            NotificationStatus::Failure => "FAILURE",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NotificationStatus::Delivered | NotificationStatus::Failure
        )
    }
}

impl TryFrom<&str> for NotificationStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "PENDING" => Ok(NotificationStatus::Pending),
            "FORWARDED" => Ok(NotificationStatus::Forwarded),
            "DELIVERED" => Ok(NotificationStatus::Delivered),
            "FAILURE" => Ok(NotificationStatus::Failure),
            _ => Err(format!("Invalid notification status: {}", value)),
        }
    }
}

/// Identifier of an outbound provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderCode {
    GcNotifyEmail,
    GcNotifySms,
    Smtp,
    Housing,
}

impl ProviderCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderCode::GcNotifyEmail => "GC_NOTIFY_EMAIL",
            ProviderCode::GcNotifySms => "GC_NOTIFY_SMS",
            ProviderCode::Smtp => "SMTP",
            ProviderCode::Housing => "HOUSING",
        }
    }
}

/// Root aggregate row. Recipients are stored comma-joined in submission
/// order; duplicates are kept as received.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub recipients: String,
    pub request_by: String,
    pub created_by: String,
    pub notification_type: NotificationType,
    pub status: NotificationStatus,
    pub provider_code: Option<ProviderCode>,
    pub attempt: i64,
    pub request_date: NaiveDateTime,
    pub sent_date: Option<NaiveDateTime>,
    pub lease_token: Option<String>,
    pub lease_expiry: Option<NaiveDateTime>,
    pub updated_at: NaiveDateTime,
}

impl Notification {
    pub fn recipient_list(&self) -> Vec<String> {
        self.recipients
            .split(',')
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect()
    }
}

/// Data required to create a notification with its content and attachments
/// in one unit.
#[derive(Debug, Clone)]
pub struct CreateNotification {
    pub recipients: Vec<String>,
    pub request_by: String,
    pub created_by: String,
    pub notification_type: NotificationType,
    pub subject: Option<String>,
    pub body: String,
    pub is_html: bool,
    pub attachments: Vec<CreateAttachment>,
}

/// A notification with its owned children loaded.
#[derive(Debug, Clone)]
pub struct NotificationDetail {
    pub notification: Notification,
    pub content: Content,
    pub attachments: Vec<Attachment>,
    pub history: Vec<HistoryEntry>,
}

impl NotificationDetail {
    pub fn total_attachment_bytes(&self) -> usize {
        self.attachments
            .iter()
            .map(|a| a.content_size as usize)
            .sum()
    }
}
