use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::notification::ProviderCode;

/// Outcome of a single provider attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum HistoryStatus {
    Delivered,
    Failure,
}

impl HistoryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryStatus::Delivered => "DELIVERED",
            HistoryStatus::Failure => "FAILURE",
        }
    }
}

/// Append-only record of one provider attempt. Never modified.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub notification_id: i64,
    pub sent_date: NaiveDateTime,
    pub status_code: HistoryStatus,
    pub provider_code: ProviderCode,
    pub response_id: Option<String>,
    pub message: Option<String>,
}

/// Data for a history append. The timestamp is assigned by the repository so
/// it matches the status write in the same transaction.
#[derive(Debug, Clone)]
pub struct NewHistoryEntry {
    pub status_code: HistoryStatus,
    pub provider_code: ProviderCode,
    pub response_id: Option<String>,
    pub message: Option<String>,
}
