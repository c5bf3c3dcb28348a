use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Ledger row collapsing retried ingress requests. A key seen again with the
/// same payload hash replays the original notification id; a different hash
/// is a conflict.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub idem_key: String,
    pub payload_hash: String,
    pub notification_id: i64,
    pub created_at: NaiveDateTime,
}
