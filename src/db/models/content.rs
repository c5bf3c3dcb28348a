use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// The single content child of a notification. Immutable after creation.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Content {
    pub id: i64,
    pub notification_id: i64,
    pub subject: Option<String>,
    pub body: String,
    pub is_html: bool,
}
