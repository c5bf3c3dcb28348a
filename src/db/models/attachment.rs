use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Attachment bytes as stored. `content_size` is derived from the decoded
/// bytes at ingress, never trusted from input.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub content_id: i64,
    pub file_name: String,
    pub file_bytes: Vec<u8>,
    pub attach_order: i64,
    pub content_size: i64,
}

#[derive(Debug, Clone)]
pub struct CreateAttachment {
    pub file_name: String,
    pub file_bytes: Vec<u8>,
    pub attach_order: i64,
}
