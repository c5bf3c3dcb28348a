use sqlx::SqlitePool;

use crate::db::models::IdempotencyRecord;
use crate::error::{AppError, AppResult};

pub struct IdempotencyRepository;

impl IdempotencyRepository {
    pub async fn find_by_key(
        pool: &SqlitePool,
        key: &str,
    ) -> AppResult<Option<IdempotencyRecord>> {
        sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            SELECT idem_key, payload_hash, notification_id, created_at
            FROM idempotency
            WHERE idem_key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }
}
