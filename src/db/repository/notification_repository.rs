use chrono::{NaiveDateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{
    Attachment, Content, CreateNotification, HistoryEntry, NewHistoryEntry, Notification,
    NotificationDetail, NotificationStatus, NotificationType, ProviderCode,
};
use crate::error::{AppError, AppResult};

const NOTIFICATION_COLUMNS: &str = "\
    id, recipients, request_by, created_by, notification_type, status, \
    provider_code, attempt, request_date, sent_date, lease_token, lease_expiry, updated_at";

/// Filter and paging for list queries. Results are ordered by
/// `(request_date DESC, id DESC)` so paging is deterministic.
#[derive(Debug, Clone, Default)]
pub struct NotificationFilter {
    pub status: Option<NotificationStatus>,
    pub request_by: Option<String>,
    /// Restrict to rows created by this caller (non-admin listing).
    pub created_by: Option<String>,
    pub notification_type: Option<NotificationType>,
    pub sent_after: Option<NaiveDateTime>,
    pub sent_before: Option<NaiveDateTime>,
    /// Substring match on recipients or subject.
    pub text: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

/// Repository for the notification aggregate: the root row, its content and
/// attachments, and the append-only history.
///
/// Implementation notes:
/// - Claiming uses an atomic single-statement guarded UPDATE with RETURNING,
///   so concurrent claims for the same id see at most one success.
/// - Status changes and their history append commit in one transaction with
///   a shared timestamp.
pub struct NotificationRepository;

impl NotificationRepository {
    /// Create a notification in `PENDING` with its content and attachments.
    /// When an idempotency key is supplied the ledger row is written in the
    /// same transaction, so a success response always implies a fully
    /// persisted aggregate.
    pub async fn create(
        pool: &SqlitePool,
        data: CreateNotification,
        idempotency: Option<(&str, &str)>,
    ) -> AppResult<Notification> {
        let now = Utc::now().naive_utc();
        let recipients = data.recipients.join(",");

        let mut tx = pool.begin().await.map_err(AppError::Database)?;

        let notification = sqlx::query_as::<_, Notification>(&format!(
            r#"
            INSERT INTO notification (
                recipients, request_by, created_by, notification_type,
                status, attempt, request_date, updated_at
            ) VALUES (?, ?, ?, ?, 'PENDING', 0, ?, ?)
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        ))
        .bind(&recipients)
        .bind(&data.request_by)
        .bind(&data.created_by)
        .bind(data.notification_type)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        let content_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO content (notification_id, subject, body, is_html)
            VALUES (?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(notification.id)
        .bind(&data.subject)
        .bind(&data.body)
        .bind(data.is_html)
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        for attachment in &data.attachments {
            let size = attachment.file_bytes.len() as i64;
            sqlx::query(
                r#"
                INSERT INTO attachment (content_id, file_name, file_bytes, attach_order, content_size)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(content_id)
            .bind(&attachment.file_name)
            .bind(&attachment.file_bytes)
            .bind(attachment.attach_order)
            .bind(size)
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;
        }

        if let Some((key, payload_hash)) = idempotency {
            sqlx::query(
                r#"
                INSERT INTO idempotency (idem_key, payload_hash, notification_id, created_at)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(key)
            .bind(payload_hash)
            .bind(notification.id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;
        }

        tx.commit().await.map_err(AppError::Database)?;

        Ok(notification)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: i64) -> AppResult<Option<Notification>> {
        sqlx::query_as::<_, Notification>(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notification WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Load the full aggregate: root row, content, attachments in
    /// presentation order, history in append order.
    pub async fn load_detail(pool: &SqlitePool, id: i64) -> AppResult<Option<NotificationDetail>> {
        let Some(notification) = Self::find_by_id(pool, id).await? else {
            return Ok(None);
        };

        let content = sqlx::query_as::<_, Content>(
            "SELECT id, notification_id, subject, body, is_html FROM content WHERE notification_id = ?",
        )
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        let attachments = sqlx::query_as::<_, Attachment>(
            r#"
            SELECT id, content_id, file_name, file_bytes, attach_order, content_size
            FROM attachment
            WHERE content_id = ?
            ORDER BY attach_order ASC, id ASC
            "#,
        )
        .bind(content.id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        let history = Self::list_history(pool, id).await?;

        Ok(Some(NotificationDetail {
            notification,
            content,
            attachments,
            history,
        }))
    }

    pub async fn list_history(pool: &SqlitePool, id: i64) -> AppResult<Vec<HistoryEntry>> {
        sqlx::query_as::<_, HistoryEntry>(
            r#"
            SELECT id, notification_id, sent_date, status_code, provider_code, response_id, message
            FROM history
            WHERE notification_id = ?
            ORDER BY sent_date ASC, id ASC
            "#,
        )
        .bind(id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// List notifications matching the filter plus the unpaged total.
    pub async fn list(
        pool: &SqlitePool,
        filter: &NotificationFilter,
    ) -> AppResult<(Vec<Notification>, i64)> {
        let text_pattern = filter.text.as_ref().map(|t| format!("%{}%", t));

        let rows = sqlx::query_as::<_, Notification>(&format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS}
            FROM notification n
            WHERE (? IS NULL OR n.status = ?)
              AND (? IS NULL OR n.request_by = ?)
              AND (? IS NULL OR n.created_by = ?)
              AND (? IS NULL OR n.notification_type = ?)
              AND (? IS NULL OR n.sent_date >= ?)
              AND (? IS NULL OR n.sent_date <= ?)
              AND (? IS NULL OR n.recipients LIKE ? OR EXISTS (
                    SELECT 1 FROM content c
                    WHERE c.notification_id = n.id AND c.subject LIKE ?))
            ORDER BY n.request_date DESC, n.id DESC
            LIMIT ? OFFSET ?
            "#
        ))
        .bind(filter.status)
        .bind(filter.status)
        .bind(&filter.request_by)
        .bind(&filter.request_by)
        .bind(&filter.created_by)
        .bind(&filter.created_by)
        .bind(filter.notification_type)
        .bind(filter.notification_type)
        .bind(filter.sent_after)
        .bind(filter.sent_after)
        .bind(filter.sent_before)
        .bind(filter.sent_before)
        .bind(&text_pattern)
        .bind(&text_pattern)
        .bind(&text_pattern)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM notification n
            WHERE (? IS NULL OR n.status = ?)
              AND (? IS NULL OR n.request_by = ?)
              AND (? IS NULL OR n.created_by = ?)
              AND (? IS NULL OR n.notification_type = ?)
              AND (? IS NULL OR n.sent_date >= ?)
              AND (? IS NULL OR n.sent_date <= ?)
              AND (? IS NULL OR n.recipients LIKE ? OR EXISTS (
                    SELECT 1 FROM content c
                    WHERE c.notification_id = n.id AND c.subject LIKE ?))
            "#,
        )
        .bind(filter.status)
        .bind(filter.status)
        .bind(&filter.request_by)
        .bind(&filter.request_by)
        .bind(&filter.created_by)
        .bind(&filter.created_by)
        .bind(filter.notification_type)
        .bind(filter.notification_type)
        .bind(filter.sent_after)
        .bind(filter.sent_after)
        .bind(filter.sent_before)
        .bind(filter.sent_before)
        .bind(&text_pattern)
        .bind(&text_pattern)
        .bind(&text_pattern)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok((rows, total))
    }

    /// Take the delivery lease: `PENDING -> FORWARDED`, or re-take an
    /// expired lease on a `FORWARDED` row. At most one concurrent caller
    /// succeeds; the rest observe `None`.
    pub async fn claim_for_dispatch(
        pool: &SqlitePool,
        id: i64,
        worker_token: &str,
        lease_ttl_seconds: u64,
    ) -> AppResult<Option<Notification>> {
        let now = Utc::now().naive_utc();
        let lease_expiry = now + chrono::Duration::seconds(lease_ttl_seconds as i64);

        sqlx::query_as::<_, Notification>(&format!(
            r#"
            UPDATE notification
            SET status = 'FORWARDED', lease_token = ?, lease_expiry = ?, updated_at = ?
            WHERE id = ?
              AND (status = 'PENDING'
                   OR (status = 'FORWARDED' AND lease_expiry IS NOT NULL AND lease_expiry <= ?))
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        ))
        .bind(worker_token)
        .bind(lease_expiry)
        .bind(now)
        .bind(id)
        .bind(now)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Give the lease back without recording an attempt, e.g. when shutdown
    /// interrupts a worker before it could call the provider. The row
    /// returns to `PENDING` with its attempt counter untouched.
    pub async fn release(pool: &SqlitePool, id: i64, worker_token: &str) -> AppResult<bool> {
        let now = Utc::now().naive_utc();
        let result = sqlx::query(
            r#"
            UPDATE notification
            SET status = 'PENDING', lease_token = NULL, lease_expiry = NULL, updated_at = ?
            WHERE id = ? AND status = 'FORWARDED' AND lease_token = ?
            "#,
        )
        .bind(now)
        .bind(id)
        .bind(worker_token)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    /// Atomic status transition plus history append, both stamped with the
    /// same timestamp. Only `FORWARDED` rows may move; anything else is an
    /// `InvalidTransition`. Moving back to `PENDING` counts the attempt;
    /// terminal transitions set `sent_date` and all of them drop the lease.
    pub async fn update_status(
        pool: &SqlitePool,
        id: i64,
        new_status: NotificationStatus,
        entry: NewHistoryEntry,
    ) -> AppResult<Notification> {
        if new_status == NotificationStatus::Forwarded {
            return Err(AppError::InvalidTransition(format!(
                "notification {}: FORWARDED is only reachable via claim_for_dispatch",
                id
            )));
        }

        let now = Utc::now().naive_utc();
        let is_terminal = new_status.is_terminal();
        let bump_attempt = new_status == NotificationStatus::Pending;

        let mut tx = pool.begin().await.map_err(AppError::Database)?;

        let updated = sqlx::query_as::<_, Notification>(&format!(
            r#"
            UPDATE notification
            SET status = ?,
                sent_date = CASE WHEN ? THEN ? ELSE sent_date END,
                attempt = attempt + CASE WHEN ? THEN 1 ELSE 0 END,
                lease_token = NULL,
                lease_expiry = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'FORWARDED'
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        ))
        .bind(new_status)
        .bind(is_terminal)
        .bind(now)
        .bind(bump_attempt)
        .bind(now)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        let Some(updated) = updated else {
            tx.rollback().await.map_err(AppError::Database)?;
            let current = Self::find_by_id(pool, id).await?;
            return Err(AppError::InvalidTransition(format!(
                "notification {}: cannot move to {} from {}",
                id,
                new_status.as_str(),
                current.map_or("missing", |n| n.status.as_str()),
            )));
        };

        let history_id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO history (id, notification_id, sent_date, status_code, provider_code, response_id, message)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&history_id)
        .bind(id)
        .bind(now)
        .bind(entry.status_code)
        .bind(entry.provider_code)
        .bind(&entry.response_id)
        .bind(&entry.message)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        tx.commit().await.map_err(AppError::Database)?;

        Ok(updated)
    }

    /// Record the selected provider once. A later call with a different code
    /// is a no-op, which is what keeps `provider_code` stable for the life
    /// of the notification.
    pub async fn set_provider_code_if_unset(
        pool: &SqlitePool,
        id: i64,
        code: ProviderCode,
    ) -> AppResult<()> {
        sqlx::query("UPDATE notification SET provider_code = ? WHERE id = ? AND provider_code IS NULL")
            .bind(code)
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }

    /// Re-admit a terminal notification to `PENDING` for a resend. Returns
    /// false when the row is not terminal (in-flight rows just need a fresh
    /// dispatch event, not a state change).
    pub async fn reset_for_resend(pool: &SqlitePool, id: i64) -> AppResult<bool> {
        let now = Utc::now().naive_utc();
        let result = sqlx::query(
            r#"
            UPDATE notification
            SET status = 'PENDING', attempt = 0, lease_token = NULL, lease_expiry = NULL, updated_at = ?
            WHERE id = ? AND status IN ('DELIVERED', 'FAILURE')
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected() > 0)
    }

    /// `PENDING` rows whose last write is older than the threshold. These
    /// lost their dispatch event (publish failure, delayed republish lost to
    /// a crash) and need re-enqueueing.
    pub async fn find_orphaned_pending(
        pool: &SqlitePool,
        older_than: NaiveDateTime,
        limit: i64,
    ) -> AppResult<Vec<Notification>> {
        sqlx::query_as::<_, Notification>(&format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS}
            FROM notification
            WHERE status = 'PENDING' AND updated_at <= ?
            ORDER BY updated_at ASC
            LIMIT ?
            "#
        ))
        .bind(older_than)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Release every expired lease back to `PENDING` and return the rows,
    /// gated on the recorded expiry so an active worker that already
    /// finished cannot be clobbered.
    pub async fn release_expired_leases(pool: &SqlitePool) -> AppResult<Vec<Notification>> {
        let now = Utc::now().naive_utc();
        sqlx::query_as::<_, Notification>(&format!(
            r#"
            UPDATE notification
            SET status = 'PENDING', lease_token = NULL, lease_expiry = NULL, updated_at = ?
            WHERE status = 'FORWARDED' AND lease_expiry IS NOT NULL AND lease_expiry <= ?
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(now)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)
    }

    /// Bump `updated_at` after re-publishing a dispatch event so the sweeper
    /// does not re-enqueue the same row every cycle.
    pub async fn touch(pool: &SqlitePool, id: i64) -> AppResult<()> {
        let now = Utc::now().naive_utc();
        sqlx::query("UPDATE notification SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{CreateAttachment, HistoryStatus};
    use crate::db::test_pool;

    fn email(recipients: &[&str]) -> CreateNotification {
        CreateNotification {
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            request_by: "BUSINESS".to_string(),
            created_by: "caller".to_string(),
            notification_type: NotificationType::Email,
            subject: Some("S".to_string()),
            body: "hi".to_string(),
            is_html: false,
            attachments: Vec::new(),
        }
    }

    fn delivered_entry() -> NewHistoryEntry {
        NewHistoryEntry {
            status_code: HistoryStatus::Delivered,
            provider_code: ProviderCode::GcNotifyEmail,
            response_id: Some("gc-1".to_string()),
            message: None,
        }
    }

    #[tokio::test]
    async fn create_persists_the_whole_aggregate() {
        let pool = test_pool().await;
        let mut data = email(&["a@x.ca", "b@x.ca", "a@x.ca"]);
        data.attachments = vec![CreateAttachment {
            file_name: "a.pdf".to_string(),
            file_bytes: vec![1, 2, 3, 4],
            attach_order: 1,
        }];

        let created = NotificationRepository::create(&pool, data, None)
            .await
            .unwrap();
        assert_eq!(created.status, NotificationStatus::Pending);
        assert_eq!(created.attempt, 0);

        let detail = NotificationRepository::load_detail(&pool, created.id)
            .await
            .unwrap()
            .unwrap();
        // Duplicates are kept, order preserved.
        assert_eq!(
            detail.notification.recipient_list(),
            vec!["a@x.ca", "b@x.ca", "a@x.ca"]
        );
        assert_eq!(detail.content.body, "hi");
        assert_eq!(detail.attachments.len(), 1);
        // Size is derived from the bytes, not taken from input.
        assert_eq!(detail.attachments[0].content_size, 4);
        assert_eq!(detail.attachments[0].file_bytes, vec![1, 2, 3, 4]);
        assert!(detail.history.is_empty());
    }

    #[tokio::test]
    async fn ids_are_monotone() {
        let pool = test_pool().await;
        let first = NotificationRepository::create(&pool, email(&["a@x.ca"]), None)
            .await
            .unwrap();
        let second = NotificationRepository::create(&pool, email(&["a@x.ca"]), None)
            .await
            .unwrap();
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn only_one_claim_succeeds() {
        let pool = test_pool().await;
        let created = NotificationRepository::create(&pool, email(&["a@x.ca"]), None)
            .await
            .unwrap();

        let first = NotificationRepository::claim_for_dispatch(&pool, created.id, "w1", 300)
            .await
            .unwrap();
        assert!(first.is_some());
        assert_eq!(first.unwrap().status, NotificationStatus::Forwarded);

        let second = NotificationRepository::claim_for_dispatch(&pool, created.id, "w2", 300)
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn expired_lease_can_be_retaken() {
        let pool = test_pool().await;
        let created = NotificationRepository::create(&pool, email(&["a@x.ca"]), None)
            .await
            .unwrap();

        NotificationRepository::claim_for_dispatch(&pool, created.id, "w1", 0)
            .await
            .unwrap()
            .unwrap();
        let retaken = NotificationRepository::claim_for_dispatch(&pool, created.id, "w2", 300)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retaken.lease_token.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn terminal_rows_cannot_be_claimed() {
        let pool = test_pool().await;
        let created = NotificationRepository::create(&pool, email(&["a@x.ca"]), None)
            .await
            .unwrap();
        NotificationRepository::claim_for_dispatch(&pool, created.id, "w1", 300)
            .await
            .unwrap();
        NotificationRepository::update_status(
            &pool,
            created.id,
            NotificationStatus::Delivered,
            delivered_entry(),
        )
        .await
        .unwrap();

        let claim = NotificationRepository::claim_for_dispatch(&pool, created.id, "w2", 300)
            .await
            .unwrap();
        assert!(claim.is_none());
    }

    #[tokio::test]
    async fn status_change_and_history_share_a_timestamp() {
        let pool = test_pool().await;
        let created = NotificationRepository::create(&pool, email(&["a@x.ca"]), None)
            .await
            .unwrap();
        NotificationRepository::claim_for_dispatch(&pool, created.id, "w1", 300)
            .await
            .unwrap();

        let updated = NotificationRepository::update_status(
            &pool,
            created.id,
            NotificationStatus::Delivered,
            delivered_entry(),
        )
        .await
        .unwrap();
        assert_eq!(updated.status, NotificationStatus::Delivered);
        assert!(updated.lease_token.is_none());

        let history = NotificationRepository::list_history(&pool, created.id)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(updated.sent_date, Some(history[0].sent_date));
        assert_eq!(history[0].response_id.as_deref(), Some("gc-1"));
    }

    #[tokio::test]
    async fn retry_transition_counts_the_attempt_without_a_sent_date() {
        let pool = test_pool().await;
        let created = NotificationRepository::create(&pool, email(&["a@x.ca"]), None)
            .await
            .unwrap();
        NotificationRepository::claim_for_dispatch(&pool, created.id, "w1", 300)
            .await
            .unwrap();

        let updated = NotificationRepository::update_status(
            &pool,
            created.id,
            NotificationStatus::Pending,
            NewHistoryEntry {
                status_code: HistoryStatus::Failure,
                provider_code: ProviderCode::GcNotifyEmail,
                response_id: None,
                message: Some("503: unavailable".to_string()),
            },
        )
        .await
        .unwrap();
        assert_eq!(updated.status, NotificationStatus::Pending);
        assert_eq!(updated.attempt, 1);
        // sent_date is reserved for terminal transitions.
        assert!(updated.sent_date.is_none());
    }

    #[tokio::test]
    async fn illegal_transitions_are_rejected() {
        let pool = test_pool().await;
        let created = NotificationRepository::create(&pool, email(&["a@x.ca"]), None)
            .await
            .unwrap();

        // PENDING -> DELIVERED skips FORWARDED.
        let result = NotificationRepository::update_status(
            &pool,
            created.id,
            NotificationStatus::Delivered,
            delivered_entry(),
        )
        .await;
        assert!(matches!(result, Err(AppError::InvalidTransition(_))));

        // No history row may exist after a rejected transition.
        let history = NotificationRepository::list_history(&pool, created.id)
            .await
            .unwrap();
        assert!(history.is_empty());

        // Terminal rows reject further updates.
        NotificationRepository::claim_for_dispatch(&pool, created.id, "w1", 300)
            .await
            .unwrap();
        NotificationRepository::update_status(
            &pool,
            created.id,
            NotificationStatus::Failure,
            NewHistoryEntry {
                status_code: HistoryStatus::Failure,
                provider_code: ProviderCode::GcNotifyEmail,
                response_id: None,
                message: None,
            },
        )
        .await
        .unwrap();
        let result = NotificationRepository::update_status(
            &pool,
            created.id,
            NotificationStatus::Delivered,
            delivered_entry(),
        )
        .await;
        assert!(matches!(result, Err(AppError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn release_requires_the_matching_token() {
        let pool = test_pool().await;
        let created = NotificationRepository::create(&pool, email(&["a@x.ca"]), None)
            .await
            .unwrap();
        NotificationRepository::claim_for_dispatch(&pool, created.id, "w1", 300)
            .await
            .unwrap();

        assert!(!NotificationRepository::release(&pool, created.id, "w2")
            .await
            .unwrap());
        assert!(NotificationRepository::release(&pool, created.id, "w1")
            .await
            .unwrap());

        let row = NotificationRepository::find_by_id(&pool, created.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, NotificationStatus::Pending);
        assert_eq!(row.attempt, 0);
    }

    #[tokio::test]
    async fn provider_code_is_write_once() {
        let pool = test_pool().await;
        let created = NotificationRepository::create(&pool, email(&["a@x.ca"]), None)
            .await
            .unwrap();

        NotificationRepository::set_provider_code_if_unset(&pool, created.id, ProviderCode::Smtp)
            .await
            .unwrap();
        NotificationRepository::set_provider_code_if_unset(
            &pool,
            created.id,
            ProviderCode::Housing,
        )
        .await
        .unwrap();

        let row = NotificationRepository::find_by_id(&pool, created.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.provider_code, Some(ProviderCode::Smtp));
    }

    #[tokio::test]
    async fn list_orders_newest_first_and_filters() {
        let pool = test_pool().await;
        for recipient in ["a@x.ca", "b@x.ca", "c@x.ca"] {
            NotificationRepository::create(&pool, email(&[recipient]), None)
                .await
                .unwrap();
        }

        let filter = NotificationFilter {
            limit: 10,
            offset: 0,
            ..Default::default()
        };
        let (rows, total) = NotificationRepository::list(&pool, &filter).await.unwrap();
        assert_eq!(total, 3);
        // (request_date DESC, id DESC): creation order reversed.
        let ids: Vec<i64> = rows.iter().map(|n| n.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(ids, sorted);

        let filter = NotificationFilter {
            text: Some("b@x".to_string()),
            limit: 10,
            offset: 0,
            ..Default::default()
        };
        let (rows, total) = NotificationRepository::list(&pool, &filter).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].recipients, "b@x.ca");

        let filter = NotificationFilter {
            status: Some(NotificationStatus::Forwarded),
            limit: 10,
            offset: 0,
            ..Default::default()
        };
        let (_, total) = NotificationRepository::list(&pool, &filter).await.unwrap();
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn idempotency_row_is_written_with_the_notification() {
        let pool = test_pool().await;
        let created =
            NotificationRepository::create(&pool, email(&["a@x.ca"]), Some(("key-1", "hash-1")))
                .await
                .unwrap();

        let record = crate::db::repository::IdempotencyRepository::find_by_key(&pool, "key-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.notification_id, created.id);
        assert_eq!(record.payload_hash, "hash-1");

        // Key reuse violates the primary key.
        let result =
            NotificationRepository::create(&pool, email(&["b@x.ca"]), Some(("key-1", "hash-2")))
                .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn reset_for_resend_only_touches_terminal_rows() {
        let pool = test_pool().await;
        let created = NotificationRepository::create(&pool, email(&["a@x.ca"]), None)
            .await
            .unwrap();

        assert!(!NotificationRepository::reset_for_resend(&pool, created.id)
            .await
            .unwrap());

        NotificationRepository::claim_for_dispatch(&pool, created.id, "w1", 300)
            .await
            .unwrap();
        NotificationRepository::set_provider_code_if_unset(
            &pool,
            created.id,
            ProviderCode::GcNotifyEmail,
        )
        .await
        .unwrap();
        NotificationRepository::update_status(
            &pool,
            created.id,
            NotificationStatus::Delivered,
            delivered_entry(),
        )
        .await
        .unwrap();

        assert!(NotificationRepository::reset_for_resend(&pool, created.id)
            .await
            .unwrap());
        let row = NotificationRepository::find_by_id(&pool, created.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, NotificationStatus::Pending);
        assert_eq!(row.attempt, 0);
        // The selected provider is sticky across resends.
        assert_eq!(row.provider_code, Some(ProviderCode::GcNotifyEmail));
    }
}
