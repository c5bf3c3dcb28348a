//! Catch-up task for rows whose dispatch events were lost: expired leases
//! on `FORWARDED` rows are released back to `PENDING`, and `PENDING` rows
//! nobody has touched for a while are re-enqueued.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::config::SweeperConfig;
use crate::db::repository::NotificationRepository;
use crate::error::AppResult;
use crate::services::bus::{EventBus, ATTR_TRACE_ID};

/// Per-cycle bound on re-enqueued orphans; the next cycle picks up the rest.
const SWEEP_BATCH: i64 = 500;

pub struct Sweeper {
    pool: SqlitePool,
    config: SweeperConfig,
    bus: Arc<EventBus>,
}

impl Sweeper {
    pub fn new(pool: SqlitePool, config: SweeperConfig, bus: Arc<EventBus>) -> Self {
        Self { pool, config, bus }
    }

    /// One sweep cycle. Returns `(released_leases, reenqueued_orphans)`.
    pub async fn sweep_once(&self) -> AppResult<(usize, usize)> {
        let released = NotificationRepository::release_expired_leases(&self.pool).await?;
        for notification in &released {
            tracing::warn!(
                "Lease on notification {} expired; re-admitting to PENDING",
                notification.id
            );
            self.enqueue(notification.id, notification.attempt as u32)
                .await?;
        }

        let cutoff = Utc::now().naive_utc()
            - chrono::Duration::seconds(self.config.orphan_threshold_seconds as i64);
        let orphans =
            NotificationRepository::find_orphaned_pending(&self.pool, cutoff, SWEEP_BATCH).await?;
        for notification in &orphans {
            tracing::info!(
                "Re-enqueueing orphaned PENDING notification {} (attempt {})",
                notification.id,
                notification.attempt
            );
            self.enqueue(notification.id, notification.attempt as u32)
                .await?;
        }

        Ok((released.len(), orphans.len()))
    }

    async fn enqueue(&self, id: i64, attempt: u32) -> AppResult<()> {
        let mut attributes = HashMap::new();
        attributes.insert(ATTR_TRACE_ID.to_string(), Uuid::new_v4().to_string());
        self.bus.publish_dispatch(id, attempt, attributes).await?;
        // Touching the row keeps it out of the next orphan scan.
        NotificationRepository::touch(&self.pool, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::models::{CreateNotification, NotificationStatus, NotificationType};
    use crate::db::test_pool;

    fn notification() -> CreateNotification {
        CreateNotification {
            recipients: vec!["a@x.ca".to_string()],
            request_by: "BUSINESS".to_string(),
            created_by: "caller".to_string(),
            notification_type: NotificationType::Email,
            subject: Some("S".to_string()),
            body: "hi".to_string(),
            is_html: false,
            attachments: Vec::new(),
        }
    }

    async fn sweeper() -> (Sweeper, SqlitePool, Arc<EventBus>) {
        let pool = test_pool().await;
        let config = Config::default();
        let bus = Arc::new(EventBus::in_process(&config.bus));
        (
            Sweeper::new(pool.clone(), config.sweeper, bus.clone()),
            pool,
            bus,
        )
    }

    #[tokio::test]
    async fn expired_lease_is_released_and_reenqueued() {
        let (sweeper, pool, bus) = sweeper().await;
        let created = NotificationRepository::create(&pool, notification(), None)
            .await
            .unwrap();

        // Zero TTL: the lease is expired the moment it is taken.
        NotificationRepository::claim_for_dispatch(&pool, created.id, "w", 0)
            .await
            .unwrap()
            .unwrap();

        let (released, orphans) = sweeper.sweep_once().await.unwrap();
        assert_eq!(released, 1);
        assert_eq!(orphans, 0);

        let row = NotificationRepository::find_by_id(&pool, created.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, NotificationStatus::Pending);
        assert!(row.lease_token.is_none());

        let (envelope, _, _) = bus.next_dispatch().await.unwrap();
        assert_eq!(envelope.id, created.id);
    }

    #[tokio::test]
    async fn stale_pending_rows_are_reenqueued_once() {
        let (sweeper, pool, bus) = sweeper().await;
        let created = NotificationRepository::create(&pool, notification(), None)
            .await
            .unwrap();

        // Backdate the row past the orphan threshold.
        let stale = Utc::now().naive_utc() - chrono::Duration::seconds(3600);
        sqlx::query("UPDATE notification SET updated_at = ? WHERE id = ?")
            .bind(stale)
            .bind(created.id)
            .execute(&pool)
            .await
            .unwrap();

        let (_, orphans) = sweeper.sweep_once().await.unwrap();
        assert_eq!(orphans, 1);
        let (envelope, _, _) = bus.next_dispatch().await.unwrap();
        assert_eq!(envelope.id, created.id);

        // The touch keeps it out of the next cycle.
        let (_, orphans) = sweeper.sweep_once().await.unwrap();
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn fresh_rows_and_active_leases_are_left_alone() {
        let (sweeper, pool, _bus) = sweeper().await;
        let created = NotificationRepository::create(&pool, notification(), None)
            .await
            .unwrap();
        NotificationRepository::claim_for_dispatch(&pool, created.id, "w", 300)
            .await
            .unwrap()
            .unwrap();

        let (released, orphans) = sweeper.sweep_once().await.unwrap();
        assert_eq!(released, 0);
        assert_eq!(orphans, 0);

        let row = NotificationRepository::find_by_id(&pool, created.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, NotificationStatus::Forwarded);
    }
}
