//! Dispatch worker logic: consume a dispatch event, claim the notification,
//! pick a provider, deliver, classify the outcome, and record it.
//!
//! Errors never leave this module as responses; they become status/history
//! writes plus an ack or nack on the bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::config::Config;
use crate::db::models::{
    HistoryStatus, NewHistoryEntry, NotificationDetail, NotificationStatus, NotificationType,
};
use crate::db::repository::NotificationRepository;
use crate::error::AppError;
use crate::services::bus::{DispatchEnvelope, EventBus, HandlerOutcome};
use crate::services::mask_recipient;
use crate::services::providers::{
    ProviderAttachment, ProviderMessage, ProviderRegistry, ProviderResult,
};
use crate::services::retry::{Disposition, RetryPolicy};
use crate::services::selector::select_provider;

pub struct Dispatcher {
    pool: SqlitePool,
    config: Config,
    providers: Arc<ProviderRegistry>,
    bus: Arc<EventBus>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        pool: SqlitePool,
        config: Config,
        providers: Arc<ProviderRegistry>,
        bus: Arc<EventBus>,
    ) -> Self {
        let retry = RetryPolicy::new(&config.retry);
        Self {
            pool,
            config,
            providers,
            bus,
            retry,
        }
    }

    /// Process one dispatch event end to end.
    ///
    /// The lease taken in step one is what serializes attempts per
    /// notification under at-least-once delivery: a second worker holding
    /// the same event acks without touching the row.
    pub async fn handle_event(
        &self,
        envelope: DispatchEnvelope,
        attributes: HashMap<String, String>,
    ) -> HandlerOutcome {
        let id = envelope.id;
        let worker_token = Uuid::new_v4().to_string();

        let claimed = match NotificationRepository::claim_for_dispatch(
            &self.pool,
            id,
            &worker_token,
            self.config.dispatch.lease_ttl_seconds,
        )
        .await
        {
            Ok(Some(notification)) => notification,
            Ok(None) => {
                tracing::debug!(
                    "Notification {} not claimable (terminal, leased, or missing); acking",
                    id
                );
                return HandlerOutcome::Ack;
            }
            Err(e) => {
                tracing::warn!("Failed to claim notification {}: {:?}", id, e);
                return HandlerOutcome::Nack;
            }
        };

        let detail = match NotificationRepository::load_detail(&self.pool, id).await {
            Ok(Some(detail)) => detail,
            Ok(None) => {
                tracing::error!("Claimed notification {} vanished from the store", id);
                return HandlerOutcome::Ack;
            }
            Err(e) => {
                tracing::warn!("Failed to load notification {}: {:?}", id, e);
                self.release_quietly(id, &worker_token).await;
                return HandlerOutcome::Nack;
            }
        };

        // provider_code is sticky: the first selection is persisted and every
        // later attempt reuses it.
        let provider_code = match claimed.provider_code {
            Some(code) => code,
            None => {
                let code = select_provider(&detail, &self.config.limits);
                if let Err(e) =
                    NotificationRepository::set_provider_code_if_unset(&self.pool, id, code).await
                {
                    tracing::warn!(
                        "Failed to persist provider code for notification {}: {:?}",
                        id,
                        e
                    );
                    self.release_quietly(id, &worker_token).await;
                    return HandlerOutcome::Nack;
                }
                code
            }
        };

        let message = build_provider_message(&detail, &attributes);

        let result = match self.providers.get(provider_code) {
            Some(provider) => {
                let capabilities = provider.capabilities();
                if message.is_html && !capabilities.supports_html {
                    tracing::warn!(
                        "Notification {} routed to {} which does not support HTML",
                        id,
                        provider_code.as_str()
                    );
                }
                if !message.attachments.is_empty() && !capabilities.supports_attachments {
                    tracing::warn!(
                        "Notification {} routed to {} which does not support attachments",
                        id,
                        provider_code.as_str()
                    );
                }

                let send_timeout = Duration::from_secs(self.config.dispatch.send_timeout_seconds);
                match tokio::time::timeout(send_timeout, provider.send(&message)).await {
                    Ok(result) => result,
                    Err(_) => ProviderResult::TransientError {
                        code: "timeout".to_string(),
                        message: format!("Provider call exceeded {:?}", send_timeout),
                    },
                }
            }
            None => ProviderResult::PermanentError {
                code: "no_adapter".to_string(),
                message: format!("No adapter registered for {}", provider_code.as_str()),
            },
        };

        match self.retry.classify(&result, envelope.attempt) {
            Disposition::Success { response_id } => {
                tracing::info!(
                    "Notification {} delivered via {} (attempt {})",
                    id,
                    provider_code.as_str(),
                    envelope.attempt
                );
                self.record(
                    id,
                    NotificationStatus::Delivered,
                    NewHistoryEntry {
                        status_code: HistoryStatus::Delivered,
                        provider_code,
                        response_id,
                        message: None,
                    },
                )
                .await
            }
            Disposition::Retry {
                delay,
                code,
                message,
            } => {
                tracing::info!(
                    "Notification {} attempt {} failed transiently via {} ({}); retrying in {:?}",
                    id,
                    envelope.attempt,
                    provider_code.as_str(),
                    code,
                    delay
                );
                let outcome = self
                    .record(
                        id,
                        NotificationStatus::Pending,
                        NewHistoryEntry {
                            status_code: HistoryStatus::Failure,
                            provider_code,
                            response_id: None,
                            message: Some(format!("{}: {}", code, message)),
                        },
                    )
                    .await;
                if outcome == HandlerOutcome::Ack {
                    self.bus.publish_dispatch_delayed(
                        id,
                        envelope.attempt + 1,
                        delay,
                        attributes,
                    );
                }
                outcome
            }
            Disposition::Fatal { code, message } => {
                tracing::warn!(
                    "Notification {} failed permanently via {} ({})",
                    id,
                    provider_code.as_str(),
                    code
                );
                self.record(
                    id,
                    NotificationStatus::Failure,
                    NewHistoryEntry {
                        status_code: HistoryStatus::Failure,
                        provider_code,
                        response_id: None,
                        message: Some(format!("{}: {}", code, message)),
                    },
                )
                .await
            }
        }
    }

    /// Hand the lease back so a redelivered event is not locked out until
    /// lease expiry. Best effort; an expiring lease covers the failure case.
    async fn release_quietly(&self, id: i64, worker_token: &str) {
        if let Err(e) = NotificationRepository::release(&self.pool, id, worker_token).await {
            tracing::warn!("Failed to release lease on notification {}: {:?}", id, e);
        }
    }

    async fn record(
        &self,
        id: i64,
        new_status: NotificationStatus,
        entry: NewHistoryEntry,
    ) -> HandlerOutcome {
        match NotificationRepository::update_status(&self.pool, id, new_status, entry).await {
            Ok(_) => HandlerOutcome::Ack,
            Err(AppError::InvalidTransition(message)) => {
                // Contract violation, not a delivery problem. Redelivery
                // would only repeat it.
                tracing::error!("{}", message);
                HandlerOutcome::Ack
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to record outcome for notification {}: {:?}; nacking",
                    id,
                    e
                );
                HandlerOutcome::Nack
            }
        }
    }
}

/// Flatten the aggregate into the adapter-independent message shape. Bus
/// attributes (trace id, idempotency key) ride along as bounded headers.
pub fn build_provider_message(
    detail: &NotificationDetail,
    attributes: &HashMap<String, String>,
) -> ProviderMessage {
    let subject = match detail.notification.notification_type {
        NotificationType::Email => detail.content.subject.clone(),
        NotificationType::Text => None,
    };

    let mut message = ProviderMessage {
        recipients: detail.notification.recipient_list(),
        subject,
        body: detail.content.body.clone(),
        is_html: detail.content.is_html,
        attachments: detail
            .attachments
            .iter()
            .map(|a| ProviderAttachment {
                file_name: a.file_name.clone(),
                file_bytes: a.file_bytes.clone(),
                attach_order: a.attach_order,
            })
            .collect(),
        headers: HashMap::new(),
    };

    for (name, value) in attributes {
        message.insert_header(name.clone(), value.clone());
    }

    tracing::debug!(
        "Built provider message for notification {} to [{}]",
        detail.notification.id,
        message
            .recipients
            .iter()
            .map(|r| mask_recipient(r))
            .collect::<Vec<_>>()
            .join(", ")
    );

    message
}
