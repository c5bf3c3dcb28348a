use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use validator::ValidateEmail;

use crate::db::models::{
    CreateAttachment, CreateNotification, Notification, NotificationDetail, NotificationStatus,
    NotificationType, ProviderCode,
};
use crate::db::repository::{IdempotencyRepository, NotificationFilter, NotificationRepository};
use crate::error::{AppError, AppResult};
use crate::services::auth::Claims;
use crate::services::bus::{ATTR_IDEMPOTENCY_KEY, ATTR_TRACE_ID};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(create_notification).get(list_notifications))
        .route("/:id", get(get_notification))
        .route("/resend/:id", post(resend_notification))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    /// Comma-separated recipient addresses, order preserved.
    pub recipients: String,
    pub request_by: String,
    #[serde(default)]
    pub notification_type: Option<NotificationType>,
    pub content: ContentRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentRequest {
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
    #[serde(default)]
    pub is_html: bool,
    #[serde(default)]
    pub attachments: Vec<AttachmentRequest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRequest {
    pub file_name: String,
    /// Base64-encoded bytes.
    pub file_bytes: String,
    #[serde(default)]
    pub attach_order: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationStatusResponse {
    pub id: String,
    pub status: NotificationStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationResponse {
    pub id: String,
    pub recipients: String,
    pub request_by: String,
    pub notification_type: NotificationType,
    pub status: NotificationStatus,
    pub provider_code: Option<ProviderCode>,
    pub request_date: NaiveDateTime,
    pub sent_date: Option<NaiveDateTime>,
    pub content: ContentResponse,
    pub history: Vec<HistoryResponse>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentResponse {
    pub subject: Option<String>,
    pub body: String,
    pub is_html: bool,
    pub attachments: Vec<AttachmentResponse>,
}

/// Attachment metadata only; the bytes stay in the store.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentResponse {
    pub file_name: String,
    pub attach_order: i64,
    pub content_size: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub status: crate::db::models::HistoryStatus,
    pub provider_code: ProviderCode,
    pub response_id: Option<String>,
    pub sent_date: NaiveDateTime,
    pub message: Option<String>,
}

impl From<NotificationDetail> for NotificationResponse {
    fn from(detail: NotificationDetail) -> Self {
        let NotificationDetail {
            notification,
            content,
            attachments,
            history,
        } = detail;

        NotificationResponse {
            id: notification.id.to_string(),
            recipients: notification.recipients,
            request_by: notification.request_by,
            notification_type: notification.notification_type,
            status: notification.status,
            provider_code: notification.provider_code,
            request_date: notification.request_date,
            sent_date: notification.sent_date,
            content: ContentResponse {
                subject: content.subject,
                body: content.body,
                is_html: content.is_html,
                attachments: attachments
                    .into_iter()
                    .map(|a| AttachmentResponse {
                        file_name: a.file_name,
                        attach_order: a.attach_order,
                        content_size: a.content_size,
                    })
                    .collect(),
            },
            history: history
                .into_iter()
                .map(|h| HistoryResponse {
                    status: h.status_code,
                    provider_code: h.provider_code,
                    response_id: h.response_id,
                    sent_date: h.sent_date,
                    message: h.message,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListNotificationsQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
    pub status: Option<NotificationStatus>,
    pub request_by: Option<String>,
    pub notification_type: Option<NotificationType>,
    pub sent_after: Option<NaiveDateTime>,
    pub sent_before: Option<NaiveDateTime>,
    pub q: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationsListResponse {
    pub items: Vec<NotificationSummary>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub total_pages: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationSummary {
    pub id: String,
    pub recipients: String,
    pub request_by: String,
    pub notification_type: NotificationType,
    pub status: NotificationStatus,
    pub provider_code: Option<ProviderCode>,
    pub request_date: NaiveDateTime,
    pub sent_date: Option<NaiveDateTime>,
}

impl From<Notification> for NotificationSummary {
    fn from(n: Notification) -> Self {
        NotificationSummary {
            id: n.id.to_string(),
            recipients: n.recipients,
            request_by: n.request_by,
            notification_type: n.notification_type,
            status: n.status,
            provider_code: n.provider_code,
            request_date: n.request_date,
            sent_date: n.sent_date,
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

fn is_e164(phone: &str) -> bool {
    let Some(digits) = phone.strip_prefix('+') else {
        return false;
    };
    digits.len() >= 7
        && digits.len() <= 15
        && !digits.starts_with('0')
        && digits.chars().all(|c| c.is_ascii_digit())
}

/// Validate the request against the domain rules and decode attachment
/// bytes. Attachment sizes come from the decoded bytes, never the request.
fn validate_request(
    request: &NotificationRequest,
    limits: &crate::config::LimitsConfig,
    created_by: &str,
) -> AppResult<CreateNotification> {
    let recipients: Vec<String> = request
        .recipients
        .split(',')
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect();

    if recipients.is_empty() {
        return Err(AppError::Validation(
            "At least one recipient is required".to_string(),
        ));
    }

    if request.request_by.trim().is_empty() {
        return Err(AppError::Validation("requestBy is required".to_string()));
    }

    let content = &request.content;
    let has_attachments = !content.attachments.is_empty();

    let notification_type = match request.notification_type {
        Some(NotificationType::Text) => {
            if content.is_html || has_attachments {
                return Err(AppError::Validation(
                    "HTML content and attachments require an EMAIL notification".to_string(),
                ));
            }
            NotificationType::Text
        }
        // HTML content or attachments force EMAIL; plain requests default
        // to EMAIL as well.
        _ => NotificationType::Email,
    };

    for recipient in &recipients {
        let valid = match notification_type {
            NotificationType::Email => recipient.validate_email(),
            NotificationType::Text => is_e164(recipient),
        };
        if !valid {
            return Err(AppError::Validation(format!(
                "Invalid {} recipient: {}",
                notification_type.as_str(),
                crate::services::mask_recipient(recipient)
            )));
        }
    }

    if content.body.trim().is_empty() {
        return Err(AppError::Validation("body is required".to_string()));
    }

    let subject = content.subject.as_ref().map(|s| s.trim().to_string());
    if notification_type == NotificationType::Email
        && subject.as_ref().map_or(true, |s| s.is_empty())
    {
        return Err(AppError::Validation(
            "subject is required for EMAIL notifications".to_string(),
        ));
    }

    let mut attachments = Vec::with_capacity(content.attachments.len());
    let mut total_bytes = 0usize;
    for (index, attachment) in content.attachments.iter().enumerate() {
        if attachment.file_name.trim().is_empty() {
            return Err(AppError::Validation(format!(
                "Attachment {} is missing a file name",
                index + 1
            )));
        }

        let file_bytes = base64::engine::general_purpose::STANDARD
            .decode(attachment.file_bytes.as_bytes())
            .map_err(|_| {
                AppError::Validation(format!(
                    "Attachment {} is not valid base64",
                    attachment.file_name
                ))
            })?;

        if file_bytes.len() > limits.max_per_attachment_bytes {
            return Err(AppError::PayloadTooLarge(format!(
                "Attachment {} exceeds {} bytes",
                attachment.file_name, limits.max_per_attachment_bytes
            )));
        }

        total_bytes += file_bytes.len();
        if total_bytes > limits.max_total_attachment_bytes {
            return Err(AppError::PayloadTooLarge(format!(
                "Attachments exceed {} bytes in total",
                limits.max_total_attachment_bytes
            )));
        }

        attachments.push(CreateAttachment {
            file_name: attachment.file_name.trim().to_string(),
            file_bytes,
            attach_order: attachment.attach_order.unwrap_or(index as i64 + 1),
        });
    }

    Ok(CreateNotification {
        recipients,
        request_by: request.request_by.trim().to_string(),
        created_by: created_by.to_string(),
        notification_type,
        subject: if notification_type == NotificationType::Email {
            subject
        } else {
            None
        },
        body: content.body.clone(),
        is_html: content.is_html,
        attachments,
    })
}

fn payload_hash(request: &NotificationRequest) -> AppResult<String> {
    let bytes = serde_json::to_vec(request)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to hash payload: {}", e)))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn can_access(claims: &Claims, notification: &Notification, admin_role: &str) -> bool {
    claims.sub == notification.created_by || claims.has_role(admin_role)
}

// ============================================================================
// Handlers
// ============================================================================

/// Accept a notification: validate, persist in `PENDING`, publish a
/// dispatch event. An `Idempotency-Key` already seen with the identical
/// payload replays the original id instead of creating a duplicate.
async fn create_notification(
    State(state): State<Arc<AppState>>,
    AuthClaims(claims): AuthClaims,
    headers: HeaderMap,
    Json(request): Json<NotificationRequest>,
) -> AppResult<Response> {
    let idem_key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let hash = payload_hash(&request)?;

    if let Some(key) = &idem_key {
        if let Some(existing) = IdempotencyRepository::find_by_key(&state.db, key).await? {
            if existing.payload_hash != hash {
                return Err(AppError::Conflict(
                    "Idempotency-Key was already used with a different payload".to_string(),
                ));
            }
            let notification =
                NotificationRepository::find_by_id(&state.db, existing.notification_id)
                    .await?
                    .ok_or_else(|| {
                        AppError::NotFound(format!(
                            "Notification {} not found",
                            existing.notification_id
                        ))
                    })?;
            tracing::debug!(
                "Replaying idempotent request for notification {}",
                notification.id
            );
            return Ok((
                StatusCode::OK,
                Json(NotificationStatusResponse {
                    id: notification.id.to_string(),
                    status: notification.status,
                }),
            )
                .into_response());
        }
    }

    let data = validate_request(&request, &state.config.limits, &claims.sub)?;

    let created = match NotificationRepository::create(
        &state.db,
        data,
        idem_key.as_deref().map(|key| (key, hash.as_str())),
    )
    .await
    {
        Ok(created) => created,
        // A concurrent request with the same key won the insert race.
        Err(AppError::Database(sqlx::Error::Database(db_err)))
            if matches!(db_err.kind(), sqlx::error::ErrorKind::UniqueViolation) =>
        {
            return Err(AppError::Conflict(
                "Idempotency-Key was already used".to_string(),
            ));
        }
        Err(e) => return Err(e),
    };

    let mut attributes = HashMap::new();
    attributes.insert(ATTR_TRACE_ID.to_string(), Uuid::new_v4().to_string());
    if let Some(key) = &idem_key {
        attributes.insert(ATTR_IDEMPOTENCY_KEY.to_string(), key.clone());
    }

    // The row is committed before the publish: if the bus is down the
    // sweeper re-enqueues the orphaned PENDING row and the caller sees 503.
    state.bus.publish_dispatch(created.id, 0, attributes).await?;

    tracing::info!("Accepted notification {} from {}", created.id, claims.sub);

    Ok((
        StatusCode::CREATED,
        Json(NotificationStatusResponse {
            id: created.id.to_string(),
            status: created.status,
        }),
    )
        .into_response())
}

/// Full snapshot of one notification including its history.
async fn get_notification(
    State(state): State<Arc<AppState>>,
    AuthClaims(claims): AuthClaims,
    Path(id): Path<i64>,
) -> AppResult<Json<NotificationResponse>> {
    let detail = NotificationRepository::load_detail(&state.db, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))?;

    if !can_access(&claims, &detail.notification, state.auth.admin_role()) {
        return Err(AppError::Forbidden);
    }

    Ok(Json(detail.into()))
}

async fn list_notifications(
    State(state): State<Arc<AppState>>,
    AuthClaims(claims): AuthClaims,
    Query(query): Query<ListNotificationsQuery>,
) -> AppResult<Json<NotificationsListResponse>> {
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.per_page.unwrap_or(20).clamp(1, 100);

    if let (Some(after), Some(before)) = (query.sent_after, query.sent_before) {
        if after > before {
            return Err(AppError::BadRequest(
                "sent_after must not be later than sent_before".to_string(),
            ));
        }
    }

    let filter = NotificationFilter {
        status: query.status,
        request_by: query.request_by,
        // Non-admin callers only see their own notifications.
        created_by: if claims.has_role(state.auth.admin_role()) {
            None
        } else {
            Some(claims.sub.clone())
        },
        notification_type: query.notification_type,
        sent_after: query.sent_after,
        sent_before: query.sent_before,
        text: query.q,
        limit: per_page,
        offset: (page - 1) * per_page,
    };

    let (rows, total) = NotificationRepository::list(&state.db, &filter).await?;
    let total_pages = (total as f64 / per_page as f64).ceil() as i64;

    Ok(Json(NotificationsListResponse {
        items: rows.into_iter().map(NotificationSummary::from).collect(),
        total,
        page,
        per_page,
        total_pages,
    }))
}

/// Re-enqueue an existing notification. Terminal rows are re-admitted to
/// `PENDING`; a recent successful delivery is refused.
async fn resend_notification(
    State(state): State<Arc<AppState>>,
    AuthClaims(claims): AuthClaims,
    Path(id): Path<i64>,
) -> AppResult<Response> {
    let notification = NotificationRepository::find_by_id(&state.db, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Notification {} not found", id)))?;

    if !can_access(&claims, &notification, state.auth.admin_role()) {
        return Err(AppError::Forbidden);
    }

    if notification.status == NotificationStatus::Delivered {
        let cooldown = chrono::Duration::seconds(state.config.server.resend_cooldown_seconds as i64);
        if let Some(sent) = notification.sent_date {
            if Utc::now().naive_utc() - sent < cooldown {
                return Err(AppError::Conflict(format!(
                    "Notification {} was delivered less than {}s ago",
                    id, state.config.server.resend_cooldown_seconds
                )));
            }
        }
    }

    NotificationRepository::reset_for_resend(&state.db, id).await?;

    let mut attributes = HashMap::new();
    attributes.insert(ATTR_TRACE_ID.to_string(), Uuid::new_v4().to_string());
    state.bus.publish_dispatch(id, 0, attributes).await?;

    tracing::info!("Resend requested for notification {} by {}", id, claims.sub);

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "id": id.to_string() })),
    )
        .into_response())
}

// ============================================================================
// Auth Extractor
// ============================================================================

use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

/// Extractor for validated bearer-token claims.
pub struct AuthClaims(pub Claims);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthClaims {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                tracing::debug!("Missing or invalid Authorization header");
                AppError::Unauthorized
            })?;

        if !auth_header.to_ascii_lowercase().starts_with("bearer ") {
            tracing::debug!("Authorization header doesn't start with 'Bearer '");
            return Err(AppError::Unauthorized);
        }

        let token = auth_header[7..].trim();
        if token.is_empty() {
            return Err(AppError::Unauthorized);
        }

        let claims = state.auth.verify(token).await.map_err(|e| {
            tracing::debug!("Token verification failed: {:?}", e);
            e
        })?;

        Ok(AuthClaims(claims))
    }
}
