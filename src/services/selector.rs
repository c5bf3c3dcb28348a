//! Provider selection policy. Pure and deterministic: no I/O, no clock, no
//! hidden branching inside the adapters. Rules are evaluated top to bottom
//! and the first match wins.

use crate::config::LimitsConfig;
use crate::db::models::{NotificationDetail, NotificationType, ProviderCode};

/// Caller tag that is always routed to the housing service.
const HOUSING_REQUEST_BY: &str = "STRR";

pub fn select_provider(detail: &NotificationDetail, limits: &LimitsConfig) -> ProviderCode {
    if detail.notification.request_by == HOUSING_REQUEST_BY {
        return ProviderCode::Housing;
    }

    if detail.content.is_html || detail.total_attachment_bytes() > limits.smtp_threshold_bytes {
        return ProviderCode::Smtp;
    }

    if detail.notification.notification_type == NotificationType::Text {
        return ProviderCode::GcNotifySms;
    }

    ProviderCode::GcNotifyEmail
}
