use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;

use crate::config::GcNotifyConfig;
use crate::db::models::ProviderCode;

use super::{result_from_status, Capabilities, Provider, ProviderMessage, ProviderResult};

#[derive(Debug, Deserialize)]
struct GcNotifyResponse {
    id: Option<String>,
}

fn auth_header(config: &GcNotifyConfig) -> String {
    format!("ApiKey-v1 {}", config.api_key)
}

/// GC Notify email adapter. Template when configured, raw otherwise. HTML
/// bodies and oversized attachments are rejected as permanent errors: the
/// selector is trusted to have routed those to SMTP.
pub struct GcNotifyEmailProvider {
    client: reqwest::Client,
    config: GcNotifyConfig,
}

impl GcNotifyEmailProvider {
    pub fn new(client: reqwest::Client, config: GcNotifyConfig) -> Self {
        Self { client, config }
    }

    fn build_payload(&self, recipient: &str, message: &ProviderMessage) -> serde_json::Value {
        let attachments: Vec<serde_json::Value> = message
            .attachments
            .iter()
            .map(|a| {
                serde_json::json!({
                    "file": base64::engine::general_purpose::STANDARD.encode(&a.file_bytes),
                    "filename": a.file_name,
                    "sending_method": "attach",
                })
            })
            .collect();

        match &self.config.email_template_id {
            Some(template_id) => serde_json::json!({
                "email_address": recipient,
                "template_id": template_id,
                "personalisation": {
                    "subject": message.subject.clone().unwrap_or_default(),
                    "body": message.body,
                    "attachments": attachments,
                },
            }),
            None => serde_json::json!({
                "email_address": recipient,
                "subject": message.subject.clone().unwrap_or_default(),
                "body": message.body,
                "attachments": attachments,
            }),
        }
    }
}

#[async_trait]
impl Provider for GcNotifyEmailProvider {
    fn id(&self) -> ProviderCode {
        ProviderCode::GcNotifyEmail
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_html: false,
            supports_attachments: true,
            max_attachment_bytes: self.config.max_attachment_bytes,
            supports_sms: false,
        }
    }

    async fn send(&self, message: &ProviderMessage) -> ProviderResult {
        if message.is_html {
            return ProviderResult::PermanentError {
                code: "html_unsupported".to_string(),
                message: "GC Notify email does not accept HTML bodies".to_string(),
            };
        }
        if let Some(oversized) = message
            .attachments
            .iter()
            .find(|a| a.file_bytes.len() > self.config.max_attachment_bytes)
        {
            return ProviderResult::PermanentError {
                code: "attachment_too_large".to_string(),
                message: format!(
                    "Attachment {} exceeds the provider limit of {} bytes",
                    oversized.file_name, self.config.max_attachment_bytes
                ),
            };
        }

        let url = format!(
            "{}/v2/notifications/email",
            self.config.base_url.trim_end_matches('/')
        );

        let mut response_id = None;
        for recipient in &message.recipients {
            let result = self
                .client
                .post(&url)
                .header(http::header::AUTHORIZATION, auth_header(&self.config))
                .json(&self.build_payload(recipient, message))
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    response_id = response
                        .json::<GcNotifyResponse>()
                        .await
                        .ok()
                        .and_then(|r| r.id);
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return result_from_status(status, &body);
                }
                Err(e) => {
                    return ProviderResult::TransientError {
                        code: "network".to_string(),
                        message: e.to_string(),
                    };
                }
            }
        }

        ProviderResult::Success { response_id }
    }
}

/// GC Notify SMS adapter. One recipient per upstream call; the loop fails
/// fast on the first permanent error.
pub struct GcNotifySmsProvider {
    client: reqwest::Client,
    config: GcNotifyConfig,
}

impl GcNotifySmsProvider {
    pub fn new(client: reqwest::Client, config: GcNotifyConfig) -> Self {
        Self { client, config }
    }

    fn build_payload(&self, recipient: &str, message: &ProviderMessage) -> serde_json::Value {
        match &self.config.sms_template_id {
            Some(template_id) => serde_json::json!({
                "phone_number": recipient,
                "template_id": template_id,
                "personalisation": { "body": message.body },
            }),
            None => serde_json::json!({
                "phone_number": recipient,
                "body": message.body,
            }),
        }
    }
}

#[async_trait]
impl Provider for GcNotifySmsProvider {
    fn id(&self) -> ProviderCode {
        ProviderCode::GcNotifySms
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_html: false,
            supports_attachments: false,
            max_attachment_bytes: 0,
            supports_sms: true,
        }
    }

    async fn send(&self, message: &ProviderMessage) -> ProviderResult {
        if !message.attachments.is_empty() {
            return ProviderResult::PermanentError {
                code: "attachments_unsupported".to_string(),
                message: "SMS messages cannot carry attachments".to_string(),
            };
        }

        let url = format!(
            "{}/v2/notifications/sms",
            self.config.base_url.trim_end_matches('/')
        );

        let mut response_id = None;
        for recipient in &message.recipients {
            let result = self
                .client
                .post(&url)
                .header(http::header::AUTHORIZATION, auth_header(&self.config))
                .json(&self.build_payload(recipient, message))
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    response_id = response
                        .json::<GcNotifyResponse>()
                        .await
                        .ok()
                        .and_then(|r| r.id);
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return result_from_status(status, &body);
                }
                Err(e) => {
                    return ProviderResult::TransientError {
                        code: "network".to_string(),
                        message: e.to_string(),
                    };
                }
            }
        }

        ProviderResult::Success { response_id }
    }
}
