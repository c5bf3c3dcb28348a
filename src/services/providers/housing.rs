use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::config::HousingConfig;
use crate::db::models::ProviderCode;

use super::{result_from_status, Capabilities, Provider, ProviderMessage, ProviderResult};

/// Leeway subtracted from the token lifetime so a token is never used right
/// at its expiry.
const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct DeliveryResponse {
    id: Option<String>,
}

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Housing delivery adapter: plain HTTP POST to the housing service with a
/// bearer token from the service-account flow. The token is cached until
/// shortly before expiry.
pub struct HousingProvider {
    client: reqwest::Client,
    config: HousingConfig,
    token: RwLock<Option<CachedToken>>,
}

impl HousingProvider {
    pub fn new(client: reqwest::Client, config: HousingConfig) -> Self {
        Self {
            client,
            config,
            token: RwLock::new(None),
        }
    }

    async fn access_token(&self) -> Result<String, ProviderResult> {
        if let Some(cached) = self.token.read().await.as_ref() {
            if cached.expires_at > Instant::now() {
                return Ok(cached.access_token.clone());
            }
        }

        let response = self
            .client
            .post(&self.config.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ProviderResult::TransientError {
                code: "token_network".to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(result_from_status(status, &body));
        }

        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| ProviderResult::TransientError {
                code: "token_decode".to_string(),
                message: e.to_string(),
            })?;

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_SKEW);
        *self.token.write().await = Some(CachedToken {
            access_token: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });

        Ok(token.access_token)
    }

    fn build_payload(&self, message: &ProviderMessage) -> serde_json::Value {
        let attachments: Vec<serde_json::Value> = message
            .attachments
            .iter()
            .map(|a| {
                serde_json::json!({
                    "fileName": a.file_name,
                    "fileBytes": base64::engine::general_purpose::STANDARD.encode(&a.file_bytes),
                    "attachOrder": a.attach_order,
                })
            })
            .collect();

        serde_json::json!({
            "recipients": message.recipients,
            "subject": message.subject.clone().unwrap_or_default(),
            "body": message.body,
            "isHtml": message.is_html,
            "attachments": attachments,
        })
    }
}

#[async_trait]
impl Provider for HousingProvider {
    fn id(&self) -> ProviderCode {
        ProviderCode::Housing
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_html: true,
            supports_attachments: true,
            max_attachment_bytes: usize::MAX,
            supports_sms: false,
        }
    }

    async fn send(&self, message: &ProviderMessage) -> ProviderResult {
        let token = match self.access_token().await {
            Ok(token) => token,
            Err(result) => return result,
        };

        let url = format!(
            "{}/notifications",
            self.config.base_url.trim_end_matches('/')
        );

        let result = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&self.build_payload(message))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                let response_id = response
                    .json::<DeliveryResponse>()
                    .await
                    .ok()
                    .and_then(|r| r.id);
                ProviderResult::Success { response_id }
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                result_from_status(status, &body)
            }
            Err(e) => ProviderResult::TransientError {
                code: "network".to_string(),
                message: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn payload_carries_attachments_in_order() {
        let provider = HousingProvider::new(reqwest::Client::new(), Config::default().providers.housing);
        let message = ProviderMessage {
            recipients: vec!["a@x.ca".to_string()],
            subject: Some("S".to_string()),
            body: "hi".to_string(),
            attachments: vec![
                super::super::ProviderAttachment {
                    file_name: "first.pdf".to_string(),
                    file_bytes: vec![1],
                    attach_order: 1,
                },
                super::super::ProviderAttachment {
                    file_name: "second.pdf".to_string(),
                    file_bytes: vec![2],
                    attach_order: 2,
                },
            ],
            ..Default::default()
        };

        let payload = provider.build_payload(&message);
        assert_eq!(payload["attachments"][0]["fileName"], "first.pdf");
        assert_eq!(payload["attachments"][1]["attachOrder"], 2);
        assert_eq!(payload["isHtml"], false);
    }
}
