//! Outbound provider contract and the concrete adapters.
//!
//! Adapters are pure functions of their input plus their own HTTP client:
//! they never touch the store or the bus. Failures are reported as values
//! (`ProviderResult`), not errors, so the dispatcher can classify them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{LimitsConfig, ProvidersConfig};
use crate::db::models::ProviderCode;
use crate::error::{AppError, AppResult};

pub mod gc_notify;
pub mod housing;
pub mod smtp;

pub use gc_notify::{GcNotifyEmailProvider, GcNotifySmsProvider};
pub use housing::HousingProvider;
pub use smtp::SmtpProvider;

/// Upper bound on free-form headers carried to a provider.
pub const MAX_MESSAGE_HEADERS: usize = 16;

#[derive(Debug, Clone)]
pub struct ProviderAttachment {
    pub file_name: String,
    pub file_bytes: Vec<u8>,
    pub attach_order: i64,
}

/// Adapter-independent message shape built by the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct ProviderMessage {
    pub recipients: Vec<String>,
    pub subject: Option<String>,
    pub body: String,
    pub is_html: bool,
    pub attachments: Vec<ProviderAttachment>,
    pub headers: HashMap<String, String>,
}

impl ProviderMessage {
    /// Headers beyond [`MAX_MESSAGE_HEADERS`] are dropped.
    pub fn insert_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if self.headers.len() < MAX_MESSAGE_HEADERS {
            self.headers.insert(name.into(), value.into());
        }
    }

    pub fn total_attachment_bytes(&self) -> usize {
        self.attachments.iter().map(|a| a.file_bytes.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderResult {
    Success {
        response_id: Option<String>,
    },
    TransientError {
        code: String,
        message: String,
    },
    PermanentError {
        code: String,
        message: String,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub supports_html: bool,
    pub supports_attachments: bool,
    pub max_attachment_bytes: usize,
    pub supports_sms: bool,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn id(&self) -> ProviderCode;
    fn capabilities(&self) -> Capabilities;
    async fn send(&self, message: &ProviderMessage) -> ProviderResult;
}

/// Classify an upstream HTTP status: 408, 429 and 5xx are worth retrying,
/// every other 4xx is not.
pub(crate) fn status_is_transient(status: reqwest::StatusCode) -> bool {
    status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error()
}

pub(crate) fn result_from_status(status: reqwest::StatusCode, body: &str) -> ProviderResult {
    let code = status.as_u16().to_string();
    let message = body.chars().take(500).collect();
    if status_is_transient(status) {
        ProviderResult::TransientError { code, message }
    } else {
        ProviderResult::PermanentError { code, message }
    }
}

/// Mapping from `provider_code` to the adapter that implements it. Built
/// once at startup; adapters hold their own pooled HTTP clients.
pub struct ProviderRegistry {
    providers: HashMap<ProviderCode, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.id(), provider);
    }

    pub fn get(&self, code: ProviderCode) -> Option<Arc<dyn Provider>> {
        self.providers.get(&code).cloned()
    }

    /// Build the four production adapters from configuration.
    pub fn from_config(
        config: &ProvidersConfig,
        limits: &LimitsConfig,
        send_timeout: Duration,
        max_connections_per_provider: usize,
    ) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(send_timeout)
            .pool_max_idle_per_host(max_connections_per_provider)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let mut registry = Self::new();
        registry.register(Arc::new(GcNotifyEmailProvider::new(
            http.clone(),
            config.gc_notify.clone(),
        )));
        registry.register(Arc::new(GcNotifySmsProvider::new(
            http.clone(),
            config.gc_notify.clone(),
        )));
        registry.register(Arc::new(SmtpProvider::new(
            &config.smtp,
            limits.max_total_attachment_bytes,
        )?));
        registry.register(Arc::new(HousingProvider::new(http, config.housing.clone())));
        Ok(registry)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_statuses() {
        for code in [408u16, 429, 500, 502, 503, 504] {
            let status = reqwest::StatusCode::from_u16(code).unwrap();
            assert!(status_is_transient(status), "{} should be transient", code);
        }
        for code in [400u16, 401, 403, 404, 422] {
            let status = reqwest::StatusCode::from_u16(code).unwrap();
            assert!(!status_is_transient(status), "{} should be permanent", code);
        }
    }

    #[test]
    fn header_limit_is_enforced() {
        let mut message = ProviderMessage::default();
        for i in 0..(MAX_MESSAGE_HEADERS + 10) {
            message.insert_header(format!("x-header-{}", i), "v");
        }
        assert_eq!(message.headers.len(), MAX_MESSAGE_HEADERS);
    }
}
