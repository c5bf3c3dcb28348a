use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::SmtpConfig;
use crate::db::models::ProviderCode;
use crate::error::{AppError, AppResult};
use crate::services::mask_recipient;

use super::{Capabilities, Provider, ProviderMessage, ProviderResult};

/// SMTP relay adapter. The escape hatch for HTML bodies and attachment
/// volumes the hosted providers will not take.
pub struct SmtpProvider {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    max_attachment_bytes: usize,
}

impl SmtpProvider {
    pub fn new(config: &SmtpConfig, max_attachment_bytes: usize) -> AppResult<Self> {
        let builder = match (&config.username, &config.password) {
            (Some(username), Some(password)) => {
                AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                    .map_err(|e| AppError::Config(format!("SMTP relay {}: {}", config.host, e)))?
                    .credentials(Credentials::new(username.clone(), password.clone()))
            }
            _ => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host),
        };

        let from = config
            .from_address
            .parse::<Mailbox>()
            .map_err(|e| AppError::Config(format!("Invalid SMTP from address: {}", e)))?;

        Ok(Self {
            transport: builder.port(config.port).build(),
            from,
            max_attachment_bytes,
        })
    }

    fn build_message(&self, message: &ProviderMessage) -> Result<Message, String> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(message.subject.clone().unwrap_or_default());

        for recipient in &message.recipients {
            let mailbox = recipient
                .parse::<Mailbox>()
                .map_err(|e| format!("Invalid recipient {}: {}", mask_recipient(recipient), e))?;
            builder = builder.to(mailbox);
        }

        let body_part = if message.is_html {
            SinglePart::html(message.body.clone())
        } else {
            SinglePart::plain(message.body.clone())
        };

        let built = if message.attachments.is_empty() {
            builder.singlepart(body_part)
        } else {
            let mut multipart = MultiPart::mixed().singlepart(body_part);
            for attachment in &message.attachments {
                multipart = multipart.singlepart(
                    Attachment::new(attachment.file_name.clone())
                        .body(attachment.file_bytes.clone(), ContentType::parse("application/octet-stream").map_err(|e| e.to_string())?),
                );
            }
            builder.multipart(multipart)
        };

        built.map_err(|e| format!("Failed to build MIME message: {}", e))
    }
}

#[async_trait]
impl Provider for SmtpProvider {
    fn id(&self) -> ProviderCode {
        ProviderCode::Smtp
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_html: true,
            supports_attachments: true,
            max_attachment_bytes: self.max_attachment_bytes,
            supports_sms: false,
        }
    }

    async fn send(&self, message: &ProviderMessage) -> ProviderResult {
        let email = match self.build_message(message) {
            Ok(email) => email,
            Err(message) => {
                return ProviderResult::PermanentError {
                    code: "invalid_message".to_string(),
                    message,
                }
            }
        };

        match self.transport.send(email).await {
            Ok(response) => ProviderResult::Success {
                response_id: Some(response.code().to_string()),
            },
            Err(e) if e.is_permanent() => ProviderResult::PermanentError {
                code: "smtp_permanent".to_string(),
                message: e.to_string(),
            },
            Err(e) => ProviderResult::TransientError {
                code: "smtp_transient".to_string(),
                message: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn provider() -> SmtpProvider {
        let config = Config::default();
        SmtpProvider::new(&config.providers.smtp, config.limits.max_total_attachment_bytes).unwrap()
    }

    #[tokio::test]
    async fn invalid_recipient_fails_to_build() {
        let provider = provider();
        let message = ProviderMessage {
            recipients: vec!["not-an-address".to_string()],
            subject: Some("S".to_string()),
            body: "hi".to_string(),
            ..Default::default()
        };

        let email = provider.build_message(&message);
        assert!(email.is_err());
    }

    #[tokio::test]
    async fn html_message_with_attachments_builds() {
        let provider = provider();
        let message = ProviderMessage {
            recipients: vec!["a@x.ca".to_string()],
            subject: Some("Welcome".to_string()),
            body: "<p>Hi</p>".to_string(),
            is_html: true,
            attachments: vec![super::super::ProviderAttachment {
                file_name: "a.pdf".to_string(),
                file_bytes: vec![1, 2, 3],
                attach_order: 1,
            }],
            ..Default::default()
        };

        assert!(provider.build_message(&message).is_ok());
    }
}
