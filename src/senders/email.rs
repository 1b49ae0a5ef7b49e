use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;
use uuid::Uuid;

use super::{wrong_channel, ChannelSender, RetryPolicy};
use crate::config::DeliveryConfig;
use crate::contact::is_valid_email;
use crate::credentials::{ChannelCredentials, SmtpCredentials};
use crate::errors::DeliveryError;
use crate::models::{Channel, Lead, OutboundContent};

/// SMTP delivery through the tenant's own mail server.
pub struct EmailSender {
    policy: RetryPolicy,
}

impl EmailSender {
    pub fn new(config: &DeliveryConfig) -> Self {
        Self {
            policy: RetryPolicy::from(config),
        }
    }

    fn transport(
        &self,
        smtp: &SmtpCredentials,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, DeliveryError> {
        let builder = if smtp.implicit_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&smtp.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&smtp.host)
        }
        .map_err(|e| DeliveryError::Permanent(format!("invalid SMTP host '{}': {}", smtp.host, e)))?;

        Ok(builder
            .port(smtp.port)
            .credentials(Credentials::new(
                smtp.username.clone(),
                smtp.password.clone(),
            ))
            .timeout(Some(self.policy.timeout + Duration::from_secs(5)))
            .build())
    }
}

/// SMTP 5xx, auth and client errors never succeed on retry; 4xx and
/// connection-level failures might.
fn classify(err: lettre::transport::smtp::Error) -> DeliveryError {
    if err.is_permanent() || err.is_client() {
        DeliveryError::Permanent(err.to_string())
    } else {
        DeliveryError::Transient(err.to_string())
    }
}

fn sender_mailbox(smtp: &SmtpCredentials) -> Result<Mailbox, DeliveryError> {
    let address = smtp
        .from_email
        .parse()
        .map_err(|e| DeliveryError::Permanent(format!("invalid sender address: {}", e)))?;
    Ok(Mailbox::new(smtp.from_name.clone(), address))
}

#[async_trait]
impl ChannelSender for EmailSender {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    async fn test_connection(&self, credentials: &ChannelCredentials) -> Result<(), DeliveryError> {
        let ChannelCredentials::Email(smtp) = credentials else {
            return Err(wrong_channel(Channel::Email, credentials));
        };
        sender_mailbox(smtp)?;

        let mailer = self.transport(smtp)?;
        match mailer.test_connection().await {
            Ok(true) => {
                tracing::info!("✓ SMTP credentials accepted by {}:{}", smtp.host, smtp.port);
                Ok(())
            }
            Ok(false) => Err(DeliveryError::Transient(format!(
                "SMTP server {}:{} did not answer",
                smtp.host, smtp.port
            ))),
            Err(e) => Err(classify(e)),
        }
    }

    async fn deliver(
        &self,
        lead: &Lead,
        content: &OutboundContent,
        credentials: &ChannelCredentials,
    ) -> Result<String, DeliveryError> {
        let ChannelCredentials::Email(smtp) = credentials else {
            return Err(wrong_channel(Channel::Email, credentials));
        };

        let to = lead
            .email
            .as_deref()
            .filter(|email| is_valid_email(email))
            .ok_or_else(|| DeliveryError::Permanent("invalid recipient address".to_string()))?;
        let recipient: Mailbox = to
            .parse()
            .map_err(|e| DeliveryError::Permanent(format!("invalid recipient address: {}", e)))?;

        let domain = smtp.from_email.rsplit('@').next().unwrap_or("localhost");
        let message_id = format!("<{}@{}>", Uuid::new_v4(), domain);

        let message = Message::builder()
            .from(sender_mailbox(smtp)?)
            .to(recipient)
            .subject(content.subject.clone().unwrap_or_default())
            .message_id(Some(message_id.clone()))
            .header(ContentType::TEXT_PLAIN)
            .body(content.body.clone())
            .map_err(|e| DeliveryError::Permanent(format!("failed to build message: {}", e)))?;

        let mailer = self.transport(smtp)?;
        mailer.send(message).await.map_err(classify)?;
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn smtp() -> ChannelCredentials {
        ChannelCredentials::Email(SmtpCredentials {
            host: "smtp.example.com".into(),
            port: 587,
            username: "bot".into(),
            password: "secret".into(),
            from_email: "bot@example.com".into(),
            from_name: Some("Outreach Bot".into()),
            implicit_tls: false,
        })
    }

    #[tokio::test]
    async fn invalid_recipient_fails_before_connecting() {
        let sender = EmailSender::new(&DeliveryConfig::default());
        let lead = Lead {
            id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "Acme".into(),
            address: None,
            phone: None,
            website: None,
            email: Some("fake999999@acme.com".into()),
            generated_description: None,
            generated_email_subject: Some("Hi".into()),
            generated_email: Some("Hello".into()),
            generated_whatsapp: None,
            email_sent: false,
            whatsapp_sent: false,
            replied: false,
            lead_score: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let content = OutboundContent {
            subject: Some("Hi".into()),
            body: "Hello".into(),
        };

        let err = sender.deliver(&lead, &content, &smtp()).await.unwrap_err();
        assert_eq!(err, DeliveryError::Permanent("invalid recipient address".into()));
    }

    #[tokio::test]
    async fn rejects_chat_credentials() {
        let sender = EmailSender::new(&DeliveryConfig::default());
        let creds = ChannelCredentials::Whatsapp(crate::credentials::WhatsAppCredentials {
            phone_number_id: "1".into(),
            access_token: "t".into(),
        });
        assert!(!sender.test_connection(&creds).await.unwrap_err().is_transient());
    }
}
