use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use std::time::Duration;

use super::{wrong_channel, ChannelSender, RetryPolicy};
use crate::config::DeliveryConfig;
use crate::contact::normalize_phone;
use crate::credentials::{ChannelCredentials, WhatsAppCredentials};
use crate::errors::{AppError, DeliveryError};
use crate::models::{Channel, Lead, OutboundContent};

/// Client for the WhatsApp Cloud API (Graph API `/{phone_number_id}/messages`).
#[derive(Clone)]
pub struct WhatsAppSender {
    client: reqwest::Client,
    base_url: String,
    default_region: String,
    policy: RetryPolicy,
}

impl WhatsAppSender {
    /// Creates a new `WhatsAppSender`.
    ///
    /// # Arguments
    ///
    /// * `config` - Delivery settings: API base URL, phone region, timeouts.
    pub fn new(config: &DeliveryConfig) -> Result<Self, AppError> {
        let policy = RetryPolicy::from(config);
        let client = reqwest::Client::builder()
            .timeout(policy.timeout + Duration::from_secs(5))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create WhatsApp client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: config.whatsapp_api_base_url.trim_end_matches('/').to_string(),
            default_region: config.default_phone_region.clone(),
            policy,
        })
    }

    fn credentials<'a>(
        &self,
        credentials: &'a ChannelCredentials,
    ) -> Result<&'a WhatsAppCredentials, DeliveryError> {
        match credentials {
            ChannelCredentials::Whatsapp(wa) => Ok(wa),
            other => Err(wrong_channel(Channel::Chat, other)),
        }
    }
}

/// 5xx and throttling are worth another attempt; any other refusal is final.
fn classify_status(status: StatusCode, error_text: String) -> DeliveryError {
    let message = format!("WhatsApp API returned {}: {}", status, error_text);
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        DeliveryError::Transient(message)
    } else {
        DeliveryError::Permanent(message)
    }
}

fn classify_transport(err: reqwest::Error) -> DeliveryError {
    if err.is_builder() {
        DeliveryError::Permanent(format!("WhatsApp request invalid: {}", err))
    } else {
        DeliveryError::Transient(format!("WhatsApp request failed: {}", err))
    }
}

#[async_trait]
impl ChannelSender for WhatsAppSender {
    fn channel(&self) -> Channel {
        Channel::Chat
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }

    async fn test_connection(&self, credentials: &ChannelCredentials) -> Result<(), DeliveryError> {
        let wa = self.credentials(credentials)?;
        let url = format!("{}/{}", self.base_url, wa.phone_number_id);
        tracing::info!("Testing WhatsApp credentials for phone number {}", wa.phone_number_id);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&wa.access_token)
            .send()
            .await
            .map_err(classify_transport)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(classify_status(status, error_text));
        }

        tracing::info!("✓ WhatsApp credentials accepted");
        Ok(())
    }

    async fn deliver(
        &self,
        lead: &Lead,
        content: &OutboundContent,
        credentials: &ChannelCredentials,
    ) -> Result<String, DeliveryError> {
        let wa = self.credentials(credentials)?;

        let phone = lead
            .phone
            .as_deref()
            .ok_or_else(|| DeliveryError::Permanent("lead has no phone number".to_string()))?;
        let e164 = normalize_phone(phone, &self.default_region)
            .map_err(|reason| DeliveryError::Permanent(format!("invalid recipient phone: {}", reason)))?;

        let url = format!("{}/{}/messages", self.base_url, wa.phone_number_id);
        let body = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": e164.trim_start_matches('+'),
            "type": "text",
            "text": { "preview_url": false, "body": content.body }
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&wa.access_token)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(classify_status(status, error_text));
        }

        let data: serde_json::Value = response.json().await.map_err(|e| {
            DeliveryError::Permanent(format!("Failed to parse WhatsApp response: {}", e))
        })?;

        // Accepted but unidentifiable: retrying would risk a duplicate message.
        data.get("messages")
            .and_then(|m| m.get(0))
            .and_then(|m| m.get("id"))
            .and_then(|id| id.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                tracing::warn!("Unexpected WhatsApp response format: {:?}", data);
                DeliveryError::Permanent("WhatsApp response missing message id".to_string())
            })
    }
}
