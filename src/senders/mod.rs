//! Outbound channel delivery.
//!
//! A sender performs one provider attempt in [`ChannelSender::deliver`]; the
//! provided [`ChannelSender::send`] wraps it with the timeout and retry policy
//! and always yields a delivery record, never an error.

pub mod email;
pub mod whatsapp;

use async_trait::async_trait;
use rand::RngExt;
use std::time::Duration;

use crate::config::DeliveryConfig;
use crate::credentials::ChannelCredentials;
use crate::errors::DeliveryError;
use crate::models::{Channel, Lead, NewDeliveryLog, OutboundContent};

pub use email::EmailSender;
pub use whatsapp::WhatsAppSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one, for transient errors only.
    pub max_retries: u32,
    /// Linear backoff step: the n-th retry waits `n * backoff`.
    pub backoff: Duration,
    /// Budget for a single attempt.
    pub timeout: Duration,
}

impl From<&DeliveryConfig> for RetryPolicy {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            max_retries: config.retry_count,
            backoff: config.retry_backoff,
            timeout: config.send_timeout,
        }
    }
}

#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn channel(&self) -> Channel;

    fn retry_policy(&self) -> RetryPolicy;

    /// Check that the credentials are accepted by the provider without sending anything.
    async fn test_connection(&self, credentials: &ChannelCredentials) -> Result<(), DeliveryError>;

    /// One delivery attempt. Returns the provider's message id.
    async fn deliver(
        &self,
        lead: &Lead,
        content: &OutboundContent,
        credentials: &ChannelCredentials,
    ) -> Result<String, DeliveryError>;

    async fn send(
        &self,
        lead: &Lead,
        content: &OutboundContent,
        credentials: &ChannelCredentials,
    ) -> NewDeliveryLog {
        let channel = self.channel();
        let policy = self.retry_policy();
        let mut retries = 0u32;

        loop {
            let attempt =
                tokio::time::timeout(policy.timeout, self.deliver(lead, content, credentials))
                    .await;

            match attempt {
                Ok(Ok(message_id)) => {
                    tracing::debug!(
                        "✓ {} delivered to lead {} (message {})",
                        channel,
                        lead.id,
                        message_id
                    );
                    return NewDeliveryLog::sent(lead, channel, message_id, retries);
                }
                Ok(Err(e)) if e.is_transient() && retries < policy.max_retries => {
                    retries += 1;
                    tracing::warn!(
                        "{} send to lead {} failed ({}), retry {}/{}",
                        channel,
                        lead.id,
                        e,
                        retries,
                        policy.max_retries
                    );
                    tokio::time::sleep(policy.backoff * retries).await;
                }
                Ok(Err(e)) => {
                    tracing::warn!("{} send to lead {} failed: {}", channel, lead.id, e);
                    return NewDeliveryLog::failed(lead, channel, e.reason().to_string(), retries);
                }
                // A timed-out attempt may still have been delivered; never retried.
                Err(_) => {
                    tracing::warn!(
                        "{} send to lead {} timed out after {}s",
                        channel,
                        lead.id,
                        policy.timeout.as_secs_f32()
                    );
                    return NewDeliveryLog::failed(
                        lead,
                        channel,
                        format!("timed out after {}s", policy.timeout.as_secs_f32()),
                        retries,
                    );
                }
            }
        }
    }
}

/// Randomised spacing between consecutive dispatches of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle {
    min_delay: Duration,
    max_delay: Duration,
}

impl Throttle {
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay: max_delay.max(min_delay),
        }
    }

    pub fn min_delay(&self) -> Duration {
        self.min_delay
    }

    /// Uniformly distributed in `[min_delay, max_delay]`.
    pub fn next_delay(&self) -> Duration {
        if self.max_delay == self.min_delay {
            return self.min_delay;
        }
        let mut rng = rand::rng();
        let millis = rng.random_range(
            self.min_delay.as_millis() as u64..=self.max_delay.as_millis() as u64,
        );
        Duration::from_millis(millis)
    }
}

impl From<&DeliveryConfig> for Throttle {
    fn from(config: &DeliveryConfig) -> Self {
        Self::new(config.min_delay, config.max_delay)
    }
}

fn wrong_channel(expected: Channel, credentials: &ChannelCredentials) -> DeliveryError {
    DeliveryError::Permanent(format!(
        "{} credentials supplied to the {} sender",
        credentials.channel(),
        expected
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::WhatsAppCredentials;
    use chrono::Utc;
    use std::sync::Mutex;
    use uuid::Uuid;

    struct Scripted {
        outcomes: Mutex<Vec<Result<String, DeliveryError>>>,
        attempt_delay: Duration,
    }

    #[async_trait]
    impl ChannelSender for Scripted {
        fn channel(&self) -> Channel {
            Channel::Chat
        }

        fn retry_policy(&self) -> RetryPolicy {
            RetryPolicy {
                max_retries: 1,
                backoff: Duration::from_millis(1),
                timeout: Duration::from_millis(50),
            }
        }

        async fn test_connection(&self, _: &ChannelCredentials) -> Result<(), DeliveryError> {
            Ok(())
        }

        async fn deliver(
            &self,
            _: &Lead,
            _: &OutboundContent,
            _: &ChannelCredentials,
        ) -> Result<String, DeliveryError> {
            tokio::time::sleep(self.attempt_delay).await;
            self.outcomes.lock().unwrap().remove(0)
        }
    }

    fn lead() -> Lead {
        Lead {
            id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            name: "Oficina Boa".into(),
            address: None,
            phone: Some("+5511987654321".into()),
            website: None,
            email: None,
            generated_description: None,
            generated_email_subject: None,
            generated_email: None,
            generated_whatsapp: Some("Olá!".into()),
            email_sent: false,
            whatsapp_sent: false,
            replied: false,
            lead_score: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn creds() -> ChannelCredentials {
        ChannelCredentials::Whatsapp(WhatsAppCredentials {
            phone_number_id: "1".into(),
            access_token: "t".into(),
        })
    }

    fn content() -> OutboundContent {
        OutboundContent {
            subject: None,
            body: "Olá!".into(),
        }
    }

    #[tokio::test]
    async fn transient_error_is_retried_once() {
        let sender = Scripted {
            outcomes: Mutex::new(vec![
                Err(DeliveryError::Transient("503".into())),
                Ok("wamid.1".into()),
            ]),
            attempt_delay: Duration::ZERO,
        };
        let log = sender.send(&lead(), &content(), &creds()).await;
        assert_eq!(log.status, crate::models::DeliveryStatus::Sent);
        assert_eq!(log.retry_count, 1);
        assert_eq!(log.provider_message_id.as_deref(), Some("wamid.1"));
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let sender = Scripted {
            outcomes: Mutex::new(vec![
                Err(DeliveryError::Permanent("invalid recipient".into())),
                Ok("never".into()),
            ]),
            attempt_delay: Duration::ZERO,
        };
        let log = sender.send(&lead(), &content(), &creds()).await;
        assert_eq!(log.status, crate::models::DeliveryStatus::Failed);
        assert_eq!(log.retry_count, 0);
        assert_eq!(log.error_message.as_deref(), Some("invalid recipient"));
        assert_eq!(sender.outcomes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn timeout_fails_without_retry() {
        let sender = Scripted {
            outcomes: Mutex::new(vec![Ok("late".into()), Ok("late".into())]),
            attempt_delay: Duration::from_millis(500),
        };
        let log = sender.send(&lead(), &content(), &creds()).await;
        assert_eq!(log.status, crate::models::DeliveryStatus::Failed);
        assert!(log.error_message.unwrap().starts_with("timed out"));
        assert_eq!(sender.outcomes.lock().unwrap().len(), 2);
    }

    #[test]
    fn throttle_stays_in_window() {
        let throttle = Throttle::new(Duration::from_millis(10), Duration::from_millis(20));
        for _ in 0..100 {
            let d = throttle.next_delay();
            assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
        }
        let fixed = Throttle::new(Duration::from_millis(30), Duration::from_millis(5));
        assert_eq!(fixed.next_delay(), Duration::from_millis(30));
    }
}
