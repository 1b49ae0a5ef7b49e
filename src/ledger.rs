use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{Channel, DeliveryCounts, DeliveryFilter, DeliveryLog, EngagementEvent, NewDeliveryLog};
use crate::store::Store;

/// Engagement rates derived from the ledger on every read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignAnalytics {
    pub campaign_id: Uuid,
    pub channel: Option<Channel>,
    pub counts: DeliveryCounts,
    pub open_rate: f64,
    pub click_rate: f64,
    pub reply_rate: f64,
    pub bounce_rate: f64,
}

/// `count / sent * 100`, rounded to 2 decimals; 0 when nothing was sent.
pub fn rate(count: i64, sent: i64) -> f64 {
    if sent <= 0 {
        return 0.0;
    }
    (count as f64 / sent as f64 * 100.0 * 100.0).round() / 100.0
}

/// Append-only record of every delivery attempt.
#[derive(Clone)]
pub struct DeliveryLedger {
    store: Arc<dyn Store>,
}

impl DeliveryLedger {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn append(&self, record: &NewDeliveryLog) -> Result<i64, AppError> {
        let id = self.store.append_delivery(record).await?;
        tracing::debug!(
            "Delivery log {} appended: lead {} via {} -> {}",
            id,
            record.lead_id,
            record.channel,
            record.status.as_str()
        );
        Ok(id)
    }

    pub async fn query(
        &self,
        campaign_id: Uuid,
        filter: &DeliveryFilter,
    ) -> Result<Vec<DeliveryLog>, AppError> {
        self.store.query_deliveries(campaign_id, filter).await
    }

    /// Apply an engagement event to a row. Events that would move the status
    /// backwards leave the row as it is.
    pub async fn advance(&self, log_id: i64, event: EngagementEvent) -> Result<DeliveryLog, AppError> {
        let updated = self
            .store
            .advance_delivery(log_id, event, Utc::now())
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Delivery log {} not found", log_id)))?;
        tracing::info!(
            "Delivery log {} received {:?}, status now {}",
            log_id,
            event,
            updated.status.as_str()
        );
        Ok(updated)
    }

    pub async fn analytics(
        &self,
        campaign_id: Uuid,
        channel: Option<Channel>,
    ) -> Result<CampaignAnalytics, AppError> {
        let counts = self.store.delivery_counts(campaign_id, channel).await?;
        Ok(CampaignAnalytics {
            campaign_id,
            channel,
            open_rate: rate(counts.opened, counts.sent),
            click_rate: rate(counts.clicked, counts.sent),
            reply_rate: rate(counts.replied, counts.sent),
            bounce_rate: rate(counts.bounced, counts.sent),
            counts,
        })
    }
}
