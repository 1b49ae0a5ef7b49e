use std::sync::Arc;
use uuid::Uuid;

use crate::errors::AppError;
use crate::store::Store;

/// Enforces tenant lead quotas and campaign lead ceilings.
///
/// Reservations are atomic in the store, so concurrent imports can never push
/// `leads_used` past `leads_quota`.
#[derive(Clone)]
pub struct QuotaGuard {
    store: Arc<dyn Store>,
}

impl QuotaGuard {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Reserve `min(requested, remaining)` against the tenant quota.
    pub async fn check_and_reserve(&self, tenant_id: Uuid, requested: i64) -> Result<i64, AppError> {
        self.reserve(tenant_id, None, requested).await
    }

    /// Like [`QuotaGuard::check_and_reserve`], also capped by the campaign's
    /// remaining `max_leads`.
    pub async fn check_and_reserve_for_campaign(
        &self,
        tenant_id: Uuid,
        campaign_id: Uuid,
        requested: i64,
    ) -> Result<i64, AppError> {
        self.reserve(tenant_id, Some(campaign_id), requested).await
    }

    pub async fn release(
        &self,
        tenant_id: Uuid,
        campaign_id: Option<Uuid>,
        count: i64,
    ) -> Result<(), AppError> {
        if count <= 0 {
            return Ok(());
        }
        tracing::debug!("Releasing {} reserved leads for tenant {}", count, tenant_id);
        self.store
            .release_lead_capacity(tenant_id, campaign_id, count)
            .await
    }

    async fn reserve(
        &self,
        tenant_id: Uuid,
        campaign_id: Option<Uuid>,
        requested: i64,
    ) -> Result<i64, AppError> {
        if requested <= 0 {
            return Err(AppError::Validation(format!(
                "requested lead count must be positive, got {}",
                requested
            )));
        }

        let allowed = self
            .store
            .reserve_lead_capacity(tenant_id, campaign_id, requested)
            .await?;

        if allowed <= 0 {
            tracing::warn!("Lead quota exhausted for tenant {}", tenant_id);
            return Err(AppError::QuotaExceeded(match campaign_id {
                Some(id) => format!("no lead capacity left for tenant {} / campaign {}", tenant_id, id),
                None => format!("no lead capacity left for tenant {}", tenant_id),
            }));
        }

        if allowed < requested {
            tracing::info!(
                "Tenant {} requested {} leads, {} allowed",
                tenant_id,
                requested,
                allowed
            );
        }
        Ok(allowed)
    }
}
